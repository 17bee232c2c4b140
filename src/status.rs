//! The per-task rendezvous status and its state machine.
//!
//! ```ascii
//! +-------------------+  request, target not sharing   +---------------------+
//! |                   |------------------------------->| WaitSend            |
//! |                   |<-------------------------------| WaitSendTimeout     |
//! |      Ready        |  answered by share / timer     +---------------------+
//! |                   |
//! |                   |  share, acknowledgments owed   +---------------------+
//! |                   |------------------------------->|     WaitReply       |
//! |                   |<-------------------------------|                     |
//! +-------------------+  last release                  +---------------------+
//! ```
//!
//! `Ready` is owned by the scheduler: it only means "eligible for dispatch". The other three
//! states are owned by the rendezvous protocol and are entered and left exclusively through
//! [`Status::transition`].
use std::fmt;

use crate::error::IllegalTransition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Eligible for dispatch; not taking part in a rendezvous as a blocked party.
    Ready,
    /// Queued on a sharer without a deadline.
    WaitSend,
    /// Queued on a sharer with a pending timed wakeup.
    WaitSendTimeout,
    /// Sharing, and blocked until every requester has released the payload.
    WaitReply,
}

impl Default for Status {
    fn default() -> Self {
        Status::Ready
    }
}

impl Status {
    /// True while the task sits in some sharer's request queue.
    pub fn is_waiting_send(self) -> bool {
        matches!(self, Status::WaitSend | Status::WaitSendTimeout)
    }

    /// True if the edge `self -> to` exists in the rendezvous state machine.
    pub fn can_transition(self, to: Status) -> bool {
        match (self, to) {
            (Status::Ready, Status::WaitSend)
            | (Status::Ready, Status::WaitSendTimeout)
            | (Status::Ready, Status::WaitReply) => true,
            (Status::WaitSend, Status::Ready)
            | (Status::WaitSendTimeout, Status::Ready)
            | (Status::WaitReply, Status::Ready) => true,
            _ => false,
        }
    }

    /// Move to `to`, leaving `self` untouched if the edge is not part of the state machine.
    pub fn transition(&mut self, to: Status) -> Result<Status, IllegalTransition> {
        if !self.can_transition(to) {
            return Err(IllegalTransition { from: *self, to });
        }
        let from = *self;
        *self = to;
        Ok(from)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ready => "READY",
            Status::WaitSend => "WAIT_SEND",
            Status::WaitSendTimeout => "WAIT_SEND_TIMEOUT",
            Status::WaitReply => "WAIT_REPLY",
        };
        f.write_str(name)
    }
}
