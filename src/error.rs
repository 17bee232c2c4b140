use thiserror::Error;

use crate::status::Status;
use crate::task::TaskId;

/// Virtual clock unit used for timeouts and sleeps.
pub type Ticks = u64;

/// Ways a [`request`](crate::share::request) can end without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The deadline passed before the target shared anything.
    #[error("request timed out after {0} ticks")]
    TimedOut(Ticks),

    /// A task asked itself for data; it could never be answered.
    #[error("{0} cannot request data from itself")]
    OwnTask(TaskId),
}

/// A status change that is not an edge of the rendezvous state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: Status,
    pub to: Status,
}
