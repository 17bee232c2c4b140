//! Deadline-ordered one-shot timers for the reference kernel.
//!
//! Two kinds of timers share one queue: request deadlines, keyed by the waiting task so a share
//! can disarm them, and plain wakeups used by sleeping tasks. Timers with the same deadline fire
//! in the order they were armed.
use std::collections::BTreeMap;
use std::fmt;
use std::task::Waker;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::error::Ticks;
use crate::task::{Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TimerKey {
    deadline: Ticks,
    seq: u64,
}

impl TimerKey {
    pub(crate) fn deadline(&self) -> Ticks {
        self.deadline
    }
}

pub(crate) enum Timer<P> {
    /// Deadline of a timed request.
    Request(Task<P>),
    /// Wakeup of a sleeping task.
    Wake(Waker),
}

impl<P> fmt::Debug for Timer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timer::Request(task) => write!(f, "Request({})", task),
            Timer::Wake(_) => write!(f, "Wake"),
        }
    }
}

pub(crate) type Expired<P> = SmallVec<[Timer<P>; 8]>;

pub(crate) struct TimerQueue<P> {
    entries: BTreeMap<TimerKey, Timer<P>>,
    requests: AHashMap<TaskId, TimerKey>,
    seq: u64,
}

impl<P> TimerQueue<P> {
    pub(crate) fn new() -> Self {
        TimerQueue {
            entries: BTreeMap::new(),
            requests: AHashMap::new(),
            seq: 0,
        }
    }

    fn next_key(&mut self, deadline: Ticks) -> TimerKey {
        let seq = self.seq;
        self.seq += 1;
        TimerKey { deadline, seq }
    }

    /// Arm the request deadline for `task`, replacing any deadline it already had.
    pub(crate) fn arm_request(&mut self, task: &Task<P>, deadline: Ticks) -> TimerKey {
        self.cancel_request(task.id());
        let key = self.next_key(deadline);
        self.entries.insert(key, Timer::Request(task.clone()));
        self.requests.insert(task.id(), key);
        key
    }

    pub(crate) fn arm_wake(&mut self, deadline: Ticks, waker: Waker) -> TimerKey {
        let key = self.next_key(deadline);
        self.entries.insert(key, Timer::Wake(waker));
        key
    }

    /// Disarm the request deadline of `id`. Returns false if there was none.
    pub(crate) fn cancel_request(&mut self, id: TaskId) -> bool {
        match self.requests.remove(&id) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub(crate) fn cancel(&mut self, key: TimerKey) -> bool {
        match self.entries.remove(&key) {
            Some(Timer::Request(task)) => {
                self.requests.remove(&task.id());
                true
            }
            Some(Timer::Wake(_)) => true,
            None => false,
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Ticks> {
        self.entries.keys().next().map(TimerKey::deadline)
    }

    /// Remove and return every timer due at or before `now`, earliest first.
    pub(crate) fn expired(&mut self, now: Ticks) -> Expired<P> {
        let mut fired = SmallVec::new();
        while let Some(key) = self.entries.keys().next().copied() {
            if key.deadline > now {
                break;
            }
            if let Some(timer) = self.entries.remove(&key) {
                if let Timer::Request(ref task) = timer {
                    self.requests.remove(&task.id());
                }
                fired.push(timer);
            }
        }
        fired
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.requests.clear();
        self.entries.clear();
    }
}
