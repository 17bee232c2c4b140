//! Task records as seen by the rendezvous protocol.
//!
//! A task itself is owned by whatever scheduler runs it. This module only defines the
//! synchronization fields every task carries, behind a cheap, cloneable [`Task`] handle.
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use intrusive_collections::LinkedListLink;

use crate::status::Status;
use crate::sys::queue::RequestQueue;

/// Identity of a task inside one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(raw: u64) -> TaskId {
        TaskId(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

pub(crate) struct SyncState<P> {
    pub(crate) status: Status,
    /// Tasks waiting for this one to share.
    pub(crate) requests: RequestQueue<P>,
    /// Requesters holding the current payload without having released it.
    pub(crate) pending_acks: usize,
    /// Requesters admitted to the current share, queued or fast path.
    pub(crate) served: usize,
    /// Payload handed to this task, or the payload this task is currently sharing.
    pub(crate) mailbox: Option<P>,
    /// The sharer whose queue this task is linked into.
    pub(crate) waiting_on: Option<Weak<TaskInner<P>>>,
}

pub(crate) struct TaskInner<P> {
    id: TaskId,
    name: String,
    pub(crate) link: LinkedListLink,
    /// Id of the request queue holding `link`, meaningful only while linked.
    pub(crate) queued_on: Cell<u64>,
    state: RefCell<SyncState<P>>,
}

impl<P> TaskInner<P> {
    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> RefMut<'_, SyncState<P>> {
        self.state.borrow_mut()
    }
}

/// Handle to a task's rendezvous state.
///
/// Cloning the handle does not clone the task; all clones observe and mutate the same record.
pub struct Task<P> {
    inner: Rc<TaskInner<P>>,
}

impl<P> Clone for Task<P> {
    fn clone(&self) -> Self {
        Task {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<P> Task<P> {
    /// Create the record for a freshly created task: `Ready`, nothing queued, nothing owed.
    pub fn new(id: TaskId, name: impl Into<String>) -> Task<P> {
        let state = SyncState {
            status: Status::Ready,
            requests: RequestQueue::new(),
            pending_acks: 0,
            served: 0,
            mailbox: None,
            waiting_on: None,
        };
        let inner = TaskInner {
            id,
            name: name.into(),
            link: LinkedListLink::new(),
            queued_on: Cell::new(0),
            state: RefCell::new(state),
        };
        Task {
            inner: Rc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Rc<TaskInner<P>>) -> Task<P> {
        Task { inner }
    }

    pub(crate) fn inner(&self) -> Rc<TaskInner<P>> {
        Rc::clone(&self.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<TaskInner<P>> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn state(&self) -> RefMut<'_, SyncState<P>> {
        self.inner.state()
    }

    fn peek(&self) -> Ref<'_, SyncState<P>> {
        self.inner.state.borrow()
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> Status {
        self.peek().status
    }

    /// Number of requesters that received this task's current share and have not released it.
    pub fn pending_acks(&self) -> usize {
        self.peek().pending_acks
    }

    /// Number of tasks queued waiting for this task to share.
    pub fn queued_requests(&self) -> usize {
        self.peek().requests.len()
    }

    /// Ids of the queued requesters, oldest first.
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.peek().requests.ids().collect()
    }

    /// True if `other` is waiting in this task's request queue.
    pub fn has_queued(&self, other: &Task<P>) -> bool {
        self.peek().requests.contains(&other.inner)
    }

    /// True if this task is linked into some sharer's request queue.
    pub fn is_queued(&self) -> bool {
        self.inner.link.is_linked()
    }

    pub fn ptr_eq(&self, other: &Task<P>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Apply a status change, rejecting edges outside the state machine.
    ///
    /// A rejected edge leaves the status untouched and returns false.
    pub(crate) fn set_status(&self, to: Status) -> bool {
        let result = self.state().status.transition(to);
        match result {
            Ok(_) => true,
            Err(err) => {
                log::error!("{}: {}", self, err);
                debug_assert!(false, "{}: {}", self, err);
                false
            }
        }
    }
}

impl<P: Clone> Task<P> {
    /// The payload currently held in this task's mailbox.
    pub fn mailbox(&self) -> Option<P> {
        self.peek().mailbox.clone()
    }
}

impl<P> fmt::Display for Task<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inner.name.is_empty() {
            write!(f, "{}", self.inner.id)
        } else {
            write!(f, "{}#{}", self.inner.name, self.inner.id.0)
        }
    }
}

impl<P> fmt::Debug for Task<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.peek();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &state.status)
            .field("pending_acks", &state.pending_acks)
            .field("requests", &state.requests)
            .finish()
    }
}
