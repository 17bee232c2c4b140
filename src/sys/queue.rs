//! FIFO of tasks waiting for a sharer, linked through the requesters themselves.
//!
//! Each task record carries a single [`LinkedListLink`], so a task can sit in at most one request
//! queue at a time. The record also names the queue it is linked into, which makes both the
//! membership check and the unlink on an expired deadline O(1).
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};

use crate::task::{TaskId, TaskInner};

intrusive_adapter!(pub(crate) RequestAdapter<P> = Rc<TaskInner<P>>: TaskInner<P> { link: LinkedListLink });

// Zero is never handed out; it marks a task that was never queued.
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct RequestQueue<P> {
    id: u64,
    list: LinkedList<RequestAdapter<P>>,
    length: usize,
}

impl<P> RequestQueue<P> {
    pub(crate) fn new() -> Self {
        RequestQueue {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            list: LinkedList::new(RequestAdapter::new()),
            length: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.length
    }

    pub(crate) fn push_back(&mut self, task: Rc<TaskInner<P>>) {
        assert!(
            !task.link.is_linked(),
            "{} is already queued on another task",
            task.id()
        );
        task.queued_on.set(self.id);
        self.list.push_back(task);
        self.length += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<Rc<TaskInner<P>>> {
        let task = self.list.pop_front()?;
        self.length -= 1;
        Some(task)
    }

    pub(crate) fn contains(&self, task: &TaskInner<P>) -> bool {
        task.link.is_linked() && task.queued_on.get() == self.id
    }

    /// Unlink `task` from this queue, returning the queue's reference to it.
    ///
    /// Returns `None` if `task` is not a member of this queue.
    pub(crate) fn remove(&mut self, task: &TaskInner<P>) -> Option<Rc<TaskInner<P>>> {
        if !self.contains(task) {
            return None;
        }
        // Safety: `task` is linked, and the only list that links it under this id is ours.
        let mut cursor = unsafe { self.list.cursor_mut_from_ptr(task as *const _) };
        let removed = cursor.remove()?;
        self.length -= 1;
        Some(removed)
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.list.iter().map(|t| t.id())
    }
}

impl<P> fmt::Debug for RequestQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}
