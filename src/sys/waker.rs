//! Wakers for kernel tasks.
//!
//! Waking a task only records its id on the ready set; the kernel dispatches it on its next turn.
use std::sync::Arc;
use std::task::{Wake, Waker};

use concurrent_queue::ConcurrentQueue;

use crate::task::TaskId;

pub(crate) type ReadySet = Arc<ConcurrentQueue<TaskId>>;

pub(crate) fn ready_set() -> ReadySet {
    Arc::new(ConcurrentQueue::unbounded())
}

/// Put `id` on the ready set.
pub(crate) fn enqueue(ready: &ReadySet, id: TaskId) {
    if ready.push(id).is_err() {
        log::trace!("ready set closed, dropping wakeup for {}", id);
    }
}

struct TaskWaker {
    id: TaskId,
    ready: ReadySet,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        enqueue(&self.ready, self.id);
    }
}

pub(crate) fn task_waker(id: TaskId, ready: &ReadySet) -> Waker {
    let waker = TaskWaker {
        id,
        ready: Arc::clone(ready),
    };
    Waker::from(Arc::new(waker))
}
