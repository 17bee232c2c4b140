//! The view a kernel task has of itself and of the kernel.
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{RequestError, Ticks};
use crate::executor::{self, KernelShared};
use crate::join::JoinHandle;
use crate::share;
use crate::sys::timer::TimerKey;
use crate::task::{Task, TaskId};

/// Handed to every task spawned on a [`Kernel`](crate::Kernel).
///
/// The rendezvous operations here are the ones in [`share`](crate::share), with this task as the
/// caller and the kernel as the scheduler.
pub struct TaskContext<P> {
    task: Task<P>,
    kernel: Rc<KernelShared<P>>,
}

impl<P> TaskContext<P> {
    pub(crate) fn new(task: Task<P>, kernel: Rc<KernelShared<P>>) -> Self {
        TaskContext { task, kernel }
    }

    /// This task's rendezvous record.
    pub fn task(&self) -> &Task<P> {
        &self.task
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Current virtual time.
    pub fn now(&self) -> Ticks {
        self.kernel.now()
    }

    /// Suspend for `ticks` of virtual time. Zero ticks yields to the other ready tasks.
    pub fn sleep(&self, ticks: Ticks) -> Sleep<P> {
        Sleep {
            kernel: Rc::clone(&self.kernel),
            deadline: self.kernel.now().saturating_add(ticks),
            yielded: ticks > 0,
            key: None,
        }
    }

    /// Go to the back of the ready set.
    pub async fn yield_now(&self) {
        futures_lite::future::yield_now().await
    }
}

impl<P: Clone + 'static> TaskContext<P> {
    /// See [`share::request`].
    pub async fn request(&self, target: &Task<P>, timeout: Ticks) -> Result<P, RequestError> {
        share::request(&*self.kernel, &self.task, target, timeout).await
    }

    /// See [`share::share`].
    pub async fn share(&self, payload: P) -> usize {
        share::share(&*self.kernel, &self.task, payload).await
    }

    /// See [`share::release`].
    pub async fn release(&self, target: &Task<P>) {
        share::release(&*self.kernel, &self.task, target).await
    }

    /// Create a sibling task on the same kernel.
    pub fn spawn<F, Fut, T>(&self, name: impl Into<String>, f: F) -> JoinHandle<P, T>
    where
        F: FnOnce(TaskContext<P>) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        executor::spawn(&self.kernel, name.into(), f)
    }
}

impl<P> fmt::Debug for TaskContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task)
            .field("now", &self.kernel.now())
            .finish()
    }
}

/// Future returned by [`TaskContext::sleep`].
pub struct Sleep<P> {
    kernel: Rc<KernelShared<P>>,
    deadline: Ticks,
    yielded: bool,
    key: Option<TimerKey>,
}

impl<P> Future for Sleep<P> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.kernel.now() >= this.deadline {
            if !this.yielded {
                this.yielded = true;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            this.key = None;
            return Poll::Ready(());
        }
        if this.key.is_none() {
            let remaining = this.deadline - this.kernel.now();
            this.key = Some(this.kernel.arm_wake(remaining, cx.waker().clone()));
        }
        Poll::Pending
    }
}

impl<P> Drop for Sleep<P> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.kernel.disarm(key);
        }
    }
}

impl<P> fmt::Debug for Sleep<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .finish()
    }
}
