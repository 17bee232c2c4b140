//! Completion handles for kernel tasks.
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::task::{Task, TaskId};

pub(crate) struct JoinState<T> {
    output: RefCell<Option<T>>,
    finished: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl<T> JoinState<T> {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(JoinState {
            output: RefCell::new(None),
            finished: Cell::new(false),
            waker: RefCell::new(None),
        })
    }

    pub(crate) fn complete(&self, value: T) {
        debug_assert!(!self.finished.get(), "task completed twice");
        self.output.replace(Some(value));
        self.finished.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// Handle to a spawned task.
///
/// Awaiting it from another task suspends until the task finishes and yields its output. From
/// outside the kernel, [`JoinHandle::take_output`] retrieves the output after
/// [`Kernel::run`](crate::Kernel::run).
pub struct JoinHandle<P, T> {
    task: Task<P>,
    state: Rc<JoinState<T>>,
}

impl<P, T> JoinHandle<P, T> {
    pub(crate) fn new(task: Task<P>, state: Rc<JoinState<T>>) -> Self {
        JoinHandle { task, state }
    }

    /// The task's rendezvous record, to be used as the `target` of requests and releases.
    pub fn task(&self) -> &Task<P> {
        &self.task
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.get()
    }

    /// The task's output, if it finished and the output was not taken yet.
    pub fn take_output(&self) -> Option<T> {
        self.state.output.borrow_mut().take()
    }
}

impl<P, T> Future for JoinHandle<P, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let state = &self.get_mut().state;
        if let Some(value) = state.output.borrow_mut().take() {
            return Poll::Ready(value);
        }
        assert!(
            !state.finished.get(),
            "JoinHandle polled after its output was taken"
        );
        replace_waker(&mut state.waker.borrow_mut(), cx);
        Poll::Pending
    }
}

impl<P, T> fmt::Debug for JoinHandle<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task.id())
            .field("finished", &self.state.finished.get())
            .finish()
    }
}

#[inline]
fn replace_waker(old: &mut Option<Waker>, cx: &mut Context<'_>) {
    if let Some(ref old_waker) = old {
        if !old_waker.will_wake(cx.waker()) {
            *old = Some(cx.waker().clone())
        }
    } else {
        *old = Some(cx.waker().clone())
    }
}
