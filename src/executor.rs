//! A deterministic single-core cooperative kernel that runs the rendezvous protocol.
//!
//! Tasks are futures. The kernel keeps a FIFO ready set of task ids and polls one task at a time;
//! a task only runs again after something puts it back on the ready set, either the protocol
//! through [`Scheduler::make_ready`] or the task's [`Waker`]. Time is virtual: when nothing is
//! ready the clock jumps to the earliest armed timer and every timer due at that tick fires.
//!
//! A poll runs uninterrupted until the task's next suspension point, and timers only fire between
//! polls. That is the whole mutual exclusion story: the protocol's cross-task mutations can never
//! interleave.
use std::cell::{Cell, RefCell};
use std::cmp;
use std::fmt;
use std::future::Future;
use std::mem;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use ahash::AHashMap;
use futures_lite::future::{BoxedLocal, FutureExt};

use crate::context::TaskContext;
use crate::error::Ticks;
use crate::join::{JoinHandle, JoinState};
use crate::scheduler::Scheduler;
use crate::share;
use crate::sys::timer::{Timer, TimerKey, TimerQueue};
use crate::sys::waker::{self, ReadySet};
use crate::task::{Task, TaskId};

/// Kernel settings. See [`KernelBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Prefix of every log line emitted by the kernel.
    pub name: String,
    /// Stop [`Kernel::run`] instead of firing a timer due after this tick.
    pub tick_limit: Option<Ticks>,
    /// Number of tasks the task table is sized for up front.
    pub task_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            name: String::from("kernel"),
            tick_limit: None,
            task_capacity: 16,
        }
    }
}

/// Configures and creates a [`Kernel`].
///
/// ```
/// use handoff::KernelBuilder;
///
/// let kernel = KernelBuilder::new().name("k0").tick_limit(1_000).build::<u32>();
/// let sharer = kernel.spawn("sharer", |cx| async move { cx.share(7).await });
/// let summary = kernel.run();
/// assert_eq!(Some(0), sharer.take_output());
/// assert_eq!(0, summary.live_tasks);
/// ```
#[derive(Debug, Default)]
pub struct KernelBuilder {
    config: KernelConfig,
}

impl KernelBuilder {
    pub fn new() -> KernelBuilder {
        KernelBuilder::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> KernelBuilder {
        self.config.name = name.into();
        self
    }

    pub fn tick_limit(mut self, limit: Ticks) -> KernelBuilder {
        self.config.tick_limit = Some(limit);
        self
    }

    pub fn task_capacity(mut self, capacity: usize) -> KernelBuilder {
        self.config.task_capacity = capacity;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn build<P>(self) -> Kernel<P> {
        Kernel::with_config(self.config)
    }
}

/// What a call to [`Kernel::run`] accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Task polls performed.
    pub polls: u64,
    /// Virtual clock when the run stopped.
    pub now: Ticks,
    /// Tasks that have not finished. Non-zero means they are blocked with nothing left to wake
    /// them.
    pub live_tasks: usize,
    /// Releases of tasks that were not waiting for acknowledgments.
    pub violations: usize,
}

struct TaskSlot<P> {
    task: Task<P>,
    future: Option<BoxedLocal<()>>,
    waker: Waker,
}

pub(crate) struct KernelShared<P> {
    config: KernelConfig,
    clock: Cell<Ticks>,
    ready: ReadySet,
    tasks: RefCell<AHashMap<TaskId, TaskSlot<P>>>,
    timers: RefCell<TimerQueue<P>>,
    next_id: Cell<u64>,
    polling: Cell<Option<TaskId>>,
    polls: Cell<u64>,
    violations: Cell<usize>,
}

impl<P> KernelShared<P> {
    pub(crate) fn now(&self) -> Ticks {
        self.clock.get()
    }

    pub(crate) fn arm_wake(&self, ticks: Ticks, waker: Waker) -> TimerKey {
        let deadline = self.now().saturating_add(ticks);
        self.timers.borrow_mut().arm_wake(deadline, waker)
    }

    pub(crate) fn disarm(&self, key: TimerKey) {
        self.timers.borrow_mut().cancel(key);
    }

    fn poll_task(&self, id: TaskId) {
        let taken = {
            let mut tasks = self.tasks.borrow_mut();
            tasks.get_mut(&id).and_then(|slot| {
                let future = slot.future.take()?;
                Some((slot.task.clone(), future, slot.waker.clone()))
            })
        };
        let (task, mut future, waker) = match taken {
            Some(taken) => taken,
            None => {
                log::trace!("{}: no runnable task for {}", self.config.name, id);
                return;
            }
        };

        self.polling.set(Some(id));
        let _polling = scopeguard::guard(&self.polling, |polling| polling.set(None));
        self.polls.set(self.polls.get() + 1);
        log::trace!("{}: polling {}", self.config.name, task);

        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                let finished = self.tasks.borrow_mut().remove(&id);
                drop(finished);
                log::debug!("{}: {} finished", self.config.name, task);
            }
            Poll::Pending => {
                if let Some(slot) = self.tasks.borrow_mut().get_mut(&id) {
                    slot.future = Some(future);
                }
            }
        }
    }

    fn fire_timers(&self, deadline: Ticks) {
        assert!(
            self.polling.get().is_none(),
            "timer fired while a task was running"
        );
        let now = cmp::max(self.now(), deadline);
        self.clock.set(now);
        let expired = self.timers.borrow_mut().expired(now);
        log::trace!("{}: tick {}, {} timers due", self.config.name, now, expired.len());
        for timer in expired {
            match timer {
                Timer::Request(task) => {
                    share::expire(self, &task);
                }
                Timer::Wake(waker) => waker.wake(),
            }
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            polls: self.polls.get(),
            now: self.now(),
            live_tasks: self.tasks.borrow().len(),
            violations: self.violations.get(),
        }
    }
}

impl<P> Scheduler<P> for KernelShared<P> {
    fn make_ready(&self, task: &Task<P>) {
        log::trace!("{}: {} is ready", self.config.name, task);
        waker::enqueue(&self.ready, task.id());
    }

    fn program_timeout(&self, task: &Task<P>, ticks: Ticks) {
        let deadline = self.now().saturating_add(ticks);
        self.timers.borrow_mut().arm_request(task, deadline);
    }

    fn cancel_timeout(&self, task: &Task<P>) {
        if self.timers.borrow_mut().cancel_request(task.id()) {
            log::trace!("{}: disarmed deadline of {}", self.config.name, task);
        }
    }

    fn protocol_violation(&self, caller: &Task<P>, target: &Task<P>) {
        self.violations.set(self.violations.get() + 1);
        log::warn!(
            "{}: {} released {} which is {}, not waiting for releases",
            self.config.name,
            caller,
            target,
            target.status()
        );
    }
}

pub(crate) fn spawn<P, F, Fut, T>(
    kernel: &Rc<KernelShared<P>>,
    name: String,
    f: F,
) -> JoinHandle<P, T>
where
    P: Clone + 'static,
    F: FnOnce(TaskContext<P>) -> Fut,
    Fut: Future<Output = T> + 'static,
    T: 'static,
{
    let id = TaskId::new(kernel.next_id.get());
    kernel.next_id.set(id.get() + 1);
    let task = Task::new(id, name);

    let join = JoinState::new();
    let completion = Rc::clone(&join);
    let body = f(TaskContext::new(task.clone(), Rc::clone(kernel)));
    let future = async move {
        let output = body.await;
        completion.complete(output);
    };

    let slot = TaskSlot {
        task: task.clone(),
        future: Some(future.boxed_local()),
        waker: waker::task_waker(id, &kernel.ready),
    };
    kernel.tasks.borrow_mut().insert(id, slot);
    log::debug!("{}: spawned {}", kernel.config.name, task);
    kernel.make_ready(&task);
    JoinHandle::new(task, join)
}

/// Owns the tasks, the ready set and the virtual clock.
pub struct Kernel<P> {
    shared: Rc<KernelShared<P>>,
}

impl<P> Kernel<P> {
    pub fn new() -> Kernel<P> {
        Kernel::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Kernel<P> {
        let tasks = AHashMap::with_capacity(config.task_capacity);
        let shared = KernelShared {
            config,
            clock: Cell::new(0),
            ready: waker::ready_set(),
            tasks: RefCell::new(tasks),
            timers: RefCell::new(TimerQueue::new()),
            next_id: Cell::new(1),
            polling: Cell::new(None),
            polls: Cell::new(0),
            violations: Cell::new(0),
        };
        Kernel {
            shared: Rc::new(shared),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    /// Current virtual time.
    pub fn now(&self) -> Ticks {
        self.shared.now()
    }

    /// Tasks spawned and not finished yet.
    pub fn live_tasks(&self) -> usize {
        self.shared.tasks.borrow().len()
    }

    /// Dispatch ready tasks and fire timers until there is nothing left to do.
    ///
    /// Stops when the ready set is empty and no timer is armed, or when the next timer is due
    /// after the configured tick limit. Can be called again after spawning more tasks.
    pub fn run(&self) -> RunSummary {
        let shared = &self.shared;
        loop {
            while let Ok(id) = shared.ready.pop() {
                shared.poll_task(id);
            }
            let deadline = match shared.timers.borrow().next_deadline() {
                Some(deadline) => deadline,
                None => break,
            };
            if let Some(limit) = shared.config.tick_limit {
                if deadline > limit {
                    log::debug!(
                        "{}: next timer at {} is past the tick limit {}",
                        shared.config.name,
                        deadline,
                        limit
                    );
                    break;
                }
            }
            shared.fire_timers(deadline);
        }
        let summary = shared.summary();
        log::debug!("{}: run stopped: {:?}", shared.config.name, summary);
        summary
    }
}

impl<P: Clone + 'static> Kernel<P> {
    /// Create a task running the future returned by `f`. It becomes ready immediately.
    pub fn spawn<F, Fut, T>(&self, name: impl Into<String>, f: F) -> JoinHandle<P, T>
    where
        F: FnOnce(TaskContext<P>) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        spawn(&self.shared, name.into(), f)
    }
}

impl<P> Default for Kernel<P> {
    fn default() -> Self {
        Kernel::new()
    }
}

impl<P> fmt::Debug for Kernel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.shared.config.name)
            .field("now", &self.shared.now())
            .field("live_tasks", &self.live_tasks())
            .field("timers", &self.shared.timers.borrow().len())
            .finish()
    }
}

impl<P> Drop for Kernel<P> {
    fn drop(&mut self) {
        // Task futures hold the kernel through their contexts; break the cycle.
        let tasks = mem::take(&mut *self.shared.tasks.borrow_mut());
        drop(tasks);
        self.shared.timers.borrow_mut().clear();
        self.shared.ready.close();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::error::RequestError;
    use crate::status::Status;

    type Payload = &'static str;

    fn kernel() -> Kernel<Payload> {
        let _ = env_logger::builder().is_test(true).try_init();
        KernelBuilder::new().name("test").build()
    }

    #[test]
    fn test_share_with_no_requesters_returns() {
        let kernel = kernel();
        let s = kernel.spawn("s", |cx| async move { cx.share("X").await });
        let summary = kernel.run();
        assert_eq!(Some(0), s.take_output());
        assert_eq!(0, s.task().pending_acks());
        assert_eq!(0, summary.live_tasks);
        assert_eq!(0, summary.now);
    }

    #[test]
    fn test_one_requester_round_trip() {
        let kernel = kernel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let s = kernel.spawn("s", {
            let log = Rc::clone(&log);
            move |cx| async move {
                cx.sleep(1).await;
                let served = cx.share("X").await;
                log.borrow_mut().push("s done");
                served
            }
        });
        let target = s.task().clone();
        let r1 = kernel.spawn("r1", {
            let log = Rc::clone(&log);
            move |cx| async move {
                let answer = cx.request(&target, 0).await;
                log.borrow_mut().push("r1 answered");
                cx.release(&target).await;
                log.borrow_mut().push("r1 released");
                answer
            }
        });

        let summary = kernel.run();
        assert_eq!(Some(Ok("X")), r1.take_output());
        assert_eq!(Some(1), s.take_output());
        assert_eq!(
            vec!["r1 answered", "r1 released", "s done"],
            *log.borrow()
        );
        assert_eq!(Status::Ready, s.task().status());
        assert_eq!(0, summary.violations);
        assert_eq!(1, summary.now);
    }

    #[test]
    fn test_two_requesters_fifo() {
        let kernel = kernel();
        let order = Rc::new(RefCell::new(Vec::new()));

        let s = kernel.spawn("s", |cx| async move {
            cx.sleep(1).await;
            cx.share("X").await
        });
        let mut requesters = Vec::new();
        for name in ["r1", "r2"].iter() {
            let target = s.task().clone();
            let order = Rc::clone(&order);
            let name = *name;
            requesters.push(kernel.spawn(name, move |cx| async move {
                let answer = cx.request(&target, 0).await;
                order.borrow_mut().push(name);
                // Hold the payload for a while before handing it back.
                cx.sleep(3).await;
                cx.release(&target).await;
                answer
            }));
        }

        kernel.run();
        assert_eq!(vec!["r1", "r2"], *order.borrow());
        for r in requesters.iter() {
            assert_eq!(Some(Ok("X")), r.take_output());
        }
        assert_eq!(Some(2), s.take_output());
    }

    #[test]
    fn test_sharer_blocks_until_all_release() {
        let kernel = kernel();
        let s = kernel.spawn("s", |cx| async move {
            cx.sleep(1).await;
            cx.share("X").await
        });
        let target = s.task().clone();
        let r1 = kernel.spawn("r1", {
            let target = target.clone();
            move |cx| async move {
                let answer = cx.request(&target, 0).await;
                cx.release(&target).await;
                answer
            }
        });
        // Never releases.
        let r2 = kernel.spawn("r2", move |cx| async move { cx.request(&target, 0).await });

        let summary = kernel.run();
        assert_eq!(Some(Ok("X")), r1.take_output());
        assert_eq!(Some(Ok("X")), r2.take_output());
        assert!(!s.is_finished());
        assert_eq!(Status::WaitReply, s.task().status());
        assert_eq!(1, s.task().pending_acks());
        assert_eq!(1, summary.live_tasks);
    }

    #[test]
    fn test_request_times_out() {
        let kernel = kernel();
        let s = kernel.spawn("s", |cx| async move {
            cx.sleep(20).await;
            cx.share("late").await
        });
        let target = s.task().clone();
        let r1 = kernel.spawn("r1", move |cx| async move {
            let answer = cx.request(&target, 5).await;
            (answer, cx.now(), target.has_queued(cx.task()))
        });

        kernel.run();
        assert_eq!(Some((Err(RequestError::TimedOut(5)), 5, false)), r1.take_output());
        // The sharer later finds nobody to answer.
        assert_eq!(Some(0), s.take_output());
    }

    #[test]
    fn test_answer_before_deadline_disarms_timer() {
        let kernel = kernel();
        let s = kernel.spawn("s", |cx| async move {
            cx.sleep(2).await;
            cx.share("X").await
        });
        let target = s.task().clone();
        let r1 = kernel.spawn("r1", move |cx| async move {
            let answer = cx.request(&target, 5).await;
            cx.release(&target).await;
            // Outlive the request deadline.
            cx.sleep(10).await;
            (answer, cx.task().status())
        });

        let summary = kernel.run();
        assert_eq!(Some((Ok("X"), Status::Ready)), r1.take_output());
        assert_eq!(12, summary.now);
        assert_eq!(0, summary.live_tasks);
    }

    #[test]
    fn test_fast_path_during_ack_wait() {
        let kernel = kernel();
        let s = kernel.spawn("s", |cx| async move {
            cx.sleep(1).await;
            cx.share("X").await
        });
        let target = s.task().clone();
        let r1 = kernel.spawn("r1", {
            let target = target.clone();
            move |cx| async move {
                let answer = cx.request(&target, 0).await;
                cx.sleep(5).await;
                cx.release(&target).await;
                answer
            }
        });
        let late = kernel.spawn("late", move |cx| async move {
            cx.sleep(3).await;
            let before = target.pending_acks();
            let answer = cx.request(&target, 0).await;
            let after = target.pending_acks();
            let at = cx.now();
            cx.release(&target).await;
            (answer, before, after, at)
        });

        kernel.run();
        assert_eq!(Some(Ok("X")), r1.take_output());
        assert_eq!(Some((Ok("X"), 1, 2, 3)), late.take_output());
        assert_eq!(Some(2), s.take_output());
    }

    #[test]
    fn test_release_misuse_counted() {
        let kernel = kernel();
        let s = kernel.spawn("s", |_| async move {});
        let target = s.task().clone();
        kernel.spawn("r", move |cx| async move { cx.release(&target).await });

        let summary = kernel.run();
        assert_eq!(1, summary.violations);
        assert_eq!(0, summary.live_tasks);
        assert_eq!(0, s.task().pending_acks());
    }

    #[test]
    fn test_join_from_task() {
        let kernel = kernel();
        let child = kernel.spawn("child", |cx| async move {
            cx.sleep(4).await;
            cx.now()
        });
        let parent = kernel.spawn("parent", move |_| async move { child.await + 1 });
        kernel.run();
        assert_eq!(Some(5), parent.take_output());
    }

    #[test]
    fn test_builder_config() {
        let builder = KernelBuilder::new().name("k1").tick_limit(3).task_capacity(64);
        assert_eq!(64, builder.config().task_capacity);
        let kernel: Kernel<Payload> = builder.build();
        assert_eq!(
            &KernelConfig {
                name: String::from("k1"),
                tick_limit: Some(3),
                task_capacity: 64,
            },
            kernel.config()
        );
        assert_eq!(16, KernelConfig::default().task_capacity);
    }

    #[test]
    fn test_tick_limit_stops_run() {
        let _ = env_logger::builder().is_test(true).try_init();
        let kernel: Kernel<Payload> = KernelBuilder::new().tick_limit(10).build();
        let sleeper = kernel.spawn("sleeper", |cx| async move { cx.sleep(50).await });
        let summary = kernel.run();
        assert!(!sleeper.is_finished());
        assert_eq!(0, summary.now);
        assert_eq!(1, summary.live_tasks);
    }

    #[test]
    fn test_random_interleavings() {
        let _ = env_logger::builder().is_test(true).try_init();
        for seed in 0..32 {
            let rng = fastrand::Rng::with_seed(seed);
            let kernel: Kernel<u32> = KernelBuilder::new().name(format!("seed{}", seed)).build();
            let requesters = rng.usize(1..12);
            let done = Rc::new(Cell::new(0));

            let s = kernel.spawn("s", {
                let done = Rc::clone(&done);
                move |cx| async move {
                    let mut served = 0;
                    let mut round = 0;
                    while done.get() < requesters {
                        cx.sleep(1).await;
                        served += cx.share(round).await;
                        round += 1;
                    }
                    served
                }
            });

            let mut handles = Vec::new();
            for i in 0..requesters {
                let target = s.task().clone();
                let done = Rc::clone(&done);
                let delay = rng.u64(0..10);
                let timeout = if rng.bool() { 0 } else { rng.u64(1..15) };
                let hold = rng.u64(0..5);
                handles.push(kernel.spawn(format!("r{}", i), move |cx| async move {
                    cx.sleep(delay).await;
                    let answer = cx.request(&target, timeout).await;
                    if answer.is_ok() {
                        cx.sleep(hold).await;
                        cx.release(&target).await;
                    }
                    done.set(done.get() + 1);
                    answer
                }));
            }

            let summary = kernel.run();
            assert_eq!(0, summary.live_tasks, "seed {}", seed);
            assert_eq!(0, summary.violations, "seed {}", seed);

            let mut answered = 0;
            for r in handles.iter() {
                match r.take_output() {
                    Some(Ok(_)) => answered += 1,
                    Some(Err(RequestError::TimedOut(_))) => {}
                    other => panic!("seed {}: unexpected outcome {:?}", seed, other),
                }
                assert_eq!(Status::Ready, r.task().status());
                assert!(!r.task().is_queued());
            }
            assert_eq!(Some(answered), s.take_output(), "seed {}", seed);
            assert_eq!(0, s.task().pending_acks());
            assert_eq!(0, s.task().queued_requests());
            assert_eq!(Status::Ready, s.task().status());
        }
    }

    #[test]
    fn test_drop_kernel_with_blocked_tasks() {
        let kernel: Kernel<Payload> = KernelBuilder::new().tick_limit(10).build();
        let s = kernel.spawn("s", |cx| async move { cx.share("X").await });
        let target = s.task().clone();
        let r = kernel.spawn("r", move |cx| async move { cx.request(&target, 100).await });
        // The deadline is past the tick limit, so the requester stays queued.
        let summary = kernel.run();
        assert_eq!(1, summary.live_tasks);
        let sharer = s.task().clone();
        assert!(sharer.has_queued(r.task()));

        drop(kernel);
        assert_eq!(0, sharer.queued_requests());
        assert_eq!(Status::Ready, r.task().status());
        assert!(!r.is_finished());
    }
}
