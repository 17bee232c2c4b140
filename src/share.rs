//! The request / share / release rendezvous.
//!
//! A sharer broadcasts one payload to every task that asked for it, then blocks until each of
//! them hands it back with [`release`]. The three operations are plain futures parameterized by
//! a [`Scheduler`] and explicit task handles; they suspend only at the points documented below
//! and mutate task records only between suspension points.
//!
//! ### Races
//!
//! A requester with a deadline can be resumed either by a share or by its timer, and whichever
//! happens first wins exactly once:
//!
//! 1. A share that dequeues a `WaitSendTimeout` requester disarms its timer before waking it.
//! 2. [`expire`] only acts on a requester that is still `WaitSendTimeout`, and unlinks it from the
//!    sharer's queue so a later share never sees it.
//!
//! Queue entries that are no longer waiting when a share drains them are skipped silently.
use std::future::Future;
use std::rc::Weak;
use std::task::Poll;

use futures_lite::future::poll_fn;

use crate::error::{RequestError, Ticks};
use crate::scheduler::Scheduler;
use crate::status::Status;
use crate::task::Task;

/// Ask `target` for data on behalf of `me`.
///
/// If `target` is currently waiting for acknowledgments of a share, its payload is adopted on
/// the spot. Otherwise `me` queues on `target` and suspends until `target` shares, or until
/// `timeout` ticks pass. A `timeout` of zero waits forever.
///
/// Every `Ok` answer must be handed back with exactly one [`release`].
pub async fn request<P, S>(
    sched: &S,
    me: &Task<P>,
    target: &Task<P>,
    timeout: Ticks,
) -> Result<P, RequestError>
where
    P: Clone,
    S: Scheduler<P> + ?Sized,
{
    if me.ptr_eq(target) {
        return Err(RequestError::OwnTask(me.id()));
    }

    {
        let mut sharer = target.state();
        let current = match sharer.mailbox {
            Some(ref payload) if sharer.status == Status::WaitReply => Some(payload.clone()),
            _ => None,
        };
        if let Some(payload) = current {
            sharer.pending_acks += 1;
            sharer.served += 1;
            log::debug!(
                "{} joined the share of {} ({} pending acks)",
                me,
                target,
                sharer.pending_acks
            );
            return Ok(payload);
        }
    }

    target.state().requests.push_back(me.inner());
    {
        let mut state = me.state();
        state.mailbox = None;
        state.waiting_on = Some(target.downgrade());
    }
    if timeout > 0 {
        me.set_status(Status::WaitSendTimeout);
        sched.program_timeout(me, timeout);
        log::debug!("{} queued on {} for {} ticks", me, target, timeout);
    } else {
        me.set_status(Status::WaitSend);
        log::debug!("{} queued on {}", me, target);
    }

    let pending = scopeguard::guard((), |_| abandon(sched, me));
    poll_fn(|_| {
        if me.status().is_waiting_send() {
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    })
    .await;
    scopeguard::ScopeGuard::into_inner(pending);

    let answer = {
        let mut state = me.state();
        state.waiting_on = None;
        state.mailbox.take()
    };
    match answer {
        Some(payload) => Ok(payload),
        None => {
            log::debug!("{} gave up on {} after {} ticks", me, target, timeout);
            Err(RequestError::TimedOut(timeout))
        }
    }
}

/// Hand `payload` from `me` to every task waiting on it, then wait for all of them to release it.
///
/// Queued requesters are answered in the order they queued. While `me` waits, late requesters
/// join through the fast path of [`request`] and must be released as well. Returns the number
/// of requesters that took part; zero if nobody asked, in which case nothing blocks.
pub async fn share<P, S>(sched: &S, me: &Task<P>, payload: P) -> usize
where
    P: Clone,
    S: Scheduler<P> + ?Sized,
{
    {
        let mut state = me.state();
        state.mailbox = Some(payload.clone());
        state.served = 0;
    }
    log::debug!("{} started sharing", me);

    loop {
        let next = me.state().requests.pop_front();
        let requester = match next {
            Some(inner) => Task::from_inner(inner),
            None => break,
        };
        let status = requester.status();
        if !status.is_waiting_send() {
            log::trace!("{} skipped stale request from {}", me, requester);
            continue;
        }
        if status == Status::WaitSendTimeout {
            sched.cancel_timeout(&requester);
        }
        requester.set_status(Status::Ready);
        requester.state().mailbox = Some(payload.clone());
        {
            let mut state = me.state();
            state.pending_acks += 1;
            state.served += 1;
        }
        log::debug!("{} answered {}", me, requester);
        sched.make_ready(&requester);
    }

    let sharing = scopeguard::guard((), |_| stop_sharing(me));
    poll_fn(|_| {
        if me.pending_acks() == 0 {
            return Poll::Ready(());
        }
        if me.status() != Status::WaitReply {
            me.set_status(Status::WaitReply);
            log::debug!("{} waiting for {} releases", me, me.pending_acks());
        }
        Poll::Pending
    })
    .await;
    scopeguard::ScopeGuard::into_inner(sharing);

    stop_sharing(me);
    let served = me.state().served;
    log::debug!("{} finished sharing with {} requesters", me, served);
    served
}

/// Hand back the payload `me` obtained from `target`.
///
/// `me` goes back on the ready set and yields. If this was the last outstanding answer,
/// `target` becomes ready as well, after `me`. Releasing a task that is not waiting for
/// acknowledgments is reported to the scheduler and otherwise tolerated.
pub async fn release<P, S>(sched: &S, me: &Task<P>, target: &Task<P>)
where
    S: Scheduler<P> + ?Sized,
{
    if target.status() != Status::WaitReply {
        sched.protocol_violation(me, target);
    }
    sched.make_ready(me);
    acknowledge(sched, me, target);
    suspend().await;
}

/// Timer expiry for a requester armed through [`Scheduler::program_timeout`].
///
/// Returns true if the deadline won: `task` left its sharer's queue and is ready again with no
/// answer. Returns false if the request was already resolved.
pub fn expire<P, S>(sched: &S, task: &Task<P>) -> bool
where
    S: Scheduler<P> + ?Sized,
{
    if task.status() != Status::WaitSendTimeout {
        log::trace!("stale timeout for {} ({})", task, task.status());
        return false;
    }
    unlink(task);
    task.set_status(Status::Ready);
    task.state().mailbox = None;
    log::debug!("{} timed out", task);
    sched.make_ready(task);
    true
}

fn acknowledge<P, S>(sched: &S, me: &Task<P>, target: &Task<P>)
where
    S: Scheduler<P> + ?Sized,
{
    let remaining = {
        let mut sharer = target.state();
        sharer.pending_acks = sharer.pending_acks.saturating_sub(1);
        sharer.pending_acks
    };
    log::debug!("{} released {} ({} pending acks)", me, target, remaining);
    if remaining == 0 && target.status() == Status::WaitReply {
        target.set_status(Status::Ready);
        sched.make_ready(target);
    }
}

fn unlink<P>(task: &Task<P>) {
    let sharer = task.state().waiting_on.as_ref().and_then(Weak::upgrade);
    if let Some(sharer) = sharer {
        let _removed = sharer.state().requests.remove(&task.inner());
    }
}

// Also runs when a share is dropped mid-wait: releases still owed for it become violations.
fn stop_sharing<P>(me: &Task<P>) {
    if me.status() == Status::WaitReply {
        me.set_status(Status::Ready);
    }
    let mut state = me.state();
    state.pending_acks = 0;
    state.mailbox = None;
}

// A request future dropped before it resumed.
fn abandon<P, S>(sched: &S, me: &Task<P>)
where
    S: Scheduler<P> + ?Sized,
{
    let status = me.status();
    if status.is_waiting_send() {
        if status == Status::WaitSendTimeout {
            sched.cancel_timeout(me);
        }
        unlink(me);
        me.set_status(Status::Ready);
        me.state().waiting_on = None;
        log::debug!("{} abandoned its request", me);
        return;
    }

    // Answered but never observed: the acknowledgment is still owed.
    let (answer, sharer) = {
        let mut state = me.state();
        let sharer = state.waiting_on.take().and_then(|w| w.upgrade());
        (state.mailbox.take(), sharer)
    };
    if let (Some(_), Some(sharer)) = (answer, sharer) {
        acknowledge(sched, me, &Task::from_inner(sharer));
    }
}

fn suspend() -> impl Future<Output = ()> {
    let mut yielded = false;
    poll_fn(move |_| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            Poll::Pending
        }
    })
}
