//! What the rendezvous protocol needs from the scheduler that runs it.
use crate::error::Ticks;
use crate::task::Task;

/// Scheduler services consumed by [`share`](crate::share).
///
/// The protocol assumes a single core: between two suspension points of one task no other
/// task runs and no timer fires. Every implementation must uphold that, which is what makes
/// the cross-task mutations in [`share`](crate::share) race free.
pub trait Scheduler<P> {
    /// Put `task` on the ready set. It will be dispatched later, never from within this call.
    fn make_ready(&self, task: &Task<P>);

    /// Arm a one-shot timer that calls [`expire`](crate::share::expire) on `task` once `ticks`
    /// have elapsed.
    fn program_timeout(&self, task: &Task<P>, ticks: Ticks);

    /// Disarm the timer armed for `task`. A no-op if it already fired or was never armed.
    fn cancel_timeout(&self, task: &Task<P>);

    /// `caller` released `target` although `target` was not waiting for acknowledgments.
    fn protocol_violation(&self, caller: &Task<P>, target: &Task<P>) {
        log::warn!(
            "{} released {} which is {} with {} pending acks",
            caller,
            target,
            target.status(),
            target.pending_acks()
        );
    }
}
