//! Internals of the reference kernel and the request queue.
pub(crate) mod queue;
pub(crate) mod timer;
pub(crate) mod waker;
