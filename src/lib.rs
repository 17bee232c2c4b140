//! Blocking share / request / release rendezvous for cooperative task kernels.
//!
//! One task, the sharer, calls [`share`](share::share) with a payload. Every task that called
//! [`request`](share::request) on it, or that does so while the sharer is still waiting, gets a
//! copy of the payload. The sharer stays blocked until each of them hands the payload back with
//! [`release`](share::release).
//!
//! The protocol itself lives in [`share`] and only needs a [`Scheduler`] that can put tasks on a
//! ready set and arm one-shot timers. This crate also ships [`Kernel`], a deterministic,
//! single-threaded executor with a virtual clock that implements those services:
//!
//! ```
//! use handoff::Kernel;
//!
//! let kernel: Kernel<&str> = Kernel::new();
//! let sharer = kernel.spawn("sharer", |cx| async move {
//!     cx.sleep(1).await;
//!     cx.share("hello").await
//! });
//! let target = sharer.task().clone();
//! let requester = kernel.spawn("requester", move |cx| async move {
//!     let answer = cx.request(&target, 0).await;
//!     cx.release(&target).await;
//!     answer
//! });
//!
//! kernel.run();
//! assert_eq!(Some(Ok("hello")), requester.take_output());
//! assert_eq!(Some(1), sharer.take_output());
//! ```
//!
//! Each task carries a [`Status`]:
//!
//! * `Ready` while running or runnable.
//! * `WaitSend` / `WaitSendTimeout` while queued on a sharer, without or with a deadline.
//! * `WaitReply` while sharing and waiting for releases.
#![warn(missing_debug_implementations, rust_2018_idioms)]

mod context;
mod error;
mod executor;
mod join;
mod scheduler;
pub mod share;
mod status;
mod sys;
mod task;

pub use crate::context::{Sleep, TaskContext};
pub use crate::error::{IllegalTransition, RequestError, Ticks};
pub use crate::executor::{Kernel, KernelBuilder, KernelConfig, RunSummary};
pub use crate::join::JoinHandle;
pub use crate::scheduler::Scheduler;
pub use crate::status::Status;
pub use crate::task::{Task, TaskId};
