//! Runtime-agnostic composable task and synchronization primitives for
//! asynchronous Rust.
//!
//! This crate provides three task flavors with different start and sharing
//! semantics, and two primitives for coordinating them:
//!
//! - [`Task`]: eagerly started, single consumer.
//! - [`LazyTask`]: starts at the first await, single consumer.
//! - [`SharedTask`]: eagerly started, any number of consumers.
//! - [`Mutex`]: a FIFO mutual-exclusion lock that suspends instead of
//!   blocking.
//! - [`Event`]: a one-shot gate releasing a single waiter.
//!
//! None of the primitives schedule anything themselves: a suspended frame
//! resumes on whichever context wakes it, whether that is the same call
//! stack or another thread. There are no timers, no I/O and no worker
//! threads; an executor such as `tokio` can drive the futures, but none is
//! required.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use cotask::{Event, Task};
//!
//! let event = Arc::new(Event::new());
//!
//! let gate = event.clone();
//! let task = Task::new(async move {
//!     gate.wait().await;
//!     1 + 2
//! });
//!
//! assert!(!task.is_ready());
//!
//! // Resumes the task on this call stack.
//! event.set();
//! assert!(task.is_ready());
//! ```
pub mod error;
pub mod event;
pub mod lazy;
pub mod mutex;
pub mod shared;
pub mod task;

mod wait_queue;
mod waker_slot;

pub use error::JoinError;
pub use event::{Event, Wait};
pub use lazy::LazyTask;
pub use mutex::{Mutex, MutexGuard};
pub use shared::SharedTask;
pub use task::Task;
