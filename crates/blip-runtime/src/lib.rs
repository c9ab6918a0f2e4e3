#![warn(missing_docs)]

//! blip-runtime: the cooperative execution substrate.
//!
//! Each long-lived protocol component is an actor: all of its mutable
//! state is touched only by tasks running on its [`Mailbox`], a serialized
//! FIFO queue drained by a shared worker pool. Tasks yield by returning,
//! never by blocking; delayed work goes through the shared [`Timer`]; and
//! the [`AsyncProvider`] helper lets an actor await a value without
//! holding up its mailbox.

/// Serialized task queues and the worker pool that drains them.
pub mod mailbox;
/// Bounded enqueue/execution history for post-mortem diagnostics.
pub mod manifest;
/// Shared monotonic timer service.
pub mod timer;
/// Single-slot future resolved across mailboxes.
pub mod async_value;

pub use async_value::{async_value, AsyncProvider, AsyncValue};
pub use mailbox::Mailbox;
pub use timer::Timer;
