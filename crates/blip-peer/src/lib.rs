#![warn(missing_docs)]

//! blip-peer: the BLIP protocol engine.
//!
//! One [`BlipIo`] drives each side of a connection: it owns the outgoing
//! priority queue, the request/response tables, the per-direction codecs,
//! and ACK-based flow control, all serialized behind a mailbox. Above it
//! sits a thin connection facade; below it, any [`blip_websocket::WebSocket`].
//!
//! Module layout:
//! - [`message`] - progress reporting and the error-reply payload
//! - [`builder`] - constructing outgoing messages
//! - [`message_out`] - an outgoing message streaming itself into frames
//! - [`message_in`] - an incoming message assembling itself from frames
//! - [`outbox`] - the urgency-aware send queue
//! - [`io`] - the engine actor

pub mod builder;
pub mod io;
pub mod message;
pub mod message_in;
pub mod message_out;
mod outbox;

pub use builder::MessageBuilder;
pub use io::{BlipIo, ConnectionDelegate};
pub use message::{MessageError, Progress, ProgressCallback, ProgressState};
pub use message_in::{MessageIn, ReceiveState};
pub use message_out::{DataSource, MessageOut};
