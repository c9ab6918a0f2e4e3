#![warn(missing_docs)]

//! blip-websocket: the WebSocket layer BLIP rides on.
//!
//! [`WebSocketImpl`] implements RFC 6455 framing over an abstract
//! [`Transport`]: it encodes and decodes frames, reassembles fragmented
//! messages, runs heartbeats and response timeouts, tracks outgoing
//! buffer levels for back-pressure, and reports exactly one close event
//! to its delegate. It never touches a socket itself; a transport
//! implementation moves the bytes.
//!
//! [`LoopbackWebSocket`] pairs two in-process sockets directly, skipping
//! the wire framing; it is the workhorse of the integration tests.

/// RFC 6455 frame encoding and incremental decoding.
pub mod frame;
/// Traits and status types shared by all WebSocket implementations.
pub mod interface;
/// In-process socket pairs with simulated latency and back-pressure.
pub mod loopback;
/// The framing state machine over an abstract transport.
pub mod ws;

pub use interface::{close_code, CloseReason, CloseStatus, Delegate, Role, Transport, WebSocket};
pub use loopback::LoopbackWebSocket;
pub use ws::WebSocketImpl;
