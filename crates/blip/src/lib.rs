#![warn(missing_docs)]

//! Blip: a small public API facade for the workspace.
//!
//! This crate provides a clean, stable surface that re-exports the most
//! commonly used types for request/response messaging over WebSockets:
//!
//! - Connection and its delegate (`Connection`, `ConnectionDelegate`)
//! - Message types (`MessageBuilder`, `MessageIn`, `Progress`, ...)
//! - WebSocket plumbing (`WebSocket`, `LoopbackWebSocket`, `CloseStatus`)
//! - Core configuration (`Config`)
//!
//! Example
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use blip::{Connection, ConnectionDelegate, Config, LoopbackWebSocket, MessageBuilder};
//!
//! struct Echo;
//! impl ConnectionDelegate for Echo {
//!     fn on_request(&self, request: Arc<blip::MessageIn>) {
//!         let body = request.body().as_slice().to_vec();
//!         let _ = request.respond(MessageBuilder::new().body(body));
//!     }
//!     fn on_close(&self, _status: blip::CloseStatus) {}
//! }
//!
//! let (client_ws, server_ws) = LoopbackWebSocket::pair(Duration::ZERO);
//! let _server = Connection::connect(server_ws, Arc::new(Echo), Config::default());
//! # let _ = client_ws;
//! ```

mod connection;

pub use connection::Connection;

// Core config
pub use blip_core::{Config, ErrorKind, Result, SharedBytes};
// Engine: messages, progress, the delegate
pub use blip_peer::{
    ConnectionDelegate, MessageBuilder, MessageError, MessageIn, Progress, ProgressState,
};
// WebSocket layer: trait, loopback pairs, close status
pub use blip_websocket::{CloseReason, CloseStatus, LoopbackWebSocket, WebSocket, WebSocketImpl};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        CloseReason, CloseStatus, Config, Connection, ConnectionDelegate, ErrorKind,
        LoopbackWebSocket, MessageBuilder, MessageError, MessageIn, Progress, ProgressState,
        WebSocket,
    };
}
