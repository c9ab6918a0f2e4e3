#![warn(missing_docs)]

//! blip-core: foundational types and utilities.
//!
//! This crate provides the minimal set of core utilities shared across all layers:
//! - Configuration types
//! - Error handling
//! - Protocol constants
//! - Shared, reference-counted byte buffers
//!
//! Protocol-specific logic lives in specialized crates:
//! - `blip-protocol`: varints, frame headers, properties, the streaming codec
//! - `blip-runtime`: mailboxes, timers, the async helper
//! - `blip-websocket`: WebSocket framing and loopback transports
//! - `blip-peer`: messages, the outbox, and the protocol engine

/// Protocol constants shared across layers.
pub mod constants {
    /// Per-message flow control window: a peer stops sending frames of a
    /// message once this many bytes are unacknowledged.
    pub const ACK_THRESHOLD: u64 = 50_000;
    /// Soft cap on the payload size of a single BLIP frame.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024;
    /// Size of the refill buffer used when pulling from a streaming data source.
    pub const DATA_BUFFER_SIZE: usize = 16 * 1024;
    /// Size of the CRC32 suffix appended to every data frame.
    pub const CHECKSUM_SIZE: usize = 4;
    /// Default interval between WebSocket PINGs, in seconds.
    pub const DEFAULT_HEARTBEAT_SECS: u64 = 5 * 60;
    /// Upper clamp for the configured heartbeat interval, in seconds.
    pub const MAX_HEARTBEAT_SECS: u64 = 60 * 60;
    /// Soft limit on bytes written to the transport but not yet flushed;
    /// above this, `send` reports back-pressure.
    pub const SEND_BUFFER_SIZE: usize = 32 * 1024;
    /// Largest complete WebSocket message accepted before closing with 1009.
    pub const MAX_WEBSOCKET_MESSAGE_SIZE: usize = 128 * 1024 * 1024;
    /// Lowest valid message number; zero is reserved.
    pub const FIRST_MESSAGE_NUMBER: u64 = 1;
}

/// Configuration options for a BLIP connection.
pub mod config;
/// Error types and results.
pub mod error;
/// Shared, reference-counted byte slices with zero-copy slicing.
pub mod shared;

pub use config::Config;
pub use error::{ErrorKind, Result};
pub use shared::SharedBytes;
