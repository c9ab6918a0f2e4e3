//! Traits and status types shared by all WebSocket implementations.

use std::sync::Arc;

/// Standardized close codes used by this layer.
pub mod close_code {
    /// Clean shutdown.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away; also used for response timeouts.
    pub const GOING_AWAY: u16 = 1001;
    /// The peer violated the protocol.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// A data type the endpoint cannot accept.
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// A message violated endpoint policy.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// A message exceeded the size limit.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// The endpoint hit an unexpected internal condition.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Which side of the handshake this socket is; client frames are masked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The connecting side.
    Client,
    /// The accepting side.
    Server,
}

/// Why a socket closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the WebSocket close handshake; `code` is a close status.
    WebSocketClose,
    /// The underlying byte stream failed; `code` is the platform errno.
    TransportError,
    /// No traffic within the response timeout.
    Timeout,
    /// A network-level failure with no errno available.
    NetworkError,
    /// Cause unknown.
    Unknown,
}

/// The single close event a socket reports to its delegate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseStatus {
    /// What kind of thing `code` is.
    pub reason: CloseReason,
    /// Close status, errno, or zero, depending on `reason`.
    pub code: i32,
    /// Close reason text or error description.
    pub message: String,
}

impl CloseStatus {
    /// Builds a WebSocket-handshake close status.
    pub fn websocket(code: u16, message: impl Into<String>) -> CloseStatus {
        CloseStatus { reason: CloseReason::WebSocketClose, code: i32::from(code), message: message.into() }
    }

    /// Builds a transport-failure close status from an errno.
    pub fn transport(errno: i32, message: impl Into<String>) -> CloseStatus {
        CloseStatus { reason: CloseReason::TransportError, code: errno, message: message.into() }
    }

    /// True for a clean close handshake (1000 or 1001).
    pub fn is_normal(&self) -> bool {
        self.reason == CloseReason::WebSocketClose
            && (self.code == i32::from(close_code::NORMAL)
                || self.code == i32::from(close_code::GOING_AWAY))
    }
}

/// Operations a WebSocket exposes upward, to the protocol engine.
pub trait WebSocket: Send + Sync {
    /// Registers the delegate and opens the socket. Call exactly once.
    fn connect(&self, delegate: Arc<dyn Delegate>);

    /// Sends one message. Returns false once the amount of buffered
    /// outgoing data passes the soft threshold; the caller should then
    /// pause until `on_writeable`.
    fn send(&self, message: &[u8], binary: bool) -> bool;

    /// Starts a clean close with the given status.
    fn close(&self, code: u16, message: &str);
}

/// Lifecycle events and incoming messages, delivered to the layer above.
/// Callbacks arrive on threads owned by the socket implementation.
pub trait Delegate: Send + Sync {
    /// The HTTP handshake finished with this status.
    fn on_http_response(&self, status: u16) {
        let _ = status;
    }

    /// The socket is open; sending is now possible.
    fn on_connect(&self) {}

    /// A complete message arrived.
    fn on_message(&self, message: &[u8], binary: bool);

    /// Buffered outgoing data drained below the soft threshold.
    fn on_writeable(&self) {}

    /// The socket closed; delivered exactly once.
    fn on_close(&self, status: CloseStatus);
}

/// Operations a concrete transport implements below [`super::WebSocketImpl`].
pub trait Transport: Send + Sync {
    /// Initiates the underlying connection and HTTP handshake. The
    /// transport later calls `on_http_response` / `on_connect` /
    /// `on_receive` / `on_write_complete` / `on_closed` on the socket.
    fn open_socket(&self);

    /// Writes encoded frame bytes to the stream.
    fn send_bytes(&self, frame: Vec<u8>);

    /// Tears the connection down without further handshake.
    fn close_socket(&self);

    /// Acknowledges that `byte_count` received bytes were consumed,
    /// letting the transport resume reads it had paused.
    fn receive_complete(&self, byte_count: usize);

    /// Asks the transport to perform a graceful close (used when the
    /// transport, not this layer, owns close semantics).
    fn request_close(&self, code: u16, message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_close_detection() {
        assert!(CloseStatus::websocket(close_code::NORMAL, "bye").is_normal());
        assert!(CloseStatus::websocket(close_code::GOING_AWAY, "").is_normal());
        assert!(!CloseStatus::websocket(close_code::PROTOCOL_ERROR, "").is_normal());
        assert!(!CloseStatus::transport(104, "reset").is_normal());
    }
}
