//! Error types returned across the BLIP layers.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Errors that can occur while framing, scheduling, or transporting messages.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Malformed varint, reserved flag bits, unknown message type, or a
    /// frame referencing a message that does not exist. Fatal; the
    /// connection closes with status 1002.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// The running CRC32 did not match the frame's trailing checksum.
    /// Fatal; the connection closes with status 1002.
    #[error("frame checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch {
        /// Checksum computed over the bytes actually received.
        expected: u32,
        /// Checksum carried by the frame.
        actual: u32,
    },
    /// The deflate engine reported a failure or overflowed its output
    /// budget. Fatal; the connection closes with status 1011.
    #[error("compression error: {0}")]
    Compression(String),
    /// An incoming message exceeded the configured size cap. Fatal; the
    /// connection closes with status 1009.
    #[error("message too large")]
    MessageTooLarge,
    /// No traffic arrived within the response timeout. The connection
    /// closes with status 1001 and pending messages report Disconnected.
    #[error("connection timed out")]
    Timeout,
    /// The underlying byte stream failed; carries the platform errno when
    /// one is known.
    #[error("transport error (errno {0})")]
    Transport(i32),
    /// Invalid use of the API (responding twice, sending after close).
    /// Surfaced to the caller; never disrupts the connection.
    #[error("usage error: {0}")]
    Usage(&'static str),
    /// Wrapper for I/O errors bubbling up from buffer plumbing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ErrorKind {
    /// Maps a connection-fatal error to the WebSocket close status it
    /// produces. Non-fatal kinds return None.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            ErrorKind::Protocol(_) | ErrorKind::ChecksumMismatch { .. } => Some(1002),
            ErrorKind::Compression(_) => Some(1011),
            ErrorKind::MessageTooLarge => Some(1009),
            ErrorKind::Timeout => Some(1001),
            ErrorKind::Transport(_) => None, // Socket is already gone
            ErrorKind::Usage(_) | ErrorKind::Io(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors_map_to_close_codes() {
        assert_eq!(ErrorKind::Protocol("reserved bits").close_code(), Some(1002));
        assert_eq!(
            ErrorKind::ChecksumMismatch { expected: 1, actual: 2 }.close_code(),
            Some(1002)
        );
        assert_eq!(ErrorKind::Compression("inflate".into()).close_code(), Some(1011));
        assert_eq!(ErrorKind::MessageTooLarge.close_code(), Some(1009));
        assert_eq!(ErrorKind::Timeout.close_code(), Some(1001));
    }

    #[test]
    fn test_non_fatal_errors_have_no_close_code() {
        assert_eq!(ErrorKind::Usage("respond twice").close_code(), None);
        assert_eq!(ErrorKind::Transport(104).close_code(), None);
    }
}
