#![warn(missing_docs)]

//! blip-protocol: the BLIP wire format.
//!
//! Every frame on the underlying binary WebSocket message is
//! `varint(message number) ∥ varint(flags) ∥ payload ∥ CRC32 (4 bytes, big-endian)`.
//! For data frames the payload is the raw or deflate-compressed
//! concatenation of the properties block and the body; for ACK frames it
//! is a single varint byte count.
//!
//! Module layout:
//! - [`varint`] - unsigned LEB128 helpers over `bytes` buffers
//! - [`frame`] - message types, frame flags, and the frame header
//! - [`properties`] - the length-prefixed NUL-separated key/value block
//! - [`codec`] - streaming deflate/inflate with the per-direction running CRC

pub mod codec;
pub mod frame;
pub mod properties;
pub mod varint;

pub use codec::{Deflater, Inflater, Mode};
pub use frame::{FrameFlags, FrameHeader, MessageNo, MessageType};
