//! Message types, frame flags, and the frame header.
//!
//! Every frame begins with `varint(message number)` followed by
//! `varint(flags)`. The low three flag bits carry the message type; the
//! remaining defined bits are Compressed, Urgent, NoReply, and MoreComing.

use blip_core::{ErrorKind, Result};

use crate::varint::{put_uvarint, try_get_uvarint};

/// Identifies a message within one direction of a connection. Numbers are
/// assigned monotonically from 1; zero is reserved.
pub type MessageNo = u64;

/// The 3-bit message type carried in every frame's flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A request, expecting a response unless NoReply is set.
    Request = 0,
    /// A successful response to a request.
    Response = 1,
    /// An error response to a request.
    Error = 2,
    /// Flow-control acknowledgment of request frames; payload is a varint
    /// cumulative byte count.
    AckRequest = 4,
    /// Flow-control acknowledgment of response frames.
    AckResponse = 5,
}

impl MessageType {
    /// Decodes the low three bits of a flags byte. Values 3, 6, and 7 are
    /// unassigned and rejected.
    pub fn from_bits(bits: u8) -> Result<MessageType> {
        match bits & FrameFlags::TYPE_MASK {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Response),
            2 => Ok(MessageType::Error),
            4 => Ok(MessageType::AckRequest),
            5 => Ok(MessageType::AckResponse),
            _ => Err(ErrorKind::Protocol("unknown message type")),
        }
    }

    /// Returns true for the two ACK control types.
    pub fn is_ack(self) -> bool {
        matches!(self, MessageType::AckRequest | MessageType::AckResponse)
    }

    /// Returns true for Response and Error.
    pub fn is_response(self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }

    /// The ACK type that acknowledges frames of this message type.
    pub fn ack_type(self) -> MessageType {
        if self.is_response() {
            MessageType::AckResponse
        } else {
            MessageType::AckRequest
        }
    }

    /// Short name used in log output.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Request => "REQ",
            MessageType::Response => "RES",
            MessageType::Error => "ERR",
            MessageType::AckRequest => "ACKREQ",
            MessageType::AckResponse => "ACKRES",
        }
    }
}

/// The flags byte of a frame: message type plus delivery modifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Mask of the 3-bit message type.
    pub const TYPE_MASK: u8 = 0x07;
    /// Message body is deflate-compressed.
    pub const COMPRESSED: u8 = 0x08;
    /// Scheduler priority hint.
    pub const URGENT: u8 = 0x10;
    /// A response is neither expected nor permitted.
    pub const NO_REPLY: u8 = 0x20;
    /// More frames of this message follow.
    pub const MORE_COMING: u8 = 0x40;
    /// Bits with no assigned meaning; a set bit here is a protocol error.
    pub const RESERVED: u8 = 0x80;

    /// Builds flags from a type and modifier bits.
    pub fn new(message_type: MessageType, modifiers: u8) -> FrameFlags {
        debug_assert_eq!(modifiers & Self::TYPE_MASK, 0);
        FrameFlags(message_type as u8 | (modifiers & !Self::TYPE_MASK & !Self::RESERVED))
    }

    /// Validates and decodes a received flags byte.
    pub fn from_bits(bits: u8) -> Result<FrameFlags> {
        if bits & Self::RESERVED != 0 {
            return Err(ErrorKind::Protocol("reserved flag bits set"));
        }
        MessageType::from_bits(bits)?;
        Ok(FrameFlags(bits))
    }

    /// Returns the raw flags byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// The message type encoded in the low three bits.
    pub fn message_type(self) -> MessageType {
        MessageType::from_bits(self.0).expect("flags hold a validated type")
    }

    /// True for AckRequest/AckResponse frames.
    pub fn is_ack(self) -> bool {
        self.message_type().is_ack()
    }

    /// True if the message body is deflate-compressed.
    pub fn compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// True if the message requested priority scheduling.
    pub fn urgent(self) -> bool {
        self.0 & Self::URGENT != 0
    }

    /// True if no response is expected or permitted.
    pub fn no_reply(self) -> bool {
        self.0 & Self::NO_REPLY != 0
    }

    /// True if more frames of this message follow.
    pub fn more_coming(self) -> bool {
        self.0 & Self::MORE_COMING != 0
    }

    /// Returns a copy with the MoreComing bit set or cleared.
    pub fn with_more_coming(self, more: bool) -> FrameFlags {
        if more {
            FrameFlags(self.0 | Self::MORE_COMING)
        } else {
            FrameFlags(self.0 & !Self::MORE_COMING)
        }
    }

    /// Returns a copy carrying a different message type (used when the
    /// first frame of a reply turns out to be an Error).
    pub fn with_type(self, message_type: MessageType) -> FrameFlags {
        FrameFlags((self.0 & !Self::TYPE_MASK) | message_type as u8)
    }
}

/// The decoded leading varints of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message number within its direction; never zero.
    pub number: MessageNo,
    /// Validated flags byte.
    pub flags: FrameFlags,
}

impl FrameHeader {
    /// Appends `varint(number) ∥ varint(flags)` to `dst`.
    pub fn encode_into(&self, dst: &mut Vec<u8>) {
        put_uvarint(dst, self.number);
        put_uvarint(dst, u64::from(self.flags.bits()));
    }

    /// Decodes a header from the front of `src`, advancing it past the
    /// two varints.
    pub fn decode(src: &mut &[u8]) -> Result<FrameHeader> {
        let number = try_get_uvarint(src)?;
        if number == 0 {
            return Err(ErrorKind::Protocol("message number zero is reserved"));
        }
        let raw_flags = try_get_uvarint(src)?;
        if raw_flags > u64::from(u8::MAX) {
            return Err(ErrorKind::Protocol("flags varint out of range"));
        }
        let flags = FrameFlags::from_bits(raw_flags as u8)?;
        Ok(FrameHeader { number, flags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = FrameHeader {
            number: 300,
            flags: FrameFlags::new(MessageType::Request, FrameFlags::URGENT | FrameFlags::MORE_COMING),
        };
        let mut buf = Vec::new();
        header.encode_into(&mut buf);

        let mut slice = &buf[..];
        let decoded = FrameHeader::decode(&mut slice).unwrap();
        assert_eq!(decoded, header);
        assert!(slice.is_empty());
        assert!(decoded.flags.urgent());
        assert!(decoded.flags.more_coming());
        assert!(!decoded.flags.compressed());
    }

    #[test]
    fn test_message_number_zero_rejected() {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, 0u64);
        put_uvarint(&mut buf, 0u64);
        let mut slice = &buf[..];
        assert!(matches!(FrameHeader::decode(&mut slice), Err(ErrorKind::Protocol(_))));
    }

    #[test]
    fn test_reserved_bits_rejected() {
        assert!(matches!(FrameFlags::from_bits(0x80), Err(ErrorKind::Protocol(_))));
    }

    #[test]
    fn test_unknown_type_rejected() {
        for bits in [3u8, 6, 7] {
            assert!(matches!(FrameFlags::from_bits(bits), Err(ErrorKind::Protocol(_))));
        }
    }

    #[test]
    fn test_more_coming_toggle() {
        let flags = FrameFlags::new(MessageType::Response, 0);
        assert!(!flags.more_coming());
        assert!(flags.with_more_coming(true).more_coming());
        assert!(!flags.with_more_coming(true).with_more_coming(false).more_coming());
    }

    #[test]
    fn test_ack_types() {
        assert_eq!(MessageType::Request.ack_type(), MessageType::AckRequest);
        assert_eq!(MessageType::Response.ack_type(), MessageType::AckResponse);
        assert_eq!(MessageType::Error.ack_type(), MessageType::AckResponse);
        assert!(MessageType::AckRequest.is_ack());
        assert!(!MessageType::Request.is_ack());
    }
}
