//! Builder for outgoing messages.

use blip_core::SharedBytes;
use blip_protocol::properties;
use blip_protocol::varint::put_uvarint;
use blip_protocol::{FrameFlags, MessageNo, MessageType};

use crate::message::{MessageError, Progress, ProgressCallback};
use crate::message_out::{DataSource, MessageOut};

/// The request method property, conventionally set on requests.
pub const PROFILE_PROPERTY: &str = "Profile";

/// Assembles an outgoing message: properties, body, flags, an optional
/// streaming data source, and a progress callback.
///
/// ```
/// use blip_peer::MessageBuilder;
///
/// let builder = MessageBuilder::with_profile("echo")
///     .property("Channel", "7")
///     .body(b"hello".to_vec())
///     .urgent(true);
/// # let _ = builder;
/// ```
#[derive(Default)]
pub struct MessageBuilder {
    properties: Vec<(String, String)>,
    body: Vec<u8>,
    urgent: bool,
    compressed: bool,
    no_reply: bool,
    data_source: Option<DataSource>,
    on_progress: Option<ProgressCallback>,
}

impl MessageBuilder {
    /// Creates an empty builder.
    pub fn new() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Creates a builder with the "Profile" property set.
    pub fn with_profile(profile: &str) -> MessageBuilder {
        MessageBuilder::new().property(PROFILE_PROPERTY, profile)
    }

    /// Appends a property. Duplicate keys are kept as written; receivers
    /// resolve lookups to the first occurrence.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> MessageBuilder {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Sets the message body.
    pub fn body(mut self, body: Vec<u8>) -> MessageBuilder {
        self.body = body;
        self
    }

    /// Requests priority scheduling for this message.
    pub fn urgent(mut self, urgent: bool) -> MessageBuilder {
        self.urgent = urgent;
        self
    }

    /// Compresses the message payload on the wire.
    pub fn compressed(mut self, compressed: bool) -> MessageBuilder {
        self.compressed = compressed;
        self
    }

    /// Declares that no response is expected or permitted.
    pub fn no_reply(mut self, no_reply: bool) -> MessageBuilder {
        self.no_reply = no_reply;
        self
    }

    /// Streams the body from a pull callback instead of (or after) the
    /// in-memory body. The callback fills the supplied buffer and returns
    /// the byte count; zero means end of data, and a negative value is a
    /// fatal sender-side transport error.
    pub fn data_source(mut self, source: impl FnMut(&mut [u8]) -> isize + Send + 'static) -> MessageBuilder {
        self.data_source = Some(Box::new(source));
        self
    }

    /// Observes the message's delivery progress.
    pub fn on_progress(mut self, callback: impl Fn(&Progress) + Send + Sync + 'static) -> MessageBuilder {
        self.on_progress = Some(std::sync::Arc::new(callback));
        self
    }

    /// Builds a request. The engine assigns the message number when the
    /// message is queued.
    pub(crate) fn build_request(self) -> MessageOut {
        self.build(MessageType::Request, 0)
    }

    /// Builds a response to request `number`.
    pub(crate) fn build_response(self, number: MessageNo) -> MessageOut {
        // Responses never get replies of their own.
        self.build(MessageType::Response, number)
    }

    /// Builds an error reply to request `number`.
    pub(crate) fn build_error_response(error: MessageError, number: MessageNo) -> MessageOut {
        MessageBuilder::new()
            .property(MessageError::DOMAIN_PROPERTY, &error.domain)
            .property(MessageError::CODE_PROPERTY, error.code.to_string())
            .body(error.message.into_bytes())
            .build(MessageType::Error, number)
    }

    fn build(self, message_type: MessageType, number: MessageNo) -> MessageOut {
        let mut modifiers = 0;
        if self.urgent {
            modifiers |= FrameFlags::URGENT;
        }
        if self.compressed {
            modifiers |= FrameFlags::COMPRESSED;
        }
        if self.no_reply || message_type.is_response() {
            modifiers |= FrameFlags::NO_REPLY;
        }
        let flags = FrameFlags::new(message_type, modifiers);

        let block = properties::encode_block(&self.properties);
        let mut payload = Vec::with_capacity(block.len() + self.body.len() + 4);
        put_uvarint(&mut payload, block.len() as u64);
        payload.extend_from_slice(&block);
        payload.extend_from_slice(&self.body);

        MessageOut::new(flags, number, SharedBytes::from_vec(payload), self.data_source, self.on_progress)
    }
}

#[cfg(test)]
mod tests {
    use blip_protocol::varint::try_get_uvarint;

    use super::*;

    #[test]
    fn test_payload_layout() {
        let msg = MessageBuilder::with_profile("echo").body(b"abc".to_vec()).build_request();
        let payload = msg.payload_for_testing();

        let mut slice = payload.as_slice();
        let props_len = try_get_uvarint(&mut slice).unwrap() as usize;
        let block = &slice[..props_len];
        assert_eq!(properties::property(block, "Profile"), Some("echo"));
        assert_eq!(&slice[props_len..], b"abc");
    }

    #[test]
    fn test_request_flags() {
        let msg = MessageBuilder::new().urgent(true).compressed(true).build_request();
        assert!(msg.flags().urgent());
        assert!(msg.flags().compressed());
        assert!(!msg.flags().no_reply());
        assert_eq!(msg.flags().message_type(), MessageType::Request);
    }

    #[test]
    fn test_responses_are_no_reply() {
        let msg = MessageBuilder::new().build_response(9);
        assert!(msg.flags().no_reply());
        assert_eq!(msg.number(), 9);
        assert_eq!(msg.flags().message_type(), MessageType::Response);
    }

    #[test]
    fn test_error_response_carries_domain_and_code() {
        let msg = MessageBuilder::build_error_response(MessageError::new("BLIP", 404, "nope"), 3);
        let payload = msg.payload_for_testing();
        let mut slice = payload.as_slice();
        let props_len = try_get_uvarint(&mut slice).unwrap() as usize;
        let block = &slice[..props_len];
        assert_eq!(properties::property(block, "Error-Domain"), Some("BLIP"));
        assert_eq!(properties::int_property(block, "Error-Code", 0), 404);
        assert_eq!(&slice[props_len..], b"nope");
        assert_eq!(msg.flags().message_type(), MessageType::Error);
    }
}
