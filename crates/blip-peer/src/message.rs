//! Progress reporting and the error-reply payload.

use std::sync::Arc;

use crate::message_in::MessageIn;

/// Where a message is in its lifecycle. For any one message the observed
/// sequence is a monotone prefix of Queued, Sending*, AwaitingReply,
/// ReceivingReply*, Complete - optionally truncated and then ended by
/// Disconnected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProgressState {
    /// Accepted by the engine, waiting for its first frame to go out.
    Queued,
    /// At least one frame has been sent; more remain.
    Sending,
    /// Fully sent; a reply is expected.
    AwaitingReply,
    /// Reply frames are arriving.
    ReceivingReply,
    /// Terminal: delivery (and the reply, unless NoReply) finished.
    Complete,
    /// Terminal: the connection went away first.
    Disconnected,
}

impl ProgressState {
    /// True for the two states that end a message's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressState::Complete | ProgressState::Disconnected)
    }
}

/// A progress notification for an outgoing message.
pub struct Progress {
    /// Current lifecycle state.
    pub state: ProgressState,
    /// Uncompressed payload bytes sent so far.
    pub bytes_sent: u64,
    /// Raw reply bytes received so far.
    pub bytes_received: u64,
    /// The completed reply, present only with `Complete` on a request
    /// that expects one.
    pub reply: Option<Arc<MessageIn>>,
}

/// Callback observing a message's progress. Invoked from the engine's
/// mailbox; keep it brief.
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync + 'static>;

/// The payload of an Error-type reply: a domain/code pair plus a human
/// readable message carried in the body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageError {
    /// Namespace of the code, e.g. "BLIP" or "HTTP".
    pub domain: String,
    /// Error code within the domain.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
}

impl MessageError {
    /// Property key carrying the domain in an error reply.
    pub const DOMAIN_PROPERTY: &'static str = "Error-Domain";
    /// Property key carrying the code in an error reply.
    pub const CODE_PROPERTY: &'static str = "Error-Code";

    /// Convenience constructor.
    pub fn new(domain: impl Into<String>, code: i64, message: impl Into<String>) -> MessageError {
        MessageError { domain: domain.into(), code, message: message.into() }
    }
}
