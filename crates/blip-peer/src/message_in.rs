//! An incoming message assembling itself from frames.

use std::sync::{Arc, Mutex, Weak};

use blip_core::constants::CHECKSUM_SIZE;
use blip_core::{Config, ErrorKind, Result, SharedBytes};
use blip_protocol::properties;
use blip_protocol::varint::try_get_uvarint;
use blip_protocol::{FrameFlags, Inflater, MessageNo, MessageType, Mode};

use crate::builder::MessageBuilder;
use crate::io::BlipIo;
use crate::message::{MessageError, Progress, ProgressCallback, ProgressState};

/// What a frame did to the message it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveState {
    /// The properties block is not complete yet.
    Beginning,
    /// Body bytes arrived; more frames follow.
    Other,
    /// The final frame arrived; the message is complete.
    End,
}

/// Longest accepted varint encoding; a prefix this long that still does
/// not parse is malformed rather than truncated.
const MAX_VARINT_LEN: usize = 10;

/// Sends the response for an incoming request back through the engine.
pub(crate) struct Responder {
    pub(crate) io: Weak<BlipIo>,
    pub(crate) number: MessageNo,
}

struct Inner {
    flags: FrameFlags,
    frames_received: u64,
    /// Uncompressed bytes waiting for the properties block to complete.
    pending: Vec<u8>,
    properties_size: Option<usize>,
    properties: Vec<u8>,
    body: Vec<u8>,
    body_shared: Option<SharedBytes>,
    raw_bytes_received: u64,
    unacked_bytes: u64,
    pending_ack: Option<u64>,
    complete: bool,
    responded: bool,
    progress_terminal: bool,
    on_progress: Option<ProgressCallback>,
    /// Uncompressed bytes of the request this message replies to.
    outgoing_size: u64,
}

/// An incoming request or reply. The engine assembles it frame by frame;
/// once complete it is handed to the application, which may read its
/// properties and body and, for requests, respond through it.
pub struct MessageIn {
    number: MessageNo,
    inner: Mutex<Inner>,
    responder: Mutex<Option<Responder>>,
}

impl MessageIn {
    /// A request arriving from the peer; flags come from its first frame.
    pub(crate) fn incoming_request(number: MessageNo, flags: FrameFlags, responder: Responder) -> MessageIn {
        MessageIn::new(number, flags, Some(responder), None, 0)
    }

    /// The placeholder for a reply we are waiting on; real flags replace
    /// these when the first reply frame arrives.
    pub(crate) fn pending_reply(
        number: MessageNo,
        on_progress: Option<ProgressCallback>,
        outgoing_size: u64,
    ) -> MessageIn {
        let flags = FrameFlags::new(MessageType::Response, 0);
        MessageIn::new(number, flags, None, on_progress, outgoing_size)
    }

    fn new(
        number: MessageNo,
        flags: FrameFlags,
        responder: Option<Responder>,
        on_progress: Option<ProgressCallback>,
        outgoing_size: u64,
    ) -> MessageIn {
        MessageIn {
            number,
            inner: Mutex::new(Inner {
                flags,
                frames_received: 0,
                pending: Vec::new(),
                properties_size: None,
                properties: Vec::new(),
                body: Vec::new(),
                body_shared: None,
                raw_bytes_received: 0,
                unacked_bytes: 0,
                pending_ack: None,
                complete: false,
                responded: false,
                progress_terminal: false,
                on_progress,
                outgoing_size,
            }),
            responder: Mutex::new(responder),
        }
    }

    /// The message number within its direction.
    pub fn number(&self) -> MessageNo {
        self.number
    }

    /// True once the final frame (body included) has arrived.
    pub fn is_complete(&self) -> bool {
        self.lock().complete
    }

    /// True if this is an Error-type reply.
    pub fn is_error(&self) -> bool {
        self.lock().flags.message_type() == MessageType::Error
    }

    /// True if this request forbids a response.
    pub fn no_reply(&self) -> bool {
        self.lock().flags.no_reply()
    }

    /// Looks up a property; the first occurrence of a duplicated key wins.
    pub fn property(&self, name: &str) -> Option<String> {
        properties::property(&self.lock().properties, name).map(str::to_string)
    }

    /// Parses a property as an integer.
    pub fn int_property(&self, name: &str, default: i64) -> i64 {
        properties::int_property(&self.lock().properties, name, default)
    }

    /// Parses a property as a boolean.
    pub fn bool_property(&self, name: &str, default: bool) -> bool {
        properties::bool_property(&self.lock().properties, name, default)
    }

    /// The message body. Cheap to call repeatedly once complete.
    pub fn body(&self) -> SharedBytes {
        let mut inner = self.lock();
        if inner.body_shared.is_none() {
            let bytes = std::mem::take(&mut inner.body);
            inner.body_shared = Some(SharedBytes::from_vec(bytes));
        }
        inner.body_shared.clone().expect("body just converted")
    }

    /// For Error-type replies, the domain/code/message triple.
    pub fn error(&self) -> Option<MessageError> {
        if !self.is_error() {
            return None;
        }
        let domain = self.property(MessageError::DOMAIN_PROPERTY).unwrap_or_default();
        let code = self.int_property(MessageError::CODE_PROPERTY, 0);
        let message = String::from_utf8_lossy(self.body().as_slice()).into_owned();
        Some(MessageError { domain, code, message })
    }

    /// Sends a response to this request. Valid exactly once, on a
    /// complete request that was not sent NoReply.
    pub fn respond(&self, builder: MessageBuilder) -> blip_core::Result<()> {
        let io = self.begin_response()?;
        let response = builder.build_response(self.number);
        if let Some(io) = io.upgrade() {
            io.queue_outgoing(response);
        }
        Ok(())
    }

    /// Sends an Error-type response. Same restrictions as [`respond`].
    ///
    /// [`respond`]: MessageIn::respond
    pub fn respond_with_error(&self, error: MessageError) -> blip_core::Result<()> {
        let io = self.begin_response()?;
        let response = MessageBuilder::build_error_response(error, self.number);
        if let Some(io) = io.upgrade() {
            io.queue_outgoing(response);
        }
        Ok(())
    }

    /// Replies that no handler exists for this request.
    pub fn not_handled(&self) -> blip_core::Result<()> {
        self.respond_with_error(MessageError::new("BLIP", 404, "no handler for message"))
    }

    fn begin_response(&self) -> blip_core::Result<Weak<BlipIo>> {
        let mut inner = self.lock();
        if inner.flags.message_type() != MessageType::Request {
            return Err(ErrorKind::Usage("only requests can be responded to"));
        }
        if inner.flags.no_reply() {
            return Err(ErrorKind::Usage("request was sent NoReply"));
        }
        if !inner.complete {
            return Err(ErrorKind::Usage("request is not complete yet"));
        }
        if inner.responded {
            return Err(ErrorKind::Usage("request already responded to"));
        }
        inner.responded = true;
        drop(inner);

        let responder = self.responder.lock().expect("responder poisoned");
        let responder = responder.as_ref().expect("request without responder");
        debug_assert_eq!(responder.number, self.number);
        Ok(responder.io.clone())
    }

    /// Absorbs one frame: verifies and strips the trailing checksum,
    /// inflates the rest, accumulates properties then body, and tracks
    /// the unacked byte count for flow control.
    pub(crate) fn received_frame(
        &self,
        inflater: &mut Inflater,
        frame: &[u8],
        flags: FrameFlags,
        config: &Config,
    ) -> Result<ReceiveState> {
        let mut inner = self.lock();
        if inner.complete {
            return Err(ErrorKind::Protocol("frame for a message that already ended"));
        }
        if frame.len() < CHECKSUM_SIZE {
            return Err(ErrorKind::Protocol("frame too short for checksum"));
        }
        if inner.frames_received == 0 {
            // The first frame fixes the real flags; a reply placeholder
            // may turn into an Error, Urgent, or Compressed message here.
            inner.flags = flags.with_more_coming(false);
        }
        inner.frames_received += 1;

        let had_properties = inner.properties_ready();
        let (payload, tail) = frame.split_at(frame.len() - CHECKSUM_SIZE);
        let mode = if flags.compressed() { Mode::SyncFlush } else { Mode::Raw };
        let mut decoded = Vec::with_capacity(payload.len() * 2);
        inflater.write(payload, &mut decoded, config.max_message_size, mode)?;
        inflater.read_checksum(tail)?;

        inner.raw_bytes_received += frame.len() as u64;
        inner.absorb(decoded)?;

        let last_frame = !flags.more_coming();
        if !last_frame {
            inner.unacked_bytes += frame.len() as u64;
            if inner.unacked_bytes > config.ack_threshold {
                inner.pending_ack = Some(inner.raw_bytes_received);
                inner.unacked_bytes = 0;
            }
        }

        if last_frame {
            if !inner.properties_ready() {
                return Err(ErrorKind::Protocol("message ended before its properties"));
            }
            inner.complete = true;
            Ok(ReceiveState::End)
        } else if !had_properties {
            Ok(ReceiveState::Beginning)
        } else {
            Ok(ReceiveState::Other)
        }
    }

    /// If the unacked window just overflowed, returns the cumulative byte
    /// count to acknowledge and clears the marker.
    pub(crate) fn take_pending_ack(&self) -> Option<u64> {
        self.lock().pending_ack.take()
    }

    /// Emits a progress notification for the request this reply answers.
    pub(crate) fn fire_progress(&self, state: ProgressState, reply: Option<Arc<MessageIn>>) {
        let mut inner = self.lock();
        if inner.progress_terminal {
            return;
        }
        if state.is_terminal() {
            inner.progress_terminal = true;
        }
        if let Some(callback) = inner.on_progress.clone() {
            let progress = Progress {
                state,
                bytes_sent: inner.outgoing_size,
                bytes_received: inner.raw_bytes_received,
                reply,
            };
            drop(inner);
            callback(&progress);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("message state poisoned")
    }
}

impl Inner {
    fn properties_ready(&self) -> bool {
        self.properties_size.map(|size| self.properties.len() == size).unwrap_or(false)
    }

    /// Routes decoded bytes into the properties block, then the body.
    fn absorb(&mut self, decoded: Vec<u8>) -> Result<()> {
        if self.properties_ready() {
            self.body.extend_from_slice(&decoded);
            return Ok(());
        }
        self.pending.extend_from_slice(&decoded);

        if self.properties_size.is_none() {
            let mut slice = &self.pending[..];
            match try_get_uvarint(&mut slice) {
                Ok(size) => {
                    let size = usize::try_from(size)
                        .map_err(|_| ErrorKind::Protocol("properties length out of range"))?;
                    let consumed = self.pending.len() - slice.len();
                    self.pending.drain(..consumed);
                    self.properties_size = Some(size);
                }
                Err(_) if self.pending.len() < MAX_VARINT_LEN => return Ok(()), // Wait for more
                Err(error) => return Err(error),
            }
        }

        if let Some(size) = self.properties_size {
            if self.pending.len() >= size {
                self.properties = self.pending.drain(..size).collect();
                properties::validate_block(&self.properties)?;
                self.body.extend_from_slice(&self.pending);
                self.pending.clear();
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessageIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MessageIn")
            .field("number", &self.number)
            .field("type", &inner.flags.message_type().name())
            .field("complete", &inner.complete)
            .finish()
    }
}
