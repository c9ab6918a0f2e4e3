//! An outgoing message streaming itself into frames.

use blip_core::constants::{CHECKSUM_SIZE, DATA_BUFFER_SIZE};
use blip_core::{ErrorKind, Result, SharedBytes};
use blip_protocol::codec::SYNC_FLUSH_TRAILER;
use blip_protocol::varint::put_uvarint;
use blip_protocol::{Deflater, FrameFlags, MessageNo, MessageType, Mode};

use crate::message::{Progress, ProgressCallback, ProgressState};

/// Pull callback supplying body bytes for a streamed message. Fills the
/// buffer and returns the byte count written; zero signals end of data; a
/// negative value is a fatal sender-side transport error.
pub type DataSource = Box<dyn FnMut(&mut [u8]) -> isize + Send + 'static>;

/// The engine keeps pulling frames while at least this much room is left.
const MIN_FRAME_HEADROOM: usize = 1024;

/// An outgoing message owned by the engine: the payload cursor, the
/// optional streaming source, and the byte accounting used for flow
/// control and progress reporting.
pub struct MessageOut {
    number: MessageNo,
    flags: FrameFlags,
    contents: Contents,
    bytes_sent: u64,
    uncompressed_bytes_sent: u64,
    unacked_bytes: u64,
    on_progress: Option<ProgressCallback>,
    terminal: bool,
}

impl MessageOut {
    pub(crate) fn new(
        flags: FrameFlags,
        number: MessageNo,
        payload: SharedBytes,
        data_source: Option<DataSource>,
        on_progress: Option<ProgressCallback>,
    ) -> MessageOut {
        MessageOut {
            number,
            flags,
            contents: Contents::new(payload, data_source),
            bytes_sent: 0,
            uncompressed_bytes_sent: 0,
            unacked_bytes: 0,
            on_progress,
            terminal: false,
        }
    }

    /// Builds an ACK control message: urgent, no-reply, payload a single
    /// varint byte count. ACKs skip the codec and carry no checksum.
    pub(crate) fn new_ack(ack_type: MessageType, number: MessageNo, byte_count: u64) -> MessageOut {
        debug_assert!(ack_type.is_ack());
        let mut payload = Vec::with_capacity(10);
        put_uvarint(&mut payload, byte_count);
        let flags = FrameFlags::new(ack_type, FrameFlags::URGENT | FrameFlags::NO_REPLY);
        MessageOut::new(flags, number, SharedBytes::from_vec(payload), None, None)
    }

    /// The message number; zero until the engine assigns one.
    pub fn number(&self) -> MessageNo {
        self.number
    }

    pub(crate) fn set_number(&mut self, number: MessageNo) {
        debug_assert_eq!(self.number, 0);
        self.number = number;
    }

    /// The message's frame flags (without MoreComing).
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub(crate) fn message_type(&self) -> MessageType {
        self.flags.message_type()
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.flags.is_ack()
    }

    pub(crate) fn urgent(&self) -> bool {
        self.flags.urgent()
    }

    pub(crate) fn no_reply(&self) -> bool {
        self.flags.no_reply()
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub(crate) fn uncompressed_bytes_sent(&self) -> u64 {
        self.uncompressed_bytes_sent
    }

    pub(crate) fn progress_callback(&self) -> Option<ProgressCallback> {
        self.on_progress.clone()
    }

    /// Appends the next frame payload for this message to `dst`, staying
    /// within `budget` bytes, and returns the flags to put in the frame
    /// header (MoreComing set when data remains). Emits the matching
    /// progress notification.
    pub(crate) fn next_frame_to_send(
        &mut self,
        deflater: &mut Deflater,
        dst: &mut Vec<u8>,
        budget: usize,
    ) -> Result<FrameFlags> {
        if self.is_ack() {
            // ACKs bypass the codec and checksum entirely.
            let start = dst.len();
            self.contents.copy_remaining_payload(dst);
            self.bytes_sent += (dst.len() - start) as u64;
            return Ok(self.flags.with_more_coming(false));
        }

        let start = dst.len();
        let limit = start + budget - CHECKSUM_SIZE;
        let mode = if self.flags.compressed() { Mode::SyncFlush } else { Mode::Raw };

        loop {
            if dst.len() + MIN_FRAME_HEADROOM > limit {
                break;
            }
            let consumed = self.contents.write_some(deflater, dst, limit, mode)?;
            if consumed == 0 {
                break;
            }
            self.uncompressed_bytes_sent += consumed as u64;
        }

        if deflater.unflushed_bytes() > 0 {
            return Err(ErrorKind::Compression("compression buffer overflow".into()));
        }
        if mode == Mode::SyncFlush && dst.len() > start {
            // A sync flush always ends with 00 00 FF FF; drop it here and
            // the receiver re-appends it before inflating.
            debug_assert!(dst.ends_with(&SYNC_FLUSH_TRAILER));
            dst.truncate(dst.len() - SYNC_FLUSH_TRAILER.len());
        }
        deflater.write_checksum(dst);

        let frame_size = (dst.len() - start) as u64;
        self.bytes_sent += frame_size;
        self.unacked_bytes += frame_size;

        let (flags, state) = if self.contents.has_more() {
            (self.flags.with_more_coming(true), ProgressState::Sending)
        } else if self.message_type() == MessageType::Request && !self.no_reply() {
            (self.flags.with_more_coming(false), ProgressState::AwaitingReply)
        } else {
            (self.flags.with_more_coming(false), ProgressState::Complete)
        };
        self.fire_progress(state, None);
        Ok(flags)
    }

    /// The peer acknowledged `byte_count` cumulative bytes of this
    /// message; shrink the unacked window accordingly.
    pub(crate) fn received_ack(&mut self, byte_count: u64) {
        if byte_count <= self.bytes_sent {
            self.unacked_bytes = self.unacked_bytes.min(self.bytes_sent - byte_count);
        }
    }

    /// True when the unacked window is full and sending must pause.
    pub(crate) fn needs_ack(&self, window: u64) -> bool {
        self.unacked_bytes >= window
    }

    /// Surfaces a Disconnected progress event unless the message already
    /// reached a terminal state.
    pub(crate) fn disconnected(&mut self) {
        if !self.is_ack() {
            self.fire_progress(ProgressState::Disconnected, None);
        }
    }

    pub(crate) fn fire_progress(&mut self, state: ProgressState, reply: Option<std::sync::Arc<crate::message_in::MessageIn>>) {
        if self.terminal {
            return;
        }
        if state.is_terminal() {
            self.terminal = true;
        }
        if let Some(callback) = &self.on_progress {
            callback(&Progress {
                state,
                bytes_sent: self.uncompressed_bytes_sent,
                bytes_received: 0,
                reply,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn payload_for_testing(&self) -> SharedBytes {
        self.contents.payload.clone()
    }
}

/// The message's data: the contiguous payload (properties + body) and an
/// optional pull source refilled through a scratch buffer.
struct Contents {
    payload: SharedBytes,
    payload_pos: usize,
    data_source: Option<DataSource>,
    buffer: Vec<u8>,
    buffer_filled: usize,
    buffer_pos: usize,
}

impl Contents {
    fn new(payload: SharedBytes, data_source: Option<DataSource>) -> Contents {
        Contents {
            payload,
            payload_pos: 0,
            data_source,
            buffer: Vec::new(),
            buffer_filled: 0,
            buffer_pos: 0,
        }
    }

    fn has_more(&self) -> bool {
        self.payload_pos < self.payload.len()
            || self.buffer_pos < self.buffer_filled
            || self.data_source.is_some()
    }

    fn copy_remaining_payload(&mut self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.payload.as_slice()[self.payload_pos..]);
        self.payload_pos = self.payload.len();
    }

    /// Feeds the next available chunk through the codec, bounded by
    /// `limit`. Returns the uncompressed bytes consumed; zero means no
    /// data is available (end of payload and source).
    fn write_some(
        &mut self,
        deflater: &mut Deflater,
        dst: &mut Vec<u8>,
        limit: usize,
        mode: Mode,
    ) -> Result<usize> {
        if self.payload_pos < self.payload.len() {
            let mut slice = &self.payload.as_slice()[self.payload_pos..];
            let before = slice.len();
            deflater.write(&mut slice, dst, limit, mode)?;
            let consumed = before - slice.len();
            self.payload_pos += consumed;
            return Ok(consumed);
        }

        if self.buffer_pos >= self.buffer_filled {
            self.refill()?;
            if self.buffer_pos >= self.buffer_filled {
                return Ok(0);
            }
        }
        let chunk_end = self.buffer_filled;
        let mut slice = &self.buffer[self.buffer_pos..chunk_end];
        let before = slice.len();
        deflater.write(&mut slice, dst, limit, mode)?;
        let consumed = before - slice.len();
        self.buffer_pos += consumed;
        Ok(consumed)
    }

    fn refill(&mut self) -> Result<()> {
        let Some(source) = self.data_source.as_mut() else {
            return Ok(());
        };
        if self.buffer.is_empty() {
            self.buffer = vec![0; DATA_BUFFER_SIZE];
        }
        let n = source(&mut self.buffer);
        if n < 0 {
            // A failing source is fatal to the connection, not silently
            // truncated.
            self.data_source = None;
            return Err(ErrorKind::Transport(n.unsigned_abs().min(i32::MAX as usize) as i32));
        }
        let n = n as usize;
        debug_assert!(n <= self.buffer.len());
        self.buffer_filled = n.min(self.buffer.len());
        self.buffer_pos = 0;
        if self.buffer_filled < self.buffer.len() {
            // A short read ends the stream.
            self.data_source = None;
        }
        Ok(())
    }
}
