//! The protocol engine.
//!
//! One [`BlipIo`] per connection side. All mutable state lives in
//! [`IoState`] and is touched only by tasks on the engine's mailbox;
//! everything external (the application facade, the WebSocket callbacks,
//! response senders) funnels in through enqueues. The engine drives the
//! WebSocket from above and the application delegate from below.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use blip_core::{Config, ErrorKind};
use blip_protocol::varint::{put_uvarint, try_get_uvarint};
use blip_protocol::{Deflater, FrameHeader, Inflater, MessageNo, MessageType};
use blip_runtime::{async_value, AsyncProvider, Mailbox};
use blip_websocket::{close_code, CloseStatus, Delegate as WsDelegate, WebSocket};
use tracing::{debug, trace, warn};

use crate::message::ProgressState;
use crate::message_in::{MessageIn, ReceiveState, Responder};
use crate::message_out::MessageOut;
use crate::outbox::Outbox;
use crate::MessageBuilder;

/// Receives protocol-level events from the engine. Callbacks run on the
/// engine's mailbox; a request handed to `on_request` may be responded to
/// from any thread, now or later.
pub trait ConnectionDelegate: Send + Sync {
    /// The connection is open; queued messages are going out.
    fn on_connect(&self) {}

    /// A complete request arrived from the peer.
    fn on_request(&self, request: Arc<MessageIn>);

    /// A complete reply to one of our requests arrived.
    fn on_response(&self, response: Arc<MessageIn>) {
        let _ = response;
    }

    /// The transport drained its send buffer after pushing back.
    fn on_writeable(&self) {}

    /// The connection closed; delivered exactly once.
    fn on_close(&self, status: CloseStatus);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Opening,
    Open,
    Closing,
    Closed,
}

/// A reply we are waiting for: the assembly record plus the async slot
/// that chains delivery to the delegate without re-entering the mailbox.
struct PendingReply {
    reply: Arc<MessageIn>,
    provider: AsyncProvider<Arc<MessageIn>>,
}

struct IoState {
    config: Config,
    phase: Phase,
    writeable: bool,
    last_request_number: MessageNo,
    num_requests_received: MessageNo,
    outbox: Outbox,
    /// Messages paused on the per-message unacked-byte window.
    icebox: Vec<MessageOut>,
    /// Fully-sent requests awaiting their first reply frame.
    pending_responses: HashMap<MessageNo, PendingReply>,
    /// Requests from the peer, mid-assembly.
    incoming_requests: HashMap<MessageNo, Arc<MessageIn>>,
    /// Replies from the peer, mid-assembly.
    incoming_responses: HashMap<MessageNo, PendingReply>,
    deflater: Deflater,
    inflater: Inflater,
    close_notified: bool,
}

/// The protocol engine actor for one side of a BLIP connection.
pub struct BlipIo {
    mailbox: Mailbox,
    websocket: Arc<dyn WebSocket>,
    delegate: Arc<dyn ConnectionDelegate>,
    accepting: AtomicBool,
    state: Mutex<IoState>,
}

impl BlipIo {
    /// Creates the engine. Wire it to the socket by passing
    /// [`BlipIo::websocket_delegate`] to the WebSocket's `connect`.
    pub fn new(
        websocket: Arc<dyn WebSocket>,
        delegate: Arc<dyn ConnectionDelegate>,
        config: Config,
    ) -> Arc<BlipIo> {
        Arc::new(BlipIo {
            mailbox: Mailbox::new("blip-io"),
            websocket,
            delegate,
            accepting: AtomicBool::new(true),
            state: Mutex::new(IoState {
                config,
                phase: Phase::Opening,
                writeable: false,
                last_request_number: 0,
                num_requests_received: 0,
                outbox: Outbox::new(),
                icebox: Vec::new(),
                pending_responses: HashMap::new(),
                incoming_requests: HashMap::new(),
                incoming_responses: HashMap::new(),
                deflater: Deflater::new(),
                inflater: Inflater::new(),
                close_notified: false,
            }),
        })
    }

    /// The delegate to hand to the WebSocket layer.
    pub fn websocket_delegate(self: &Arc<Self>) -> Arc<dyn WsDelegate> {
        Arc::new(WsBridge { io: Arc::downgrade(self) })
    }

    /// Queues an outgoing request. Fails once the connection is closing.
    pub fn send(self: &Arc<Self>, builder: MessageBuilder) -> blip_core::Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ErrorKind::Usage("connection is closed"));
        }
        let msg = builder.build_request();
        self.queue_outgoing(msg);
        Ok(())
    }

    /// Starts a clean close. Queued messages report Disconnected.
    pub fn close(self: &Arc<Self>) -> blip_core::Result<()> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return Err(ErrorKind::Usage("connection already closed"));
        }
        self.enqueue("close", |this, state| {
            Self::local_close(this, state, close_code::NORMAL, "");
        });
        Ok(())
    }

    /// Queues any outgoing message (requests from the facade, responses
    /// from request records, ACKs from the engine itself).
    pub(crate) fn queue_outgoing(self: &Arc<Self>, msg: MessageOut) {
        self.enqueue("send", move |this, state| Self::queue_message(this, state, msg));
    }

    fn enqueue(
        self: &Arc<Self>,
        name: &'static str,
        task: impl FnOnce(&Arc<BlipIo>, &mut IoState) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.mailbox.enqueue(name, move || {
            let mut state = this.state.lock().expect("engine state poisoned");
            task(&this, &mut state);
        });
    }

    // ===== Tasks (hold the state lock, run on the mailbox) =====

    fn queue_message(this: &Arc<Self>, state: &mut IoState, mut msg: MessageOut) {
        if state.phase >= Phase::Closing {
            debug!(number = msg.number(), "message queued on closing connection");
            msg.disconnected();
            return;
        }
        if msg.number() == 0 {
            state.last_request_number += 1;
            msg.set_number(state.last_request_number);
        }
        trace!(number = msg.number(), kind = msg.message_type().name(), "queued");
        if !msg.is_ack() {
            msg.fire_progress(ProgressState::Queued, None);
        }
        state.outbox.insert(msg);
        Self::write_frames(this, state);
    }

    /// The outgoing scheduler: one frame per round from the front of the
    /// outbox, until the socket pushes back or the queue drains.
    fn write_frames(this: &Arc<Self>, state: &mut IoState) {
        while state.phase == Phase::Open && state.writeable {
            let Some(mut msg) = state.outbox.pop() else {
                break;
            };

            let mut frame = Vec::with_capacity(state.config.max_frame_size + 16);
            put_uvarint(&mut frame, msg.number());
            let flags_index = frame.len();
            frame.push(0); // Patched below; flags always fit one varint byte
            let max_frame_size = state.config.max_frame_size;
            let flags = match msg.next_frame_to_send(&mut state.deflater, &mut frame, max_frame_size)
            {
                Ok(flags) => flags,
                Err(error) => {
                    msg.disconnected();
                    Self::fatal(this, state, error);
                    return;
                }
            };
            frame[flags_index] = flags.bits();
            trace!(
                number = msg.number(),
                kind = msg.message_type().name(),
                len = frame.len(),
                more = flags.more_coming(),
                "frame out"
            );

            state.writeable = this.websocket.send(&frame, true);

            if flags.more_coming() {
                if msg.needs_ack(state.config.ack_threshold) {
                    // Window full: park until the peer acknowledges.
                    state.icebox.push(msg);
                } else {
                    state.outbox.insert(msg);
                }
            } else {
                Self::finish_sent(this, state, msg);
            }
        }
    }

    /// The final frame of `msg` went out.
    fn finish_sent(this: &Arc<Self>, state: &mut IoState, msg: MessageOut) {
        if msg.message_type() != MessageType::Request || msg.no_reply() {
            return; // Responses and ACKs are done once sent
        }
        let reply = Arc::new(MessageIn::pending_reply(
            msg.number(),
            msg.progress_callback(),
            msg.uncompressed_bytes_sent(),
        ));
        let (provider, value) = async_value::<Arc<MessageIn>>();
        let delegate = Arc::clone(&this.delegate);
        value.observe(Some(this.mailbox.clone()), move |outcome| {
            if let Some(reply) = outcome {
                delegate.on_response(reply);
            }
        });
        state.pending_responses.insert(msg.number(), PendingReply { reply, provider });
    }

    fn on_ws_message(this: &Arc<Self>, state: &mut IoState, data: Vec<u8>) {
        if state.phase >= Phase::Closing {
            return;
        }
        let mut slice = &data[..];
        let header = match FrameHeader::decode(&mut slice) {
            Ok(header) => header,
            Err(error) => return Self::fatal(this, state, error),
        };
        trace!(
            number = header.number,
            kind = header.flags.message_type().name(),
            len = data.len(),
            "frame in"
        );

        match header.flags.message_type() {
            MessageType::AckRequest | MessageType::AckResponse => {
                Self::on_ack(this, state, header, slice)
            }
            MessageType::Request => Self::on_data_frame(this, state, header, slice, true),
            MessageType::Response | MessageType::Error => {
                Self::on_data_frame(this, state, header, slice, false)
            }
        }
    }

    fn on_ack(this: &Arc<Self>, state: &mut IoState, header: FrameHeader, mut payload: &[u8]) {
        let byte_count = match try_get_uvarint(&mut payload) {
            Ok(count) => count,
            Err(error) => return Self::fatal(this, state, error),
        };
        // AckRequest acknowledges one of our outgoing requests,
        // AckResponse one of our outgoing responses.
        let response_class = header.flags.message_type() == MessageType::AckResponse;

        if let Some(msg) = state.outbox.find_mut(header.number, response_class) {
            msg.received_ack(byte_count);
            return;
        }
        let frozen = state.icebox.iter().position(|m| {
            m.number() == header.number && m.message_type().is_response() == response_class
        });
        match frozen {
            Some(index) => {
                let mut msg = state.icebox.swap_remove(index);
                msg.received_ack(byte_count);
                if msg.needs_ack(state.config.ack_threshold) {
                    state.icebox.push(msg);
                } else {
                    // Thawed: back into rotation.
                    state.outbox.insert(msg);
                    Self::write_frames(this, state);
                }
            }
            None => debug!(number = header.number, "ACK for unknown message"),
        }
    }

    fn on_data_frame(
        this: &Arc<Self>,
        state: &mut IoState,
        header: FrameHeader,
        payload: &[u8],
        is_request: bool,
    ) {
        let msg: Arc<MessageIn> = if is_request {
            if header.number == state.num_requests_received + 1 {
                state.num_requests_received = header.number;
                let responder = Responder { io: Arc::downgrade(this), number: header.number };
                let msg =
                    Arc::new(MessageIn::incoming_request(header.number, header.flags, responder));
                state.incoming_requests.insert(header.number, Arc::clone(&msg));
                msg
            } else if let Some(msg) = state.incoming_requests.get(&header.number) {
                Arc::clone(msg)
            } else {
                return Self::fatal(
                    this,
                    state,
                    ErrorKind::Protocol("request frame out of sequence"),
                );
            }
        } else if let Some(pending) = state.pending_responses.remove(&header.number) {
            // First reply frame: move from the waiting table to assembly.
            let msg = Arc::clone(&pending.reply);
            state.incoming_responses.insert(header.number, pending);
            msg
        } else if let Some(pending) = state.incoming_responses.get(&header.number) {
            Arc::clone(&pending.reply)
        } else {
            return Self::fatal(this, state, ErrorKind::Protocol("response with unknown number"));
        };

        let receive_state =
            match msg.received_frame(&mut state.inflater, payload, header.flags, &state.config) {
                Ok(receive_state) => receive_state,
                Err(error) => return Self::fatal(this, state, error),
            };

        if let Some(acked_bytes) = msg.take_pending_ack() {
            let ack = MessageOut::new_ack(
                header.flags.message_type().ack_type(),
                header.number,
                acked_bytes,
            );
            state.outbox.insert(ack);
            Self::write_frames(this, state);
        }

        match receive_state {
            ReceiveState::Beginning | ReceiveState::Other => {
                if !is_request {
                    msg.fire_progress(ProgressState::ReceivingReply, None);
                }
            }
            ReceiveState::End => {
                if is_request {
                    state.incoming_requests.remove(&header.number);
                    this.delegate.on_request(msg);
                } else if let Some(pending) = state.incoming_responses.remove(&header.number) {
                    msg.fire_progress(ProgressState::Complete, Some(Arc::clone(&msg)));
                    pending.provider.resolve(msg);
                }
            }
        }
    }

    fn local_close(this: &Arc<Self>, state: &mut IoState, code: u16, message: &str) {
        if state.phase >= Phase::Closing {
            return;
        }
        debug!(code, "closing connection");
        state.phase = Phase::Closing;
        Self::fail_outgoing(state);
        this.websocket.close(code, message);
    }

    /// Connection-fatal error: surface it, then funnel through the normal
    /// close path so that exactly one on_close is delivered.
    fn fatal(this: &Arc<Self>, state: &mut IoState, error: ErrorKind) {
        warn!(%error, "fatal connection error");
        if state.phase >= Phase::Closing {
            return;
        }
        this.accepting.store(false, Ordering::SeqCst);
        state.phase = Phase::Closing;
        Self::fail_outgoing(state);
        let code = error.close_code().unwrap_or(close_code::INTERNAL_ERROR);
        this.websocket.close(code, &error.to_string());
    }

    fn on_ws_closed(this: &Arc<Self>, state: &mut IoState, status: CloseStatus) {
        if state.phase == Phase::Closed {
            return;
        }
        state.phase = Phase::Closed;
        this.accepting.store(false, Ordering::SeqCst);

        Self::fail_outgoing(state);
        for (_, pending) in state.pending_responses.drain() {
            pending.reply.fire_progress(ProgressState::Disconnected, None);
            // Dropping the provider delivers None to the observer.
        }
        for (_, pending) in state.incoming_responses.drain() {
            pending.reply.fire_progress(ProgressState::Disconnected, None);
        }
        state.incoming_requests.clear();

        if !state.close_notified {
            state.close_notified = true;
            debug!(?status, "connection closed");
            this.delegate.on_close(status);
        }
    }

    fn fail_outgoing(state: &mut IoState) {
        for mut msg in state.outbox.drain() {
            msg.disconnected();
        }
        for mut msg in state.icebox.drain(..) {
            msg.disconnected();
        }
    }
}

/// Bridges WebSocket callbacks onto the engine mailbox. Holds the engine
/// weakly: the socket must not keep a dead connection alive.
struct WsBridge {
    io: Weak<BlipIo>,
}

impl WsBridge {
    fn with_io(&self, name: &'static str, task: impl FnOnce(&Arc<BlipIo>, &mut IoState) + Send + 'static) {
        if let Some(io) = self.io.upgrade() {
            io.enqueue(name, task);
        }
    }
}

impl WsDelegate for WsBridge {
    fn on_connect(&self) {
        self.with_io("ws-connect", |this, state| {
            state.phase = Phase::Open;
            state.writeable = true;
            this.delegate.on_connect();
            BlipIo::write_frames(this, state);
        });
    }

    fn on_message(&self, message: &[u8], binary: bool) {
        let data = message.to_vec();
        self.with_io("ws-message", move |this, state| {
            if binary {
                BlipIo::on_ws_message(this, state, data);
            } else {
                BlipIo::fatal(this, state, ErrorKind::Protocol("text message on BLIP connection"));
            }
        });
    }

    fn on_writeable(&self) {
        self.with_io("ws-writeable", |this, state| {
            state.writeable = true;
            BlipIo::write_frames(this, state);
            this.delegate.on_writeable();
        });
    }

    fn on_close(&self, status: CloseStatus) {
        self.with_io("ws-close", move |this, state| {
            BlipIo::on_ws_closed(this, state, status);
        });
    }
}
