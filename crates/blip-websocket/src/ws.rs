//! Transport-agnostic WebSocket state machine.
//!
//! [`WebSocketImpl`] knows how to encode and decode the protocol but
//! never touches a socket: a [`Transport`] implementation moves bytes and
//! calls back into `on_http_response` / `on_connect` / `on_receive` /
//! `on_write_complete` / `on_closed`. With `framing` disabled the
//! transport is assumed to carry whole messages itself (loopback pairs,
//! or a stream that already framed them) and bytes pass straight through.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use blip_core::{Config, ErrorKind};
use blip_runtime::Timer;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::frame::{self, FrameParser, OpCode};
use crate::interface::{close_code, CloseReason, CloseStatus, Delegate, Role, Transport, WebSocket};

/// Abnormal closure pseudo-status (RFC 6455 §7.1.5).
const CODE_ABNORMAL: u16 = 1006;

/// Work to perform after the state lock is released; the delegate and the
/// transport may call back into this socket, so nothing below the lock
/// may hold it.
enum Action {
    Message(Vec<u8>, bool),
    Pong(Vec<u8>),
    EchoClose(Vec<u8>),
    ReceivedPong,
    CloseSocket,
    RequestClose(u16, String),
}

struct WsState {
    parser: FrameParser,
    cur_opcode: Option<OpCode>,
    cur_message: Vec<u8>,
    buffered_bytes: usize,
    close_sent: bool,
    close_received: bool,
    close_message: Option<Vec<u8>>,
    timed_out: bool,
    closed: bool,
    bytes_sent: u64,
    bytes_received: u64,
    connected_at: Option<Instant>,
}

/// WebSocket framing over an abstract transport. Construct with
/// [`WebSocketImpl::new`], wire the transport's callbacks to the `on_*`
/// methods, and use it through the [`WebSocket`] trait from above.
pub struct WebSocketImpl<T: Transport> {
    transport: T,
    role: Role,
    framing: bool,
    config: Config,
    delegate: OnceLock<Arc<dyn Delegate>>,
    state: Mutex<WsState>,
    ping_timer: Mutex<Option<Timer>>,
    response_timer: Mutex<Option<Timer>>,
}

impl<T: Transport + 'static> WebSocketImpl<T> {
    /// Creates a socket over `transport`. With `framing` false the
    /// transport carries whole messages and no RFC 6455 encoding happens.
    pub fn new(transport: T, role: Role, framing: bool, config: Config) -> Arc<WebSocketImpl<T>> {
        Arc::new(WebSocketImpl {
            transport,
            role,
            framing,
            config,
            delegate: OnceLock::new(),
            state: Mutex::new(WsState {
                parser: FrameParser::new(),
                cur_opcode: None,
                cur_message: Vec::new(),
                buffered_bytes: 0,
                close_sent: false,
                close_received: false,
                close_message: None,
                timed_out: false,
                closed: false,
                bytes_sent: 0,
                bytes_received: 0,
                connected_at: None,
            }),
            ping_timer: Mutex::new(None),
            response_timer: Mutex::new(None),
        })
    }

    /// Access to the transport (used by tests and owners).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn delegate(&self) -> Option<Arc<dyn Delegate>> {
        self.delegate.get().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WsState> {
        self.state.lock().expect("websocket state poisoned")
    }

    // ===== Callbacks from the transport =====

    /// The HTTP handshake finished. Anything but 101 is unrecoverable.
    pub fn on_http_response(self: &Arc<Self>, status: u16) {
        if let Some(delegate) = self.delegate() {
            delegate.on_http_response(status);
        }
        if status != 101 {
            warn!(status, "websocket handshake refused");
            self.transport.close_socket();
            self.on_closed(CloseStatus::websocket(
                close_code::PROTOCOL_ERROR,
                "unexpected HTTP status",
            ));
        }
    }

    /// The transport is connected; starts heartbeats and the response
    /// timer, and tells the delegate it can send.
    pub fn on_connect(self: &Arc<Self>) {
        self.lock().connected_at = Some(Instant::now());
        if let Some(delegate) = self.delegate() {
            delegate.on_connect();
        }

        if self.framing {
            if let Some(interval) = self.config.clamped_heartbeat() {
                let weak = Arc::downgrade(self);
                let timer = Timer::new(move || {
                    if let Some(ws) = weak.upgrade() {
                        ws.send_ping();
                    }
                });
                timer.fire_after(interval);
                *self.ping_timer.lock().expect("ping timer poisoned") = Some(timer);
            }
            if let Some(timeout) = self.config.effective_response_timeout() {
                let weak = Arc::downgrade(self);
                let timer = Timer::new(move || {
                    if let Some(ws) = weak.upgrade() {
                        ws.timed_out();
                    }
                });
                timer.fire_after(timeout);
                *self.response_timer.lock().expect("response timer poisoned") = Some(timer);
            }
        }
    }

    /// Bytes arrived from the transport. Any traffic re-arms the response
    /// timer; completed messages go to the delegate.
    pub fn on_receive(self: &Arc<Self>, data: &[u8]) {
        self.reset_response_timer();

        if !self.framing {
            self.lock().bytes_received += data.len() as u64;
            if let Some(delegate) = self.delegate() {
                delegate.on_message(data, true);
            }
            self.transport.receive_complete(data.len());
            return;
        }

        let mut actions = Vec::new();
        let result = {
            let mut state = self.lock();
            state.bytes_received += data.len() as u64;
            let mut parser = std::mem::take(&mut state.parser);
            let result = parser.consume(data, &mut |frame| {
                Self::handle_frame(&self.config, &mut state, frame, &mut actions)
            });
            state.parser = parser;
            result
        };

        if let Err(error) = result {
            let code = error.close_code().unwrap_or(close_code::PROTOCOL_ERROR);
            warn!(%error, code, "closing websocket on receive error");
            self.close(code, "websocket protocol violation");
        }
        self.perform(actions);
        self.transport.receive_complete(data.len());
    }

    /// The transport flushed `byte_count` previously sent bytes.
    pub fn on_write_complete(&self, byte_count: usize) {
        let (notify, disconnect) = {
            let mut state = self.lock();
            let was_over = state.buffered_bytes > self.config.send_buffer_size;
            state.buffered_bytes = state.buffered_bytes.saturating_sub(byte_count);
            let notify = was_over && state.buffered_bytes <= self.config.send_buffer_size;
            let disconnect =
                state.close_sent && state.close_received && state.buffered_bytes == 0;
            (notify, disconnect)
        };

        if disconnect {
            // The close echo has drained; tear the socket down.
            debug!("close handshake complete; disconnecting");
            self.transport.close_socket();
        } else if notify {
            if let Some(delegate) = self.delegate() {
                delegate.on_writeable();
            }
        }
    }

    /// The underlying socket failed; `errno` is the platform error.
    pub fn on_closed_with_errno(self: &Arc<Self>, errno: i32) {
        let message = std::io::Error::from_raw_os_error(errno).to_string();
        self.on_closed(CloseStatus::transport(errno, message));
    }

    /// The underlying socket closed. Exactly one `on_close` reaches the
    /// delegate regardless of how many times the transport reports it.
    pub fn on_closed(self: &Arc<Self>, mut status: CloseStatus) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;

            if self.framing {
                let clean = status.code == 0
                    || (status.reason == CloseReason::WebSocketClose
                        && status.code == i32::from(close_code::NORMAL));
                let expected = state.close_sent && state.close_received;
                if state.timed_out {
                    status = CloseStatus {
                        reason: CloseReason::Timeout,
                        code: i32::from(close_code::GOING_AWAY),
                        message: "connection timed out".into(),
                    };
                } else if clean {
                    status.reason = CloseReason::WebSocketClose;
                    if !expected {
                        status.code = i32::from(CODE_ABNORMAL);
                    } else if let Some(payload) = &state.close_message {
                        let (code, message) = frame::parse_close_payload(payload);
                        status.code = i32::from(code);
                        status.message = message;
                    } else {
                        status.code = i32::from(close_code::NORMAL);
                    }
                }
            }

            if let Some(since) = state.connected_at {
                debug!(
                    sent = state.bytes_sent,
                    received = state.bytes_received,
                    secs = since.elapsed().as_secs_f64(),
                    "websocket closed"
                );
            }
        }

        *self.ping_timer.lock().expect("ping timer poisoned") = None;
        *self.response_timer.lock().expect("response timer poisoned") = None;

        if let Some(delegate) = self.delegate() {
            delegate.on_close(status);
        }
    }

    // ===== Internals =====

    fn handle_frame(
        config: &Config,
        state: &mut WsState,
        frame: frame::Frame,
        actions: &mut Vec<Action>,
    ) -> blip_core::Result<()> {
        trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "frame");
        match frame.opcode {
            OpCode::Ping => {
                actions.push(Action::Pong(frame.payload));
                Ok(())
            }
            OpCode::Pong => {
                actions.push(Action::ReceivedPong);
                Ok(())
            }
            OpCode::Close => {
                if state.close_received {
                    return Ok(());
                }
                state.close_received = true;
                if state.close_sent {
                    // We initiated; the peer confirmed. Tear down now.
                    actions.push(Action::CloseSocket);
                } else {
                    // Peer initiated: echo the close, then ask the
                    // transport to finish the shutdown.
                    state.close_sent = true;
                    state.close_message = Some(frame.payload.clone());
                    let (code, message) = frame::parse_close_payload(&frame.payload);
                    actions.push(Action::EchoClose(frame.payload));
                    actions.push(Action::RequestClose(code, message));
                }
                Ok(())
            }
            OpCode::Continuation => {
                if state.cur_opcode.is_none() {
                    return Err(ErrorKind::Protocol("continuation without a message"));
                }
                Self::append_fragment(config, state, frame, actions)
            }
            OpCode::Text | OpCode::Binary => {
                if state.cur_opcode.is_some() {
                    return Err(ErrorKind::Protocol("data frame inside fragmented message"));
                }
                state.cur_opcode = Some(frame.opcode);
                Self::append_fragment(config, state, frame, actions)
            }
        }
    }

    fn append_fragment(
        config: &Config,
        state: &mut WsState,
        frame: frame::Frame,
        actions: &mut Vec<Action>,
    ) -> blip_core::Result<()> {
        if state.cur_message.len() + frame.payload.len() > config.max_message_size {
            return Err(ErrorKind::MessageTooLarge);
        }
        state.cur_message.extend_from_slice(&frame.payload);

        if frame.fin {
            let opcode = state.cur_opcode.take().expect("fragment has an opcode");
            let message = std::mem::take(&mut state.cur_message);
            if opcode == OpCode::Text && std::str::from_utf8(&message).is_err() {
                return Err(ErrorKind::Protocol("text message is not valid UTF-8"));
            }
            actions.push(Action::Message(message, opcode == OpCode::Binary));
        }
        Ok(())
    }

    fn perform(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Message(message, binary) => {
                    if let Some(delegate) = self.delegate() {
                        delegate.on_message(&message, binary);
                    }
                }
                Action::Pong(payload) => {
                    self.send_op(&payload, OpCode::Pong);
                }
                Action::ReceivedPong => self.received_pong(),
                Action::EchoClose(payload) => {
                    self.send_op(&payload, OpCode::Close);
                }
                Action::CloseSocket => self.transport.close_socket(),
                Action::RequestClose(code, message) => {
                    self.transport.request_close(code, &message);
                }
            }
        }
    }

    fn send_op(&self, payload: &[u8], opcode: OpCode) -> bool {
        let frame;
        let writeable;
        {
            let mut state = self.lock();
            if state.closed || (state.close_sent && opcode != OpCode::Close) {
                return false;
            }
            frame = if self.framing {
                frame::format_message(payload, opcode, self.mask_key())
            } else {
                debug_assert_eq!(opcode, OpCode::Binary);
                payload.to_vec()
            };
            state.buffered_bytes += frame.len();
            state.bytes_sent += frame.len() as u64;
            writeable = state.buffered_bytes <= self.config.send_buffer_size;
        }
        // The lock is released before calling down: the transport may
        // re-enter this socket from inside send_bytes.
        self.transport.send_bytes(frame);
        writeable
    }

    fn mask_key(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(rand::rng().random()),
            Role::Server => None,
        }
    }

    fn send_ping(&self) {
        trace!("sending PING");
        self.send_op(&[], OpCode::Ping);
    }

    fn received_pong(&self) {
        trace!("received PONG");
        // A live peer re-arms the next heartbeat.
        if let (Some(timer), Some(interval)) = (
            self.ping_timer.lock().expect("ping timer poisoned").as_ref(),
            self.config.clamped_heartbeat(),
        ) {
            timer.fire_after(interval);
        }
    }

    fn reset_response_timer(&self) {
        if let (Some(timer), Some(timeout)) = (
            self.response_timer.lock().expect("response timer poisoned").as_ref(),
            self.config.effective_response_timeout(),
        ) {
            timer.fire_after(timeout);
        }
    }

    fn timed_out(&self) {
        warn!("no traffic within response timeout");
        self.lock().timed_out = true;
        self.close(close_code::GOING_AWAY, "connection timed out");
    }
}

impl<T: Transport + 'static> WebSocket for WebSocketImpl<T> {
    fn connect(&self, delegate: Arc<dyn Delegate>) {
        if self.delegate.set(delegate).is_err() {
            warn!("websocket connect called twice");
            return;
        }
        self.transport.open_socket();
    }

    fn send(&self, message: &[u8], binary: bool) -> bool {
        self.send_op(message, if binary { OpCode::Binary } else { OpCode::Text })
    }

    fn close(&self, code: u16, message: &str) {
        if self.framing {
            let payload = {
                let mut state = self.lock();
                if state.close_sent || state.close_received {
                    return;
                }
                state.close_sent = true;
                let payload = frame::format_close_payload(code, message);
                state.close_message = Some(payload.clone());
                payload
            };
            self.send_op(&payload, OpCode::Close);
        } else {
            self.transport.request_close(code, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::frame::{format_message, Frame};

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        socket_closed: AtomicBool,
        close_requested: Mutex<Option<(u16, String)>>,
        acked: AtomicUsize,
    }

    impl MockTransport {
        fn sent_frames(&self) -> Vec<Frame> {
            let mut parser = FrameParser::new();
            let mut frames = Vec::new();
            for chunk in self.sent.lock().unwrap().iter() {
                parser
                    .consume(chunk, &mut |frame| {
                        frames.push(frame);
                        Ok(())
                    })
                    .unwrap();
            }
            frames
        }
    }

    impl Transport for MockTransport {
        fn open_socket(&self) {}
        fn send_bytes(&self, frame: Vec<u8>) {
            self.sent.lock().unwrap().push(frame);
        }
        fn close_socket(&self) {
            self.socket_closed.store(true, Ordering::SeqCst);
        }
        fn receive_complete(&self, byte_count: usize) {
            self.acked.fetch_add(byte_count, Ordering::SeqCst);
        }
        fn request_close(&self, code: u16, message: &str) {
            *self.close_requested.lock().unwrap() = Some((code, message.to_string()));
        }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        connected: AtomicBool,
        messages: Mutex<Vec<(Vec<u8>, bool)>>,
        writeable: AtomicUsize,
        closes: Mutex<Vec<CloseStatus>>,
    }

    impl Delegate for RecordingDelegate {
        fn on_connect(&self) {
            self.connected.store(true, Ordering::SeqCst);
        }
        fn on_message(&self, message: &[u8], binary: bool) {
            self.messages.lock().unwrap().push((message.to_vec(), binary));
        }
        fn on_writeable(&self) {
            self.writeable.fetch_add(1, Ordering::SeqCst);
        }
        fn on_close(&self, status: CloseStatus) {
            self.closes.lock().unwrap().push(status);
        }
    }

    fn open_socket(
        config: Config,
    ) -> (Arc<WebSocketImpl<MockTransport>>, Arc<RecordingDelegate>) {
        let ws = WebSocketImpl::new(MockTransport::default(), Role::Server, true, config);
        let delegate = Arc::new(RecordingDelegate::default());
        ws.connect(delegate.clone() as Arc<dyn Delegate>);
        ws.on_http_response(101);
        ws.on_connect();
        (ws, delegate)
    }

    fn quiet_config() -> Config {
        Config { heartbeat_interval: None, ..Config::default() }
    }

    #[test]
    fn test_send_produces_a_binary_frame() {
        let (ws, _) = open_socket(quiet_config());
        assert!(ws.send(b"payload", true));

        let frames = ws.transport().sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Binary);
        assert_eq!(frames[0].payload, b"payload");
    }

    #[test]
    fn test_receive_reassembles_fragmented_message() {
        let (ws, delegate) = open_socket(quiet_config());

        let mut first = format_message(b"hello ", OpCode::Binary, None);
        first[0] &= 0x7F; // clear FIN
        ws.on_receive(&first);
        let cont = {
            let mut f = format_message(b"world", OpCode::Continuation, None);
            f[0] |= 0x80;
            f
        };
        ws.on_receive(&cont);

        let messages = delegate.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, b"hello world");
        assert!(messages[0].1);
        assert!(ws.transport().acked.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_data_frame_inside_fragmented_message_closes_1002() {
        let (ws, _) = open_socket(quiet_config());

        let mut first = format_message(b"frag", OpCode::Binary, None);
        first[0] &= 0x7F;
        ws.on_receive(&first);
        ws.on_receive(&format_message(b"rogue", OpCode::Binary, None));

        let frames = ws.transport().sent_frames();
        let close = frames.iter().find(|f| f.opcode == OpCode::Close).expect("close frame");
        assert_eq!(frame::parse_close_payload(&close.payload).0, 1002);
    }

    #[test]
    fn test_oversized_message_closes_1009() {
        let config = Config { max_message_size: 64, ..quiet_config() };
        let (ws, _) = open_socket(config);

        ws.on_receive(&format_message(&[0u8; 100], OpCode::Binary, None));

        let frames = ws.transport().sent_frames();
        let close = frames.iter().find(|f| f.opcode == OpCode::Close).expect("close frame");
        assert_eq!(frame::parse_close_payload(&close.payload).0, 1009);
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (ws, _) = open_socket(quiet_config());
        ws.on_receive(&format_message(b"hb", OpCode::Ping, None));

        let frames = ws.transport().sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Pong);
        assert_eq!(frames[0].payload, b"hb");
    }

    #[test]
    fn test_local_close_handshake() {
        let (ws, delegate) = open_socket(quiet_config());

        ws.close(close_code::NORMAL, "done");
        let frames = ws.transport().sent_frames();
        assert_eq!(frames[0].opcode, OpCode::Close);

        // Peer echoes the close; the socket tears the transport down.
        ws.on_receive(&format_message(&frames[0].payload, OpCode::Close, None));
        assert!(ws.transport().socket_closed.load(Ordering::SeqCst));

        ws.on_closed(CloseStatus::websocket(close_code::NORMAL, String::new()));
        let closes = delegate.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert!(closes[0].is_normal());
        assert_eq!(closes[0].message, "done");
    }

    #[test]
    fn test_remote_close_is_echoed() {
        let (ws, _) = open_socket(quiet_config());

        let payload = frame::format_close_payload(close_code::GOING_AWAY, "bye");
        ws.on_receive(&format_message(&payload, OpCode::Close, None));

        let frames = ws.transport().sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Close);
        assert_eq!(frames[0].payload, payload);
        let requested = ws.transport().close_requested.lock().unwrap().clone();
        assert_eq!(requested, Some((close_code::GOING_AWAY as u16, "bye".to_string())));
    }

    #[test]
    fn test_on_close_delivered_exactly_once() {
        let (ws, delegate) = open_socket(quiet_config());
        ws.on_closed_with_errno(104);
        ws.on_closed_with_errno(104);

        let closes = delegate.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].reason, CloseReason::TransportError);
        assert_eq!(closes[0].code, 104);
    }

    #[test]
    fn test_back_pressure_and_writeable() {
        let config = Config { send_buffer_size: 64, ..quiet_config() };
        let (ws, delegate) = open_socket(config);

        assert!(ws.send(&[0u8; 16], true));
        assert!(!ws.send(&[0u8; 128], true), "second send crosses the threshold");

        let total: usize = ws.transport().sent.lock().unwrap().iter().map(|f| f.len()).sum();
        ws.on_write_complete(total);
        assert_eq!(delegate.writeable.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_response_timeout_closes_going_away() {
        let config = Config {
            heartbeat_interval: None,
            response_timeout: Some(Duration::from_millis(25)),
            ..Config::default()
        };
        let (ws, delegate) = open_socket(config);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let frames = ws.transport().sent_frames();
            if frames.iter().any(|f| f.opcode == OpCode::Close) {
                break;
            }
            assert!(Instant::now() < deadline, "timeout close never sent");
            std::thread::sleep(Duration::from_millis(5));
        }

        // Transport reports the socket going down; status maps to Timeout.
        ws.on_closed(CloseStatus::websocket(close_code::NORMAL, String::new()));
        let closes = delegate.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].reason, CloseReason::Timeout);
        assert_eq!(closes[0].code, i32::from(close_code::GOING_AWAY));
    }

    #[test]
    fn test_failed_handshake_closes_with_protocol_error() {
        let ws = WebSocketImpl::new(MockTransport::default(), Role::Client, true, quiet_config());
        let delegate = Arc::new(RecordingDelegate::default());
        ws.connect(delegate.clone() as Arc<dyn Delegate>);
        ws.on_http_response(500);

        assert!(ws.transport().socket_closed.load(Ordering::SeqCst));
        let closes = delegate.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].code, i32::from(close_code::PROTOCOL_ERROR));
    }
}
