//! In-process WebSocket pairs.
//!
//! A loopback socket relays complete messages straight to its peer,
//! skipping the wire framing; each socket is an actor on its own mailbox,
//! so delivery is asynchronous and ordered just like a real transport.
//! Received bytes are acknowledged back to the sender, which drives the
//! same buffered-bytes back-pressure a real socket shows: `send` returns
//! false once too much data is in flight, and `on_writeable` fires when
//! the peer drains it.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blip_core::constants::SEND_BUFFER_SIZE;
use blip_runtime::Mailbox;
use tracing::{debug, trace};

use crate::interface::{CloseStatus, Delegate, WebSocket};

struct LoopbackState {
    peer: Option<Arc<LoopbackWebSocket>>,
    delegate: Option<Arc<dyn Delegate>>,
    connected: bool,
    closed: bool,
}

/// One end of an in-process WebSocket pair. Create with
/// [`LoopbackWebSocket::pair`]; both ends must be `connect`ed before
/// messages flow.
pub struct LoopbackWebSocket {
    name: &'static str,
    mailbox: Mailbox,
    latency: Duration,
    ack_delay: Mutex<Duration>,
    buffered_bytes: AtomicI64,
    bytes_sent: AtomicU64,
    state: Mutex<LoopbackState>,
}

impl LoopbackWebSocket {
    /// Creates two sockets bound to each other. Messages sent by one are
    /// received by the other after `latency`.
    pub fn pair(latency: Duration) -> (Arc<LoopbackWebSocket>, Arc<LoopbackWebSocket>) {
        let a = Arc::new(Self::new("loopback-a", latency));
        let b = Arc::new(Self::new("loopback-b", latency));
        a.state.lock().expect("loopback poisoned").peer = Some(Arc::clone(&b));
        b.state.lock().expect("loopback poisoned").peer = Some(Arc::clone(&a));
        (a, b)
    }

    fn new(name: &'static str, latency: Duration) -> LoopbackWebSocket {
        LoopbackWebSocket {
            name,
            mailbox: Mailbox::new(name),
            latency,
            ack_delay: Mutex::new(Duration::ZERO),
            buffered_bytes: AtomicI64::new(0),
            bytes_sent: AtomicU64::new(0),
            state: Mutex::new(LoopbackState {
                peer: None,
                delegate: None,
                connected: false,
                closed: false,
            }),
        }
    }

    /// Delays the receive acknowledgments this socket sends back to its
    /// peer, keeping the peer's buffered-byte count high. Used to
    /// simulate a slow transport and exercise back-pressure.
    pub fn set_ack_delay(&self, delay: Duration) {
        *self.ack_delay.lock().expect("loopback poisoned") = delay;
    }

    /// Total message bytes this socket has sent (observing wire volume).
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    /// Simulates the underlying transport failing: both ends report a
    /// TransportError close with `errno`, with no close handshake.
    pub fn simulate_transport_failure(self: &Arc<Self>, errno: i32) {
        let peer = self.state.lock().expect("loopback poisoned").peer.clone();
        self.simulate_closed(CloseStatus::transport(errno, "simulated transport failure"));
        if let Some(peer) = peer {
            peer.simulate_closed(CloseStatus::transport(errno, "simulated transport failure"));
        }
    }

    fn delegate(&self) -> Option<Arc<dyn Delegate>> {
        self.state.lock().expect("loopback poisoned").delegate.clone()
    }

    fn peer(&self) -> Option<Arc<LoopbackWebSocket>> {
        let state = self.state.lock().expect("loopback poisoned");
        if state.closed {
            None
        } else {
            state.peer.clone()
        }
    }

    /// Peer side: enqueues delivery of a message to this socket's
    /// delegate, then acks the bytes back to the sender.
    fn simulate_received(self: &Arc<Self>, message: Vec<u8>, binary: bool, latency: Duration) {
        let this = Arc::clone(self);
        let deliver = move || {
            let n = message.len();
            let (delegate, sender, ack_delay) = {
                let state = this.state.lock().expect("loopback poisoned");
                if state.closed || !state.connected {
                    return;
                }
                (
                    state.delegate.clone(),
                    state.peer.clone(),
                    *this.ack_delay.lock().expect("loopback poisoned"),
                )
            };
            if let Some(delegate) = delegate {
                delegate.on_message(&message, binary);
            }
            if let Some(sender) = sender {
                sender.ack(n, ack_delay);
            }
        };
        if latency.is_zero() {
            self.mailbox.enqueue("receive", deliver);
        } else {
            self.mailbox.enqueue_after(latency, "receive", deliver);
        }
    }

    /// A receiver consumed `n` of our bytes; drop them from the buffered
    /// count and wake the delegate if we just fell below the threshold.
    fn ack(self: &Arc<Self>, n: usize, delay: Duration) {
        let this = Arc::clone(self);
        let task = move || {
            let before = this.buffered_bytes.fetch_sub(n as i64, Ordering::SeqCst);
            let after = before - n as i64;
            let threshold = SEND_BUFFER_SIZE as i64;
            if after <= threshold && before > threshold {
                trace!(socket = this.name, "writeable again");
                if let Some(delegate) = this.delegate() {
                    delegate.on_writeable();
                }
            }
        };
        if delay.is_zero() {
            self.mailbox.enqueue("ack", task);
        } else {
            self.mailbox.enqueue_after(delay, "ack", task);
        }
    }

    fn simulate_closed(self: &Arc<Self>, status: CloseStatus) {
        let this = Arc::clone(self);
        self.mailbox.enqueue("closed", move || {
            let delegate = {
                let mut state = this.state.lock().expect("loopback poisoned");
                if state.closed {
                    return;
                }
                state.closed = true;
                state.peer = None;
                state.delegate.clone()
            };
            debug!(socket = this.name, ?status, "loopback closed");
            if let Some(delegate) = delegate {
                delegate.on_close(status);
            }
        });
    }
}

impl WebSocket for LoopbackWebSocket {
    fn connect(&self, delegate: Arc<dyn Delegate>) {
        {
            let mut state = self.state.lock().expect("loopback poisoned");
            assert!(state.peer.is_some(), "loopback socket connected before being paired");
            state.delegate = Some(delegate.clone());
            state.connected = true;
        }
        let name = self.name;
        self.mailbox.enqueue("connect", move || {
            trace!(socket = name, "loopback open");
            delegate.on_http_response(101);
            delegate.on_connect();
        });
    }

    fn send(&self, message: &[u8], binary: bool) -> bool {
        let n = message.len();
        let buffered = self.buffered_bytes.fetch_add(n as i64, Ordering::SeqCst) + n as i64;
        self.bytes_sent.fetch_add(n as u64, Ordering::SeqCst);

        if let Some(peer) = self.peer() {
            peer.simulate_received(message.to_vec(), binary, self.latency);
        } else {
            debug!(socket = self.name, "send on closed loopback dropped");
        }
        buffered <= SEND_BUFFER_SIZE as i64
    }

    fn close(&self, code: u16, message: &str) {
        let status = CloseStatus::websocket(code, message);
        let (peer, delegate) = {
            let mut state = self.state.lock().expect("loopback poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            (state.peer.take(), state.delegate.clone())
        };
        if let Some(peer) = peer {
            peer.simulate_closed(status.clone());
        }
        self.mailbox.enqueue("close", move || {
            if let Some(delegate) = delegate {
                delegate.on_close(status);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;

    #[derive(Default)]
    struct CollectingDelegate {
        messages: Mutex<Vec<Vec<u8>>>,
        writeable: AtomicUsize,
        closes: Mutex<Vec<CloseStatus>>,
        connects: AtomicUsize,
    }

    impl Delegate for CollectingDelegate {
        fn on_connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
        fn on_message(&self, message: &[u8], _binary: bool) {
            self.messages.lock().unwrap().push(message.to_vec());
        }
        fn on_writeable(&self) {
            self.writeable.fetch_add(1, Ordering::SeqCst);
        }
        fn on_close(&self, status: CloseStatus) {
            self.closes.lock().unwrap().push(status);
        }
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(5), "condition not met in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn connected_pair() -> (
        Arc<LoopbackWebSocket>,
        Arc<LoopbackWebSocket>,
        Arc<CollectingDelegate>,
        Arc<CollectingDelegate>,
    ) {
        let (a, b) = LoopbackWebSocket::pair(Duration::ZERO);
        let da = Arc::new(CollectingDelegate::default());
        let db = Arc::new(CollectingDelegate::default());
        a.connect(da.clone() as Arc<dyn Delegate>);
        b.connect(db.clone() as Arc<dyn Delegate>);
        wait_until(|| da.connects.load(Ordering::SeqCst) == 1 && db.connects.load(Ordering::SeqCst) == 1);
        (a, b, da, db)
    }

    #[test]
    fn test_messages_cross_in_order() {
        let (a, _b, _da, db) = connected_pair();
        for i in 0..20u8 {
            a.send(&[i], true);
        }
        wait_until(|| db.messages.lock().unwrap().len() == 20);
        let received = db.messages.lock().unwrap();
        for (i, message) in received.iter().enumerate() {
            assert_eq!(message, &vec![i as u8]);
        }
    }

    #[test]
    fn test_back_pressure_and_writeable_round_trip() {
        let (a, b, da, _db) = connected_pair();
        b.set_ack_delay(Duration::from_millis(20));

        // Push enough to cross the 32 KiB buffer threshold.
        let chunk = vec![0u8; 16 * 1024];
        assert!(a.send(&chunk, true));
        assert!(a.send(&chunk, true));
        assert!(!a.send(&chunk, true), "third send is over the threshold");

        wait_until(|| da.writeable.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_clean_close_reaches_both_sides() {
        let (a, _b, da, db) = connected_pair();
        a.close(1000, "bye");
        wait_until(|| !da.closes.lock().unwrap().is_empty() && !db.closes.lock().unwrap().is_empty());

        for delegate in [&da, &db] {
            let closes = delegate.closes.lock().unwrap();
            assert_eq!(closes.len(), 1);
            assert!(closes[0].is_normal());
            assert_eq!(closes[0].message, "bye");
        }
    }

    #[test]
    fn test_transport_failure_reported_once_per_side() {
        let (a, _b, da, db) = connected_pair();
        a.simulate_transport_failure(104);
        a.simulate_transport_failure(104);

        wait_until(|| !da.closes.lock().unwrap().is_empty() && !db.closes.lock().unwrap().is_empty());
        std::thread::sleep(Duration::from_millis(20));
        for delegate in [&da, &db] {
            let closes = delegate.closes.lock().unwrap();
            assert_eq!(closes.len(), 1);
            assert_eq!(closes[0].reason, crate::interface::CloseReason::TransportError);
            assert_eq!(closes[0].code, 104);
        }
    }
}
