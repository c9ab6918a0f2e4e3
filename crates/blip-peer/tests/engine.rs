//! Integration tests for the blip-peer engine over loopback sockets.
//!
//! These exercise the request/response tables, numbering, and the close
//! handshake directly against [`BlipIo`]; the end-to-end scenarios live
//! in the `blip` facade crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use blip_core::Config;
use blip_peer::{BlipIo, ConnectionDelegate, MessageBuilder, MessageIn};
use blip_websocket::{CloseStatus, LoopbackWebSocket, WebSocket};

#[derive(Default)]
struct Recorder {
    requests: Mutex<Vec<Arc<MessageIn>>>,
    responses: Mutex<Vec<Arc<MessageIn>>>,
    closes: AtomicUsize,
    echo: bool,
}

impl Recorder {
    fn echoing() -> Recorder {
        Recorder { echo: true, ..Recorder::default() }
    }
}

impl ConnectionDelegate for Recorder {
    fn on_request(&self, request: Arc<MessageIn>) {
        if self.echo {
            let body = request.body().as_slice().to_vec();
            request.respond(MessageBuilder::new().body(body)).unwrap();
        }
        self.requests.lock().unwrap().push(request);
    }

    fn on_response(&self, response: Arc<MessageIn>) {
        self.responses.lock().unwrap().push(response);
    }

    fn on_close(&self, _status: CloseStatus) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_until(condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(10), "condition not met in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn engine_pair() -> (Arc<BlipIo>, Arc<Recorder>, Arc<BlipIo>, Arc<Recorder>) {
    let (client_ws, server_ws) = LoopbackWebSocket::pair(Duration::ZERO);
    let client_delegate = Arc::new(Recorder::default());
    let server_delegate = Arc::new(Recorder::echoing());

    let client = BlipIo::new(client_ws.clone(), client_delegate.clone(), Config::default());
    let server = BlipIo::new(server_ws.clone(), server_delegate.clone(), Config::default());
    client_ws.connect(client.websocket_delegate());
    server_ws.connect(server.websocket_delegate());
    (client, client_delegate, server, server_delegate)
}

#[test]
fn test_request_gets_echoed_response() {
    let (client, client_delegate, _server, server_delegate) = engine_pair();

    client.send(MessageBuilder::with_profile("echo").body(b"ping".to_vec())).unwrap();

    wait_until(|| !client_delegate.responses.lock().unwrap().is_empty());
    let responses = client_delegate.responses.lock().unwrap();
    assert_eq!(responses[0].body().as_slice(), b"ping");
    assert!(!responses[0].is_error());

    let requests = server_delegate.requests.lock().unwrap();
    assert_eq!(requests[0].property("Profile").as_deref(), Some("echo"));
}

#[test]
fn test_request_numbers_are_sequential_per_direction() {
    let (client, client_delegate, _server, server_delegate) = engine_pair();

    for i in 0..5u8 {
        client.send(MessageBuilder::new().body(vec![i])).unwrap();
    }
    wait_until(|| server_delegate.requests.lock().unwrap().len() == 5);
    wait_until(|| client_delegate.responses.lock().unwrap().len() == 5);

    let requests = server_delegate.requests.lock().unwrap();
    for (i, request) in requests.iter().enumerate() {
        assert_eq!(request.number(), i as u64 + 1);
        assert_eq!(request.body().as_slice(), &[i as u8]);
    }
    // Replies match their requests by number.
    let responses = client_delegate.responses.lock().unwrap();
    for response in responses.iter() {
        assert_eq!(response.body().as_slice(), &[(response.number() - 1) as u8]);
    }
}

#[test]
fn test_both_directions_carry_requests() {
    let (client, client_delegate, server, server_delegate) = engine_pair();

    client.send(MessageBuilder::new().body(b"from client".to_vec())).unwrap();
    server.send(MessageBuilder::new().no_reply(true).body(b"from server".to_vec())).unwrap();

    wait_until(|| {
        !server_delegate.requests.lock().unwrap().is_empty()
            && !client_delegate.requests.lock().unwrap().is_empty()
    });
    // Numbers are scoped per direction, so both first requests are #1.
    assert_eq!(server_delegate.requests.lock().unwrap()[0].number(), 1);
    assert_eq!(client_delegate.requests.lock().unwrap()[0].number(), 1);
}

#[test]
fn test_send_after_close_is_a_usage_error() {
    let (client, client_delegate, _server, server_delegate) = engine_pair();

    client.close().unwrap();
    assert!(client.send(MessageBuilder::new()).is_err());
    assert!(client.close().is_err(), "second close is a usage error");

    wait_until(|| client_delegate.closes.load(Ordering::SeqCst) == 1);
    wait_until(|| server_delegate.closes.load(Ordering::SeqCst) == 1);
}

#[test]
fn test_large_compressed_round_trip() {
    let (client, client_delegate, _server, _server_delegate) = engine_pair();

    let body = "a moderately compressible sentence, repeated. ".repeat(8000).into_bytes();
    client
        .send(MessageBuilder::new().compressed(true).body(body.clone()))
        .unwrap();

    wait_until(|| !client_delegate.responses.lock().unwrap().is_empty());
    let responses = client_delegate.responses.lock().unwrap();
    assert_eq!(responses[0].body().as_slice(), &body[..]);
}
