//! In-process echo demo over a loopback WebSocket pair.
//!
//! Run:
//! - cargo run -p blip --example echo
//! - cargo run -p blip --example echo -- 10
//!   (sends 10 requests)

use std::env;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use blip::prelude::*;

struct EchoServer;

impl ConnectionDelegate for EchoServer {
    fn on_request(&self, request: Arc<MessageIn>) {
        let profile = request.property("Profile").unwrap_or_default();
        let body = request.body();
        println!(
            "[server] request #{} profile=\"{}\" ({} bytes)",
            request.number(),
            profile,
            body.len()
        );
        if let Err(e) = request.respond(MessageBuilder::new().body(body.as_slice().to_vec())) {
            eprintln!("[server] failed to respond: {}", e);
        }
    }

    fn on_close(&self, status: CloseStatus) {
        println!("[server] closed: {:?}", status);
    }
}

struct EchoClient;

impl ConnectionDelegate for EchoClient {
    fn on_request(&self, _request: Arc<MessageIn>) {
        // The server side never sends requests in this demo.
    }

    fn on_response(&self, response: Arc<MessageIn>) {
        let text = String::from_utf8_lossy(response.body().as_slice()).into_owned();
        println!("[client] reply #{}: \"{}\"", response.number(), text);
    }

    fn on_close(&self, status: CloseStatus) {
        println!("[client] closed: {:?}", status);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let count: usize = env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(3);

    let (client_ws, server_ws) = LoopbackWebSocket::pair(Duration::from_millis(5));
    let _server = Connection::connect(server_ws, Arc::new(EchoServer), Config::default());
    let client = Connection::connect(client_ws, Arc::new(EchoClient), Config::default());

    let (done_tx, done_rx) = mpsc::channel();
    for i in 0..count {
        let done = done_tx.clone();
        client.send(
            MessageBuilder::with_profile("echo")
                .body(format!("hello {}", i).into_bytes())
                .on_progress(move |progress| {
                    if progress.state.is_terminal() {
                        let _ = done.send(progress.state);
                    }
                }),
        )?;
    }

    for _ in 0..count {
        let state = done_rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(state, ProgressState::Complete);
    }

    client.close()?;
    std::thread::sleep(Duration::from_millis(50));
    println!("done: {} echoes round-tripped", count);
    Ok(())
}
