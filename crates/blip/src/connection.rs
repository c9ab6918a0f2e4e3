//! The connection facade.

use std::sync::Arc;

use blip_core::{Config, Result};
use blip_peer::{BlipIo, ConnectionDelegate, MessageBuilder};
use blip_websocket::WebSocket;

/// One side of a BLIP connection. Owns the protocol engine; the
/// application talks to the engine only through this facade and hears
/// back through its [`ConnectionDelegate`].
pub struct Connection {
    io: Arc<BlipIo>,
}

impl Connection {
    /// Creates the engine over `websocket` and opens it. The delegate
    /// starts receiving callbacks once the socket connects; messages sent
    /// before then are queued and flushed on open.
    pub fn connect(
        websocket: Arc<dyn WebSocket>,
        delegate: Arc<dyn ConnectionDelegate>,
        config: Config,
    ) -> Arc<Connection> {
        let io = BlipIo::new(Arc::clone(&websocket), delegate, config);
        websocket.connect(io.websocket_delegate());
        Arc::new(Connection { io })
    }

    /// Queues an outgoing request. Progress (including the eventual
    /// reply) is reported through the builder's progress callback, and
    /// complete replies also reach the delegate's `on_response`.
    pub fn send(&self, message: MessageBuilder) -> Result<()> {
        self.io.send(message)
    }

    /// Starts a clean close. Messages still queued report Disconnected;
    /// the delegate's `on_close` fires when the handshake finishes.
    pub fn close(&self) -> Result<()> {
        self.io.close()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish()
    }
}
