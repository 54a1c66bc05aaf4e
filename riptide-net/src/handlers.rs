//! Event hooks
//!
//! Applications observe and steer connections by supplying these
//! capability traits at construction time. Every method has a no-op
//! default, so implementors override only what they care about. Hooks run
//! on the connection's I/O loop; use the async call surface
//! (`send_async`, `disconnect_async`, ...) from inside them.

use std::sync::Arc;

use riptide_core::Error;

use crate::client::Client;
use crate::server::Server;
use crate::session::Session;

/// Hooks observed by a server-side session.
pub trait SessionEvents: Send + Sync + 'static {
    fn on_connect(&self, _session: &Session) {}
    /// TLS only: the handshake completed and the session is ready.
    fn on_handshaked(&self, _session: &Session) {}
    fn on_disconnect(&self, _session: &Session) {}
    /// A chunk of bytes arrived. Chunks carry no framing.
    fn on_receive(&self, _session: &Session, _data: &[u8]) {}
    /// `sent` bytes left the socket; `pending` bytes remain staged.
    fn on_send(&self, _session: &Session, _sent: usize, _pending: u64) {}
    /// Both send buffers drained; more data can flow.
    fn on_empty(&self, _session: &Session) {}
    fn on_error(&self, _session: &Session, _err: &Error) {}
}

/// Default no-op session sink.
pub struct NoopSessionEvents;

impl SessionEvents for NoopSessionEvents {}

/// Hooks observed by a server.
pub trait ServerEvents: Send + Sync + 'static {
    /// Factory for the event sink of the next accepted session. This is
    /// the polymorphic extension point: return a different implementation
    /// per connection if needed.
    fn new_session(&self) -> Arc<dyn SessionEvents> {
        Arc::new(NoopSessionEvents)
    }

    fn on_start(&self, _server: &Server) {}
    fn on_stop(&self, _server: &Server) {}
    fn on_connect(&self, _session: &Session) {}
    /// TLS only.
    fn on_handshaked(&self, _session: &Session) {}
    fn on_disconnect(&self, _session: &Session) {}
    fn on_error(&self, _err: &Error) {}
}

/// Default no-op server sink.
pub struct NoopServerEvents;

impl ServerEvents for NoopServerEvents {}

/// Hooks observed by a client.
pub trait ClientEvents: Send + Sync + 'static {
    fn on_connect(&self, _client: &Client) {}
    /// TLS only: the handshake completed and the client is ready.
    fn on_handshaked(&self, _client: &Client) {}
    fn on_disconnect(&self, _client: &Client) {}
    fn on_receive(&self, _client: &Client, _data: &[u8]) {}
    fn on_send(&self, _client: &Client, _sent: usize, _pending: u64) {}
    fn on_empty(&self, _client: &Client) {}
    fn on_error(&self, _client: &Client, _err: &Error) {}
}

/// Default no-op client sink.
pub struct NoopClientEvents;

impl ClientEvents for NoopClientEvents {}
