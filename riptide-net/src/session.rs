//! Server-side sessions
//!
//! A session manages one accepted connection: its socket, the send and
//! receive loops, byte counters, and the notification surface. Sessions
//! are created by the server's accept loop, registered before `connect`,
//! and removed from the registry after disconnect.
//!
//! A session holds a strong reference to its server only while
//! connected. The disconnect path clears that reference before the
//! registry entry goes away, so the server/session cycle closes itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use riptide_core::{Error, IoLoop};

use crate::handlers::SessionEvents;
use crate::pump::{self, Endpoint, Pump};
use crate::server::Server;
use crate::socket;

pub struct Session {
    id: Uuid,
    this: Weak<Session>,
    io: Arc<IoLoop>,
    events: Arc<dyn SessionEvents>,
    /// Strong reference held only while connected.
    server: Mutex<Option<Arc<Server>>>,
    secured: bool,
    connected: AtomicBool,
    handshaked: AtomicBool,
    pump: Pump,
}

impl Session {
    pub(crate) fn new(server: &Arc<Server>, events: Arc<dyn SessionEvents>) -> Arc<Self> {
        let session = Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            this: this.clone(),
            io: server.service().next_io(),
            events,
            server: Mutex::new(Some(server.clone())),
            secured: server.factory().secured(),
            connected: AtomicBool::new(false),
            handshaked: AtomicBool::new(false),
            pump: Pump::new(),
        });
        session
            .pump
            .send_limit
            .store(server.session_send_limit(), Ordering::SeqCst);
        session
            .pump
            .receive_limit
            .store(server.session_receive_limit(), Ordering::SeqCst);
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn io(&self) -> &Arc<IoLoop> {
        &self.io
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// TLS sessions become handshaked after the handshake; plain
    /// sessions are handshaked at connect.
    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::SeqCst)
    }

    /// User data may flow only when ready.
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.is_handshaked()
    }

    pub fn bytes_pending(&self) -> u64 {
        self.pump.bytes_pending.load(Ordering::SeqCst)
    }

    pub fn bytes_sending(&self) -> u64 {
        self.pump.bytes_sending.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.pump.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.pump.bytes_received.load(Ordering::SeqCst)
    }

    /// Send buffer limit in bytes; 0 means unlimited.
    pub fn send_buffer_limit(&self) -> usize {
        self.pump.send_limit.load(Ordering::SeqCst)
    }

    pub fn set_send_buffer_limit(&self, limit: usize) {
        self.pump.send_limit.store(limit, Ordering::SeqCst);
    }

    /// Receive buffer limit in bytes; 0 means unlimited. Reaching it
    /// disconnects the session.
    pub fn receive_buffer_limit(&self) -> usize {
        self.pump.receive_limit.load(Ordering::SeqCst)
    }

    pub fn set_receive_buffer_limit(&self, limit: usize) {
        self.pump.receive_limit.store(limit, Ordering::SeqCst);
    }

    /// Synchronous send. Zero timeout writes the whole buffer; a
    /// non-zero timeout races one write against a timer and cancels the
    /// loser. Blocks the caller: use [`Self::send_async`] from hooks.
    pub fn send(&self, data: &[u8], timeout: Duration) -> usize {
        pump::send_blocking(self, data, timeout)
    }

    /// Append to the send buffer and start a write campaign when none is
    /// running. Returns false when not ready, `data` is empty, or the
    /// send buffer limit would be exceeded.
    pub fn send_async(&self, data: &[u8]) -> bool {
        pump::send_async(self, data)
    }

    /// Synchronous receive into `out`. Blocks the caller.
    pub fn receive(&self, out: &mut [u8], timeout: Duration) -> usize {
        pump::receive_blocking(self, out, timeout)
    }

    /// Synchronous receive of up to `size` bytes as text.
    pub fn receive_text(&self, size: usize, timeout: Duration) -> String {
        let mut buf = vec![0u8; size];
        let count = self.receive(&mut buf, timeout);
        buf.truncate(count);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Arm the continuous receive loop. Server sessions arm themselves
    /// at connect; this re-arms after a manual pause.
    pub fn receive_async(&self) {
        pump::arm_receive(&self.pump);
    }

    /// Schedule an orderly shutdown of this session. Idempotent: returns
    /// false when the session is already disconnected.
    pub fn disconnect(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        self.io.spawn(async move {
            this.do_disconnect().await;
        });
        true
    }

    fn server_ref(&self) -> Option<Arc<Server>> {
        self.server.lock().clone()
    }

    /// Runs on the session's loop right after the accept completed:
    /// register the socket with this loop, apply socket options, flip to
    /// connected, fire the connect hooks, run the transport handshake,
    /// then arm the I/O loops.
    pub(crate) async fn establish(self: Arc<Self>, raw: std::net::TcpStream) {
        let Some(server) = self.server_ref() else {
            return;
        };
        let tcp = match TcpStream::from_std(raw) {
            Ok(tcp) => tcp,
            Err(err) => {
                // Never connected: undo the registration directly.
                self.report(&Error::Io(err));
                if let Some(server) = self.server.lock().take() {
                    let id = self.id;
                    let registry = server.clone();
                    server.io().post(Box::new(move || registry.unregister(&id)));
                }
                return;
            }
        };
        let options = server.options();
        match socket::configure_stream(&tcp, &options) {
            Ok(chunk) => self.pump.set_recv_chunk(chunk),
            Err(err) => self.report(&err),
        }
        self.pump.reset_counters();
        self.connected.store(true, Ordering::SeqCst);

        // TLS: connect hooks fire before the handshake, while the
        // session is connected but not yet ready.
        if self.secured {
            self.events.on_connect(&self);
            server.events().on_connect(&self);
        }

        match server.factory().accept_stream(tcp).await {
            Ok(stream) => {
                // Disconnected while the handshake was in flight.
                if !self.connected.load(Ordering::SeqCst) {
                    return;
                }
                self.handshaked.store(true, Ordering::SeqCst);
                // Channels are live before any hook that may send.
                pump::start_io(&self, &self.io, stream);
                if self.secured {
                    self.events.on_handshaked(&self);
                    server.events().on_handshaked(&self);
                } else {
                    self.events.on_connect(&self);
                    server.events().on_connect(&self);
                }
                self.pump.arm();
                if self.pump.main_is_empty() {
                    self.events.on_empty(&self);
                }
                debug!(session = %self.id, "session ready");
            }
            Err(err) => {
                // Failed handshake: no TLS shutdown is owed.
                self.report(&err);
                self.clone().do_disconnect().await;
            }
        }
    }

    async fn do_disconnect(self: Arc<Self>) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        let was_ready = self.handshaked.swap(false, Ordering::SeqCst);

        let pump = &self.pump;
        pump.signal_shutdown(self.secured && was_ready);
        pump.join_tasks().await;
        pump.drop_channels();
        pump.clear_buffers();

        self.events.on_disconnect(&self);

        // Clear the server reference before the registry entry goes.
        if let Some(server) = self.server.lock().take() {
            server.events().on_disconnect(&self);
            let id = self.id;
            let registry = server.clone();
            server.io().post(Box::new(move || {
                registry.unregister(&id);
            }));
        }
        debug!(session = %self.id, "session disconnected");
        true
    }
}

impl Endpoint for Session {
    fn pump(&self) -> &Pump {
        &self.pump
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.handshaked.load(Ordering::SeqCst)
    }

    fn fire_receive(&self, data: &[u8]) {
        self.events.on_receive(self, data);
    }

    fn fire_send(&self, sent: usize, pending: u64) {
        self.events.on_send(self, sent, pending);
    }

    fn fire_empty(&self) {
        self.events.on_empty(self);
    }

    fn report(&self, err: &Error) {
        if !err.is_benign() {
            self.events.on_error(self, err);
        }
    }

    fn schedule_disconnect(self: Arc<Self>) {
        let io = self.io.clone();
        io.spawn(async move {
            self.do_disconnect().await;
        });
    }

    fn record_sent(&self, n: u64) {
        if let Some(server) = self.server_ref() {
            server.add_bytes_sent(n);
        }
    }

    fn record_received(&self, n: u64) {
        if let Some(server) = self.server_ref() {
            server.add_bytes_received(n);
        }
    }
}
