//! Outbound client
//!
//! Runs the same buffering and I/O discipline as a server-side session
//! against a socket it connects itself. A client moves through
//! idle -> connecting -> connected (-> handshaking -> handshaked for
//! TLS) -> disconnected, and can be reconnected any number of times.
//! TLS clients build a fresh stream on every attempt.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use riptide_core::{Error, IoLoop, Service, TcpOptions};

use crate::handlers::ClientEvents;
use crate::pump::{self, Endpoint, Pump};
use crate::socket;
use crate::tls::TlsClientContext;
use crate::transport::{PlainFactory, StreamFactory, TlsClientFactory};

pub struct Client {
    id: Uuid,
    this: Weak<Client>,
    service: Arc<Service>,
    io: Arc<IoLoop>,
    factory: Arc<dyn StreamFactory>,
    events: Arc<dyn ClientEvents>,
    address: String,
    port: u16,
    endpoint: Mutex<Option<SocketAddr>>,
    options: Mutex<TcpOptions>,
    connecting: AtomicBool,
    connected: AtomicBool,
    handshaking: AtomicBool,
    handshaked: AtomicBool,
    pump: Pump,
}

impl Client {
    pub fn new(
        service: &Arc<Service>,
        events: Arc<dyn ClientEvents>,
        factory: Arc<dyn StreamFactory>,
        address: impl Into<String>,
        port: u16,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            this: this.clone(),
            service: service.clone(),
            io: service.next_io(),
            factory,
            events,
            address: address.into(),
            port,
            endpoint: Mutex::new(None),
            options: Mutex::new(TcpOptions::default()),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            handshaking: AtomicBool::new(false),
            handshaked: AtomicBool::new(false),
            pump: Pump::new(),
        })
    }

    /// Plain TCP client.
    pub fn plain(
        service: &Arc<Service>,
        events: Arc<dyn ClientEvents>,
        address: impl Into<String>,
        port: u16,
    ) -> Arc<Self> {
        Self::new(service, events, Arc::new(PlainFactory), address, port)
    }

    /// TLS client. `address` doubles as the name the server certificate
    /// is verified against.
    pub fn tls(
        service: &Arc<Service>,
        events: Arc<dyn ClientEvents>,
        context: &TlsClientContext,
        address: impl Into<String>,
        port: u16,
    ) -> Arc<Self> {
        Self::new(
            service,
            events,
            Arc::new(TlsClientFactory::new(context)),
            address,
            port,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Transport scheme, "tcp" or "tls".
    pub fn scheme(&self) -> &'static str {
        self.factory.scheme()
    }

    /// Endpoint resolved by the last connect attempt.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.lock()
    }

    pub fn options(&self) -> TcpOptions {
        self.options.lock().clone()
    }

    /// Socket options applied at the next connect.
    pub fn set_options(&self, options: TcpOptions) {
        let limits = (options.send_limit, options.receive_limit);
        *self.options.lock() = options;
        self.pump.send_limit.store(limits.0, Ordering::SeqCst);
        self.pump.receive_limit.store(limits.1, Ordering::SeqCst);
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::SeqCst)
    }

    /// User data may flow only when ready: connected, and handshaked for
    /// TLS transports.
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.is_handshaked()
    }

    pub fn bytes_pending(&self) -> u64 {
        self.pump.bytes_pending.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.pump.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.pump.bytes_received.load(Ordering::SeqCst)
    }

    pub fn send_buffer_limit(&self) -> usize {
        self.pump.send_limit.load(Ordering::SeqCst)
    }

    pub fn set_send_buffer_limit(&self, limit: usize) {
        self.pump.send_limit.store(limit, Ordering::SeqCst);
    }

    pub fn receive_buffer_limit(&self) -> usize {
        self.pump.receive_limit.load(Ordering::SeqCst)
    }

    pub fn set_receive_buffer_limit(&self, limit: usize) {
        self.pump.receive_limit.store(limit, Ordering::SeqCst);
    }

    /// Connect and block until the attempt resolves. The receive loop
    /// stays unarmed until [`Self::receive_async`] is called. Must not
    /// be called from a service worker thread.
    pub fn connect(&self) -> bool {
        if self.is_connected() || self.is_connecting() {
            return false;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        let (done_tx, done_rx) = oneshot::channel();
        self.io.spawn(async move {
            let ok = this.do_connect(false).await;
            let _ = done_tx.send(ok);
        });
        done_rx.blocking_recv().unwrap_or(false)
    }

    /// Begin an asynchronous connect. Completion surfaces through
    /// `on_connect` (and `on_handshaked` for TLS); failure through
    /// `on_disconnect`. The receive loop arms itself once ready.
    pub fn connect_async(&self) -> bool {
        if self.is_connected()
            || self.is_connecting()
            || self.handshaking.load(Ordering::SeqCst)
        {
            return false;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        self.io.spawn(async move {
            this.do_connect(true).await;
        });
        true
    }

    /// Disconnect and block until the teardown completes. Must not be
    /// called from a service worker thread.
    pub fn disconnect(&self) -> bool {
        if !self.is_connected() || self.handshaking.load(Ordering::SeqCst) {
            return false;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        let (done_tx, done_rx) = oneshot::channel();
        self.io.spawn(async move {
            let ok = this.do_disconnect().await;
            let _ = done_tx.send(ok);
        });
        done_rx.blocking_recv().unwrap_or(false)
    }

    /// Schedule an asynchronous disconnect. `dispatch` is a scheduling
    /// hint; teardown always runs on the client's loop.
    pub fn disconnect_async(&self, _dispatch: bool) -> bool {
        if !self.is_connected()
            || self.is_connecting()
            || self.handshaking.load(Ordering::SeqCst)
        {
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

    /// Synchronous disconnect-then-connect.
    pub fn reconnect(&self) -> bool {
        if !self.disconnect() {
            return false;
        }
        self.connect()
    }

    /// Asynchronous reconnect: the connect chains onto the completed
    /// disconnect on the client's loop.
    pub fn reconnect_async(&self) -> bool {
        if !self.is_connected()
            || self.is_connecting()
            || self.handshaking.load(Ordering::SeqCst)
        {
            return false;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        self.io.spawn(async move {
            if this.clone().do_disconnect().await {
                this.do_connect(true).await;
            }
        });
        true
    }

    /// Synchronous send; see [`crate::session::Session::send`].
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

    /// Arm the continuous receive loop.
    pub fn receive_async(&self) {
        pump::arm_receive(&self.pump);
    }

    async fn do_connect(self: Arc<Self>, arm_receive: bool) -> bool {
        if self.connected.load(Ordering::SeqCst)
            || self.handshaked.load(Ordering::SeqCst)
            || self.handshaking.load(Ordering::SeqCst)
        {
            return false;
        }
        if self.connecting.swap(true, Ordering::SeqCst) {
            return false;
        }
        let ok = Self::run_connect(&self, arm_receive).await;
        self.connecting.store(false, Ordering::SeqCst);
        ok
    }

    async fn run_connect(this: &Arc<Self>, arm_receive: bool) -> bool {
        let target = match socket::resolve(&this.address, this.port).await {
            Ok(target) => target,
            Err(err) => {
                this.report(&err);
                this.events.on_disconnect(this);
                return false;
            }
        };
        *this.endpoint.lock() = Some(target);

        let tcp = match TcpStream::connect(target).await {
            Ok(tcp) => tcp,
            Err(err) => {
                this.report(&Error::Io(err));
                this.events.on_disconnect(this);
                return false;
            }
        };

        let options = this.options.lock().clone();
        match socket::configure_stream(&tcp, &options) {
            Ok(chunk) => this.pump.set_recv_chunk(chunk),
            Err(err) => this.report(&err),
        }
        this.pump.reset_counters();
        this.connected.store(true, Ordering::SeqCst);

        // TLS: the connect hook fires before the handshake, while the
        // client is connected but not yet ready.
        let secured = this.factory.secured();
        if secured {
            this.events.on_connect(this);
        }

        // A fresh stream per attempt: the factory builds it from the new
        // socket, running the TLS handshake for secured transports.
        this.handshaking.store(true, Ordering::SeqCst);
        let stream = this.factory.connect_stream(tcp, &this.address).await;
        this.handshaking.store(false, Ordering::SeqCst);

        match stream {
            Ok(stream) => {
                // Disconnected while the handshake was in flight.
                if !this.connected.load(Ordering::SeqCst) {
                    return false;
                }
                this.handshaked.store(true, Ordering::SeqCst);
                // Channels are live before any hook that may send.
                pump::start_io(this, &this.io, stream);
                if secured {
                    this.events.on_handshaked(this);
                } else {
                    this.events.on_connect(this);
                }
                if arm_receive {
                    this.pump.arm();
                }
                if this.pump.main_is_empty() {
                    this.events.on_empty(this);
                }
                debug!(client = %this.id, endpoint = %target, "client ready");
                true
            }
            Err(err) => {
                this.report(&err);
                this.clone().do_disconnect().await;
                false
            }
        }
    }

    async fn do_disconnect(self: Arc<Self>) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        let was_ready = self.handshaked.swap(false, Ordering::SeqCst);
        self.handshaking.store(false, Ordering::SeqCst);

        let pump = &self.pump;
        pump.signal_shutdown(self.factory.secured() && was_ready);
        pump.join_tasks().await;
        pump.drop_channels();
        pump.clear_buffers();

        self.events.on_disconnect(&self);
        debug!(client = %self.id, "client disconnected");
        true
    }
}

impl Endpoint for Client {
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
}
