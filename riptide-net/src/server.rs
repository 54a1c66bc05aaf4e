//! Connection-oriented server
//!
//! Binds a listening endpoint, accepts connections, constructs sessions
//! through the `new_session` factory hook, and manages the fleet: a
//! keyed registry guarded by a shared lock, multicast, mass disconnect
//! and aggregate byte counters.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use riptide_core::{Error, IoLoop, Service, TcpOptions};

use crate::handlers::ServerEvents;
use crate::session::Session;
use crate::socket;
use crate::tls::TlsServerContext;
use crate::transport::{PlainFactory, StreamFactory, TlsServerFactory};

pub struct Server {
    id: Uuid,
    this: Weak<Server>,
    service: Arc<Service>,
    io: Arc<IoLoop>,
    factory: Arc<dyn StreamFactory>,
    events: Arc<dyn ServerEvents>,
    address: String,
    port: u16,
    bound: Mutex<Option<SocketAddr>>,
    options: Mutex<TcpOptions>,
    /// Buffer limits seeded into every new session; 0 means unlimited.
    session_send_limit: AtomicUsize,
    session_receive_limit: AtomicUsize,
    started: AtomicBool,
    /// Registry of live sessions. Readers: multicast, lookup. Writers:
    /// register on accept, unregister after disconnect.
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
}

impl Server {
    pub fn new(
        service: &Arc<Service>,
        events: Arc<dyn ServerEvents>,
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
            bound: Mutex::new(None),
            options: Mutex::new(TcpOptions::default()),
            session_send_limit: AtomicUsize::new(0),
            session_receive_limit: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            sessions: RwLock::new(HashMap::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            accept_task: Mutex::new(None),
            stop_tx: Mutex::new(None),
            stopped: Mutex::new(true),
            stopped_cv: Condvar::new(),
        })
    }

    /// Plain TCP server.
    pub fn plain(
        service: &Arc<Service>,
        events: Arc<dyn ServerEvents>,
        address: impl Into<String>,
        port: u16,
    ) -> Arc<Self> {
        Self::new(service, events, Arc::new(PlainFactory), address, port)
    }

    /// TLS server sharing `context` with all of its sessions.
    pub fn tls(
        service: &Arc<Service>,
        events: Arc<dyn ServerEvents>,
        context: &TlsServerContext,
        address: impl Into<String>,
        port: u16,
    ) -> Arc<Self> {
        Self::new(
            service,
            events,
            Arc::new(TlsServerFactory::new(context)),
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

    pub(crate) fn io(&self) -> &Arc<IoLoop> {
        &self.io
    }

    pub(crate) fn factory(&self) -> &Arc<dyn StreamFactory> {
        &self.factory
    }

    pub(crate) fn events(&self) -> &Arc<dyn ServerEvents> {
        &self.events
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Actually bound port; falls back to the configured one before
    /// start. Binding port 0 picks an ephemeral port.
    pub fn port(&self) -> u16 {
        (*self.bound.lock())
            .map(|addr| addr.port())
            .unwrap_or(self.port)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    pub fn options(&self) -> TcpOptions {
        self.options.lock().clone()
    }

    /// Replace the socket options applied to the acceptor and to every
    /// new session. Takes effect at the next start/accept.
    pub fn set_options(&self, options: TcpOptions) {
        *self.options.lock() = options;
    }

    pub fn session_send_limit(&self) -> usize {
        self.session_send_limit.load(Ordering::SeqCst)
    }

    /// Send buffer limit seeded into new sessions; 0 means unlimited.
    pub fn set_session_send_limit(&self, limit: usize) {
        self.session_send_limit.store(limit, Ordering::SeqCst);
    }

    pub fn session_receive_limit(&self) -> usize {
        self.session_receive_limit.load(Ordering::SeqCst)
    }

    /// Receive buffer limit seeded into new sessions; 0 means unlimited.
    pub fn set_session_receive_limit(&self, limit: usize) {
        self.session_receive_limit.store(limit, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn connected_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Bytes staged but not yet written, across all live sessions.
    pub fn bytes_pending(&self) -> u64 {
        self.sessions
            .read()
            .values()
            .map(|session| session.bytes_pending())
            .sum()
    }

    pub(crate) fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::SeqCst);
    }

    /// Open the acceptor and begin accepting. Returns false when already
    /// started.
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug_assert!(false, "server is already running");
            return false;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        *self.stopped.lock() = false;
        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);
        let task = self.io.spawn(accept_loop(this, stop_rx));
        *self.accept_task.lock() = Some(task);
        true
    }

    /// Close the acceptor, disconnect every session, clear the registry
    /// and fire `on_stop`. Returns false when not started.
    pub fn stop(&self) -> bool {
        if !self.started.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(true);
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        self.io.spawn(async move {
            let accept_task = this.accept_task.lock().take();
            if let Some(task) = accept_task {
                let _ = task.await;
            }

            let sessions: Vec<Arc<Session>> =
                this.sessions.read().values().cloned().collect();
            for session in &sessions {
                session.disconnect();
            }
            this.sessions.write().clear();
            *this.bound.lock() = None;

            this.events.on_stop(&this);
            this.notify_stopped();
            info!(server = %this.id, "server stopped");
        });
        true
    }

    /// Stop, wait for the stop to complete, then start again. Sessions
    /// from the previous run never survive a restart.
    pub fn restart(&self) -> bool {
        if !self.stop() {
            return false;
        }
        if !self.wait_stopped(Duration::from_secs(5)) {
            return false;
        }
        self.start()
    }

    /// Block until the in-flight stop completes. True when it did.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.stopped_cv.wait_while_for(&mut stopped, |s| !*s, timeout);
        }
        *stopped
    }

    fn notify_stopped(&self) {
        *self.stopped.lock() = true;
        self.stopped_cv.notify_all();
    }

    /// Send `data` to every live session. Per-session byte order is
    /// preserved; no ordering exists across sessions.
    pub fn multicast(&self, data: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        let sessions = self.sessions.read();
        for session in sessions.values() {
            session.send_async(data);
        }
        true
    }

    /// Disconnect every live session from the server's loop.
    pub fn disconnect_all(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        self.io.post(Box::new(move || {
            let sessions: Vec<Arc<Session>> =
                this.sessions.read().values().cloned().collect();
            for session in sessions {
                session.disconnect();
            }
        }));
        true
    }

    pub fn find_session(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub(crate) fn unregister(&self, id: &Uuid) {
        self.sessions.write().remove(id);
    }

    pub(crate) fn report(&self, err: &Error) {
        if !err.is_benign() {
            self.events.on_error(err);
        }
    }
}

async fn accept_loop(server: Arc<Server>, mut stop: watch::Receiver<bool>) {
    let options = server.options();
    let listener = match socket::bind_listener(&server.address, server.port, &options) {
        Ok(listener) => listener,
        Err(err) => {
            server.report(&err);
            server.started.store(false, Ordering::SeqCst);
            server.notify_stopped();
            return;
        }
    };
    if let Ok(addr) = listener.local_addr() {
        *server.bound.lock() = Some(addr);
    }
    server.bytes_sent.store(0, Ordering::SeqCst);
    server.bytes_received.store(0, Ordering::SeqCst);

    info!(server = %server.id, address = %server.address, port = server.port(), "server started");
    server.events.on_start(&server);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    // Detach from this loop's reactor so the session can
                    // re-register the socket with its own loop.
                    let raw = match tcp.into_std() {
                        Ok(raw) => raw,
                        Err(err) => {
                            server.report(&Error::Io(err));
                            continue;
                        }
                    };
                    let session = Session::new(&server, server.events.new_session());
                    server
                        .sessions
                        .write()
                        .insert(session.id(), session.clone());
                    debug!(server = %server.id, session = %session.id(), %peer, "connection accepted");
                    let io = session.io().clone();
                    io.spawn(session.establish(raw));
                }
                // Accept failures never stop the loop.
                Err(err) => server.report(&Error::Io(err)),
            }
        }
    }
    debug!(server = %server.id, "accept loop finished");
}
