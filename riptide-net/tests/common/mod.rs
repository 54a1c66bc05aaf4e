//! Shared probes and helpers for the end-to-end tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use riptide_core::{Error, Service, ServiceEvents};
use riptide_net::{Client, ClientEvents, Server, ServerEvents, Session, SessionEvents};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Poll `check` until it holds or the deadline passes.
pub fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Default)]
pub struct ServiceProbe {
    pub thread_init: AtomicUsize,
    pub thread_cleanup: AtomicUsize,
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    pub idle: AtomicBool,
    pub errors: Mutex<Vec<String>>,
}

impl ServiceEvents for ServiceProbe {
    fn on_thread_init(&self) {
        self.thread_init.fetch_add(1, Ordering::SeqCst);
    }
    fn on_thread_cleanup(&self) {
        self.thread_cleanup.fetch_add(1, Ordering::SeqCst);
    }
    fn on_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }
    fn on_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
    fn on_idle(&self) {
        self.idle.store(true, Ordering::SeqCst);
        std::thread::yield_now();
    }
    fn on_error(&self, err: &Error) {
        self.errors.lock().push(err.to_string());
    }
}

#[derive(Default)]
pub struct ServerProbe {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub handshakes: AtomicUsize,
    pub last_session: Mutex<Option<Uuid>>,
    pub errors: Mutex<Vec<String>>,
    pub echo: AtomicBool,
}

impl ServerProbe {
    pub fn live_connections(&self) -> isize {
        self.connects.load(Ordering::SeqCst) as isize
            - self.disconnects.load(Ordering::SeqCst) as isize
    }
}

pub struct EchoServerEvents(pub Arc<ServerProbe>);

impl ServerEvents for EchoServerEvents {
    fn new_session(&self) -> Arc<dyn SessionEvents> {
        Arc::new(EchoSessionEvents(self.0.clone()))
    }
    fn on_start(&self, _server: &Server) {
        self.0.starts.fetch_add(1, Ordering::SeqCst);
    }
    fn on_stop(&self, _server: &Server) {
        self.0.stops.fetch_add(1, Ordering::SeqCst);
    }
    fn on_connect(&self, session: &Session) {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        *self.0.last_session.lock() = Some(session.id());
    }
    fn on_handshaked(&self, _session: &Session) {
        self.0.handshakes.fetch_add(1, Ordering::SeqCst);
    }
    fn on_disconnect(&self, _session: &Session) {
        self.0.disconnects.fetch_add(1, Ordering::SeqCst);
    }
    fn on_error(&self, err: &Error) {
        self.0.errors.lock().push(err.to_string());
    }
}

pub struct EchoSessionEvents(pub Arc<ServerProbe>);

impl SessionEvents for EchoSessionEvents {
    fn on_receive(&self, session: &Session, data: &[u8]) {
        if self.0.echo.load(Ordering::SeqCst) {
            session.send_async(data);
        }
    }
    fn on_error(&self, _session: &Session, err: &Error) {
        self.0.errors.lock().push(err.to_string());
    }
}

#[derive(Default)]
pub struct ClientProbe {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub handshaked: AtomicBool,
    pub empty: AtomicBool,
    pub errors: Mutex<Vec<String>>,
}

pub struct ProbeClientEvents(pub Arc<ClientProbe>);

impl ClientEvents for ProbeClientEvents {
    fn on_connect(&self, _client: &Client) {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
    }
    fn on_handshaked(&self, _client: &Client) {
        self.0.handshaked.store(true, Ordering::SeqCst);
    }
    fn on_disconnect(&self, _client: &Client) {
        self.0.disconnects.fetch_add(1, Ordering::SeqCst);
    }
    fn on_empty(&self, _client: &Client) {
        self.0.empty.store(true, Ordering::SeqCst);
    }
    fn on_error(&self, _client: &Client, err: &Error) {
        self.0.errors.lock().push(err.to_string());
    }
}

pub fn server_probe(echo: bool) -> Arc<ServerProbe> {
    let probe = Arc::new(ServerProbe::default());
    probe.echo.store(echo, Ordering::SeqCst);
    probe
}

/// Plain echo (or sink) server on an ephemeral loopback port.
pub fn start_server(service: &Arc<Service>, echo: bool) -> (Arc<Server>, Arc<ServerProbe>) {
    let probe = server_probe(echo);
    let server = Server::plain(
        service,
        Arc::new(EchoServerEvents(probe.clone())),
        "127.0.0.1",
        0,
    );
    assert!(server.start());
    wait_until("server start", WAIT, || {
        probe.starts.load(Ordering::SeqCst) > 0 && server.local_addr().is_some()
    });
    (server, probe)
}

/// Plain client, already connected and ready.
pub fn connect_client(service: &Arc<Service>, port: u16) -> (Arc<Client>, Arc<ClientProbe>) {
    let probe = Arc::new(ClientProbe::default());
    let client = Client::plain(
        service,
        Arc::new(ProbeClientEvents(probe.clone())),
        "127.0.0.1",
        port,
    );
    assert!(client.connect_async());
    wait_until("client ready", WAIT, || client.is_ready());
    (client, probe)
}
