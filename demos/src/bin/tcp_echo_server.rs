//! TCP echo server: every received byte goes straight back to its
//! sender.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use riptide_core::{Error, NetConfig, NoopServiceEvents, Service};
use riptide_net::{Server, ServerEvents, Session, SessionEvents};

#[derive(Parser)]
#[command(name = "tcp_echo_server", about = "Echo every byte back to its sender")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Listen port
    #[arg(long, default_value_t = 1111)]
    port: u16,

    /// Worker threads (defaults to the online CPU count)
    #[arg(long)]
    threads: Option<usize>,
}

struct EchoServer;

impl ServerEvents for EchoServer {
    fn new_session(&self) -> Arc<dyn SessionEvents> {
        Arc::new(EchoSession)
    }
    fn on_start(&self, server: &Server) {
        info!(address = server.address(), port = server.port(), "echo server started");
    }
    fn on_connect(&self, session: &Session) {
        info!(session = %session.id(), "session connected");
    }
    fn on_disconnect(&self, session: &Session) {
        info!(session = %session.id(), "session disconnected");
    }
    fn on_error(&self, err: &Error) {
        error!(%err, "server error");
    }
}

struct EchoSession;

impl SessionEvents for EchoSession {
    fn on_receive(&self, session: &Session, data: &[u8]) {
        session.send_async(data);
    }
    fn on_error(&self, session: &Session, err: &Error) {
        error!(session = %session.id(), %err, "session error");
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = NetConfig::from_env();
    config.address = args.address;
    config.port = args.port;
    if let Some(threads) = args.threads {
        config.service.threads = threads;
    }

    let service =
        Service::from_config(Arc::new(NoopServiceEvents), &config.service).expect("service");
    service.start(config.service.polling);

    let server = Server::plain(
        &service,
        Arc::new(EchoServer),
        config.address.clone(),
        config.port,
    );
    server.set_options(config.tcp.clone());
    if !server.start() {
        error!("failed to start the server");
        std::process::exit(1);
    }

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
