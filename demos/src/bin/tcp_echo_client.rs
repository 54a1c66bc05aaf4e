//! Round-trip echo benchmark client: each client seeds a pipeline of
//! messages against an echo server and bounces every reply back for a
//! fixed number of seconds.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info};

use riptide_core::{Error, NetConfig, NoopServiceEvents, Service};
use riptide_net::{Client, ClientEvents};

#[derive(Parser)]
#[command(name = "tcp_echo_client", about = "Echo round-trip benchmark")]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Server port
    #[arg(long, default_value_t = 1111)]
    port: u16,

    /// Worker threads (defaults to the online CPU count)
    #[arg(long)]
    threads: Option<usize>,

    /// Concurrent clients
    #[arg(long, default_value_t = 1)]
    clients: usize,

    /// Messages in flight per client
    #[arg(long, default_value_t = 100)]
    messages: usize,

    /// Message size in bytes
    #[arg(long, default_value_t = 32)]
    size: usize,

    /// Benchmark duration in seconds
    #[arg(long, default_value_t = 10)]
    seconds: u64,
}

struct BenchClient {
    payload: Vec<u8>,
    pipeline: usize,
    running: Arc<AtomicBool>,
    received: Arc<AtomicU64>,
}

impl ClientEvents for BenchClient {
    fn on_connect(&self, client: &Client) {
        for _ in 0..self.pipeline {
            client.send_async(&self.payload);
        }
    }
    fn on_receive(&self, client: &Client, data: &[u8]) {
        self.received.fetch_add(data.len() as u64, Ordering::Relaxed);
        if self.running.load(Ordering::Relaxed) {
            client.send_async(data);
        }
    }
    fn on_error(&self, client: &Client, err: &Error) {
        error!(client = %client.id(), %err, "client error");
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

    let running = Arc::new(AtomicBool::new(true));
    let received = Arc::new(AtomicU64::new(0));

    let clients: Vec<Arc<Client>> = (0..args.clients.max(1))
        .map(|_| {
            let events = BenchClient {
                payload: vec![0x61; args.size.max(1)],
                pipeline: args.messages.max(1),
                running: running.clone(),
                received: received.clone(),
            };
            let client = Client::plain(
                &service,
                Arc::new(events),
                config.address.clone(),
                config.port,
            );
            client.connect_async();
            client
        })
        .collect();

    info!(
        clients = clients.len(),
        messages = args.messages,
        size = args.size,
        "benchmark running for {}s",
        args.seconds
    );
    let started = Instant::now();
    std::thread::sleep(Duration::from_secs(args.seconds));
    running.store(false, Ordering::Relaxed);

    for client in &clients {
        client.disconnect_async(false);
    }
    std::thread::sleep(Duration::from_millis(200));

    let elapsed = started.elapsed().as_secs_f64();
    let total = received.load(Ordering::Relaxed);
    let sent: u64 = clients.iter().map(|client| client.bytes_sent()).sum();
    info!(
        bytes_sent = sent,
        bytes_received = total,
        throughput = %format!("{:.1} MiB/s", total as f64 / elapsed / (1024.0 * 1024.0)),
        "benchmark finished"
    );

    service.stop();
}
