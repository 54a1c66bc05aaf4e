//! Randomized lifecycle stress: connects, disconnects, reconnects,
//! multicasts and sends interleaved for a few seconds. The invariant
//! under test is freedom from non-benign errors and a registry that
//! drains to empty.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use rand::Rng;
use riptide_core::Service;
use riptide_net::Client;

const MAX_CLIENTS: usize = 24;
const RUN_FOR: Duration = Duration::from_secs(3);

#[test]
fn random_lifecycle_stress() {
    init_tracing();
    let service = Service::new(Arc::new(ServiceProbe::default()), 4).unwrap();
    assert!(service.start(false));

    let (server, server_probe) = start_server(&service, true);
    let port = server.port();

    let mut clients: Vec<(Arc<Client>, Arc<ClientProbe>)> = Vec::new();
    let mut rng = rand::thread_rng();

    let new_client = |clients: &mut Vec<(Arc<Client>, Arc<ClientProbe>)>| {
        let probe = Arc::new(ClientProbe::default());
        let client = Client::plain(
            &service,
            Arc::new(ProbeClientEvents(probe.clone())),
            "127.0.0.1",
            port,
        );
        client.connect_async();
        clients.push((client, probe));
    };

    let deadline = Instant::now() + RUN_FOR;
    while Instant::now() < deadline {
        let roll: f64 = rng.gen();
        if roll < 0.01 {
            server.disconnect_all();
        } else if roll < 0.20 {
            if clients.len() < MAX_CLIENTS {
                new_client(&mut clients);
            }
        } else if roll < 0.35 {
            if let Some((client, _)) = pick(&mut rng, &clients) {
                if client.is_connected() {
                    client.disconnect_async(false);
                } else {
                    client.connect_async();
                }
            }
        } else if roll < 0.45 {
            if let Some((client, _)) = pick(&mut rng, &clients) {
                client.reconnect_async();
            }
        } else if roll < 0.70 {
            server.multicast(b"test");
        } else if let Some((client, _)) = pick(&mut rng, &clients) {
            if client.is_ready() {
                client.send_async(b"test");
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    // Drain iteratively: a client caught mid-connect finishes first and
    // needs another disconnect pass.
    let drain_deadline = Instant::now() + Duration::from_secs(15);
    loop {
        for (client, _) in &clients {
            client.disconnect_async(false);
        }
        let idle = clients
            .iter()
            .all(|(client, _)| !client.is_connected() && !client.is_connecting());
        if idle && server.connected_sessions() == 0 {
            break;
        }
        assert!(Instant::now() < drain_deadline, "fleet did not drain");
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(server.bytes_sent() > 0);
    assert!(server.bytes_received() > 0);
    assert!(
        server_probe.errors.lock().is_empty(),
        "server errors: {:?}",
        server_probe.errors.lock()
    );
    for (index, (_, probe)) in clients.iter().enumerate() {
        let errors = probe.errors.lock();
        assert!(errors.is_empty(), "client {index} errors: {errors:?}");
    }

    assert!(server.stop());
    assert!(service.stop());
    assert_eq!(server.connected_sessions(), 0);
}

fn pick<'a, R: Rng>(
    rng: &mut R,
    clients: &'a [(Arc<Client>, Arc<ClientProbe>)],
) -> Option<&'a (Arc<Client>, Arc<ClientProbe>)> {
    if clients.is_empty() {
        None
    } else {
        let index = rng.gen_range(0..clients.len());
        clients.get(index)
    }
}
