//! Back-pressure limits: send-side rejection keeps the session alive,
//! receive-side exhaustion disconnects it.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use riptide_core::{Service, TcpOptions};

#[test]
fn send_limit_rejects_the_append_and_keeps_the_session() {
    init_tracing();
    let service = Service::new(Arc::new(ServiceProbe::default()), 2).unwrap();
    assert!(service.start(false));

    // Sink server: nobody reads an echo, nobody sends.
    let (server, server_probe) = start_server(&service, false);
    let (client, _client_probe) = connect_client(&service, server.port());
    wait_until("session up", WAIT, || {
        server_probe.connects.load(Ordering::SeqCst) == 1
    });

    let session_id = (*server_probe.last_session.lock()).unwrap();
    let session = server
        .find_session(&session_id)
        .expect("session registered");
    session.set_send_buffer_limit(1024);
    assert_eq!(session.send_buffer_limit(), 1024);

    // One byte over the limit: the append is refused and reported.
    let payload = vec![7u8; 1025];
    assert!(!session.send_async(&payload));
    wait_until("limit reported", WAIT, || {
        server_probe
            .errors
            .lock()
            .iter()
            .any(|message| message.contains("send buffer limit"))
    });

    // The session stays connected and usable.
    std::thread::sleep(Duration::from_millis(50));
    assert!(session.is_connected());
    assert_eq!(server.connected_sessions(), 1);
    assert!(session.send_async(b"fits"));
    wait_until("small send flows", WAIT, || client.bytes_received() == 4);

    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn receive_limit_disconnects_the_session() {
    init_tracing();
    let service = Service::new(Arc::new(ServiceProbe::default()), 2).unwrap();
    assert!(service.start(false));

    let probe = server_probe(false);
    let server = riptide_net::Server::plain(
        &service,
        Arc::new(EchoServerEvents(probe.clone())),
        "127.0.0.1",
        0,
    );
    // Small kernel buffer so inbound reads fill the receive buffer, and
    // a limit every doubling attempt must cross.
    server.set_options(TcpOptions {
        receive_buffer_size: Some(4096),
        ..TcpOptions::default()
    });
    server.set_session_receive_limit(1);
    assert!(server.start());
    wait_until("server start", WAIT, || server.local_addr().is_some());

    let (client, client_probe) = connect_client(&service, server.port());
    wait_until("session up", WAIT, || {
        probe.connects.load(Ordering::SeqCst) == 1
    });

    // Flood until a read fills the session's buffer.
    let chunk = vec![0u8; 64 * 1024];
    for _ in 0..16 {
        client.send_async(&chunk);
    }

    wait_until("exhaustion reported", WAIT, || {
        probe
            .errors
            .lock()
            .iter()
            .any(|message| message.contains("receive buffer limit"))
    });
    wait_until("session dropped", WAIT, || {
        probe.disconnects.load(Ordering::SeqCst) == 1 && server.connected_sessions() == 0
    });

    // The client side only ever saw a benign teardown.
    wait_until("client saw close", WAIT, || {
        client_probe.disconnects.load(Ordering::SeqCst) == 1
    });
    assert!(
        client_probe.errors.lock().is_empty(),
        "client errors: {:?}",
        client_probe.errors.lock()
    );

    assert!(server.stop());
    assert!(service.stop());
}
