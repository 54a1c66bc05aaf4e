//! Socket construction and option plumbing

use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{lookup_host, TcpListener, TcpStream};

use riptide_core::{Error, Result, TcpOptions};

const LISTEN_BACKLOG: i32 = 1024;
const FALLBACK_RECV_CHUNK: usize = 8192;

/// Build a listening socket with the server's reuse options applied
/// before bind. Must run inside a runtime context.
pub(crate) fn bind_listener(
    address: &str,
    port: u16,
    options: &TcpOptions,
) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{address}:{port}")
        .parse()
        .map_err(|_| Error::Resolve(format!("{address}:{port} is not a listen address")))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(options.reuse_address)?;
    #[cfg(unix)]
    if options.reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into()).map_err(Error::Io)
}

/// Apply per-connection socket options and report the kernel receive
/// buffer size, which seeds the adaptive receive buffer.
pub(crate) fn configure_stream(tcp: &TcpStream, options: &TcpOptions) -> Result<usize> {
    tcp.set_nodelay(options.no_delay)?;
    let sock = SockRef::from(tcp);
    sock.set_keepalive(options.keep_alive)?;
    if let Some(size) = options.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    if let Some(size) = options.receive_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    Ok(sock.recv_buffer_size().unwrap_or(FALLBACK_RECV_CHUNK))
}

/// Resolve an address/port pair to its first endpoint.
pub(crate) async fn resolve(address: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = lookup_host((address, port))
        .await
        .map_err(|err| Error::Resolve(format!("{address}:{port}: {err}")))?;
    addrs
        .next()
        .ok_or_else(|| Error::Resolve(format!("{address}:{port}: no addresses returned")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_honours_reuse_address() {
        let options = TcpOptions::default();
        let listener = bind_listener("127.0.0.1", 0, &options).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        // rebinding the same port right away works with reuse_address set
        let again = bind_listener("127.0.0.1", addr.port(), &options);
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn bad_listen_address_is_rejected() {
        let options = TcpOptions::default();
        assert!(bind_listener("not-an-ip", 0, &options).is_err());
    }

    #[tokio::test]
    async fn resolve_finds_loopback() {
        let addr = resolve("127.0.0.1", 4242).await.unwrap();
        assert_eq!(addr.port(), 4242);
        assert!(addr.ip().is_loopback());
    }
}
