//! Error types for riptide
//!
//! Defines the standard error type shared by the service, server, session
//! and client layers, together with the benign-disconnect classifier that
//! keeps post-disconnect noise out of the error hooks.

use std::io;

/// Standard error type for riptide operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Address could not be resolved to an endpoint
    #[error("address resolution failed: {0}")]
    Resolve(String),

    /// An async send was refused because the send buffer limit was reached
    #[error("send buffer limit exceeded ({limit} bytes)")]
    SendBufferFull { limit: usize },

    /// The receive buffer would have to grow past its configured limit
    #[error("receive buffer limit exceeded ({limit} bytes)")]
    ReceiveBufferFull { limit: usize },

    /// Invalid configuration supplied by the caller
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The service is not running
    #[error("service is not running")]
    NotRunning,
}

/// Result type for riptide operations
pub type Result<T> = std::result::Result<T, Error>;

/// TLS failure reasons that routinely show up after one side of a
/// connection has gone away. They carry no diagnostic value for the
/// application and are suppressed from the error hooks.
const BENIGN_TLS_REASONS: &[&str] = &[
    "close_notify",
    "stream truncated",
    "bad record mac",
    "decryption failed",
    "protocol is shutdown",
    "wrong version number",
];

fn benign_text(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    BENIGN_TLS_REASONS.iter().any(|reason| text.contains(reason))
}

fn benign_io(err: &io::Error) -> bool {
    use io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::Interrupted => true,
        // rustls surfaces alerts and truncation as wrapped io errors
        _ => benign_text(&err.to_string()),
    }
}

impl Error {
    /// Benign disconnect errors: the normal debris of a peer going away.
    /// These never reach `on_error`.
    pub fn is_benign(&self) -> bool {
        match self {
            Error::Io(err) => benign_io(err),
            Error::Tls(msg) => benign_text(msg),
            _ => false,
        }
    }

    /// Back-pressure errors leave the connection alive on the send side
    /// and tear it down on the receive side.
    pub fn is_buffer_exhausted(&self) -> bool {
        matches!(
            self,
            Error::SendBufferFull { .. } | Error::ReceiveBufferFull { .. }
        )
    }

    pub(crate) fn eof() -> Error {
        Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream"))
    }
}

/// Shorthand for the end-of-stream error the receive loop reports when the
/// peer closes its half of the connection.
pub fn end_of_stream() -> Error {
    Error::eof()
}
