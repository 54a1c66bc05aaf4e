//! # Riptide Net
//!
//! TCP and TLS servers, sessions and clients built on the riptide
//! reactor service.
//!
//! A [`Server`] accepts connections and tracks one [`Session`] per peer
//! in a keyed registry, with multicast and mass disconnect across the
//! fleet. A [`Client`] drives the same send/receive machinery against a
//! socket it connects itself. TLS is a transport layer: the same
//! session and client types run over plain TCP or rustls streams,
//! selected by the stream factory they are built with.

pub mod client;
pub mod handlers;
mod pump;
pub mod server;
pub mod session;
mod socket;
pub mod tls;
pub mod transport;

pub use client::Client;
pub use handlers::{
    ClientEvents, NoopClientEvents, NoopServerEvents, NoopSessionEvents, ServerEvents,
    SessionEvents,
};
pub use server::Server;
pub use session::Session;
pub use tls::{TlsClientContext, TlsServerContext};
pub use transport::{
    PlainFactory, SessionStream, StreamFactory, TlsClientFactory, TlsServerFactory,
};

pub use riptide_core::{Error, Result};

pub mod prelude {
    //! Common imports for riptide applications.

    pub use riptide_core::prelude::*;

    pub use crate::client::Client;
    pub use crate::handlers::{ClientEvents, ServerEvents, SessionEvents};
    pub use crate::server::Server;
    pub use crate::session::Session;
    pub use crate::tls::{TlsClientContext, TlsServerContext};
    pub use crate::transport::{PlainFactory, StreamFactory};
}
