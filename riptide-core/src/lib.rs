//! # Riptide Core
//!
//! Reactor service, per-operation handler arenas and configuration for
//! the riptide client-server framework.
//!
//! The [`Service`] owns the event loops and worker threads that every
//! server and client in `riptide-net` binds its I/O to. [`HandlerSlab`]
//! supplies the inline staging buffers used by pending operations, and
//! [`config`] holds the serde-backed settings consumed by applications.

pub mod config;
pub mod error;
pub mod service;
pub mod slab;

pub use config::{NetConfig, ServiceConfig, TcpOptions, TlsSettings};
pub use error::{end_of_stream, Error, Result};
pub use service::{IoLoop, NoopServiceEvents, Service, ServiceEvents, TaskFn};
pub use slab::{HandlerSlab, SlabBuf, DEFAULT_SLAB_CAPACITY};

pub mod prelude {
    //! Common imports for riptide applications.

    pub use crate::config::{NetConfig, ServiceConfig, TcpOptions, TlsSettings};
    pub use crate::error::{Error, Result};
    pub use crate::service::{IoLoop, Service, ServiceEvents};
    pub use crate::slab::{HandlerSlab, SlabBuf};
}
