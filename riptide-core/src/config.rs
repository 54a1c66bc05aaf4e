//! Configuration structures
//!
//! Serde-backed settings for the service and the TCP/TLS endpoints, with
//! defaults that match a bare `Service::new` and optional environment
//! overrides for the demo binaries.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reactor pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Worker thread count.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Share one loop between all workers and serialize callbacks,
    /// instead of the default loop-per-worker layout.
    #[serde(default)]
    pub shared_loop: bool,

    /// Drive the loops in polling mode.
    #[serde(default)]
    pub polling: bool,
}

fn default_threads() -> usize {
    num_cpus::get()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            shared_loop: false,
            polling: false,
        }
    }
}

/// Socket and buffering options applied to servers, sessions and clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpOptions {
    #[serde(default)]
    pub keep_alive: bool,

    #[serde(default = "default_true")]
    pub no_delay: bool,

    #[serde(default = "default_true")]
    pub reuse_address: bool,

    #[serde(default)]
    pub reuse_port: bool,

    /// Send buffer limit in bytes; 0 means unlimited.
    #[serde(default)]
    pub send_limit: usize,

    /// Receive buffer limit in bytes; 0 means unlimited.
    #[serde(default)]
    pub receive_limit: usize,

    /// Kernel send buffer size (SO_SNDBUF) override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_buffer_size: Option<usize>,

    /// Kernel receive buffer size (SO_RCVBUF) override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_buffer_size: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            keep_alive: false,
            no_delay: true,
            reuse_address: true,
            reuse_port: false,
            send_limit: 0,
            receive_limit: 0,
            send_buffer_size: None,
            receive_buffer_size: None,
        }
    }
}

/// PEM material and verification settings for a TLS endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Certificate chain file (PEM).
    pub certificate: PathBuf,

    /// Private key file (PEM, PKCS#8 or RSA).
    pub private_key: PathBuf,

    /// Trust anchors for peer verification (PEM). Clients fall back to
    /// the webpki system roots when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,

    /// Require and verify a client certificate (server side).
    #[serde(default)]
    pub require_client_auth: bool,
}

/// Aggregate configuration for the demo binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub tcp: TcpOptions,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1111
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            service: ServiceConfig::default(),
            tcp: TcpOptions::default(),
            tls: None,
        }
    }
}

impl NetConfig {
    /// Defaults with `RIPTIDE_ADDRESS`, `RIPTIDE_PORT` and
    /// `RIPTIDE_THREADS` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        if let Ok(address) = std::env::var("RIPTIDE_ADDRESS") {
            if !address.is_empty() {
                self.address = address;
            }
        }
        if let Ok(port) = std::env::var("RIPTIDE_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(threads) = std::env::var("RIPTIDE_THREADS") {
            if let Ok(threads) = threads.parse() {
                self.service.threads = threads;
            }
        }
    }
}

/// Zero duration stands for "no timeout" throughout the sync call surface.
pub const NO_TIMEOUT: Duration = Duration::ZERO;
