//! TLS contexts
//!
//! Immutable, reference-counted rustls configuration shared by a server
//! and all of its sessions, or by a client across reconnect attempts.
//! Certificates and keys load from PEM files or in-memory PEM data;
//! protocol versions are the rustls safe defaults (TLS 1.2 and 1.3).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use riptide_core::{Error, Result};

fn read_pem_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| {
        Error::Tls(format!(
            "failed to read PEM file {}: {err}",
            path.display()
        ))
    })
}

fn parse_certs(pem: &[u8]) -> Result<Vec<Certificate>> {
    let mut reader = std::io::Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|err| Error::Tls(format!("failed to parse certificates: {err}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificates found in PEM data".into()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKey> {
    let mut reader = std::io::Cursor::new(pem);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|err| Error::Tls(format!("failed to parse private key: {err}")))?;
    if keys.is_empty() {
        let mut reader = std::io::Cursor::new(pem);
        keys = rustls_pemfile::rsa_private_keys(&mut reader)
            .map_err(|err| Error::Tls(format!("failed to parse private key: {err}")))?;
    }
    if keys.is_empty() {
        return Err(Error::Tls("no private key found in PEM data".into()));
    }
    Ok(PrivateKey(keys.remove(0)))
}

fn root_store_from_pem(pem: &[u8]) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in parse_certs(pem)? {
        store
            .add(&cert)
            .map_err(|err| Error::Tls(format!("failed to add trust anchor: {err}")))?;
    }
    Ok(store)
}

/// Server-side TLS configuration.
pub struct TlsServerContext {
    config: Arc<ServerConfig>,
}

impl TlsServerContext {
    /// Certificate chain and private key from PEM files; no client
    /// certificate is requested.
    pub fn from_pem_files(certificate: &Path, private_key: &Path) -> Result<Self> {
        Self::from_pem_data(&read_pem_file(certificate)?, &read_pem_file(private_key)?)
    }

    /// Certificate chain and private key from in-memory PEM data.
    pub fn from_pem_data(certificate: &[u8], private_key: &[u8]) -> Result<Self> {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(parse_certs(certificate)?, parse_private_key(private_key)?)
            .map_err(|err| Error::Tls(format!("invalid certificate or key: {err}")))?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Like [`Self::from_pem_data`], but requires clients to present a
    /// certificate chaining to `client_ca` and fails the handshake
    /// otherwise.
    pub fn from_pem_data_with_client_auth(
        certificate: &[u8],
        private_key: &[u8],
        client_ca: &[u8],
    ) -> Result<Self> {
        let verifier = AllowAnyAuthenticatedClient::new(root_store_from_pem(client_ca)?);
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(verifier.boxed())
            .with_single_cert(parse_certs(certificate)?, parse_private_key(private_key)?)
            .map_err(|err| Error::Tls(format!("invalid certificate or key: {err}")))?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }
}

/// Client-side TLS configuration. Server certificates are always
/// verified, against either a caller-supplied CA or the webpki roots.
pub struct TlsClientContext {
    config: Arc<ClientConfig>,
}

impl TlsClientContext {
    /// Trust the webpki system roots.
    pub fn with_system_roots() -> Self {
        let mut store = RootCertStore::empty();
        store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                anchor.subject,
                anchor.spki,
                anchor.name_constraints,
            )
        }));
        Self::from_root_store(store)
    }

    /// Trust exactly the anchors in a PEM CA file.
    pub fn from_ca_file(path: &Path) -> Result<Self> {
        Self::from_ca_pem(&read_pem_file(path)?)
    }

    /// Trust exactly the anchors in in-memory PEM data.
    pub fn from_ca_pem(ca: &[u8]) -> Result<Self> {
        Ok(Self::from_root_store(root_store_from_pem(ca)?))
    }

    fn from_root_store(store: RootCertStore) -> Self {
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(store)
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
        }
    }

    /// Present a client certificate during the handshake (mutual TLS).
    pub fn with_client_cert(ca: &[u8], certificate: &[u8], private_key: &[u8]) -> Result<Self> {
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store_from_pem(ca)?)
            .with_client_auth_cert(parse_certs(certificate)?, parse_private_key(private_key)?)
            .map_err(|err| Error::Tls(format!("invalid client certificate: {err}")))?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub(crate) fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (Vec<u8>, Vec<u8>) {
        let cert = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        (
            cert.serialize_pem().unwrap().into_bytes(),
            cert.serialize_private_key_pem().into_bytes(),
        )
    }

    #[test]
    fn server_context_accepts_generated_material() {
        let (cert, key) = self_signed();
        assert!(TlsServerContext::from_pem_data(&cert, &key).is_ok());
    }

    #[test]
    fn server_context_rejects_garbage() {
        assert!(TlsServerContext::from_pem_data(b"not pem", b"still not pem").is_err());
    }

    #[test]
    fn client_context_accepts_a_ca_file() {
        let (cert, _) = self_signed();
        assert!(TlsClientContext::from_ca_pem(&cert).is_ok());
        assert!(TlsClientContext::from_ca_pem(b"garbage").is_err());
    }

    #[test]
    fn mutual_tls_context_builds() {
        let (server_cert, server_key) = self_signed();
        let (client_cert, client_key) = self_signed();
        assert!(TlsServerContext::from_pem_data_with_client_auth(
            &server_cert,
            &server_key,
            &client_cert,
        )
        .is_ok());
        assert!(
            TlsClientContext::with_client_cert(&server_cert, &client_cert, &client_key).is_ok()
        );
    }
}
