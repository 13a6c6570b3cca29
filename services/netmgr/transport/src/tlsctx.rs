//! TLS server and client contexts.

use rustls::client::{ClientSessionMemoryCache, Resumption};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// ALPN identifier for DNS-over-TLS
pub const DOT_ALPN: &[u8] = b"dot";

/// Sessions remembered per client context
const SESSION_CACHE_SIZE: usize = 256;

/// TLS context construction errors
#[derive(Error, Debug)]
pub enum TlsCtxError {
    /// PEM input could not be read
    #[error("failed to read PEM data: {0}")]
    Io(#[from] std::io::Error),
    /// No certificate in the PEM input
    #[error("no certificates found")]
    NoCertificates,
    /// No private key in the PEM input
    #[error("no private key found")]
    NoPrivateKey,
    /// Invalid server name for certificate verification
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    /// Rejected by the TLS library
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

fn install_provider() {
    // Fails only when a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsCtxError> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsCtxError::NoCertificates);
    }
    Ok(certs)
}

fn load_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsCtxError> {
    rustls_pemfile::private_key(&mut &pem[..])?.ok_or(TlsCtxError::NoPrivateKey)
}

/// Server-side TLS configuration
#[derive(Clone)]
pub struct TlsServerCtx {
    config: Arc<ServerConfig>,
}

impl TlsServerCtx {
    /// Build from a PEM certificate chain and private key, advertising `dot`
    pub fn from_pem(cert_chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsCtxError> {
        Self::from_pem_with_alpn(cert_chain_pem, key_pem, &[DOT_ALPN])
    }

    /// Build from PEM input with an explicit ALPN list; empty disables ALPN
    pub fn from_pem_with_alpn(
        cert_chain_pem: &[u8],
        key_pem: &[u8],
        alpn: &[&[u8]],
    ) -> Result<Self, TlsCtxError> {
        install_provider();
        let certs = load_certs(cert_chain_pem)?;
        let key = load_key(key_pem)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        info!("TLS server context created");
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Build from certificate and key files
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsCtxError> {
        let cert = std::fs::read(cert_path)?;
        let key = std::fs::read(key_path)?;
        Self::from_pem(&cert, &key)
    }

    /// Wrap an existing configuration
    pub fn from_config(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    pub(crate) fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl fmt::Debug for TlsServerCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServerCtx")
            .field("alpn", &self.config.alpn_protocols)
            .finish()
    }
}

/// Client-side TLS configuration with a session cache
#[derive(Clone)]
pub struct TlsClientCtx {
    config: Arc<ClientConfig>,
    server_name: Option<ServerName<'static>>,
}

impl TlsClientCtx {
    /// Trust the CA certificates in `ca_pem`; offer `dot` when `dot_alpn` is set
    pub fn from_pem(ca_pem: &[u8], dot_alpn: bool) -> Result<Self, TlsCtxError> {
        install_provider();
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_pem)? {
            roots.add(cert)?;
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        if dot_alpn {
            config.alpn_protocols = vec![DOT_ALPN.to_vec()];
        }
        config.resumption = Resumption::store(Arc::new(ClientSessionMemoryCache::new(
            SESSION_CACHE_SIZE,
        )));

        info!("TLS client context created");
        Ok(Self {
            config: Arc::new(config),
            server_name: None,
        })
    }

    /// Wrap an existing configuration
    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            server_name: None,
        }
    }

    /// Verify the peer against `name` instead of its IP address
    pub fn with_server_name(mut self, name: &str) -> Result<Self, TlsCtxError> {
        let name = ServerName::try_from(name.to_string())
            .map_err(|_| TlsCtxError::InvalidServerName(name.to_string()))?;
        self.server_name = Some(name);
        Ok(self)
    }

    pub(crate) fn config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    /// Name to verify and to key resumed sessions by
    pub(crate) fn server_name_for(&self, peer: SocketAddr) -> ServerName<'static> {
        self.server_name
            .clone()
            .unwrap_or_else(|| ServerName::IpAddress(peer.ip().into()))
    }
}

impl fmt::Debug for TlsClientCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientCtx")
            .field("alpn", &self.config.alpn_protocols)
            .field("server_name", &self.server_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &[u8] = include_bytes!("../tests/certs/ca.pem");
    const CERT: &[u8] = include_bytes!("../tests/certs/server.pem");
    const KEY: &[u8] = include_bytes!("../tests/certs/server-key.pem");

    #[test]
    fn test_server_ctx_alpn() {
        let ctx = TlsServerCtx::from_pem(CERT, KEY).unwrap();
        assert_eq!(ctx.config().alpn_protocols, vec![b"dot".to_vec()]);

        let ctx = TlsServerCtx::from_pem_with_alpn(CERT, KEY, &[]).unwrap();
        assert!(ctx.config().alpn_protocols.is_empty());
    }

    #[test]
    fn test_server_ctx_missing_key() {
        let err = TlsServerCtx::from_pem(CERT, CERT).unwrap_err();
        assert!(matches!(err, TlsCtxError::NoPrivateKey));

        let err = TlsServerCtx::from_pem(b"", KEY).unwrap_err();
        assert!(matches!(err, TlsCtxError::NoCertificates));
    }

    #[test]
    fn test_client_server_name() {
        let peer: SocketAddr = "127.0.0.1:853".parse().unwrap();
        let ctx = TlsClientCtx::from_pem(CA, true).unwrap();
        assert!(matches!(ctx.server_name_for(peer), ServerName::IpAddress(_)));
        assert_eq!(ctx.config().alpn_protocols, vec![b"dot".to_vec()]);

        let ctx = ctx.with_server_name("localhost").unwrap();
        assert!(matches!(ctx.server_name_for(peer), ServerName::DnsName(_)));

        assert!(TlsClientCtx::from_pem(CA, false)
            .unwrap()
            .config()
            .alpn_protocols
            .is_empty());
    }
}
