//! TLS Configuration for both legs of an intercepted session
//!
//! - Client-facing TLS (proxy ← client) presents an issued leaf certificate
//! - Upstream TLS (proxy → origin) verifies the origin against real roots
//!
//! TLS 1.2 and 1.3 only. ALPN lists are supplied per session by the bridge.

use super::certificate_authority::IssuedCertificate;
use rustls::pki_types::ServerName;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

static TLS12_AND_13: &[&SupportedProtocolVersion] = &[&TLS12, &TLS13];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// TLS version preference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    Tls12And13,
    /// TLS 1.3 only
    Tls13Only,
}

impl TlsVersion {
    fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12And13 => TLS12_AND_13,
            TlsVersion::Tls13Only => TLS13_ONLY,
        }
    }
}

/// Client-facing TLS config (proxy acts as server with an issued cert)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    pub fn new(cert: &IssuedCertificate, alpn: &[&[u8]]) -> Result<Self, TlsConfigError> {
        Self::new_with_options(cert, alpn, TlsVersion::default())
    }

    pub fn new_with_options(
        cert: &IssuedCertificate,
        alpn: &[&[u8]],
        tls_version: TlsVersion,
    ) -> Result<Self, TlsConfigError> {
        let mut config = ServerConfig::builder_with_protocol_versions(tls_version.versions())
            .with_no_client_auth()
            .with_single_cert(cert.cert_chain().to_vec(), cert.private_key())
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        debug!(
            host = cert.host(),
            alpn = ?alpn_labels(&config.alpn_protocols),
            "Client-facing TLS config created"
        );

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client with real verification)
#[derive(Clone)]
pub struct UpstreamTlsConfig {
    roots: Arc<RootCertStore>,
    tls_version: TlsVersion,
}

impl UpstreamTlsConfig {
    /// Trust the Mozilla root bundle shipped with `webpki-roots`
    pub fn new() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(root_store)
    }

    /// Trust an explicit root store instead of the webpki bundle
    pub fn with_roots(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
            tls_version: TlsVersion::default(),
        }
    }

    pub fn tls_version(mut self, version: TlsVersion) -> Self {
        self.tls_version = version;
        self
    }

    pub fn roots_count(&self) -> usize {
        self.roots.len()
    }

    /// Build a rustls client config offering `alpn`
    pub fn client_config(&self, alpn: &[&[u8]]) -> Arc<ClientConfig> {
        let mut config = ClientConfig::builder_with_protocol_versions(self.tls_version.versions())
            .with_root_certificates(Arc::clone(&self.roots))
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    }
}

impl Default for UpstreamTlsConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UpstreamTlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTlsConfig")
            .field("roots", &self.roots.len())
            .field("tls_version", &self.tls_version)
            .finish()
    }
}

/// SNI (Server Name Indication) utilities
pub struct SniUtils;

impl SniUtils {
    /// Parse hostname into ServerName for SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
        ServerName::try_from(hostname.to_owned())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}", e)))
    }
}

fn alpn_labels(protocols: &[Vec<u8>]) -> Vec<String> {
    protocols
        .iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::certificate_authority::{CertificateProvider, RootAuthority};

    #[test]
    fn test_tls_version_default() {
        assert_eq!(TlsVersion::default(), TlsVersion::Tls12And13);
    }

    #[test]
    fn test_tls_version_protocol_lists() {
        let both = TlsVersion::Tls12And13.versions();
        assert_eq!(both.len(), 2);
        assert_eq!(both[0].version, rustls::ProtocolVersion::TLSv1_2);
        assert_eq!(both[1].version, rustls::ProtocolVersion::TLSv1_3);

        let only = TlsVersion::Tls13Only.versions();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].version, rustls::ProtocolVersion::TLSv1_3);
    }

    #[test]
    fn test_sni_parse_server_name() {
        assert!(SniUtils::parse_server_name("example.com").is_ok());

        // rustls 0.22+ accepts IP addresses in ServerName
        assert!(SniUtils::parse_server_name("192.168.1.1").is_ok());

        assert!(SniUtils::parse_server_name("").is_err());
    }

    #[test]
    fn test_client_facing_config_uses_requested_alpn() {
        let root = RootAuthority::generate("tls config root").unwrap();
        let issued = root.issue("example.com").unwrap();

        let config = ClientTlsConfig::new(&issued, &[ALPN_HTTP11]).unwrap();
        assert_eq!(
            config.server_config().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_upstream_config_roots() {
        let config = UpstreamTlsConfig::new();
        assert_eq!(config.roots_count(), TLS_SERVER_ROOTS.len());

        let client = config.client_config(&[ALPN_H2, ALPN_HTTP11]);
        assert_eq!(client.alpn_protocols.len(), 2);

        let custom = UpstreamTlsConfig::with_roots(RootCertStore::empty());
        assert_eq!(custom.roots_count(), 0);
    }
}
