//! Dual TLS bridge
//!
//! Terminates the client's TLS session with a leaf certificate issued for
//! the tunnel host and opens a verified TLS session to the origin. Either
//! handshake failing aborts the session; there is no plaintext fallback.

use super::certificate_authority::CertificateStore;
use super::tls_config::{ClientTlsConfig, SniUtils, UpstreamTlsConfig, ALPN_H2, ALPN_HTTP11};
use crate::error::{ProxyError, Result, Side};
use crate::pipeline::HttpVersion;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Both legs of an established bridge
pub struct BridgedStreams<C, O> {
    pub client: server::TlsStream<C>,
    pub origin: client::TlsStream<O>,
    /// HTTP version negotiated through ALPN
    pub version: HttpVersion,
}

impl<C, O> std::fmt::Debug for BridgedStreams<C, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedStreams")
            .field("version", &self.version)
            .finish()
    }
}

/// Terminates client TLS and originates origin TLS for one host at a time
#[derive(Clone)]
pub struct TlsBridge {
    certs: Arc<CertificateStore>,
    upstream: UpstreamTlsConfig,
    enable_http2: bool,
}

impl TlsBridge {
    pub fn new(
        certs: Arc<CertificateStore>,
        upstream: UpstreamTlsConfig,
        enable_http2: bool,
    ) -> Self {
        Self {
            certs,
            upstream,
            enable_http2,
        }
    }

    pub fn certificates(&self) -> &Arc<CertificateStore> {
        &self.certs
    }

    /// Run both handshakes for `host`
    ///
    /// With HTTP/2 disabled both sides offer only `http/1.1` and the two
    /// handshakes run concurrently. With it enabled the origin is contacted
    /// first and the client is offered exactly the protocol the origin picked.
    pub async fn establish<C, O>(
        &self,
        host: &str,
        client: C,
        origin: O,
    ) -> Result<BridgedStreams<C, O>>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        O: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.enable_http2 {
            let (client, origin) = tokio::try_join!(
                self.accept_client(host, client, &[ALPN_HTTP11]),
                self.connect_origin(host, origin, &[ALPN_HTTP11]),
            )?;
            info!(target_host = %host, "TLS bridge established");
            return Ok(BridgedStreams {
                client,
                origin,
                version: HttpVersion::Http1,
            });
        }

        let origin = self.connect_origin(host, origin, &[ALPN_H2, ALPN_HTTP11]).await?;
        let version = match origin.get_ref().1.alpn_protocol() {
            Some(ALPN_H2) => HttpVersion::Http2,
            _ => HttpVersion::Http1,
        };
        let offer: &[&[u8]] = match version {
            HttpVersion::Http2 => &[ALPN_H2],
            HttpVersion::Http1 => &[ALPN_HTTP11],
        };
        let client = self.accept_client(host, client, offer).await?;

        info!(target_host = %host, version = ?version, "TLS bridge established");
        Ok(BridgedStreams {
            client,
            origin,
            version,
        })
    }

    async fn accept_client<C>(
        &self,
        host: &str,
        client: C,
        alpn: &[&[u8]],
    ) -> Result<server::TlsStream<C>>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let issued = self.certs.get_or_issue(host).await?;
        let config = ClientTlsConfig::new(&issued, alpn)
            .map_err(|e| ProxyError::handshake(Side::Client, host, e.to_string()))?;

        let stream = TlsAcceptor::from(config.server_config())
            .accept(client)
            .await
            .map_err(|e| {
                warn!(target_host = %host, error = %e, "Client TLS handshake failed");
                ProxyError::handshake(Side::Client, host, e.to_string())
            })?;

        debug!(
            target_host = %host,
            alpn = ?stream.get_ref().1.alpn_protocol().map(String::from_utf8_lossy),
            "Client TLS handshake successful"
        );
        Ok(stream)
    }

    async fn connect_origin<O>(
        &self,
        host: &str,
        origin: O,
        alpn: &[&[u8]],
    ) -> Result<client::TlsStream<O>>
    where
        O: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = SniUtils::parse_server_name(host)
            .map_err(|e| ProxyError::handshake(Side::Origin, host, e.to_string()))?;

        let stream = TlsConnector::from(self.upstream.client_config(alpn))
            .connect(server_name, origin)
            .await
            .map_err(|e| {
                warn!(target_host = %host, error = %e, "Upstream TLS handshake failed");
                ProxyError::handshake(Side::Origin, host, e.to_string())
            })?;

        debug!(target_host = %host, "Upstream TLS handshake successful");
        Ok(stream)
    }
}

impl std::fmt::Debug for TlsBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsBridge")
            .field("upstream", &self.upstream)
            .field("enable_http2", &self.enable_http2)
            .finish()
    }
}
