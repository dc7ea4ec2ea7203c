//! Upstream proxy chaining
//!
//! When a [`ProxySelector`] picks a proxy for a target, the orchestrator dials
//! the proxy instead and runs the matching tunnel handshake before the
//! outbound connection is handed to any other stage.

use crate::net_address::NetAddress;
use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};
use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::debug;

const SOCKS_DEFAULT_PORT: u16 = 1080;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpstreamProxyError {
    #[error("Invalid proxy URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported proxy scheme '{0}' (expected http, socks4 or socks5)")]
    UnsupportedScheme(String),

    #[error("Proxy URL has no host")]
    MissingHost,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UpstreamProxy {
    /// HTTP proxy reached with `CONNECT`
    Http {
        addr: NetAddress,
        credentials: Option<Credentials>,
    },
    /// SOCKS4a, remote name resolution
    Socks4a {
        addr: NetAddress,
        user_id: Option<String>,
    },
    Socks5 {
        addr: NetAddress,
        credentials: Option<Credentials>,
    },
}

impl UpstreamProxy {
    /// Parse `http://[user:pass@]host:port`, `socks4://[user@]host:port` or
    /// `socks5://[user:pass@]host:port`
    pub fn parse(raw: &str) -> Result<Self, UpstreamProxyError> {
        let url = url::Url::parse(raw)?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(UpstreamProxyError::MissingHost)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let credentials = (!url.username().is_empty()).then(|| Credentials {
            username: url.username().to_string(),
            password: url.password().unwrap_or("").to_string(),
        });

        match url.scheme() {
            "http" => Ok(UpstreamProxy::Http {
                addr: NetAddress::new(host, url.port_or_known_default().unwrap_or(80)),
                credentials,
            }),
            "socks4" | "socks4a" => Ok(UpstreamProxy::Socks4a {
                addr: NetAddress::new(host, url.port().unwrap_or(SOCKS_DEFAULT_PORT)),
                user_id: credentials.map(|c| c.username),
            }),
            "socks5" | "socks5h" => Ok(UpstreamProxy::Socks5 {
                addr: NetAddress::new(host, url.port().unwrap_or(SOCKS_DEFAULT_PORT)),
                credentials,
            }),
            other => Err(UpstreamProxyError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Address of the proxy itself
    pub fn addr(&self) -> &NetAddress {
        match self {
            UpstreamProxy::Http { addr, .. }
            | UpstreamProxy::Socks4a { addr, .. }
            | UpstreamProxy::Socks5 { addr, .. } => addr,
        }
    }

    fn scheme(&self) -> &'static str {
        match self {
            UpstreamProxy::Http { .. } => "http",
            UpstreamProxy::Socks4a { .. } => "socks4",
            UpstreamProxy::Socks5 { .. } => "socks5",
        }
    }

    /// Ask the proxy for a tunnel to `target` over an already connected
    /// stream, returning the stream once the tunnel is up
    pub async fn handshake(
        &self,
        mut stream: TcpStream,
        target: &NetAddress,
    ) -> io::Result<TcpStream> {
        debug!(proxy = %self, target = %target, "Negotiating upstream tunnel");
        let dest = (target.host(), target.port());
        match self {
            UpstreamProxy::Http { credentials, .. } => {
                let connected = match credentials {
                    Some(creds) => {
                        http_connect_tokio_with_basic_auth(
                            &mut stream,
                            target.host(),
                            target.port(),
                            &creds.username,
                            &creds.password,
                        )
                        .await
                    }
                    None => http_connect_tokio(&mut stream, target.host(), target.port()).await,
                };
                connected.map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
                Ok(stream)
            }
            UpstreamProxy::Socks4a { user_id, .. } => {
                let tunnel = match user_id {
                    Some(user_id) => {
                        Socks4Stream::connect_with_userid_and_socket(stream, dest, user_id).await
                    }
                    None => Socks4Stream::connect_with_socket(stream, dest).await,
                };
                Ok(tunnel.map_err(socks_error)?.into_inner())
            }
            UpstreamProxy::Socks5 { credentials, .. } => {
                let tunnel = match credentials {
                    Some(creds) => {
                        Socks5Stream::connect_with_password_and_socket(
                            stream,
                            dest,
                            &creds.username,
                            &creds.password,
                        )
                        .await
                    }
                    None => Socks5Stream::connect_with_socket(stream, dest).await,
                };
                Ok(tunnel.map_err(socks_error)?.into_inner())
            }
        }
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.addr())
    }
}

/// Chooses the upstream proxy, if any, for each tunnel target
pub trait ProxySelector: Send + Sync {
    fn select(&self, target: &NetAddress) -> Option<UpstreamProxy>;
}

/// Connect directly to every target
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _target: &NetAddress) -> Option<UpstreamProxy> {
        None
    }
}

/// Route every target through the same proxy
#[derive(Debug, Clone)]
pub struct FixedProxy(pub UpstreamProxy);

impl ProxySelector for FixedProxy {
    fn select(&self, _target: &NetAddress) -> Option<UpstreamProxy> {
        Some(self.0.clone())
    }
}

impl<F> ProxySelector for F
where
    F: Fn(&NetAddress) -> Option<UpstreamProxy> + Send + Sync,
{
    fn select(&self, target: &NetAddress) -> Option<UpstreamProxy> {
        self(target)
    }
}

fn socks_error(e: tokio_socks::Error) -> io::Error {
    match e {
        tokio_socks::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::ConnectionRefused, other),
    }
}
