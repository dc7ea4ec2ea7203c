//! Front door: accepts CONNECT and SOCKS5 tunnel requests
//!
//! The first byte of each accepted connection picks the dialect. `0x05` is a
//! SOCKS5 greeting; anything else is served as HTTP/1.1 by hyper, where only
//! `CONNECT` is accepted. The target is dialed before the client is told the
//! tunnel is ready, so a failed dial is reported as `502 Bad Gateway` or the
//! matching SOCKS5 reply code and the client is closed.

use crate::error::{DialError, ProxyError};
use crate::net_address::NetAddress;
use crate::orchestrator::TunnelOrchestrator;
use anyhow::{Context, Result};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_NO_ACCEPTABLE_METHOD: u8 = 0xff;
const SOCKS_CMD_CONNECT: u8 = 0x01;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_TTL_EXPIRED: u8 = 0x06;
const REPLY_COMMAND_UNSUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_UNSUPPORTED: u8 = 0x08;

/// Accept loop for the proxy listener
pub struct ProxyServer {
    listener: TcpListener,
    orchestrator: Arc<TunnelOrchestrator>,
}

impl ProxyServer {
    pub async fn bind(addr: &str, orchestrator: Arc<TunnelOrchestrator>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", addr))?;
        Ok(Self {
            listener,
            orchestrator,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one task per connection
    pub async fn run(self) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            intercepting = self.orchestrator.is_intercepting(),
            "Proxy listening"
        );
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            let orchestrator = Arc::clone(&self.orchestrator);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, orchestrator).await {
                    debug!(peer = %peer, error = %e, "Client connection ended with error");
                }
            });
        }
    }
}

/// Serve one client connection
pub async fn serve_connection(
    stream: TcpStream,
    orchestrator: Arc<TunnelOrchestrator>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);

    let mut first = [0u8; 1];
    if stream.peek(&mut first).await? == 0 {
        return Ok(());
    }

    if first[0] == SOCKS_VERSION {
        serve_socks5(stream, orchestrator).await
    } else {
        serve_http1(stream, orchestrator).await
    }
}

async fn serve_http1(stream: TcpStream, orchestrator: Arc<TunnelOrchestrator>) -> Result<()> {
    let io = TokioIo::new(stream);

    hyper::server::conn::http1::Builder::new()
        .serve_connection(
            io,
            service_fn(move |req| {
                let orchestrator = Arc::clone(&orchestrator);
                async move { Ok::<_, Infallible>(handle_request(req, orchestrator).await) }
            }),
        )
        .with_upgrades()
        .await
        .context("HTTP/1.1 front door connection error")
}

async fn handle_request(
    mut req: Request<Incoming>,
    orchestrator: Arc<TunnelOrchestrator>,
) -> Response<Full<Bytes>> {
    if req.method() != Method::CONNECT {
        debug!(method = %req.method(), uri = %req.uri(), "Rejecting non-CONNECT request");
        let mut response =
            status_response(StatusCode::METHOD_NOT_ALLOWED, "Only CONNECT is supported");
        response
            .headers_mut()
            .insert(http::header::ALLOW, http::HeaderValue::from_static("CONNECT"));
        return response;
    }

    let target = match req
        .uri()
        .authority()
        .map(|authority| NetAddress::parse_authority(authority.as_str()))
    {
        Some(Ok(target)) => target,
        Some(Err(e)) => {
            warn!(uri = %req.uri(), error = %e, "[CONNECT] Invalid authority");
            return status_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        }
        None => {
            warn!("[CONNECT] Missing authority in CONNECT request");
            return status_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        }
    };

    let session = orchestrator.open_session(target);
    info!(session_id = session.id(), target = %session.target(), "[CONNECT] Tunnel requested");

    let origin = match orchestrator.dial(&session).await {
        Ok(origin) => origin,
        Err(e) => {
            orchestrator.fail(&session, &e);
            return status_response(StatusCode::BAD_GATEWAY, "Failed to connect to target");
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let session_id = session.id();
                if let Err(e) = orchestrator.run(session, TokioIo::new(upgraded), origin).await {
                    debug!(session_id, error = %e, "[CONNECT] Tunnel ended with error");
                }
            }
            Err(e) => {
                error!(session_id = session.id(), error = %e, "[CONNECT] Upgrade failed");
            }
        }
    });

    status_response(StatusCode::OK, "")
}

fn status_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

async fn serve_socks5(mut stream: TcpStream, orchestrator: Arc<TunnelOrchestrator>) -> Result<()> {
    // Greeting: VER NMETHODS METHODS...
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&SOCKS_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, SOCKS_NO_ACCEPTABLE_METHOD])
            .await?;
        anyhow::bail!("SOCKS5 client offered no acceptable auth method");
    }
    stream.write_all(&[SOCKS_VERSION, SOCKS_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        anyhow::bail!("SOCKS5 request version mismatch {}", request[0]);
    }
    if request[1] != SOCKS_CMD_CONNECT {
        write_socks5_reply(&mut stream, REPLY_COMMAND_UNSUPPORTED, None).await?;
        anyhow::bail!("SOCKS5 command {} is unsupported", request[1]);
    }

    let host = match request[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).context("SOCKS5 domain is not UTF-8")?
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        atyp => {
            write_socks5_reply(&mut stream, REPLY_ADDRESS_UNSUPPORTED, None).await?;
            anyhow::bail!("SOCKS5 address type {} is unsupported", atyp);
        }
    };
    let port = stream.read_u16().await?;

    let session = orchestrator.open_session(NetAddress::new(host, port));
    info!(session_id = session.id(), target = %session.target(), "[SOCKS5] Tunnel requested");

    let origin = match orchestrator.dial(&session).await {
        Ok(origin) => origin,
        Err(e) => {
            orchestrator.fail(&session, &e);
            let code = socks5_failure_code(&e);
            debug!(
                session_id = session.id(),
                reply = socks5_reply_code_label(code),
                "[SOCKS5] Reporting dial failure"
            );
            write_socks5_reply(&mut stream, code, None).await?;
            return Ok(());
        }
    };

    write_socks5_reply(&mut stream, REPLY_SUCCEEDED, origin.local_addr().ok()).await?;
    orchestrator.run(session, stream, origin).await?;
    Ok(())
}

async fn write_socks5_reply(
    stream: &mut TcpStream,
    code: u8,
    bound: Option<SocketAddr>,
) -> io::Result<()> {
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut reply = vec![SOCKS_VERSION, code, 0x00];
    match bound.ip() {
        IpAddr::V4(v4) => {
            reply.push(0x01);
            reply.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            reply.push(0x04);
            reply.extend_from_slice(&v6.octets());
        }
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&reply).await?;
    stream.flush().await
}

fn socks5_reply_code_label(code: u8) -> &'static str {
    match code {
        0x01 => "general_failure",
        0x02 => "ruleset_blocked",
        0x03 => "network_unreachable",
        0x04 => "host_unreachable",
        0x05 => "connection_refused",
        0x06 => "ttl_expired",
        0x07 => "command_unsupported",
        0x08 => "address_type_unsupported",
        _ => "unknown",
    }
}

/// SOCKS5 reply code for a failed dial
fn socks5_failure_code(error: &ProxyError) -> u8 {
    match error {
        ProxyError::Dial { source, .. } => match source {
            DialError::Timeout(_) => REPLY_TTL_EXPIRED,
            DialError::Connect(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
                _ => REPLY_HOST_UNREACHABLE,
            },
            DialError::ProxyHandshake(_) => REPLY_GENERAL_FAILURE,
        },
        _ => REPLY_GENERAL_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_socks5_failure_codes() {
        let target = NetAddress::new("example.com", 443);

        let refused = ProxyError::dial(
            &target,
            DialError::Connect(io::Error::from(io::ErrorKind::ConnectionRefused)),
        );
        assert_eq!(socks5_failure_code(&refused), REPLY_CONNECTION_REFUSED);
        assert_eq!(socks5_reply_code_label(REPLY_CONNECTION_REFUSED), "connection_refused");

        let timeout = ProxyError::dial(&target, DialError::Timeout(Duration::from_secs(1)));
        assert_eq!(socks5_failure_code(&timeout), REPLY_TTL_EXPIRED);

        let dns = ProxyError::dial(
            &target,
            DialError::Connect(io::Error::new(io::ErrorKind::Other, "no such host")),
        );
        assert_eq!(socks5_failure_code(&dns), REPLY_HOST_UNREACHABLE);

        assert_eq!(
            socks5_failure_code(&ProxyError::mismatch("x")),
            REPLY_GENERAL_FAILURE
        );
    }

    #[test]
    fn test_status_response() {
        let response = status_response(StatusCode::BAD_GATEWAY, "nope");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
