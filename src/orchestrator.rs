//! Tunnel orchestration
//!
//! A [`TunnelOrchestrator`] owns everything sessions share: the detector, the
//! TLS bridge, the listener handle and the upstream proxy selector. The front
//! door asks it to open a session, dial the target and then run the session to
//! completion on the connection's own task.
//!
//! Without a listener every session is a transparent relay. With one, the
//! client stream is classified first, TLS is bridged when detected, and the
//! decrypted (or plaintext) bytes go through the HTTP interceptor, which may
//! hand the connection on to WebSocket framing or back to the relay.

use crate::config::ProxyConfig;
use crate::detector::{Detector, Protocol};
use crate::error::{DialError, ProxyError, Result};
use crate::listener::{ListenerHandle, SessionEvent};
use crate::mitm::{
    intercept_http1, intercept_http2, relay_websocket, CertificateStore, Http1Outcome,
    Http2Config, HttpConn, InterceptContext, RootAuthority, TlsBridge, UpstreamTlsConfig,
};
use crate::net_address::NetAddress;
use crate::pipeline::{HttpVersion, Pipeline, Stage};
use crate::relay::{relay, Metered, RelayStats};
use crate::rewind::Rewind;
use crate::upstream::{FixedProxy, NoProxy, ProxySelector};
use anyhow::Context;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Per-connection limits copied into every session
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub relay_buffer_size: usize,
    pub max_head_size: usize,
    pub max_body_capture: usize,
    pub ws_max_frame_size: usize,
}

impl From<&ProxyConfig> for SessionLimits {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            relay_buffer_size: config.relay_buffer_size,
            max_head_size: config.max_head_size,
            max_body_capture: config.max_body_capture,
            ws_max_frame_size: config.ws_max_frame_size,
        }
    }
}

/// State of one tunnel from accept to close
#[derive(Debug, Serialize)]
pub struct TunnelSession {
    id: u64,
    target: NetAddress,
    intercepted: bool,
    tls: bool,
    client_pipeline: Pipeline,
    origin_pipeline: Pipeline,
    #[serde(skip)]
    started: Instant,
}

impl TunnelSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &NetAddress {
        &self.target
    }

    /// A listener was attached when the session opened
    pub fn is_intercepted(&self) -> bool {
        self.intercepted
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn client_pipeline(&self) -> &Pipeline {
        &self.client_pipeline
    }

    pub fn origin_pipeline(&self) -> &Pipeline {
        &self.origin_pipeline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn add_last(&mut self, stage: Stage) {
        self.client_pipeline.add_last(stage);
        self.origin_pipeline.add_last(stage);
    }

    /// Swap the HTTP codec on both sides in place
    fn swap_codec(&mut self, stage: Stage) {
        self.client_pipeline.replace_http_codec(stage);
        self.origin_pipeline.replace_http_codec(stage);
    }
}

pub struct TunnelOrchestrator {
    detector: Detector,
    bridge: TlsBridge,
    listener: Option<ListenerHandle>,
    selector: Arc<dyn ProxySelector>,
    connect_timeout: Duration,
    limits: SessionLimits,
    http2: Http2Config,
    next_session_id: AtomicU64,
}

impl std::fmt::Debug for TunnelOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelOrchestrator")
            .field("detector", &self.detector)
            .field("bridge", &self.bridge)
            .field("intercepting", &self.listener.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("limits", &self.limits)
            .finish()
    }
}

impl TunnelOrchestrator {
    /// Relay-only orchestrator; attach a listener to start intercepting
    pub fn new(config: &ProxyConfig, bridge: TlsBridge) -> Self {
        let selector: Arc<dyn ProxySelector> = match &config.upstream_proxy {
            Some(proxy) => Arc::new(FixedProxy(proxy.clone())),
            None => Arc::new(NoProxy),
        };
        Self {
            detector: Detector::default(),
            bridge,
            listener: None,
            selector,
            connect_timeout: config.connect_timeout,
            limits: SessionLimits::from(config),
            http2: Http2Config::default(),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Build the certificate store and TLS bridge described by `config`
    ///
    /// Loads the root CA from `ca_cert_path`/`ca_key_path` when both are set,
    /// otherwise generates an ephemeral root.
    pub fn from_config(config: &ProxyConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let root = load_root_authority(config)?;
        let certs = Arc::new(CertificateStore::new(
            Arc::new(root),
            config.cert_cache_size,
            config.cert_ttl,
            config.cert_workers,
        ));
        let bridge = TlsBridge::new(certs, UpstreamTlsConfig::new(), config.enable_http2);
        Ok(Self::new(config, bridge))
    }

    pub fn with_listener(mut self, listener: ListenerHandle) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_detector(mut self, detector: Detector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_http2_config(mut self, http2: Http2Config) -> Self {
        self.http2 = http2;
        self
    }

    pub fn bridge(&self) -> &TlsBridge {
        &self.bridge
    }

    pub fn is_intercepting(&self) -> bool {
        self.listener.is_some()
    }

    /// Allocate a session for `target`; ids increase monotonically
    pub fn open_session(&self, target: NetAddress) -> TunnelSession {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        TunnelSession {
            id,
            target,
            intercepted: self.listener.is_some(),
            tls: false,
            client_pipeline: Pipeline::new(),
            origin_pipeline: Pipeline::new(),
            started: Instant::now(),
        }
    }

    /// Connect to the session target, through the selected upstream proxy if
    /// any
    ///
    /// The timeout covers both the TCP connect and the proxy handshake, so a
    /// returned stream is ready to carry tunnel bytes.
    pub async fn dial(&self, session: &TunnelSession) -> Result<TcpStream> {
        let target = &session.target;
        let proxy = self.selector.select(target);

        let connect = async {
            match &proxy {
                Some(proxy) => {
                    let stream = TcpStream::connect(proxy.addr().as_socket_pair())
                        .await
                        .map_err(DialError::Connect)?;
                    proxy
                        .handshake(stream, target)
                        .await
                        .map_err(DialError::ProxyHandshake)
                }
                None => TcpStream::connect(target.as_socket_pair())
                    .await
                    .map_err(DialError::Connect),
            }
        };

        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProxyError::dial(target, e)),
            Err(_) => {
                return Err(ProxyError::dial(
                    target,
                    DialError::Timeout(self.connect_timeout),
                ))
            }
        };

        configure_socket(&stream);
        debug!(
            session_id = session.id,
            target = %target,
            via = ?proxy.as_ref().map(|p| p.to_string()),
            "Outbound connection ready"
        );
        Ok(stream)
    }

    /// Report a session that never got an outbound connection
    pub fn fail(&self, session: &TunnelSession, error: &ProxyError) {
        warn!(
            session_id = session.id,
            target = %session.target,
            kind = error.kind(),
            error = %error,
            "Session failed"
        );
        if let Some(listener) = &self.listener {
            listener.session_event(SessionEvent::Failed {
                session_id: session.id,
                target: session.target.clone(),
                kind: error.kind(),
                message: error.to_string(),
            });
        }
    }

    /// Drive a dialed session until both sides are done
    ///
    /// Returns the bytes that crossed the client connection.
    pub async fn run<C>(
        &self,
        mut session: TunnelSession,
        client: C,
        origin: TcpStream,
    ) -> Result<RelayStats>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let client = Metered::new(client);
        let counters = client.counters();

        info!(
            session_id = session.id,
            target = %session.target,
            intercepted = session.intercepted,
            "Session established"
        );
        self.notify(SessionEvent::Established {
            session_id: session.id,
            target: session.target.clone(),
            intercepted: session.intercepted,
        });

        let result = match &self.listener {
            None => {
                session.add_last(Stage::Relay);
                relay(client, origin, self.limits.relay_buffer_size)
                    .await
                    .map(|_| ())
                    .map_err(ProxyError::from)
            }
            Some(listener) => {
                let listener = listener.clone();
                self.intercept(&mut session, client, origin, listener).await
            }
        };

        let bytes = counters.snapshot();
        if let Err(e) = &result {
            self.fail(&session, e);
        }

        info!(
            session_id = session.id,
            target = %session.target,
            tls = session.tls,
            client_to_origin = bytes.client_to_origin,
            origin_to_client = bytes.origin_to_client,
            pipeline = %session.client_pipeline,
            "Session closed"
        );
        self.notify(SessionEvent::Closed {
            session_id: session.id,
            target: session.target.clone(),
            tls: session.tls,
            bytes,
            duration: session.elapsed(),
            client_pipeline: session.client_pipeline.clone(),
            origin_pipeline: session.origin_pipeline.clone(),
        });

        result.map(|_| bytes)
    }

    async fn intercept<C>(
        &self,
        session: &mut TunnelSession,
        client: C,
        origin: TcpStream,
        listener: ListenerHandle,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        session.client_pipeline.add_last(Stage::Detector);
        let (protocol, client) = self.detector.detect(client).await?;
        session.client_pipeline.remove(Stage::Detector);

        let mut ctx = InterceptContext {
            session_id: session.id,
            target: session.target.clone(),
            tls: false,
            listener,
            max_head_size: self.limits.max_head_size,
            max_body_capture: self.limits.max_body_capture,
            ws_max_frame_size: self.limits.ws_max_frame_size,
        };

        match protocol {
            Protocol::Tls => {
                session.tls = true;
                ctx.tls = true;
                session.add_last(Stage::TlsBridge);
                let bridged = self
                    .bridge
                    .establish(session.target.host(), client, origin)
                    .await?;
                self.serve_http(session, bridged.client, bridged.origin, bridged.version, &ctx)
                    .await
            }
            Protocol::Plaintext => {
                self.serve_http(session, client, origin, HttpVersion::Http1, &ctx)
                    .await
            }
        }
    }

    async fn serve_http<C, O>(
        &self,
        session: &mut TunnelSession,
        client: C,
        origin: O,
        version: HttpVersion,
        ctx: &InterceptContext,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        O: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        session.add_last(Stage::HttpCodec(version));

        if version == HttpVersion::Http2 {
            return intercept_http2(client, origin, ctx, &self.http2).await;
        }

        match intercept_http1(HttpConn::new(client), HttpConn::new(origin), ctx).await? {
            Http1Outcome::Closed => Ok(()),
            Http1Outcome::WebSocket { client, origin } => {
                session.swap_codec(Stage::WebSocketCodec);
                relay_websocket(client, origin, ctx).await
            }
            Http1Outcome::H2cPreface { client, origin } => {
                session.swap_codec(Stage::HttpCodec(HttpVersion::Http2));
                let (client, client_buf) = client.into_parts();
                let (origin, origin_buf) = origin.into_parts();
                intercept_http2(
                    Rewind::new_buffered(client, client_buf),
                    Rewind::new_buffered(origin, origin_buf),
                    ctx,
                    &self.http2,
                )
                .await
            }
            Http1Outcome::NotHttp { client, origin } | Http1Outcome::Opaque { client, origin } => {
                session.swap_codec(Stage::Relay);
                let (client, client_buf) = client.into_parts();
                let (origin, origin_buf) = origin.into_parts();
                relay(
                    Rewind::new_buffered(client, client_buf),
                    Rewind::new_buffered(origin, origin_buf),
                    self.limits.relay_buffer_size,
                )
                .await?;
                Ok(())
            }
        }
    }

    fn notify(&self, event: SessionEvent) {
        if let Some(listener) = &self.listener {
            listener.session_event(event);
        }
    }
}

/// Root CA from the configured PEM files, or a fresh ephemeral one
pub fn load_root_authority(config: &ProxyConfig) -> anyhow::Result<RootAuthority> {
    match (&config.ca_cert_path, &config.ca_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read_to_string(cert_path)
                .with_context(|| format!("Failed to read CA certificate {}", cert_path))?;
            let key_pem = std::fs::read_to_string(key_path)
                .with_context(|| format!("Failed to read CA key {}", key_path))?;
            let root = RootAuthority::from_pem(&cert_pem, &key_pem)
                .context("Failed to load CA material")?;
            info!(cert_path = %cert_path, "Loaded root CA");
            Ok(root)
        }
        _ => RootAuthority::generate("tapwire interception root")
            .context("Failed to generate ephemeral root CA"),
    }
}

fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    if let Err(e) = socket2::SockRef::from(stream).set_keepalive(true) {
        debug!(error = %e, "Failed to set SO_KEEPALIVE");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn orchestrator(config: &ProxyConfig) -> TunnelOrchestrator {
        TunnelOrchestrator::from_config(config).unwrap()
    }

    #[tokio::test]
    async fn test_session_ids_increase() {
        let orchestrator = orchestrator(&ProxyConfig::default());
        let a = orchestrator.open_session(NetAddress::new("a.test", 443));
        let b = orchestrator.open_session(NetAddress::new("b.test", 443));
        assert!(b.id() > a.id());
        assert!(!a.is_intercepted());
    }

    #[tokio::test]
    async fn test_dial_refused_is_dial_error() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let orchestrator = orchestrator(&ProxyConfig::default());
        let session = orchestrator.open_session(NetAddress::new("127.0.0.1", port));
        let err = orchestrator.dial(&session).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Dial {
                source: DialError::Connect(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_relay_session_without_listener() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = origin_listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"pong").await.unwrap();
        });

        let orchestrator = orchestrator(&ProxyConfig::default());
        let session =
            orchestrator.open_session(NetAddress::new("127.0.0.1", origin_addr.port()));
        let origin = orchestrator.dial(&session).await.unwrap();

        let (mut client_remote, client) = tokio::io::duplex(1024);
        let run = tokio::spawn(async move { orchestrator.run(session, client, origin).await });

        client_remote.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client_remote.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        client_remote.shutdown().await.unwrap();

        let stats = run.await.unwrap().unwrap();
        assert_eq!(stats.client_to_origin, 4);
        assert_eq!(stats.origin_to_client, 4);
    }
}
