//! MITM (Man-in-the-Middle) interception
//!
//! - Per-host leaf certificates issued from a configurable root
//! - The dual TLS bridge (client-facing server session, origin-facing client session)
//! - HTTP/1.1 and HTTP/2 exchange capture
//! - WebSocket frame relay after an upgrade

pub mod bridge;
pub mod cert_cache;
pub mod certificate_authority;
pub mod http1;
pub mod http2;
pub mod tls_config;
pub mod websocket;

pub use bridge::{BridgedStreams, TlsBridge};
pub use cert_cache::CertCache;
pub use certificate_authority::{
    CertificateProvider, CertificateStore, HostIdentifier, IssuedCertificate, RootAuthority,
};
pub use http1::{intercept_http1, Http1Outcome, HttpConn};
pub use http2::{intercept_http2, Http2Config};
pub use tls_config::{ClientTlsConfig, SniUtils, TlsConfigError, TlsVersion, UpstreamTlsConfig};
pub use websocket::relay_websocket;

use crate::headers::RequestHeaders;
use crate::headers::ResponseHeaders;
use crate::listener::{CapturedBody, Exchange, ListenerHandle};
use crate::net_address::NetAddress;
use chrono::{DateTime, Utc};
use std::time::Instant;

/// Per-session state shared by the HTTP and WebSocket interceptors
#[derive(Debug, Clone)]
pub struct InterceptContext {
    pub session_id: u64,
    pub target: NetAddress,
    /// Traffic is decrypted from an intercepted TLS session
    pub tls: bool,
    pub listener: ListenerHandle,
    pub max_head_size: usize,
    pub max_body_capture: usize,
    pub ws_max_frame_size: usize,
}

/// Start time of an exchange, wall clock for the listener and monotonic for
/// the duration
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExchangeClock {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl ExchangeClock {
    pub(crate) fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }
}

impl InterceptContext {
    pub(crate) fn deliver_exchange(
        &self,
        clock: ExchangeClock,
        request: RequestHeaders,
        request_body: CapturedBody,
        response: Option<ResponseHeaders>,
        response_body: CapturedBody,
    ) {
        self.listener.exchange(Exchange {
            session_id: self.session_id,
            target: self.target.clone(),
            tls: self.tls,
            request,
            request_body,
            response,
            response_body,
            started_at: clock.started_at,
            duration: clock.started.elapsed(),
        });
    }
}
