//! tapwire - TLS-capable intercepting proxy core
//!
//! Clients open tunnels with HTTP `CONNECT` or SOCKS5. Each tunnel either
//! relays bytes untouched or, when a [`MessageListener`] is attached, has its
//! traffic classified, TLS terminated on both sides, and HTTP/1.1, HTTP/2 and
//! WebSocket exchanges decoded and reported before being re-encoded toward
//! the origin.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tapwire::{ListenerHandle, ProxyConfig, ProxyServer, TracingListener, TunnelOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProxyConfig::from_env()?;
//!     let listener =
//!         ListenerHandle::spawn(Arc::new(TracingListener), config.listener_queue_capacity);
//!     let orchestrator = TunnelOrchestrator::from_config(&config)?.with_listener(listener);
//!
//!     ProxyServer::bind(&config.listen_addr(), Arc::new(orchestrator))
//!         .await?
//!         .run()
//!         .await
//! }
//! ```
//!
//! ## Architecture
//!
//! - `headers` - canonical HTTP/1.1 and HTTP/2 header model
//! - `detector` - protocol sniffing over a replayable window
//! - `relay` - transparent byte relay with per-direction backpressure
//! - `mitm` - certificates, the dual TLS bridge and the HTTP/WebSocket interceptors
//! - `orchestrator` - session lifecycle, dialing and pipeline swaps
//! - `server` - CONNECT / SOCKS5 front door

pub mod config;
pub mod detector;
pub mod error;
pub mod headers;
pub mod listener;
pub mod mitm;
pub mod net_address;
pub mod orchestrator;
pub mod pipeline;
pub mod relay;
pub mod rewind;
pub mod server;
pub mod upstream;

/// Configuration types
pub use config::ProxyConfig;

/// Errors
pub use error::{DialError, ProxyError, Result, Side};

/// Header model
pub use headers::{
    Header, HeaderParseError, HeaderSet, Http1RequestHeaders, Http1ResponseHeaders,
    Http2RequestHeaders, Http2ResponseHeaders, NameValue, RequestHeaders, ResponseHeaders,
};

/// Detection
pub use detector::{Classification, Detector, DetectorError, Protocol, ProtocolMatcher};

/// Listener contract
pub use listener::{
    CapturedBody, Direction, Exchange, ListenerHandle, MessageKind, MessageListener,
    SessionEvent, TracingListener, WebSocketMessage,
};

/// Interception
pub use mitm::{
    CertificateProvider, CertificateStore, Http2Config, IssuedCertificate, RootAuthority,
    TlsBridge, UpstreamTlsConfig,
};

/// Sessions and front door
pub use net_address::NetAddress;
pub use orchestrator::{TunnelOrchestrator, TunnelSession};
pub use pipeline::{HttpVersion, Pipeline, Stage};
pub use relay::RelayStats;
pub use server::ProxyServer;
pub use upstream::{FixedProxy, NoProxy, ProxySelector, UpstreamProxy};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "tapwire");
    }
}
