//! Intercepting proxy that logs every captured exchange
//!
//! ```text
//! RUST_LOG=debug cargo run --example capture_proxy
//! curl --proxy http://127.0.0.1:8080 --cacert tapwire-root.pem https://example.com/
//! ```
//!
//! Without `TAPWIRE_CA_CERT_PATH`/`TAPWIRE_CA_KEY_PATH` an ephemeral root is
//! generated and written to `tapwire-root.pem` so clients can trust it.

use anyhow::{Context, Result};
use std::sync::Arc;
use tapwire::orchestrator::load_root_authority;
use tapwire::{
    CertificateStore, ListenerHandle, ProxyConfig, ProxyServer, TlsBridge, TracingListener,
    TunnelOrchestrator, UpstreamTlsConfig,
};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = ProxyConfig::from_env()?;
    info!(addr = %config.listen_addr(), "Starting capture proxy");

    let root = load_root_authority(&config)?;
    if config.ca_cert_path.is_none() {
        std::fs::write("tapwire-root.pem", root.cert_pem())
            .context("Failed to write tapwire-root.pem")?;
        info!("Ephemeral root written to tapwire-root.pem");
    }

    let certs = Arc::new(CertificateStore::new(
        Arc::new(root),
        config.cert_cache_size,
        config.cert_ttl,
        config.cert_workers,
    ));
    let bridge = TlsBridge::new(certs, UpstreamTlsConfig::new(), config.enable_http2);
    let listener = ListenerHandle::spawn(Arc::new(TracingListener), config.listener_queue_capacity);
    let orchestrator = TunnelOrchestrator::new(&config, bridge).with_listener(listener);

    let server = ProxyServer::bind(&config.listen_addr(), Arc::new(orchestrator)).await?;

    tokio::select! {
        result = server.run() => result,
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
