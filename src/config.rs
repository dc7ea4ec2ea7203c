use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::upstream::UpstreamProxy;

/// WebSocket frame payload limit used when none is configured
pub const DEFAULT_WS_MAX_FRAME_SIZE: usize = 65536;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // Listener address for the CONNECT / SOCKS5 front door
    pub host: String,
    pub port: u16,

    // Outbound dialing (covers TCP connect and upstream proxy handshake)
    pub connect_timeout: Duration,
    pub upstream_proxy: Option<UpstreamProxy>,

    // Leaf certificate cache
    pub cert_cache_size: usize,
    pub cert_ttl: Duration,
    pub cert_workers: usize,

    // Root CA material; an ephemeral root is generated when unset
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,

    // Framing limits
    pub max_head_size: usize,
    pub max_body_capture: usize,
    pub relay_buffer_size: usize,
    pub ws_max_frame_size: usize,

    // Listener dispatch
    pub listener_queue_capacity: usize,

    /// Offer h2 over ALPN on intercepted TLS sessions
    pub enable_http2: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            connect_timeout: Duration::from_secs(10),
            upstream_proxy: None,
            cert_cache_size: 1000,
            cert_ttl: Duration::from_secs(24 * 60 * 60),
            cert_workers: 2,
            ca_cert_path: None,
            ca_key_path: None,
            max_head_size: 64 * 1024,
            max_body_capture: 1024 * 1024,
            relay_buffer_size: crate::relay::DEFAULT_BUFFER_SIZE,
            ws_max_frame_size: DEFAULT_WS_MAX_FRAME_SIZE,
            listener_queue_capacity: 1024,
            enable_http2: false,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Self::default();

        let host = env::var("TAPWIRE_HOST").unwrap_or(defaults.host);
        let port = env_or("TAPWIRE_PORT", defaults.port)?;

        let connect_timeout = Duration::from_millis(env_or(
            "TAPWIRE_CONNECT_TIMEOUT_MS",
            defaults.connect_timeout.as_millis() as u64,
        )?);
        let upstream_proxy = match env::var("TAPWIRE_UPSTREAM_PROXY") {
            Ok(url) if !url.trim().is_empty() => Some(
                UpstreamProxy::parse(url.trim()).context("Invalid TAPWIRE_UPSTREAM_PROXY")?,
            ),
            _ => None,
        };

        let cert_cache_size = env_or("TAPWIRE_CERT_CACHE_SIZE", defaults.cert_cache_size)?;
        let cert_ttl = Duration::from_secs(env_or(
            "TAPWIRE_CERT_TTL_SECONDS",
            defaults.cert_ttl.as_secs(),
        )?);
        let cert_workers = env_or("TAPWIRE_CERT_WORKERS", defaults.cert_workers)?;

        let ca_cert_path = env::var("TAPWIRE_CA_CERT_PATH").ok();
        let ca_key_path = env::var("TAPWIRE_CA_KEY_PATH").ok();

        let max_head_size = env_or("TAPWIRE_MAX_HEAD_SIZE", defaults.max_head_size)?;
        let max_body_capture = env_or("TAPWIRE_MAX_BODY_CAPTURE", defaults.max_body_capture)?;
        let relay_buffer_size = env_or("TAPWIRE_RELAY_BUFFER_SIZE", defaults.relay_buffer_size)?;
        let ws_max_frame_size = env_or("TAPWIRE_WS_MAX_FRAME_SIZE", defaults.ws_max_frame_size)?;
        let listener_queue_capacity = env_or(
            "TAPWIRE_LISTENER_QUEUE_CAPACITY",
            defaults.listener_queue_capacity,
        )?;
        let enable_http2 = env_or("TAPWIRE_ENABLE_HTTP2", defaults.enable_http2)?;

        let config = ProxyConfig {
            host,
            port,
            connect_timeout,
            upstream_proxy,
            cert_cache_size,
            cert_ttl,
            cert_workers,
            ca_cert_path,
            ca_key_path,
            max_head_size,
            max_body_capture,
            relay_buffer_size,
            ws_max_frame_size,
            listener_queue_capacity,
            enable_http2,
        };
        config.validate()?;

        if let Some(proxy) = &config.upstream_proxy {
            tracing::info!(upstream = %proxy, "Outbound connections go through upstream proxy");
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cert_cache_size == 0 {
            anyhow::bail!("Certificate cache size must be greater than 0");
        }
        if self.cert_workers == 0 {
            anyhow::bail!("Certificate worker count must be greater than 0");
        }
        if self.relay_buffer_size == 0 {
            anyhow::bail!("Relay buffer size must be greater than 0");
        }
        if self.ws_max_frame_size == 0 {
            anyhow::bail!("WebSocket max frame size must be greater than 0");
        }
        if self.max_head_size < 1024 {
            anyhow::bail!(
                "Max head size {} is too small (minimum 1024 bytes)",
                self.max_head_size
            );
        }
        if self.connect_timeout.is_zero() {
            anyhow::bail!("Connect timeout must be greater than 0");
        }
        if self.ca_cert_path.is_some() != self.ca_key_path.is_some() {
            anyhow::bail!("TAPWIRE_CA_CERT_PATH and TAPWIRE_CA_KEY_PATH must be set together");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}
