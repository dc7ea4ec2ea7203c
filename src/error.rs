//! Proxy error types
//!
//! Every failure in the interception pipeline maps onto one of these variants.
//! None of them are retried inside the pipeline.

use crate::net_address::NetAddress;
use std::time::Duration;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Which leg of a bridged session a handshake belonged to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Proxy ← client (proxy acts as TLS server)
    Client,
    /// Proxy → origin (proxy acts as TLS client)
    Origin,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Origin => f.write_str("origin"),
        }
    }
}

/// Why an outbound dial failed
#[derive(Error, Debug)]
pub enum DialError {
    /// Connect (and proxy handshake) did not finish in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// TCP connect failed (refused, unreachable, DNS)
    #[error("{0}")]
    Connect(#[source] std::io::Error),

    /// Upstream proxy rejected or botched the tunnel handshake
    #[error("upstream proxy handshake failed: {0}")]
    ProxyHandshake(#[source] std::io::Error),
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Outbound connection could not be established
    #[error("Failed to dial {target}: {source}")]
    Dial {
        target: NetAddress,
        #[source]
        source: DialError,
    },

    /// TLS handshake failed on one side of the bridge
    #[error("TLS handshake with {side} failed for {host}: {message}")]
    Handshake {
        side: Side,
        host: String,
        message: String,
    },

    /// Wire data did not fit the protocol that was committed to
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Leaf certificate could not be produced for a host
    #[error("Failed to generate certificate for {host}: {message}")]
    CertGeneration { host: String, message: String },

    /// Stream closed before classification or framing could complete
    #[error("Connection closed: {0}")]
    Closed(&'static str),

    /// HTTP/2 connection level failure
    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Create a dial error
    pub fn dial(target: &NetAddress, source: DialError) -> Self {
        Self::Dial {
            target: target.clone(),
            source,
        }
    }

    /// Create a TLS handshake error
    pub fn handshake(side: Side, host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Handshake {
            side,
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a protocol mismatch error
    pub fn mismatch(msg: impl Into<String>) -> Self {
        Self::ProtocolMismatch(msg.into())
    }

    /// Create a certificate generation error
    pub fn cert_generation(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGeneration {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Short label used in session failure notices
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Dial { .. } => "dial_failure",
            ProxyError::Handshake { .. } => "handshake_failure",
            ProxyError::ProtocolMismatch(_) => "protocol_mismatch",
            ProxyError::CertGeneration { .. } => "cert_generation_failure",
            ProxyError::Closed(_) => "closed",
            ProxyError::Http2(_) => "http2_error",
            ProxyError::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let target = NetAddress::new("example.com", 443);
        let err = ProxyError::dial(&target, DialError::Timeout(Duration::from_secs(5)));
        assert_eq!(err.to_string(), "Failed to dial example.com:443: timed out after 5s");
        assert_eq!(err.kind(), "dial_failure");

        let err = ProxyError::handshake(Side::Origin, "example.com", "bad certificate");
        assert_eq!(
            err.to_string(),
            "TLS handshake with origin failed for example.com: bad certificate"
        );
    }
}
