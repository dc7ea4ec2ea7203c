//! Tunnel target addresses

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Authority parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Authority must be in host:port format")]
    MissingPort,

    #[error("Host cannot be empty")]
    EmptyHost,

    #[error("Invalid port '{0}': must be a number between 1 and 65535")]
    InvalidPort(String),
}

/// Host and port of a tunnel target
///
/// IPv6 literals are stored without brackets and re-bracketed on display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    host: String,
    port: u16,
}

impl NetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` authority as found in CONNECT request targets
    pub fn parse_authority(authority: &str) -> Result<Self, AddressError> {
        // Split by last colon to handle IPv6 addresses like [::1]:443
        let (host, port_str) = authority
            .rsplit_once(':')
            .ok_or(AddressError::MissingPort)?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(AddressError::EmptyHost);
        }
        // A bare IPv6 literal without brackets has no port to split off
        if host.contains(':') && !authority.starts_with('[') {
            return Err(AddressError::MissingPort);
        }

        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressError::InvalidPort(port_str.to_string()))?;
        if port == 0 {
            return Err(AddressError::InvalidPort(port_str.to_string()));
        }

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `(host, port)` pair suitable for `TcpStream::connect`
    pub fn as_socket_pair(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authority_valid() {
        assert_eq!(
            NetAddress::parse_authority("example.com:443"),
            Ok(NetAddress::new("example.com", 443))
        );
        assert_eq!(
            NetAddress::parse_authority("192.168.1.1:8080"),
            Ok(NetAddress::new("192.168.1.1", 8080))
        );
        assert_eq!(
            NetAddress::parse_authority("[2001:db8::1]:443"),
            Ok(NetAddress::new("2001:db8::1", 443))
        );
    }

    #[test]
    fn test_parse_authority_invalid() {
        assert_eq!(
            NetAddress::parse_authority("example.com"),
            Err(AddressError::MissingPort)
        );
        assert_eq!(
            NetAddress::parse_authority(":443"),
            Err(AddressError::EmptyHost)
        );
        assert!(NetAddress::parse_authority("").is_err());
        assert!(NetAddress::parse_authority("example.com:0").is_err());
        assert!(NetAddress::parse_authority("example.com:99999").is_err());
        assert!(NetAddress::parse_authority("2001:db8::1").is_err());
    }

    #[test]
    fn test_display_brackets_ipv6() {
        assert_eq!(NetAddress::new("::1", 443).to_string(), "[::1]:443");
        assert_eq!(NetAddress::new("example.com", 80).to_string(), "example.com:80");
    }
}
