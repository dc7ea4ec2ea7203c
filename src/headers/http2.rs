//! HTTP/2 header variants
//!
//! Pseudo-headers are stored as fields and only synthesized when rendering
//! raw lines, so `headers()` always returns ordinary headers.

use super::{cookie_values, Header, HeaderParseError, HeaderSet, NameValue};
use serde::{Deserialize, Serialize};

const VERSION: &str = "HTTP/2";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Http2RequestHeaders {
    scheme: String,
    method: String,
    path: String,
    /// Empty unless the request carried `:authority`
    authority: String,
    headers: Vec<Header>,
}

impl Http2RequestHeaders {
    pub fn new(
        headers: Vec<Header>,
        scheme: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::with_authority(headers, scheme, method, path, "")
    }

    pub fn with_authority(
        headers: Vec<Header>,
        scheme: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        authority: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            method: method.into(),
            path: path.into(),
            authority: authority.into(),
            headers,
        }
    }

    pub fn parse_raw_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, HeaderParseError> {
        let mut scheme = None;
        let mut method = None;
        let mut path = None;
        let mut authority = String::new();
        let mut headers = Vec::with_capacity(lines.len());

        for line in lines {
            let header = Header::parse_raw_line(line.as_ref())?;
            match header.name.as_str() {
                ":scheme" => scheme = Some(header.value),
                ":method" => method = Some(header.value),
                ":path" => path = Some(header.value),
                ":authority" => authority = header.value,
                name if name.starts_with(':') => {
                    return Err(HeaderParseError::UnknownPseudoHeader(name.to_string()))
                }
                _ => headers.push(header),
            }
        }

        Ok(Self {
            scheme: scheme.ok_or(HeaderParseError::MissingPseudoHeader(":scheme"))?,
            method: method.ok_or(HeaderParseError::MissingPseudoHeader(":method"))?,
            path: path.ok_or(HeaderParseError::MissingPseudoHeader(":path"))?,
            authority,
            headers,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn cookie_values(&self) -> Vec<NameValue> {
        cookie_values(&self.headers)
    }
}

impl HeaderSet for Http2RequestHeaders {
    fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn raw_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.headers.len() + 4);
        lines.push(format!(":scheme: {}", self.scheme));
        lines.push(format!(":method: {}", self.method));
        lines.push(format!(":path: {}", self.path));
        if !self.authority.is_empty() {
            lines.push(format!(":authority: {}", self.authority));
        }
        lines.extend(self.headers.iter().map(Header::raw_line));
        lines
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Http2ResponseHeaders {
    status: u16,
    headers: Vec<Header>,
}

impl Http2ResponseHeaders {
    pub fn new(status: u16, headers: Vec<Header>) -> Self {
        Self { status, headers }
    }

    pub fn parse_raw_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, HeaderParseError> {
        let mut status = None;
        let mut headers = Vec::with_capacity(lines.len());

        for line in lines {
            let header = Header::parse_raw_line(line.as_ref())?;
            match header.name.as_str() {
                ":status" => {
                    let code = header
                        .value
                        .parse::<u16>()
                        .map_err(|_| HeaderParseError::InvalidStatusCode(header.value.clone()))?;
                    status = Some(code);
                }
                name if name.starts_with(':') => {
                    return Err(HeaderParseError::UnknownPseudoHeader(name.to_string()))
                }
                _ => headers.push(header),
            }
        }

        Ok(Self {
            status: status.ok_or(HeaderParseError::MissingPseudoHeader(":status"))?,
            headers,
        })
    }

    pub fn status(&self) -> u16 {
        self.status
    }
}

impl HeaderSet for Http2ResponseHeaders {
    fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn raw_lines(&self) -> Vec<String> {
        std::iter::once(format!(":status: {}", self.status))
            .chain(self.headers.iter().map(Header::raw_line))
            .collect()
    }
}
