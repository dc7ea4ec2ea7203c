//! Canonical header model
//!
//! Version-agnostic request/response metadata. HTTP/1.1 messages keep their
//! start line; HTTP/2 messages carry scheme/method/path/authority (or status)
//! separately and synthesize pseudo-headers when rendered as raw lines.
//!
//! Every variant renders to `raw_lines()` and parses back losslessly:
//! `parse_raw_lines(&h.raw_lines())` yields the same method, path, version and
//! header order as `h`.

pub mod http1;
pub mod http2;

pub use http1::{Http1RequestHeaders, Http1ResponseHeaders};
pub use http2::{Http2RequestHeaders, Http2ResponseHeaders};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw-line parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderParseError {
    #[error("No lines to parse")]
    Empty,

    #[error("Invalid start line: {0}")]
    InvalidStartLine(String),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(String),

    #[error("Header line without name/value separator: {0}")]
    InvalidHeader(String),

    #[error("Missing pseudo-header: {0}")]
    MissingPseudoHeader(&'static str),

    #[error("Unknown pseudo-header: {0}")]
    UnknownPseudoHeader(String),
}

/// A single header; order within a message is significant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `name: value`
    pub fn raw_line(&self) -> String {
        format!("{}: {}", self.name, self.value)
    }

    /// Inverse of [`Header::raw_line`]
    ///
    /// Pseudo-header names keep their leading colon; exactly one space after
    /// the separator is dropped so values with leading whitespace survive.
    pub fn parse_raw_line(line: &str) -> Result<Self, HeaderParseError> {
        let search_from = usize::from(line.starts_with(':'));
        let sep = line[search_from..]
            .find(':')
            .map(|idx| idx + search_from)
            .ok_or_else(|| HeaderParseError::InvalidHeader(line.to_string()))?;

        let name = &line[..sep];
        if name.is_empty() || name == ":" {
            return Err(HeaderParseError::InvalidHeader(line.to_string()));
        }
        let rest = &line[sep + 1..];
        let value = rest.strip_prefix(' ').unwrap_or(rest);
        Ok(Self::new(name, value))
    }
}

/// A cookie name/value pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse `name=value`; a segment without `=` is all name
    pub fn parse(segment: &str) -> Self {
        match segment.split_once('=') {
            Some((name, value)) => Self::new(name, value),
            None => Self::new(segment, ""),
        }
    }
}

/// Capabilities shared by every header variant
pub trait HeaderSet {
    /// Ordinary headers in wire order (no pseudo-headers)
    fn headers(&self) -> &[Header];

    /// Protocol version label (`HTTP/1.1`, `HTTP/2`, ...)
    fn version(&self) -> &str;

    /// One line per header, start line or pseudo-headers first
    fn raw_lines(&self) -> Vec<String>;

    /// All values for a header name (case-insensitive)
    fn get_header(&self, name: &str) -> Vec<&str> {
        self.headers()
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    fn first_header(&self, name: &str) -> Option<&str> {
        self.headers()
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn has_header(&self, name: &str) -> bool {
        self.first_header(name).is_some()
    }

    fn content_length(&self) -> Option<u64> {
        self.first_header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    fn content_type(&self) -> Option<&str> {
        self.first_header("content-type")
    }

    /// Whether the last transfer coding is `chunked`
    fn is_chunked(&self) -> bool {
        self.get_header("transfer-encoding")
            .last()
            .and_then(|v| v.rsplit(',').next())
            .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// Whether any `name` header contains `token` in its comma-separated list
    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.get_header(name).iter().any(|value| {
            value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }
}

/// Request metadata, HTTP/1.1 or HTTP/2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestHeaders {
    Http1(Http1RequestHeaders),
    Http2(Http2RequestHeaders),
}

impl RequestHeaders {
    pub fn method(&self) -> &str {
        match self {
            RequestHeaders::Http1(h) => h.method(),
            RequestHeaders::Http2(h) => h.method(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            RequestHeaders::Http1(h) => h.path(),
            RequestHeaders::Http2(h) => h.path(),
        }
    }

    /// `:scheme` for HTTP/2; HTTP/1.1 requests inside a tunnel carry none
    pub fn scheme(&self) -> Option<&str> {
        match self {
            RequestHeaders::Http1(_) => None,
            RequestHeaders::Http2(h) => Some(h.scheme()),
        }
    }

    /// `:authority` for HTTP/2, `Host` for HTTP/1.1
    pub fn authority(&self) -> Option<&str> {
        match self {
            RequestHeaders::Http1(h) => h.first_header("host"),
            RequestHeaders::Http2(h) => Some(h.authority()).filter(|a| !a.is_empty()),
        }
    }

    /// Name/value pairs from every `Cookie` header
    pub fn cookie_values(&self) -> Vec<NameValue> {
        cookie_values(self.headers())
    }

    /// Parse raw lines produced by [`HeaderSet::raw_lines`]
    ///
    /// Lines starting with `:` select the HTTP/2 variant.
    pub fn parse_raw_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, HeaderParseError> {
        let first = lines.first().ok_or(HeaderParseError::Empty)?;
        if first.as_ref().starts_with(':') {
            Http2RequestHeaders::parse_raw_lines(lines).map(RequestHeaders::Http2)
        } else {
            Http1RequestHeaders::parse_raw_lines(lines).map(RequestHeaders::Http1)
        }
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, RequestHeaders::Http2(_))
    }
}

impl HeaderSet for RequestHeaders {
    fn headers(&self) -> &[Header] {
        match self {
            RequestHeaders::Http1(h) => h.headers(),
            RequestHeaders::Http2(h) => h.headers(),
        }
    }

    fn version(&self) -> &str {
        match self {
            RequestHeaders::Http1(h) => h.version(),
            RequestHeaders::Http2(h) => h.version(),
        }
    }

    fn raw_lines(&self) -> Vec<String> {
        match self {
            RequestHeaders::Http1(h) => h.raw_lines(),
            RequestHeaders::Http2(h) => h.raw_lines(),
        }
    }
}

/// Response metadata, HTTP/1.1 or HTTP/2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseHeaders {
    Http1(Http1ResponseHeaders),
    Http2(Http2ResponseHeaders),
}

impl ResponseHeaders {
    pub fn status(&self) -> u16 {
        match self {
            ResponseHeaders::Http1(h) => h.status(),
            ResponseHeaders::Http2(h) => h.status(),
        }
    }

    /// Reason phrase; HTTP/2 has none on the wire
    pub fn reason(&self) -> &str {
        match self {
            ResponseHeaders::Http1(h) => h.reason(),
            ResponseHeaders::Http2(_) => "",
        }
    }

    pub fn parse_raw_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, HeaderParseError> {
        let first = lines.first().ok_or(HeaderParseError::Empty)?;
        if first.as_ref().starts_with(':') {
            Http2ResponseHeaders::parse_raw_lines(lines).map(ResponseHeaders::Http2)
        } else {
            Http1ResponseHeaders::parse_raw_lines(lines).map(ResponseHeaders::Http1)
        }
    }
}

impl HeaderSet for ResponseHeaders {
    fn headers(&self) -> &[Header] {
        match self {
            ResponseHeaders::Http1(h) => h.headers(),
            ResponseHeaders::Http2(h) => h.headers(),
        }
    }

    fn version(&self) -> &str {
        match self {
            ResponseHeaders::Http1(h) => h.version(),
            ResponseHeaders::Http2(h) => h.version(),
        }
    }

    fn raw_lines(&self) -> Vec<String> {
        match self {
            ResponseHeaders::Http1(h) => h.raw_lines(),
            ResponseHeaders::Http2(h) => h.raw_lines(),
        }
    }
}

/// Split `Cookie` headers on `;` into trimmed name/value pairs
pub(crate) fn cookie_values(headers: &[Header]) -> Vec<NameValue> {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("cookie"))
        .flat_map(|h| h.value.split(';'))
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(NameValue::parse)
        .collect()
}

/// Parse ordinary header lines
pub(crate) fn parse_header_lines<S: AsRef<str>>(
    lines: &[S],
) -> Result<Vec<Header>, HeaderParseError> {
    lines
        .iter()
        .map(|line| Header::parse_raw_line(line.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_raw_line_roundtrip_keeps_colons_and_spaces() {
        let header = Header::new("X-Time", " 12:30:00");
        let line = header.raw_line();
        assert_eq!(line, "X-Time:  12:30:00");
        assert_eq!(Header::parse_raw_line(&line).unwrap(), header);

        let pseudo = Header::new(":path", "/a:b");
        assert_eq!(Header::parse_raw_line(&pseudo.raw_line()).unwrap(), pseudo);
    }

    #[test]
    fn test_header_parse_rejects_missing_separator() {
        assert!(matches!(
            Header::parse_raw_line("NoSeparator"),
            Err(HeaderParseError::InvalidHeader(_))
        ));
        assert!(Header::parse_raw_line(": value").is_err());
    }

    #[test]
    fn test_name_value_parse() {
        assert_eq!(NameValue::parse("a=1"), NameValue::new("a", "1"));
        assert_eq!(NameValue::parse("a"), NameValue::new("a", ""));
        assert_eq!(NameValue::parse("a=b=c"), NameValue::new("a", "b=c"));
    }

    #[test]
    fn test_is_chunked_uses_last_coding() {
        let h = Http1RequestHeaders::new(
            "POST",
            "/",
            "HTTP/1.1",
            vec![Header::new("Transfer-Encoding", "gzip, chunked")],
        );
        assert!(h.is_chunked());

        let h = Http1RequestHeaders::new(
            "POST",
            "/",
            "HTTP/1.1",
            vec![Header::new("Transfer-Encoding", "chunked, gzip")],
        );
        assert!(!h.is_chunked());
    }

    #[test]
    fn test_parse_raw_lines_selects_variant() {
        let lines = vec![":scheme: https", ":method: GET", ":path: /"];
        assert!(RequestHeaders::parse_raw_lines(&lines).unwrap().is_http2());

        let lines = vec!["GET / HTTP/1.1", "Host: example.com"];
        let parsed = RequestHeaders::parse_raw_lines(&lines).unwrap();
        assert!(!parsed.is_http2());
        assert_eq!(parsed.authority(), Some("example.com"));

        let empty: Vec<&str> = Vec::new();
        assert_eq!(
            RequestHeaders::parse_raw_lines(&empty),
            Err(HeaderParseError::Empty)
        );
    }
}
