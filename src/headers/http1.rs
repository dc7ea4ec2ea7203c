//! HTTP/1.x header variants

use super::{cookie_values, parse_header_lines, Header, HeaderParseError, HeaderSet, NameValue};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// HTTP/1.x request head: request line plus ordered headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Http1RequestHeaders {
    request_line: String,
    method: String,
    path: String,
    version: String,
    headers: Vec<Header>,
}

impl Http1RequestHeaders {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        version: impl Into<String>,
        headers: Vec<Header>,
    ) -> Self {
        let method = method.into();
        let path = path.into();
        let version = version.into();
        Self {
            request_line: format!("{} {} {}", method, path, version),
            method,
            path,
            version,
            headers,
        }
    }

    /// Build from a request line such as `GET /index.html HTTP/1.1`
    pub fn from_request_line(line: &str, headers: Vec<Header>) -> Result<Self, HeaderParseError> {
        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(version))
                if !method.is_empty() && !path.is_empty() && version.starts_with("HTTP/") =>
            {
                Ok(Self {
                    request_line: line.to_string(),
                    method: method.to_string(),
                    path: path.to_string(),
                    version: version.to_string(),
                    headers,
                })
            }
            _ => Err(HeaderParseError::InvalidStartLine(line.to_string())),
        }
    }

    pub fn parse_raw_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, HeaderParseError> {
        let (first, rest) = lines.split_first().ok_or(HeaderParseError::Empty)?;
        Self::from_request_line(first.as_ref(), parse_header_lines(rest)?)
    }

    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cookie_values(&self) -> Vec<NameValue> {
        cookie_values(&self.headers)
    }

    /// Remove every header with this name, returning how many were removed
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before - self.headers.len()
    }

    /// Whether the connection stays open after this request
    pub fn is_keep_alive(&self) -> bool {
        keep_alive(&self.version, self)
    }

    /// Serialize to wire format, terminated by the blank line
    pub fn encode(&self) -> BytesMut {
        encode_head(&self.request_line, &self.headers)
    }
}

impl HeaderSet for Http1RequestHeaders {
    fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn raw_lines(&self) -> Vec<String> {
        std::iter::once(self.request_line.clone())
            .chain(self.headers.iter().map(Header::raw_line))
            .collect()
    }
}

/// HTTP/1.x response head: status line plus ordered headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Http1ResponseHeaders {
    status_line: String,
    version: String,
    status: u16,
    reason: String,
    headers: Vec<Header>,
}

impl Http1ResponseHeaders {
    pub fn new(
        version: impl Into<String>,
        status: u16,
        reason: impl Into<String>,
        headers: Vec<Header>,
    ) -> Self {
        let version = version.into();
        let reason = reason.into();
        let status_line = if reason.is_empty() {
            format!("{} {}", version, status)
        } else {
            format!("{} {} {}", version, status, reason)
        };
        Self {
            status_line,
            version,
            status,
            reason,
            headers,
        }
    }

    /// Build from a status line such as `HTTP/1.1 404 Not Found`
    pub fn from_status_line(line: &str, headers: Vec<Header>) -> Result<Self, HeaderParseError> {
        let mut parts = line.splitn(3, ' ');
        let version = parts
            .next()
            .filter(|v| v.starts_with("HTTP/"))
            .ok_or_else(|| HeaderParseError::InvalidStartLine(line.to_string()))?;
        let code = parts
            .next()
            .ok_or_else(|| HeaderParseError::InvalidStartLine(line.to_string()))?;
        let status = code
            .parse::<u16>()
            .ok()
            .filter(|s| (100..1000).contains(s))
            .ok_or_else(|| HeaderParseError::InvalidStatusCode(code.to_string()))?;
        let reason = parts.next().unwrap_or("");

        Ok(Self {
            status_line: line.to_string(),
            version: version.to_string(),
            status,
            reason: reason.to_string(),
            headers,
        })
    }

    pub fn parse_raw_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, HeaderParseError> {
        let (first, rest) = lines.split_first().ok_or(HeaderParseError::Empty)?;
        Self::from_status_line(first.as_ref(), parse_header_lines(rest)?)
    }

    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_keep_alive(&self) -> bool {
        keep_alive(&self.version, self)
    }

    /// Remove every header named `name`, returning how many were removed
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before - self.headers.len()
    }

    pub fn encode(&self) -> BytesMut {
        encode_head(&self.status_line, &self.headers)
    }
}

impl HeaderSet for Http1ResponseHeaders {
    fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn raw_lines(&self) -> Vec<String> {
        std::iter::once(self.status_line.clone())
            .chain(self.headers.iter().map(Header::raw_line))
            .collect()
    }
}

/// HTTP/1.1 defaults to persistent connections, HTTP/1.0 does not
fn keep_alive(version: &str, headers: &impl HeaderSet) -> bool {
    if headers.header_has_token("connection", "close") {
        return false;
    }
    if version == "HTTP/1.0" {
        return headers.header_has_token("connection", "keep-alive");
    }
    true
}

fn encode_head(start_line: &str, headers: &[Header]) -> BytesMut {
    let len = start_line.len()
        + 4
        + headers
            .iter()
            .map(|h| h.name.len() + h.value.len() + 4)
            .sum::<usize>();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_slice(start_line.as_bytes());
    buf.put_slice(b"\r\n");
    for header in headers {
        buf.put_slice(header.name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(header.value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_raw_lines_start_with_request_line() {
        let h = Http1RequestHeaders::new(
            "GET",
            "/search?q=1",
            "HTTP/1.1",
            vec![Header::new("Host", "example.com"), Header::new("Accept", "*/*")],
        );
        assert_eq!(
            h.raw_lines(),
            vec!["GET /search?q=1 HTTP/1.1", "Host: example.com", "Accept: */*"]
        );
    }

    #[test]
    fn test_request_line_rejects_garbage() {
        assert!(Http1RequestHeaders::from_request_line("GET /", vec![]).is_err());
        assert!(Http1RequestHeaders::from_request_line("GET / FTP/1.0", vec![]).is_err());
    }

    #[test]
    fn test_status_line_without_reason() {
        let h = Http1ResponseHeaders::from_status_line("HTTP/1.1 204", vec![]).unwrap();
        assert_eq!(h.status(), 204);
        assert_eq!(h.reason(), "");
        assert_eq!(h.raw_lines(), vec!["HTTP/1.1 204"]);
    }

    #[test]
    fn test_status_line_invalid_code() {
        assert!(matches!(
            Http1ResponseHeaders::from_status_line("HTTP/1.1 ABC OK", vec![]),
            Err(HeaderParseError::InvalidStatusCode(_))
        ));
    }

    #[test]
    fn test_keep_alive_defaults() {
        let h11 = Http1RequestHeaders::new("GET", "/", "HTTP/1.1", vec![]);
        assert!(h11.is_keep_alive());

        let h10 = Http1RequestHeaders::new("GET", "/", "HTTP/1.0", vec![]);
        assert!(!h10.is_keep_alive());

        let closing = Http1ResponseHeaders::new(
            "HTTP/1.1",
            200,
            "OK",
            vec![Header::new("Connection", "Close")],
        );
        assert!(!closing.is_keep_alive());
    }

    #[test]
    fn test_encode_and_remove_header() {
        let mut h = Http1RequestHeaders::new(
            "PUT",
            "/upload",
            "HTTP/1.1",
            vec![
                Header::new("Host", "example.com"),
                Header::new("Expect", "100-continue"),
                Header::new("Content-Length", "3"),
            ],
        );
        assert_eq!(h.remove_header("expect"), 1);
        assert_eq!(
            &h.encode()[..],
            b"PUT /upload HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\n"
        );
    }
}
