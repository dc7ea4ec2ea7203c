//! HTTP/1.1 interception
//!
//! Heads are parsed into the header model for the listener while the bytes
//! received are kept and forwarded with only framing fixes applied. Bodies
//! are forwarded with their original framing while the payload is captured
//! for the listener. The loop ends when either side
//! closes, when a response switches protocols, or when the first bytes turn
//! out not to be HTTP at all.

use super::{ExchangeClock, InterceptContext};
use crate::error::{ProxyError, Result};
use crate::headers::{
    Header, HeaderSet, Http1RequestHeaders, Http1ResponseHeaders, RequestHeaders,
    ResponseHeaders,
};
use crate::listener::{BodyCapture, CapturedBody};
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Request line of the HTTP/2 connection preface
pub const H2C_PREFACE_LINE: &[u8] = b"PRI * HTTP/2.0";

const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 4096;
const READ_CHUNK: usize = 8 * 1024;
const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// A stream plus the bytes read from it but not yet consumed
#[derive(Debug)]
pub struct HttpConn<S> {
    io: S,
    buf: BytesMut,
}

impl<S> HttpConn<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Bytes read ahead of the last parsed message
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_parts(self) -> (S, Bytes) {
        (self.io, self.buf.freeze())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> HttpConn<S> {
    async fn fill(&mut self) -> io::Result<usize> {
        if self.buf.capacity() - self.buf.len() < 1024 {
            self.buf.reserve(READ_CHUNK);
        }
        self.io.read_buf(&mut self.buf).await
    }

    async fn fill_or_closed(&mut self, context: &'static str) -> Result<()> {
        if self.fill().await? == 0 {
            return Err(ProxyError::Closed(context));
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.io.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.io.flush().await
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.io.shutdown().await {
            debug!(error = %e, "Shutdown after HTTP exchange failed");
        }
    }
}

/// What the interceptor did with the connection pair
#[derive(Debug)]
pub enum Http1Outcome<C, O> {
    /// One side closed; nothing left to do
    Closed,
    /// The first bytes were not HTTP and nothing was forwarded yet
    NotHttp {
        client: HttpConn<C>,
        origin: HttpConn<O>,
    },
    /// Client opened with the HTTP/2 prior-knowledge preface
    H2cPreface {
        client: HttpConn<C>,
        origin: HttpConn<O>,
    },
    /// Origin accepted a WebSocket upgrade; bytes past the 101 stay buffered
    WebSocket {
        client: HttpConn<C>,
        origin: HttpConn<O>,
    },
    /// Origin switched to some other protocol
    Opaque {
        client: HttpConn<C>,
        origin: HttpConn<O>,
    },
}

enum Parse<T> {
    Complete(T, usize),
    Partial,
    Invalid,
}

enum RequestHead {
    Parsed(Http1RequestHeaders, RawHead),
    Eof,
    NotHttp,
    H2cPreface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Relay HTTP/1.1 exchanges between `client` and `origin` until the
/// connection ends or changes protocol
pub async fn intercept_http1<C, O>(
    mut client: HttpConn<C>,
    mut origin: HttpConn<O>,
    ctx: &InterceptContext,
) -> Result<Http1Outcome<C, O>>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let mut forwarded = 0u64;

    loop {
        let head = if forwarded == 0 {
            read_first_request(&mut client, &mut origin, ctx.max_head_size).await?
        } else {
            read_request(&mut client, ctx.max_head_size).await?
        };

        let (mut request, mut request_wire) = match head {
            RequestHead::Parsed(request, wire) => (request, wire),
            RequestHead::Eof => {
                origin.shutdown().await;
                return Ok(Http1Outcome::Closed);
            }
            RequestHead::NotHttp if forwarded == 0 => {
                debug!(session_id = ctx.session_id, "Payload is not HTTP, falling back to relay");
                return Ok(Http1Outcome::NotHttp { client, origin });
            }
            RequestHead::H2cPreface if forwarded == 0 => {
                debug!(session_id = ctx.session_id, "HTTP/2 prior-knowledge preface");
                return Ok(Http1Outcome::H2cPreface { client, origin });
            }
            RequestHead::NotHttp | RequestHead::H2cPreface => {
                return Err(ProxyError::mismatch(
                    "client sent non-HTTP data after a completed exchange",
                ));
            }
        };

        let clock = ExchangeClock::start();
        debug!(
            session_id = ctx.session_id,
            method = request.method(),
            path = request.path(),
            "HTTP/1.1 request"
        );

        let expects_continue = request.header_has_token("expect", "100-continue");
        if expects_continue {
            request.remove_header("expect");
            request_wire.remove("expect");
        }
        let wants_websocket = request.header_has_token("upgrade", "websocket")
            && request.header_has_token("connection", "upgrade");
        let request_keep_alive = request.is_keep_alive();
        let request_kind = request_body_kind(&request)?;
        if request_kind == BodyKind::Chunked {
            request.remove_header("content-length");
            request_wire.remove("content-length");
        }

        origin.send(&request_wire.encode()).await?;
        if expects_continue && request_kind != BodyKind::Empty {
            client.send(CONTINUE_RESPONSE).await?;
            client.flush().await?;
        }
        let request_body =
            transfer_body(&mut client, &mut origin, request_kind, ctx.max_body_capture).await?;

        // Interim responses other than 101 pass straight through
        let (mut response, mut response_wire) = loop {
            match read_response(&mut origin, ctx.max_head_size).await? {
                Some((response, wire)) if is_interim(response.status()) => {
                    client.send(&wire.encode()).await?;
                    client.flush().await?;
                }
                Some(parsed) => break parsed,
                None => {
                    warn!(
                        session_id = ctx.session_id,
                        method = request.method(),
                        "Origin closed before responding"
                    );
                    ctx.deliver_exchange(
                        clock,
                        RequestHeaders::Http1(request),
                        request_body,
                        None,
                        CapturedBody::empty(),
                    );
                    client.shutdown().await;
                    return Ok(Http1Outcome::Closed);
                }
            }
        };

        let response_kind = response_body_kind(request.method(), &response)?;
        if response_kind == BodyKind::Chunked {
            response.remove_header("content-length");
            response_wire.remove("content-length");
        }
        client.send(&response_wire.encode()).await?;

        if response.status() == 101 {
            client.flush().await?;
            let websocket = wants_websocket && response.header_has_token("upgrade", "websocket");
            ctx.deliver_exchange(
                clock,
                RequestHeaders::Http1(request),
                request_body,
                Some(ResponseHeaders::Http1(response)),
                CapturedBody::empty(),
            );
            return Ok(if websocket {
                Http1Outcome::WebSocket { client, origin }
            } else {
                Http1Outcome::Opaque { client, origin }
            });
        }

        let response_keep_alive = response.is_keep_alive();
        let response_body =
            transfer_body(&mut origin, &mut client, response_kind, ctx.max_body_capture).await?;

        ctx.deliver_exchange(
            clock,
            RequestHeaders::Http1(request),
            request_body,
            Some(ResponseHeaders::Http1(response)),
            response_body,
        );
        forwarded += 1;

        if response_kind == BodyKind::UntilClose || !request_keep_alive || !response_keep_alive {
            client.shutdown().await;
            origin.shutdown().await;
            return Ok(Http1Outcome::Closed);
        }
    }
}

/// Wait for the first request while watching for an origin that speaks first
async fn read_first_request<C, O>(
    client: &mut HttpConn<C>,
    origin: &mut HttpConn<O>,
    max_head_size: usize,
) -> Result<RequestHead>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let mut origin_open = true;
    loop {
        if let Some(head) = try_parse_request(client, max_head_size) {
            return Ok(head);
        }
        tokio::select! {
            read = client.fill() => {
                if read? == 0 {
                    return Ok(if client.buf.is_empty() {
                        RequestHead::Eof
                    } else {
                        RequestHead::NotHttp
                    });
                }
            }
            read = origin.fill(), if origin_open => {
                if read? == 0 {
                    origin_open = false;
                } else {
                    // Server-first protocol
                    return Ok(RequestHead::NotHttp);
                }
            }
        }
    }
}

async fn read_request<C>(client: &mut HttpConn<C>, max_head_size: usize) -> Result<RequestHead>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if let Some(head) = try_parse_request(client, max_head_size) {
            return Ok(head);
        }
        if client.fill().await? == 0 {
            return Ok(if client.buf.is_empty() {
                RequestHead::Eof
            } else {
                RequestHead::NotHttp
            });
        }
    }
}

/// `None` means more bytes are needed
fn try_parse_request<C>(client: &mut HttpConn<C>, max_head_size: usize) -> Option<RequestHead> {
    if client.buf.is_empty() {
        return None;
    }
    let preface_len = H2C_PREFACE_LINE.len().min(client.buf.len());
    if client.buf[..preface_len] == H2C_PREFACE_LINE[..preface_len] {
        if client.buf.len() >= H2C_PREFACE_LINE.len() {
            return Some(RequestHead::H2cPreface);
        }
        return None;
    }

    match parse_request(&client.buf) {
        Parse::Complete((request, wire), len) => {
            let _ = client.buf.split_to(len);
            Some(RequestHead::Parsed(request, wire))
        }
        Parse::Partial if client.buf.len() > max_head_size => Some(RequestHead::NotHttp),
        Parse::Partial => None,
        Parse::Invalid => Some(RequestHead::NotHttp),
    }
}

/// `Ok(None)` when the origin closed before sending anything
async fn read_response<O>(
    origin: &mut HttpConn<O>,
    max_head_size: usize,
) -> Result<Option<(Http1ResponseHeaders, RawHead)>>
where
    O: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if !origin.buf.is_empty() {
            match parse_response(&origin.buf) {
                Parse::Complete(response, len) => {
                    let _ = origin.buf.split_to(len);
                    return Ok(Some(response));
                }
                Parse::Partial if origin.buf.len() <= max_head_size => {}
                Parse::Partial => {
                    return Err(ProxyError::mismatch("response head exceeds size limit"))
                }
                Parse::Invalid => {
                    return Err(ProxyError::mismatch("origin sent a non-HTTP response"))
                }
            }
        }
        if origin.fill().await? == 0 {
            if origin.buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Closed("origin closed mid response head"));
        }
    }
}

fn parse_request(buf: &[u8]) -> Parse<(Http1RequestHeaders, RawHead)> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => match (req.method, req.path, req.version) {
            (Some(method), Some(path), Some(version)) => Parse::Complete(
                (
                    Http1RequestHeaders::new(
                        method,
                        path,
                        format!("HTTP/1.{}", version),
                        collect_headers(req.headers),
                    ),
                    RawHead::new(&buf[..len], req.headers),
                ),
                len,
            ),
            _ => Parse::Invalid,
        },
        Ok(httparse::Status::Partial) => Parse::Partial,
        Err(_) => Parse::Invalid,
    }
}

fn parse_response(buf: &[u8]) -> Parse<(Http1ResponseHeaders, RawHead)> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => match (res.version, res.code) {
            (Some(version), Some(code)) => Parse::Complete(
                (
                    Http1ResponseHeaders::new(
                        format!("HTTP/1.{}", version),
                        code,
                        res.reason.unwrap_or(""),
                        collect_headers(res.headers),
                    ),
                    RawHead::new(&buf[..len], res.headers),
                ),
                len,
            ),
            _ => Parse::Invalid,
        },
        Ok(httparse::Status::Partial) => Parse::Partial,
        Err(_) => Parse::Invalid,
    }
}

/// Head as it was received, minus the fields the interceptor strips
///
/// Forwarding from here keeps obs-text bytes and header name case that the
/// text model cannot carry.
#[derive(Debug, Clone)]
struct RawHead {
    start_line: Bytes,
    fields: Vec<(Bytes, Bytes)>,
}

impl RawHead {
    fn new(head: &[u8], headers: &[httparse::Header<'_>]) -> Self {
        let start = head
            .iter()
            .position(|b| !matches!(b, b'\r' | b'\n'))
            .unwrap_or(head.len());
        let head = &head[start..];
        let end = head.iter().position(|&b| b == b'\n').unwrap_or(head.len());
        let line = &head[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        Self {
            start_line: Bytes::copy_from_slice(line),
            fields: headers
                .iter()
                .map(|h| {
                    (
                        Bytes::copy_from_slice(h.name.as_bytes()),
                        Bytes::copy_from_slice(h.value),
                    )
                })
                .collect(),
        }
    }

    fn remove(&mut self, name: &str) {
        self.fields
            .retain(|(field, _)| !field.eq_ignore_ascii_case(name.as_bytes()));
    }

    fn encode(&self) -> BytesMut {
        let len = self.start_line.len()
            + 4
            + self
                .fields
                .iter()
                .map(|(name, value)| name.len() + value.len() + 4)
                .sum::<usize>();
        let mut out = BytesMut::with_capacity(len);
        out.extend_from_slice(&self.start_line);
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.fields {
            out.extend_from_slice(name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<Header> {
    headers
        .iter()
        .map(|h| Header::new(h.name, String::from_utf8_lossy(h.value)))
        .collect()
}

fn is_interim(status: u16) -> bool {
    (100..200).contains(&status) && status != 101
}

/// Content-Length shared by every field and list member
///
/// Differing or unparsable values would let the two peers frame the message
/// differently, so they are refused.
fn declared_length(headers: &impl HeaderSet) -> Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_header("content-length") {
        for item in value.split(',') {
            let parsed = item.trim().parse::<u64>().map_err(|_| {
                ProxyError::mismatch(format!("invalid Content-Length '{}'", value))
            })?;
            match length {
                Some(previous) if previous != parsed => {
                    return Err(ProxyError::mismatch(format!(
                        "conflicting Content-Length values {} and {}",
                        previous, parsed
                    )))
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

/// Chunked coding wins over Content-Length; the caller strips the latter
fn request_body_kind(request: &Http1RequestHeaders) -> Result<BodyKind> {
    if request.is_chunked() {
        return Ok(BodyKind::Chunked);
    }
    Ok(match declared_length(request)? {
        Some(0) | None => BodyKind::Empty,
        Some(len) => BodyKind::Length(len),
    })
}

fn response_body_kind(method: &str, response: &Http1ResponseHeaders) -> Result<BodyKind> {
    let status = response.status();
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyKind::Empty);
    }
    if response.is_chunked() {
        return Ok(BodyKind::Chunked);
    }
    Ok(match declared_length(response)? {
        Some(0) => BodyKind::Empty,
        Some(len) => BodyKind::Length(len),
        None => BodyKind::UntilClose,
    })
}

/// Forward one body from `src` to `dst` in its original framing, capturing
/// the decoded payload
async fn transfer_body<A, B>(
    src: &mut HttpConn<A>,
    dst: &mut HttpConn<B>,
    kind: BodyKind,
    capture_limit: usize,
) -> Result<CapturedBody>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut capture = BodyCapture::new(capture_limit);
    match kind {
        BodyKind::Empty => {}
        BodyKind::Length(len) => {
            copy_exact(src, dst, len, Some(&mut capture)).await?;
        }
        BodyKind::Chunked => copy_chunked(src, dst, &mut capture).await?,
        BodyKind::UntilClose => loop {
            if src.buf.is_empty() && src.fill().await? == 0 {
                break;
            }
            let chunk = src.buf.split();
            capture.push(&chunk);
            dst.send(&chunk).await?;
        },
    }
    dst.flush().await?;
    Ok(capture.finish())
}

async fn copy_exact<A, B>(
    src: &mut HttpConn<A>,
    dst: &mut HttpConn<B>,
    len: u64,
    mut capture: Option<&mut BodyCapture>,
) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        if src.buf.is_empty() {
            src.fill_or_closed("body ended early").await?;
        }
        let take = remaining.min(src.buf.len() as u64) as usize;
        let chunk = src.buf.split_to(take);
        if let Some(capture) = capture.as_deref_mut() {
            capture.push(&chunk);
        }
        dst.send(&chunk).await?;
        remaining -= take as u64;
    }
    Ok(())
}

async fn copy_chunked<A, B>(
    src: &mut HttpConn<A>,
    dst: &mut HttpConn<B>,
    capture: &mut BodyCapture,
) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (line_len, size) = loop {
            match httparse::parse_chunk_size(&src.buf) {
                Ok(httparse::Status::Complete(parsed)) => break parsed,
                Ok(httparse::Status::Partial) if src.buf.len() > MAX_CHUNK_LINE => {
                    return Err(ProxyError::mismatch("chunk size line too long"))
                }
                Ok(httparse::Status::Partial) => {
                    src.fill_or_closed("chunked body ended early").await?
                }
                Err(_) => return Err(ProxyError::mismatch("invalid chunk size line")),
            }
        };
        let line = src.buf.split_to(line_len);
        dst.send(&line).await?;

        if size == 0 {
            return copy_trailers(src, dst).await;
        }

        copy_exact(src, dst, size, Some(capture)).await?;
        // CRLF closing the chunk data
        copy_exact(src, dst, 2, None).await?;
    }
}

/// Forward trailer lines through the terminating empty line
async fn copy_trailers<A, B>(src: &mut HttpConn<A>, dst: &mut HttpConn<B>) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match src.buf.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                let line = src.buf.split_to(pos + 2);
                dst.send(&line).await?;
                if line.len() == 2 {
                    return Ok(());
                }
            }
            None if src.buf.len() > MAX_CHUNK_LINE => {
                return Err(ProxyError::mismatch("trailer line too long"))
            }
            None => src.fill_or_closed("chunked trailers ended early").await?,
        }
    }
}
