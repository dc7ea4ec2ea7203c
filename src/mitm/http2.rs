//! HTTP/2 interception
//!
//! Built on the `h2` crate: a server connection faces the client, a client
//! connection faces the origin, and each client stream is proxied on its own
//! task. Body data is only sent once the receiving peer has granted window
//! capacity, so a slow reader stalls its stream instead of growing buffers.
//!
//! Server push is disabled toward the origin and never offered to the client.
//! Streams and the origin connection driver live in [`JoinSet`]s owned by the
//! session, so dropping the session aborts them.

use super::{ExchangeClock, InterceptContext};
use crate::error::Result;
use crate::headers::{
    Header, Http2RequestHeaders, Http2ResponseHeaders, RequestHeaders, ResponseHeaders,
};
use crate::listener::{BodyCapture, CapturedBody};
use bytes::Bytes;
use futures_util::future::poll_fn;
use h2::{RecvStream, SendStream};
use http::{HeaderMap, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// HTTP/2 connection settings applied to both sides
#[derive(Debug, Clone)]
pub struct Http2Config {
    /// Initial flow control window (per stream) - default: 64KB
    pub initial_window_size: u32,

    /// Connection-level window - default: 1MB
    pub initial_connection_window_size: u32,

    /// Max concurrent streams accepted from the client - default: 100
    pub max_concurrent_streams: u32,

    /// Max frame size - default: 16KB
    pub max_frame_size: u32,

    /// Accept PUSH_PROMISE from the origin
    pub enable_server_push: bool,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_window_size: 65535,
            initial_connection_window_size: 1_048_576,
            max_concurrent_streams: 100,
            max_frame_size: 16384,
            enable_server_push: false,
        }
    }
}

/// Proxy an HTTP/2 connection pair until the client goes away
///
/// Every completed stream is delivered to the listener as an exchange.
pub async fn intercept_http2<C, O>(
    client_io: C,
    origin_io: O,
    ctx: &InterceptContext,
    config: &Http2Config,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!(
        session_id = ctx.session_id,
        target_host = %ctx.target.host(),
        "Starting HTTP/2 interception"
    );

    let (origin, connection) = h2::client::Builder::new()
        .initial_window_size(config.initial_window_size)
        .initial_connection_window_size(config.initial_connection_window_size)
        .max_frame_size(config.max_frame_size)
        .enable_push(config.enable_server_push)
        .handshake::<_, Bytes>(origin_io)
        .await?;

    let mut driver = JoinSet::new();
    let session_id = ctx.session_id;
    driver.spawn(async move {
        if let Err(e) = connection.await {
            debug!(session_id, error = %e, "HTTP/2 origin connection ended");
        }
    });

    let mut client = h2::server::Builder::new()
        .initial_window_size(config.initial_window_size)
        .initial_connection_window_size(config.initial_connection_window_size)
        .max_concurrent_streams(config.max_concurrent_streams)
        .max_frame_size(config.max_frame_size)
        .handshake::<_, Bytes>(client_io)
        .await?;

    debug!(session_id, "HTTP/2 handshakes complete");

    let mut streams = JoinSet::new();
    let mut stream_count = 0u64;
    let mut outcome = Ok(());

    while let Some(accepted) = client.accept().await {
        match accepted {
            Ok((request, respond)) => {
                stream_count += 1;
                let origin = origin.clone();
                let ctx = ctx.clone();
                streams.spawn(async move {
                    if let Err(e) = proxy_stream(request, respond, origin, &ctx).await {
                        debug!(session_id = ctx.session_id, error = %e, "HTTP/2 stream aborted");
                    }
                });
            }
            Err(e) if e.reason() == Some(h2::Reason::NO_ERROR) => {
                debug!(session_id, "HTTP/2 client sent GOAWAY");
                break;
            }
            Err(e) => {
                warn!(session_id, error = %e, "HTTP/2 client connection error");
                outcome = Err(e.into());
                break;
            }
        }
        // Reap finished streams so the set does not grow with the connection
        while streams.try_join_next().is_some() {}
    }

    drop(origin);
    while streams.join_next().await.is_some() {}
    driver.join_next().await;

    info!(
        session_id,
        target_host = %ctx.target.host(),
        stream_count,
        "HTTP/2 connection closed"
    );
    outcome
}

async fn proxy_stream(
    request: Request<RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    origin: h2::client::SendRequest<Bytes>,
    ctx: &InterceptContext,
) -> std::result::Result<(), h2::Error> {
    let clock = ExchangeClock::start();
    let (parts, request_body) = request.into_parts();
    let request_headers = request_headers(&parts, ctx.tls);

    debug!(
        session_id = ctx.session_id,
        method = %parts.method,
        path = request_headers.path(),
        "HTTP/2 request"
    );

    let request_ended = request_body.is_end_stream();
    let mut origin = origin.ready().await?;
    let (response_future, origin_send) =
        origin.send_request(Request::from_parts(parts, ()), request_ended)?;

    // Request body flows concurrently with the response head
    let capture_limit = ctx.max_body_capture;
    let request_task = tokio::spawn(async move {
        if request_ended {
            Ok(CapturedBody::empty())
        } else {
            forward_body(request_body, origin_send, capture_limit).await
        }
    });

    let response = match response_future.await {
        Ok(response) => response,
        Err(e) => {
            request_task.abort();
            ctx.deliver_exchange(
                clock,
                RequestHeaders::Http2(request_headers),
                CapturedBody::empty(),
                None,
                CapturedBody::empty(),
            );
            respond.send_reset(e.reason().unwrap_or(h2::Reason::INTERNAL_ERROR));
            return Err(e);
        }
    };

    let (parts, response_body) = response.into_parts();
    let response_headers =
        Http2ResponseHeaders::new(parts.status.as_u16(), collect_headers(&parts.headers));

    let response_ended = response_body.is_end_stream();
    let client_send = respond.send_response(Response::from_parts(parts, ()), response_ended)?;
    let response_captured = if response_ended {
        CapturedBody::empty()
    } else {
        forward_body(response_body, client_send, ctx.max_body_capture).await?
    };

    let request_captured = match request_task.await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            debug!(session_id = ctx.session_id, error = %e, "HTTP/2 request body aborted");
            CapturedBody::empty()
        }
        Err(_) => CapturedBody::empty(),
    };

    ctx.deliver_exchange(
        clock,
        RequestHeaders::Http2(request_headers),
        request_captured,
        Some(ResponseHeaders::Http2(response_headers)),
        response_captured,
    );
    Ok(())
}

/// Copy DATA frames and trailers from `recv` to `send`, capturing the payload
async fn forward_body(
    mut recv: RecvStream,
    mut send: SendStream<Bytes>,
    capture_limit: usize,
) -> std::result::Result<CapturedBody, h2::Error> {
    let mut capture = BodyCapture::new(capture_limit);

    while let Some(chunk) = recv.data().await {
        let chunk = chunk?;
        let len = chunk.len();
        capture.push(&chunk);
        send_with_capacity(&mut send, chunk).await?;
        recv.flow_control().release_capacity(len)?;
    }

    match recv.trailers().await? {
        Some(trailers) => send.send_trailers(trailers)?,
        None => send.send_data(Bytes::new(), true)?,
    }
    Ok(capture.finish())
}

/// Send `data` in pieces no larger than the window the peer has granted
async fn send_with_capacity(
    send: &mut SendStream<Bytes>,
    mut data: Bytes,
) -> std::result::Result<(), h2::Error> {
    while !data.is_empty() {
        send.reserve_capacity(data.len());
        let granted = match poll_fn(|cx| send.poll_capacity(cx)).await {
            Some(granted) => granted?,
            None => return Err(h2::Reason::CANCEL.into()),
        };
        if granted == 0 {
            continue;
        }
        let piece = data.split_to(granted.min(data.len()));
        send.send_data(piece, false)?;
    }
    Ok(())
}

fn request_headers(parts: &http::request::Parts, tls: bool) -> Http2RequestHeaders {
    let default_scheme = if tls { "https" } else { "http" };
    let scheme = parts.uri.scheme_str().unwrap_or(default_scheme);
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let authority = parts
        .uri
        .authority()
        .map(|a| a.as_str())
        .unwrap_or_default();

    Http2RequestHeaders::with_authority(
        collect_headers(&parts.headers),
        scheme,
        parts.method.as_str(),
        path,
        authority,
    )
}

fn collect_headers(headers: &HeaderMap) -> Vec<Header> {
    headers
        .iter()
        .map(|(name, value)| {
            Header::new(name.as_str(), String::from_utf8_lossy(value.as_bytes()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http2_config_defaults() {
        let config = Http2Config::default();

        assert_eq!(config.initial_window_size, 65535);
        assert_eq!(config.initial_connection_window_size, 1_048_576);
        assert_eq!(config.max_concurrent_streams, 100);
        assert_eq!(config.max_frame_size, 16384);
        assert!(!config.enable_server_push);
    }

    #[test]
    fn test_request_headers_from_parts() {
        let request = Request::builder()
            .method("POST")
            .uri("https://example.com/upload?x=1")
            .header("cookie", "a=1; b=2")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();

        let headers = request_headers(&parts, true);
        assert_eq!(headers.scheme(), "https");
        assert_eq!(headers.method(), "POST");
        assert_eq!(headers.path(), "/upload?x=1");
        assert_eq!(headers.authority(), "example.com");
        assert_eq!(headers.cookie_values().len(), 2);
    }

    #[test]
    fn test_request_headers_default_scheme_and_path() {
        let request = Request::builder().uri("*").body(()).unwrap();
        let (parts, _) = request.into_parts();

        let headers = request_headers(&parts, false);
        assert_eq!(headers.scheme(), "http");
        assert_eq!(headers.authority(), "");
    }
}
