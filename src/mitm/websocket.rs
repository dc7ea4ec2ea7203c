//! WebSocket relay after an accepted upgrade
//!
//! Frames are relayed byte for byte. Only the frame header is parsed (through
//! tungstenite's `FrameHeader`), so extension bits, masks and fragmentation
//! reach the peer exactly as they were sent. Payloads are unmasked on a copy
//! for listener notices only. Bytes already read past the 101 response seed
//! the frame readers so frames that arrived with the handshake are not lost.

use super::http1::HttpConn;
use super::InterceptContext;
use crate::error::{ProxyError, Result};
use crate::listener::{Direction, MessageKind, WebSocketMessage};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Control, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::FrameHeader;
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

/// How long the opposite direction may keep running once one side is done,
/// so a Close reply still reaches its peer
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Relay frames between an upgraded client and origin until both sides have
/// finished or the close grace period runs out
pub async fn relay_websocket<C, O>(
    client: HttpConn<C>,
    origin: HttpConn<O>,
    ctx: &InterceptContext,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (client_io, client_buf) = client.into_parts();
    let (origin_io, origin_buf) = origin.into_parts();
    debug!(
        session_id = ctx.session_id,
        client_buffered = client_buf.len(),
        origin_buffered = origin_buf.len(),
        "Switching to WebSocket framing"
    );

    let (client_read, client_write) = tokio::io::split(client_io);
    let (origin_read, origin_write) = tokio::io::split(origin_io);

    let upstream = relay_direction(
        FrameReader::new(client_read, client_buf),
        origin_write,
        Direction::ClientToServer,
        ctx,
    );
    let downstream = relay_direction(
        FrameReader::new(origin_read, origin_buf),
        client_write,
        Direction::ServerToClient,
        ctx,
    );
    tokio::pin!(upstream);
    tokio::pin!(downstream);

    let first = tokio::select! {
        end = &mut upstream => First::Upstream(end),
        end = &mut downstream => First::Downstream(end),
    };
    let result = match first {
        First::Upstream(end) => settle(end, downstream, ctx).await,
        First::Downstream(end) => settle(end, upstream, ctx).await,
    };

    debug!(session_id = ctx.session_id, ok = result.is_ok(), "WebSocket relay finished");
    result
}

enum First {
    Upstream(Result<DirectionEnd>),
    Downstream(Result<DirectionEnd>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionEnd {
    /// A Close frame was forwarded
    Closed,
    /// The sender hung up between frames
    Eof,
}

async fn settle<F>(
    first: Result<DirectionEnd>,
    other: Pin<&mut F>,
    ctx: &InterceptContext,
) -> Result<()>
where
    F: Future<Output = Result<DirectionEnd>>,
{
    let end = first?;
    match tokio::time::timeout(CLOSE_GRACE, other).await {
        Ok(other_end) => other_end.map(|_| ()),
        Err(_) => {
            debug!(
                session_id = ctx.session_id,
                ?end,
                "WebSocket peer did not finish within the close grace period"
            );
            Ok(())
        }
    }
}

async fn relay_direction<R, W>(
    mut reader: FrameReader<R>,
    mut sink: W,
    direction: Direction,
    ctx: &InterceptContext,
) -> Result<DirectionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut assembler = MessageAssembler::new(ctx.max_body_capture);
    while let Some(frame) = reader.next_frame(ctx.ws_max_frame_size).await? {
        sink.write_all(&frame.head).await?;
        sink.write_all(&frame.payload).await?;
        sink.flush().await?;

        let closing = frame.header.opcode == OpCode::Control(Control::Close);
        if let Some((kind, payload)) = assembler.push(&frame) {
            notify(ctx, direction, kind, payload);
        }
        if closing {
            return Ok(DirectionEnd::Closed);
        }
    }
    // Peer may already be gone
    let _ = sink.shutdown().await;
    Ok(DirectionEnd::Eof)
}

/// One frame as it appeared on the wire
struct RawFrame {
    header: FrameHeader,
    /// Header bytes including extended length and mask
    head: Bytes,
    /// Payload bytes, still masked when the header carries a mask
    payload: Bytes,
}

struct FrameReader<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(io: R, buffered: Bytes) -> Self {
        let mut buf = BytesMut::with_capacity(READ_CHUNK.max(buffered.len()));
        buf.extend_from_slice(&buffered);
        Self { io, buf }
    }

    /// Next complete frame, or `None` when the stream ends between frames
    async fn next_frame(&mut self, max_frame_size: usize) -> Result<Option<RawFrame>> {
        loop {
            if let Some(frame) = self.split_frame(max_frame_size)? {
                return Ok(Some(frame));
            }
            self.buf.reserve(READ_CHUNK);
            if self.io.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Closed("WebSocket frame truncated"));
            }
        }
    }

    fn split_frame(&mut self, max_frame_size: usize) -> Result<Option<RawFrame>> {
        let mut cursor = Cursor::new(&self.buf[..]);
        let (header, payload_len) = match FrameHeader::parse(&mut cursor) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(None),
            Err(e) => return Err(ProxyError::mismatch(format!("invalid WebSocket frame: {e}"))),
        };
        let head_len = cursor.position() as usize;

        if payload_len > max_frame_size as u64 {
            return Err(ProxyError::mismatch(format!(
                "WebSocket frame of {payload_len} bytes exceeds limit of {max_frame_size}"
            )));
        }
        let payload_len = payload_len as usize;
        if self.buf.len() < head_len + payload_len {
            return Ok(None);
        }

        let head = self.buf.split_to(head_len).freeze();
        let payload = self.buf.split_to(payload_len).freeze();
        Ok(Some(RawFrame {
            header,
            head,
            payload,
        }))
    }
}

/// Joins fragmented data messages for notices; control frames pass straight
/// through
struct MessageAssembler {
    capture_limit: usize,
    kind: Option<MessageKind>,
    parts: BytesMut,
}

impl MessageAssembler {
    fn new(capture_limit: usize) -> Self {
        Self {
            capture_limit,
            kind: None,
            parts: BytesMut::new(),
        }
    }

    fn push(&mut self, frame: &RawFrame) -> Option<(MessageKind, Bytes)> {
        let data = unmask(&frame.payload, frame.header.mask);
        let kind = match frame.header.opcode {
            OpCode::Control(Control::Close) => return Some((MessageKind::Close, data)),
            OpCode::Control(Control::Ping) => return Some((MessageKind::Ping, data)),
            OpCode::Control(Control::Pong) => return Some((MessageKind::Pong, data)),
            OpCode::Data(Data::Text) => MessageKind::Text,
            OpCode::Data(Data::Binary) => MessageKind::Binary,
            OpCode::Data(Data::Continue) => match self.kind {
                Some(kind) => kind,
                None => return None,
            },
            OpCode::Control(Control::Reserved(_)) | OpCode::Data(Data::Reserved(_)) => return None,
        };

        if frame.header.opcode != OpCode::Data(Data::Continue) {
            self.parts.clear();
        }
        self.kind = Some(kind);
        let room = self.capture_limit.saturating_sub(self.parts.len());
        self.parts.extend_from_slice(&data[..data.len().min(room)]);

        if !frame.header.is_final {
            return None;
        }
        self.kind = None;
        Some((kind, self.parts.split().freeze()))
    }
}

fn unmask(payload: &Bytes, mask: Option<[u8; 4]>) -> Bytes {
    match mask {
        None => payload.clone(),
        Some(mask) => payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % 4])
            .collect::<Vec<u8>>()
            .into(),
    }
}

fn notify(ctx: &InterceptContext, direction: Direction, kind: MessageKind, payload: Bytes) {
    ctx.listener.websocket_message(WebSocketMessage {
        session_id: ctx.session_id,
        target: ctx.target.clone(),
        direction,
        kind,
        payload,
        timestamp: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{Exchange, ListenerHandle, MessageListener};
    use crate::net_address::NetAddress;
    use std::sync::Arc;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<WebSocketMessage>);

    impl MessageListener for Recorder {
        fn on_exchange(&self, _exchange: Exchange) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_websocket_message(&self, message: WebSocketMessage) -> anyhow::Result<()> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    fn context() -> (InterceptContext, mpsc::UnboundedReceiver<WebSocketMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = InterceptContext {
            session_id: 7,
            target: NetAddress::new("chat.test", 443),
            tls: true,
            listener: ListenerHandle::spawn(Arc::new(Recorder(tx)), 64),
            max_head_size: 64 * 1024,
            max_body_capture: 1024,
            ws_max_frame_size: 1024,
        };
        (ctx, rx)
    }

    fn masked_frame(first: u8, mask: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![first, 0x80 | payload.len() as u8];
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        frame
    }

    #[tokio::test]
    async fn test_extension_bits_pass_through_unchanged() {
        let (ctx, mut notices) = context();
        let (mut client, client_side) = duplex(4096);
        let (origin_side, mut origin) = duplex(4096);

        let relay = tokio::spawn(async move {
            relay_websocket(HttpConn::new(client_side), HttpConn::new(origin_side), &ctx).await
        });

        // FIN | RSV1 | text, as sent with permessage-deflate
        let frame = masked_frame(0xC1, [1, 2, 3, 4], &[0xf2, 0x48, 0x05]);
        client.write_all(&frame).await.unwrap();

        let mut received = vec![0u8; frame.len()];
        origin.read_exact(&mut received).await.unwrap();
        assert_eq!(received, frame);

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.direction, Direction::ClientToServer);
        assert_eq!(notice.kind, MessageKind::Text);
        assert_eq!(&notice.payload[..], &[0xf2, 0x48, 0x05]);

        drop(client);
        drop(origin);
        assert!(relay.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fragmented_message_is_reported_once() {
        let (ctx, mut notices) = context();
        let (mut client, client_side) = duplex(4096);
        let (origin_side, mut origin) = duplex(4096);

        let relay = tokio::spawn(async move {
            relay_websocket(HttpConn::new(client_side), HttpConn::new(origin_side), &ctx).await
        });

        // Text without FIN, a ping in between, then the final continuation
        let mut wire = vec![0x01, 0x03];
        wire.extend_from_slice(b"hel");
        wire.extend_from_slice(&[0x89, 0x00]);
        wire.extend_from_slice(&[0x80, 0x02]);
        wire.extend_from_slice(b"lo");
        origin.write_all(&wire).await.unwrap();

        let mut received = vec![0u8; wire.len()];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, wire);

        let ping = notices.recv().await.unwrap();
        assert_eq!(ping.kind, MessageKind::Ping);
        let text = notices.recv().await.unwrap();
        assert_eq!(text.direction, Direction::ServerToClient);
        assert_eq!(text.kind, MessageKind::Text);
        assert_eq!(&text.payload[..], b"hello");

        drop(client);
        drop(origin);
        assert!(relay.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_reply_reaches_the_initiator() {
        let (ctx, mut notices) = context();
        let (mut client, client_side) = duplex(4096);
        let (origin_side, mut origin) = duplex(4096);

        let relay = tokio::spawn(async move {
            relay_websocket(HttpConn::new(client_side), HttpConn::new(origin_side), &ctx).await
        });

        let close = masked_frame(0x88, [9, 9, 9, 9], &[0x03, 0xe8]);
        client.write_all(&close).await.unwrap();
        let mut received = vec![0u8; close.len()];
        origin.read_exact(&mut received).await.unwrap();

        origin.write_all(&[0x88, 0x02, 0x03, 0xe8]).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x88, 0x02, 0x03, 0xe8]);

        assert!(relay.await.unwrap().is_ok());

        let first = notices.recv().await.unwrap();
        assert_eq!(first.kind, MessageKind::Close);
        assert_eq!(&first.payload[..], &[0x03, 0xe8]);
        let second = notices.recv().await.unwrap();
        assert_eq!(second.direction, Direction::ServerToClient);
        assert_eq!(second.kind, MessageKind::Close);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (ctx, _notices) = context();
        let (mut client, client_side) = duplex(4096);
        let (origin_side, _origin) = duplex(4096);

        let relay = tokio::spawn(async move {
            relay_websocket(HttpConn::new(client_side), HttpConn::new(origin_side), &ctx).await
        });

        client.write_all(&[0x82, 0x7e, 0x00]).await.unwrap();
        drop(client);

        let err = relay.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "closed");
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (ctx, _notices) = context();
        let (mut client, client_side) = duplex(4096);
        let (origin_side, _origin) = duplex(4096);

        let relay = tokio::spawn(async move {
            relay_websocket(HttpConn::new(client_side), HttpConn::new(origin_side), &ctx).await
        });

        // 127 marks a 64-bit length
        let mut header = vec![0x82, 0x7f];
        header.extend_from_slice(&(1u64 << 20).to_be_bytes());
        client.write_all(&header).await.unwrap();

        let err = relay.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "protocol_mismatch");
    }

    #[test]
    fn test_unmask_restores_payload() {
        let mask = [0x11, 0x22, 0x33, 0x44];
        let masked: Bytes = b"hi".iter().enumerate().map(|(i, b)| b ^ mask[i % 4]).collect();
        assert_eq!(&unmask(&masked, Some(mask))[..], b"hi");
        assert_eq!(&unmask(&Bytes::from_static(b"hi"), None)[..], b"hi");
    }
}
