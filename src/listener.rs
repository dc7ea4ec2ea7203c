//! Capture delivery
//!
//! Interceptors hand finished exchanges, WebSocket messages and session
//! lifecycle notices to a [`ListenerHandle`]. The handle queues them on a
//! bounded channel drained by a dedicated task, so a slow or failing listener
//! never stalls proxying: a full queue drops the notice with a warning, and
//! listener errors or panics are logged and swallowed.

use crate::headers::{HeaderSet, RequestHeaders, ResponseHeaders};
use crate::net_address::NetAddress;
use crate::pipeline::Pipeline;
use crate::relay::RelayStats;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

/// A message body captured up to a size limit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedBody {
    pub data: Bytes,
    /// Payload length seen on the wire, including bytes past the limit
    pub total_len: u64,
    pub truncated: bool,
}

impl CapturedBody {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }
}

/// Accumulates body bytes without exceeding `limit`
#[derive(Debug)]
pub struct BodyCapture {
    buf: BytesMut,
    limit: usize,
    total_len: u64,
}

impl BodyCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
            total_len: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total_len += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&chunk[..room.min(chunk.len())]);
    }

    pub fn finish(self) -> CapturedBody {
        CapturedBody {
            truncated: self.total_len > self.buf.len() as u64,
            data: self.buf.freeze(),
            total_len: self.total_len,
        }
    }
}

/// One request paired with its response
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    pub session_id: u64,
    pub target: NetAddress,
    /// Whether the exchange travelled inside an intercepted TLS session
    pub tls: bool,
    pub request: RequestHeaders,
    pub request_body: CapturedBody,
    /// `None` when the origin went away before answering
    pub response: Option<ResponseHeaders>,
    pub response_body: CapturedBody,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebSocketMessage {
    pub session_id: u64,
    pub target: NetAddress,
    pub direction: Direction,
    pub kind: MessageKind,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Session lifecycle notices
#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    Established {
        session_id: u64,
        target: NetAddress,
        intercepted: bool,
    },
    Failed {
        session_id: u64,
        target: NetAddress,
        kind: &'static str,
        message: String,
    },
    Closed {
        session_id: u64,
        target: NetAddress,
        tls: bool,
        bytes: RelayStats,
        duration: Duration,
        client_pipeline: Pipeline,
        origin_pipeline: Pipeline,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> u64 {
        match self {
            SessionEvent::Established { session_id, .. }
            | SessionEvent::Failed { session_id, .. }
            | SessionEvent::Closed { session_id, .. } => *session_id,
        }
    }
}

/// Consumer of intercepted traffic
///
/// Calls happen on the dispatcher task, one at a time, in delivery order.
pub trait MessageListener: Send + Sync + 'static {
    fn on_exchange(&self, exchange: Exchange) -> anyhow::Result<()>;

    fn on_websocket_message(&self, _message: WebSocketMessage) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_session_event(&self, _event: SessionEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum Notice {
    Exchange(Box<Exchange>),
    WebSocket(WebSocketMessage),
    Session(SessionEvent),
}

impl Notice {
    fn label(&self) -> &'static str {
        match self {
            Notice::Exchange(_) => "exchange",
            Notice::WebSocket(_) => "websocket_message",
            Notice::Session(_) => "session_event",
        }
    }
}

/// Cloneable sender side of the listener queue
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    tx: mpsc::Sender<Notice>,
}

impl ListenerHandle {
    /// Start the dispatcher task; must be called inside a tokio runtime
    pub fn spawn(listener: Arc<dyn MessageListener>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Notice>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                dispatch(listener.as_ref(), notice);
            }
            debug!("Listener dispatcher stopped");
        });

        Self { tx }
    }

    pub fn exchange(&self, exchange: Exchange) {
        self.enqueue(Notice::Exchange(Box::new(exchange)));
    }

    pub fn websocket_message(&self, message: WebSocketMessage) {
        self.enqueue(Notice::WebSocket(message));
    }

    pub fn session_event(&self, event: SessionEvent) {
        self.enqueue(Notice::Session(event));
    }

    fn enqueue(&self, notice: Notice) {
        let label = notice.label();
        match self.tx.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(notice = label, "Listener queue full, dropping notice");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(notice = label, "Listener dispatcher gone, dropping notice");
            }
        }
    }
}

fn dispatch(listener: &dyn MessageListener, notice: Notice) {
    let label = notice.label();
    let outcome = catch_unwind(AssertUnwindSafe(|| match notice {
        Notice::Exchange(exchange) => listener.on_exchange(*exchange),
        Notice::WebSocket(message) => listener.on_websocket_message(message),
        Notice::Session(event) => listener.on_session_event(event),
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(notice = label, error = %e, "Listener returned an error"),
        Err(_) => error!(notice = label, "Listener panicked"),
    }
}

/// Logs every notice through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl MessageListener for TracingListener {
    fn on_exchange(&self, exchange: Exchange) -> anyhow::Result<()> {
        info!(
            session_id = exchange.session_id,
            target = %exchange.target,
            tls = exchange.tls,
            method = exchange.request.method(),
            path = exchange.request.path(),
            version = exchange.request.version(),
            status = exchange.response.as_ref().map(|r| r.status()),
            request_bytes = exchange.request_body.total_len,
            response_bytes = exchange.response_body.total_len,
            duration_ms = exchange.duration.as_millis() as u64,
            "Exchange captured"
        );
        Ok(())
    }

    fn on_websocket_message(&self, message: WebSocketMessage) -> anyhow::Result<()> {
        debug!(
            session_id = message.session_id,
            target = %message.target,
            direction = ?message.direction,
            kind = ?message.kind,
            len = message.payload.len(),
            "WebSocket message"
        );
        Ok(())
    }

    fn on_session_event(&self, event: SessionEvent) -> anyhow::Result<()> {
        match event {
            SessionEvent::Established {
                session_id,
                target,
                intercepted,
            } => info!(session_id, target = %target, intercepted, "Session established"),
            SessionEvent::Failed {
                session_id,
                target,
                kind,
                message,
            } => warn!(session_id, target = %target, kind, error = %message, "Session failed"),
            SessionEvent::Closed {
                session_id,
                target,
                tls,
                bytes,
                duration,
                client_pipeline,
                ..
            } => info!(
                session_id,
                target = %target,
                tls,
                client_to_origin = bytes.client_to_origin,
                origin_to_client = bytes.origin_to_client,
                duration_ms = duration.as_millis() as u64,
                pipeline = %client_pipeline,
                "Session closed"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;
    use std::sync::Mutex;

    #[test]
    fn test_body_capture_truncates() {
        let mut capture = BodyCapture::new(4);
        capture.push(b"abc");
        capture.push(b"defg");
        let body = capture.finish();
        assert_eq!(&body.data[..], b"abcd");
        assert_eq!(body.total_len, 7);
        assert!(body.truncated);

        let body = BodyCapture::new(4).finish();
        assert!(body.is_empty());
        assert!(!body.truncated);
    }

    #[test]
    fn test_session_event_json_shape() {
        let event = SessionEvent::Closed {
            session_id: 7,
            target: NetAddress::new("example.com", 443),
            tls: true,
            bytes: RelayStats {
                client_to_origin: 10,
                origin_to_client: 20,
            },
            duration: Duration::from_millis(1500),
            client_pipeline: Pipeline::with_stages([Stage::TlsBridge, Stage::Relay]),
            origin_pipeline: Pipeline::new(),
        };

        let json = serde_json::to_value(&event).unwrap();
        let closed = &json["Closed"];
        assert_eq!(closed["session_id"], 7);
        assert_eq!(closed["tls"], true);
        assert_eq!(closed["bytes"]["origin_to_client"], 20);
        assert_eq!(closed["client_pipeline"]["stages"][0], "TlsBridge");
    }

    struct FlakyListener {
        seen: Mutex<Vec<u64>>,
    }

    impl MessageListener for FlakyListener {
        fn on_exchange(&self, _exchange: Exchange) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_session_event(&self, event: SessionEvent) -> anyhow::Result<()> {
            let id = event.session_id();
            self.seen.lock().unwrap().push(id);
            match id {
                1 => panic!("listener bug"),
                2 => anyhow::bail!("listener failure"),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_faults_are_isolated() {
        let listener = Arc::new(FlakyListener {
            seen: Mutex::new(Vec::new()),
        });
        let handle = ListenerHandle::spawn(listener.clone(), 8);

        for session_id in 1..=3 {
            handle.session_event(SessionEvent::Established {
                session_id,
                target: NetAddress::new("example.com", 443),
                intercepted: true,
            });
        }

        for _ in 0..50 {
            if listener.seen.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*listener.seen.lock().unwrap(), vec![1, 2, 3]);
    }
}
