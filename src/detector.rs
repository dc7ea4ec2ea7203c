//! Protocol detection on freshly tunneled streams
//!
//! Matchers are evaluated in registration order against the bytes buffered so
//! far. A matcher that cannot decide yet blocks every matcher after it, so a
//! later, looser matcher never steals a stream that an earlier one would have
//! claimed with one more byte. The bytes read for classification are handed
//! back through [`Rewind`] so nothing is lost for the next stage.

use crate::error::{ProxyError, Result};
use crate::rewind::Rewind;
use bytes::BytesMut;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// TLS record type for handshake messages
const TLS_HANDSHAKE: u8 = 0x16;
/// Major version byte shared by SSL 3.0 and every TLS version
const TLS_MAJOR_VERSION: u8 = 0x03;

/// Protocol a matcher wires the stream to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    Tls,
    /// Anything else; handed to the plaintext HTTP interceptor
    Plaintext,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tls => f.write_str("tls"),
            Protocol::Plaintext => f.write_str("plaintext"),
        }
    }
}

/// Verdict of a single matcher over the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Match,
    Mismatch,
    /// Window too short to decide
    NeedMore,
}

pub trait ProtocolMatcher: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn matches(&self, window: &[u8]) -> MatchResult;

    /// Catch-all matchers accept every non-empty window
    fn is_catch_all(&self) -> bool {
        false
    }
}

/// Recognizes a TLS handshake record by its first two bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsMatcher;

impl ProtocolMatcher for TlsMatcher {
    fn protocol(&self) -> Protocol {
        Protocol::Tls
    }

    fn matches(&self, window: &[u8]) -> MatchResult {
        match window {
            [] => MatchResult::NeedMore,
            [first, ..] if *first != TLS_HANDSHAKE => MatchResult::Mismatch,
            [_] => MatchResult::NeedMore,
            [_, major, ..] if *major == TLS_MAJOR_VERSION => MatchResult::Match,
            _ => MatchResult::Mismatch,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AnyMatcher;

impl ProtocolMatcher for AnyMatcher {
    fn protocol(&self) -> Protocol {
        Protocol::Plaintext
    }

    fn matches(&self, window: &[u8]) -> MatchResult {
        if window.is_empty() {
            MatchResult::NeedMore
        } else {
            MatchResult::Match
        }
    }

    fn is_catch_all(&self) -> bool {
        true
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetectorError {
    #[error("Detector needs at least one matcher")]
    Empty,

    #[error("Last matcher must be a catch-all")]
    MissingCatchAll,
}

/// Outcome of classifying a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Matched(Protocol),
    NeedMore,
    /// Stream ended before any byte arrived
    Closed,
}

pub struct Detector {
    matchers: Vec<Box<dyn ProtocolMatcher>>,
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocols: Vec<Protocol> = self.matchers.iter().map(|m| m.protocol()).collect();
        f.debug_struct("Detector")
            .field("matchers", &protocols)
            .finish()
    }
}

impl Default for Detector {
    /// TLS first, catch-all last
    fn default() -> Self {
        Self {
            matchers: vec![Box::new(TlsMatcher), Box::new(AnyMatcher)],
        }
    }
}

impl Detector {
    pub fn new(
        matchers: Vec<Box<dyn ProtocolMatcher>>,
    ) -> std::result::Result<Self, DetectorError> {
        let last = matchers.last().ok_or(DetectorError::Empty)?;
        if !last.is_catch_all() {
            return Err(DetectorError::MissingCatchAll);
        }
        Ok(Self { matchers })
    }

    /// Classify the bytes seen so far
    ///
    /// At EOF an undecided matcher counts as a mismatch, so a short stream
    /// still reaches the catch-all.
    pub fn classify(&self, window: &[u8], eof: bool) -> Classification {
        if window.is_empty() {
            return if eof {
                Classification::Closed
            } else {
                Classification::NeedMore
            };
        }

        for matcher in &self.matchers {
            match matcher.matches(window) {
                MatchResult::Match => return Classification::Matched(matcher.protocol()),
                MatchResult::Mismatch => continue,
                MatchResult::NeedMore if eof => continue,
                MatchResult::NeedMore => return Classification::NeedMore,
            }
        }

        // Unreachable with a catch-all in place
        Classification::NeedMore
    }

    /// Read until a matcher decides, returning the protocol and the stream
    /// with every byte read so far queued for replay
    pub async fn detect<S>(&self, mut stream: S) -> Result<(Protocol, Rewind<S>)>
    where
        S: AsyncRead + Unpin,
    {
        let mut window = BytesMut::with_capacity(512);
        let mut eof = false;

        loop {
            match self.classify(&window, eof) {
                Classification::Matched(protocol) => {
                    debug!(protocol = %protocol, peeked = window.len(), "Protocol detected");
                    return Ok((protocol, Rewind::new_buffered(stream, window.freeze())));
                }
                Classification::Closed => {
                    return Err(ProxyError::Closed("stream ended before protocol detection"))
                }
                Classification::NeedMore => {
                    if stream.read_buf(&mut window).await? == 0 {
                        eof = true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_construction_requires_catch_all() {
        assert_eq!(Detector::new(vec![]).unwrap_err(), DetectorError::Empty);
        assert_eq!(
            Detector::new(vec![Box::new(TlsMatcher)]).unwrap_err(),
            DetectorError::MissingCatchAll
        );
        assert_eq!(
            Detector::new(vec![Box::new(AnyMatcher), Box::new(TlsMatcher)]).unwrap_err(),
            DetectorError::MissingCatchAll
        );
        assert!(Detector::new(vec![Box::new(TlsMatcher), Box::new(AnyMatcher)]).is_ok());
    }

    #[test]
    fn test_single_handshake_byte_waits() {
        let detector = Detector::default();
        assert_eq!(detector.classify(&[0x16], false), Classification::NeedMore);
        assert_eq!(
            detector.classify(&[0x16], true),
            Classification::Matched(Protocol::Plaintext)
        );
    }

    #[test]
    fn test_non_handshake_byte_decides_immediately() {
        let detector = Detector::default();
        assert_eq!(
            detector.classify(b"G", false),
            Classification::Matched(Protocol::Plaintext)
        );
    }

    #[test]
    fn test_empty_window() {
        let detector = Detector::default();
        assert_eq!(detector.classify(&[], false), Classification::NeedMore);
        assert_eq!(detector.classify(&[], true), Classification::Closed);
    }

    #[tokio::test]
    async fn test_detect_replays_peeked_bytes() {
        let (mut remote, local) = tokio::io::duplex(64);
        remote.write_all(&[0x16]).await.unwrap();

        let detector = Detector::default();
        let pending = tokio::spawn(async move { detector.detect(local).await });

        tokio::task::yield_now().await;
        remote.write_all(&[0x03, 0x01, 0x00]).await.unwrap();

        let (protocol, stream) = pending.await.unwrap().unwrap();
        assert_eq!(protocol, Protocol::Tls);
        assert_eq!(stream.pending()[..2], [0x16, 0x03]);
    }

    #[tokio::test]
    async fn test_detect_closed_before_any_byte() {
        let (remote, local) = tokio::io::duplex(64);
        drop(remote);
        let result = Detector::default().detect(local).await;
        assert!(matches!(result, Err(ProxyError::Closed(_))));
    }
}
