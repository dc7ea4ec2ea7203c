//! Per-side handler chains
//!
//! A session owns one `Pipeline` for the client-facing connection and one for
//! the origin connection. Stages are plain tags; the session task is the only
//! place that mutates them, which `&mut` access enforces.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HttpVersion {
    Http1,
    Http2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    Detector,
    TlsBridge,
    HttpCodec(HttpVersion),
    WebSocketCodec,
    Relay,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Detector => f.write_str("detector"),
            Stage::TlsBridge => f.write_str("tls"),
            Stage::HttpCodec(HttpVersion::Http1) => f.write_str("http/1.1"),
            Stage::HttpCodec(HttpVersion::Http2) => f.write_str("h2"),
            Stage::WebSocketCodec => f.write_str("websocket"),
            Stage::Relay => f.write_str("relay"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stages(stages: impl IntoIterator<Item = Stage>) -> Self {
        Self {
            stages: stages.into_iter().collect(),
        }
    }

    pub fn add_last(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Remove the first occurrence of `stage`, returning whether it was present
    pub fn remove(&mut self, stage: Stage) -> bool {
        match self.position(stage) {
            Some(idx) => {
                self.stages.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Swap `old` for `new` at the same position
    pub fn replace(&mut self, old: Stage, new: Stage) -> bool {
        match self.position(old) {
            Some(idx) => {
                self.stages[idx] = new;
                true
            }
            None => false,
        }
    }

    /// Replace any HTTP codec stage
    pub fn replace_http_codec(&mut self, new: Stage) -> bool {
        match self
            .stages
            .iter()
            .position(|s| matches!(s, Stage::HttpCodec(_)))
        {
            Some(idx) => {
                self.stages[idx] = new;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.position(stage).is_some()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn position(&self, stage: Stage) -> Option<usize> {
        self.stages.iter().position(|s| *s == stage)
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" > ")?;
            }
            write!(f, "{}", stage)?;
        }
        Ok(())
    }
}
