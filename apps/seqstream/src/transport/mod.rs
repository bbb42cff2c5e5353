use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use seqstream_proto::WireRecord;
use thiserror::Error;

use crate::context::{ContextId, ServerCounters};
use crate::reconcile::UploadOutcome;
use crate::record::Record;

pub mod http;
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

pub use http::HttpTransport;
pub use websocket::WebSocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    WebSocket,
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::WebSocket => "websocket",
        }
    }
}

/// Server request to back off before retrying, with whatever progress
/// counters came along with it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySignal {
    pub retry_after_seconds: f64,
    pub pending_bytes: Option<u64>,
    pub records_processed: Option<u64>,
}

impl RetrySignal {
    pub fn new(retry_after_seconds: f64) -> Self {
        Self {
            retry_after_seconds,
            pending_bytes: None,
            records_processed: None,
        }
    }

    pub fn with_counters(mut self, pending_bytes: Option<u64>, records_processed: Option<u64>) -> Self {
        self.pending_bytes = pending_bytes;
        self.records_processed = records_processed;
        self
    }

    /// Negative and NaN delays collapse to zero; delays too large for a
    /// `Duration` saturate.
    pub fn delay(&self) -> Duration {
        let seconds = self.retry_after_seconds;
        if seconds.is_nan() || seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    pub fn counters(&self) -> ServerCounters {
        ServerCounters::new(self.pending_bytes, self.records_processed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Accepted(ServerCounters),
    Overload(RetrySignal),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed(UploadOutcome),
    StillWorking(RetrySignal),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("chunk rejected as larger than the server buffer: {0}")]
    PayloadTooLarge(String),
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("connection closed")]
    ConnectionClosed,
}

/// Open/send/close capability shared by every concrete transport.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open_context(&self, filenames: &[String]) -> Result<ContextId, TransportError>;

    async fn send_batch(
        &self,
        context: &ContextId,
        batch: &[Record],
    ) -> Result<SendOutcome, TransportError>;

    async fn close_context(&self, context: &ContextId) -> Result<CloseOutcome, TransportError>;
}

pub(crate) fn wire_batch(batch: &[Record]) -> Vec<WireRecord> {
    batch.iter().map(Record::to_wire).collect()
}
