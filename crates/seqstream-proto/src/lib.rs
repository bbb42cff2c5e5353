//! Wire definitions shared by the seqstream client and the read-filter API.
//! Field names follow what the filter server emits (camelCase JSON on the
//! HTTP routes, snake_case tagged events on the WebSocket route) so test
//! servers and the client decode the same shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The four lines of one read: identifier, sequence, separator, quality.
pub type ReadLines = [String; 4];

/// One record on the wire: the read from every paired stream, in stream order.
pub type WireRecord = Vec<ReadLines>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub buffer_size: u64,
    #[serde(default)]
    pub uptime: Option<f64>,
    #[serde(flatten)]
    pub version: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateContextRequest {
    pub filenames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateContextResponse {
    pub context: String,
}

/// Body of a 200 reply to `POST context/{id}/reads`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadsAccepted {
    #[serde(default)]
    pub processed_reads: Option<u64>,
    #[serde(default)]
    pub pending_bytes: Option<u64>,
}

/// Body of the 422 (slow down), 413 (oversized chunk) and 503 (still working)
/// replies. Every field is optional because the server omits some of them
/// depending on the status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureReply {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub retry_after: Option<f64>,
    #[serde(default)]
    pub pending_bytes: Option<u64>,
    #[serde(default)]
    pub processed_reads: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseContextRequest {
    pub context: String,
}

/// Body of a 200 reply to `POST context/{id}/close`.
///
/// Older frontends read `saved`/`total`; both spellings are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextClosed {
    #[serde(alias = "saved")]
    pub reads_saved: Vec<String>,
    #[serde(alias = "total")]
    pub reads_processed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}

/// Events a client emits on the persistent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    CreateContext {
        request_id: u64,
        filenames: Vec<String>,
    },
    DataUpload {
        request_id: u64,
        context: String,
        reads: Vec<WireRecord>,
    },
    CloseContext {
        request_id: u64,
        context: String,
    },
}

impl ClientEvent {
    pub fn request_id(&self) -> u64 {
        match self {
            ClientEvent::CreateContext { request_id, .. }
            | ClientEvent::DataUpload { request_id, .. }
            | ClientEvent::CloseContext { request_id, .. } => *request_id,
        }
    }
}

/// Events the server emits on the persistent connection. Every reply echoes
/// the `request_id` of the client event it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ContextCreated {
        request_id: u64,
        context: String,
    },
    DataAccepted {
        request_id: u64,
        #[serde(default)]
        pending_bytes: Option<u64>,
        #[serde(default)]
        processed_reads: Option<u64>,
    },
    SlowDown {
        request_id: u64,
        retry_after: f64,
        #[serde(default)]
        pending_bytes: Option<u64>,
        #[serde(default)]
        processed_reads: Option<u64>,
    },
    ContextClosed {
        request_id: u64,
        reads_saved: Vec<String>,
        reads_processed: u64,
    },
    StillWorking {
        request_id: u64,
        retry_after: f64,
        #[serde(default)]
        pending_bytes: Option<u64>,
        #[serde(default)]
        processed_reads: Option<u64>,
    },
    Error {
        #[serde(default)]
        request_id: Option<u64>,
        message: String,
    },
}

impl ServerEvent {
    /// Correlation id, `None` only for unsolicited errors.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerEvent::ContextCreated { request_id, .. }
            | ServerEvent::DataAccepted { request_id, .. }
            | ServerEvent::SlowDown { request_id, .. }
            | ServerEvent::ContextClosed { request_id, .. }
            | ServerEvent::StillWorking { request_id, .. } => Some(*request_id),
            ServerEvent::Error { request_id, .. } => *request_id,
        }
    }
}
