use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use seqstream_proto::{
    BackpressureReply, CloseContextRequest, ContextClosed, CreateContextRequest,
    CreateContextResponse, ReadsAccepted, ServerStatus,
};
use tracing::{debug, trace};
use url::Url;

use super::{
    wire_batch, CloseOutcome, RetrySignal, SendOutcome, Transport, TransportError, TransportKind,
};
use crate::context::{ContextId, ServerCounters};
use crate::reconcile::UploadOutcome;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(3),
            request: Duration::from_secs(60),
        }
    }
}

/// Request/response transport against the read-filter REST API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: Url) -> Result<Self, TransportError> {
        Self::with_timeouts(base_url, HttpTimeouts::default())
    }

    pub fn with_timeouts(base_url: Url, timeouts: HttpTimeouts) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.request)
            .no_proxy()
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetches the server configuration; `buffer_size` seeds the chunk budget.
    pub async fn server_status(&self) -> Result<ServerStatus, TransportError> {
        let endpoint = self.endpoint("server-status")?;
        let response = self.client.get(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(unexpected_status(response).await);
        }
        Ok(response.json::<ServerStatus>().await?)
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url.join(path).map_err(|err| {
            TransportError::InvalidConfig(format!("invalid endpoint {path}: {err}"))
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open_context(&self, filenames: &[String]) -> Result<ContextId, TransportError> {
        let endpoint = self.endpoint("context/create")?;
        let request = CreateContextRequest {
            filenames: filenames.to_vec(),
        };
        let response = self.client.post(endpoint).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(unexpected_status(response).await);
        }
        let payload = response.json::<CreateContextResponse>().await?;
        if payload.context.trim().is_empty() {
            return Err(TransportError::InvalidResponse(
                "server returned an empty context id".into(),
            ));
        }
        debug!(target = "seqstream::http", context = %payload.context, "context created");
        Ok(ContextId::new(payload.context))
    }

    async fn send_batch(
        &self,
        context: &ContextId,
        batch: &[Record],
    ) -> Result<SendOutcome, TransportError> {
        let endpoint = self.endpoint(&format!("context/{context}/reads"))?;
        let response = self
            .client
            .post(endpoint)
            .json(&wire_batch(batch))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let payload = response.json::<ReadsAccepted>().await?;
                trace!(
                    target = "seqstream::http",
                    context = %context,
                    records = batch.len(),
                    pending_bytes = ?payload.pending_bytes,
                    "batch accepted"
                );
                Ok(SendOutcome::Accepted(ServerCounters::new(
                    payload.pending_bytes,
                    payload.processed_reads,
                )))
            }
            StatusCode::UNPROCESSABLE_ENTITY => {
                let signal = retry_signal(response).await?;
                Ok(SendOutcome::Overload(signal))
            }
            StatusCode::PAYLOAD_TOO_LARGE => {
                let reply = response
                    .json::<BackpressureReply>()
                    .await
                    .unwrap_or_default();
                Err(TransportError::PayloadTooLarge(
                    reply
                        .message
                        .unwrap_or_else(|| "chunk larger than the configured buffer size".into()),
                ))
            }
            _ => Err(unexpected_status(response).await),
        }
    }

    async fn close_context(&self, context: &ContextId) -> Result<CloseOutcome, TransportError> {
        let endpoint = self.endpoint(&format!("context/{context}/close"))?;
        let request = CloseContextRequest {
            context: context.to_string(),
        };
        let response = self.client.post(endpoint).json(&request).send().await?;

        match response.status() {
            status if status.is_success() => {
                let payload = response.json::<ContextClosed>().await?;
                Ok(CloseOutcome::Closed(UploadOutcome {
                    kept_identifiers: payload.reads_saved.into_iter().collect(),
                    records_processed: payload.reads_processed,
                }))
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                let signal = retry_signal(response).await?;
                Ok(CloseOutcome::StillWorking(signal))
            }
            _ => Err(unexpected_status(response).await),
        }
    }
}

/// Builds a retry signal from a 422/503 reply. The body's `retryAfter` wins;
/// the `Retry-After` header is the fallback.
async fn retry_signal(response: Response) -> Result<RetrySignal, TransportError> {
    let status = response.status();
    let header_delay = retry_after_header(response.headers());
    let reply = response
        .json::<BackpressureReply>()
        .await
        .unwrap_or_default();
    let seconds = reply.retry_after.or(header_delay).ok_or_else(|| {
        TransportError::InvalidResponse(format!("{status} reply without a retry delay"))
    })?;
    Ok(RetrySignal::new(seconds).with_counters(reply.pending_bytes, reply.processed_reads))
}

fn retry_after_header(headers: &HeaderMap) -> Option<f64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
}

async fn unexpected_status(response: Response) -> TransportError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    TransportError::HttpStatus { status, body }
}
