use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use seqstream_proto::{ClientEvent, ServerEvent};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::{
    wire_batch, CloseOutcome, RetrySignal, SendOutcome, Transport, TransportError, TransportKind,
};
use crate::context::{ContextId, ServerCounters};
use crate::reconcile::UploadOutcome;
use crate::record::Record;

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerEvent>>>>;

/// Persistent-connection transport. All partitions share one socket;
/// replies are matched to requests by `request_id`.
pub struct WebSocketTransport {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingReplies,
    next_request: AtomicU64,
    connected: Arc<AtomicBool>,
    io_task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub async fn connect(url: &Url) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::WebSocket(Box::new(err)))?;
        debug!(target = "seqstream::websocket", url = %url, "connected");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let io_task = tokio::spawn(run_connection(
            stream,
            outgoing_rx,
            pending.clone(),
            connected.clone(),
        ));

        Ok(Self {
            outgoing,
            pending,
            next_request: AtomicU64::new(1),
            connected,
            io_task: Some(io_task),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Sends a close frame and waits for the connection task to wind down.
    pub async fn close(&mut self) {
        let _ = self.outgoing.send(Message::Close(None));
        if let Some(task) = self.io_task.take() {
            let _ = task.await;
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientEvent,
    ) -> Result<ServerEvent, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_string(&build(request_id))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id, reply_tx);
        if self.outgoing.send(Message::Text(payload)).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(TransportError::ConnectionClosed);
        }

        match reply_rx.await {
            Ok(ServerEvent::Error { message, .. }) => Err(TransportError::Server(message)),
            Ok(event) => Ok(event),
            Err(_) => Err(TransportError::ConnectionClosed),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open_context(&self, filenames: &[String]) -> Result<ContextId, TransportError> {
        let filenames = filenames.to_vec();
        let reply = self
            .request(|request_id| ClientEvent::CreateContext {
                request_id,
                filenames,
            })
            .await?;
        match reply {
            ServerEvent::ContextCreated { context, .. } if !context.trim().is_empty() => {
                Ok(ContextId::new(context))
            }
            other => Err(unexpected_event("create_context", &other)),
        }
    }

    async fn send_batch(
        &self,
        context: &ContextId,
        batch: &[Record],
    ) -> Result<SendOutcome, TransportError> {
        let reads = wire_batch(batch);
        let reply = self
            .request(|request_id| ClientEvent::DataUpload {
                request_id,
                context: context.to_string(),
                reads,
            })
            .await?;
        match reply {
            ServerEvent::DataAccepted {
                pending_bytes,
                processed_reads,
                ..
            } => Ok(SendOutcome::Accepted(ServerCounters::new(
                pending_bytes,
                processed_reads,
            ))),
            ServerEvent::SlowDown {
                retry_after,
                pending_bytes,
                processed_reads,
                ..
            } => Ok(SendOutcome::Overload(
                RetrySignal::new(retry_after).with_counters(pending_bytes, processed_reads),
            )),
            other => Err(unexpected_event("data_upload", &other)),
        }
    }

    async fn close_context(&self, context: &ContextId) -> Result<CloseOutcome, TransportError> {
        let reply = self
            .request(|request_id| ClientEvent::CloseContext {
                request_id,
                context: context.to_string(),
            })
            .await?;
        match reply {
            ServerEvent::ContextClosed {
                reads_saved,
                reads_processed,
                ..
            } => Ok(CloseOutcome::Closed(UploadOutcome {
                kept_identifiers: reads_saved.into_iter().collect(),
                records_processed: reads_processed,
            })),
            ServerEvent::StillWorking {
                retry_after,
                pending_bytes,
                processed_reads,
                ..
            } => Ok(CloseOutcome::StillWorking(
                RetrySignal::new(retry_after).with_counters(pending_bytes, processed_reads),
            )),
            other => Err(unexpected_event("close_context", &other)),
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
    }
}

async fn run_connection(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
    pending: PendingReplies,
    connected: Arc<AtomicBool>,
) {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                let Some(message) = outgoing else { break };
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    warn!(target = "seqstream::websocket", error = %err, "send failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => dispatch(&pending, &text),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => dispatch(&pending, text),
                    Err(err) => {
                        warn!(target = "seqstream::websocket", error = %err, "invalid utf8 frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    warn!(target = "seqstream::websocket", error = %err, "receive failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    // Receiver goes first so no request can slip in after the drain below.
    drop(outgoing_rx);
    connected.store(false, Ordering::Release);
    let abandoned = pending.lock().drain().count();
    debug!(
        target = "seqstream::websocket",
        abandoned_requests = abandoned,
        "connection closed"
    );
}

fn dispatch(pending: &PendingReplies, text: &str) {
    let event = match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(target = "seqstream::websocket", error = %err, "undecodable server event");
            return;
        }
    };
    let Some(request_id) = event.request_id() else {
        warn!(target = "seqstream::websocket", event = ?event, "unsolicited server event");
        return;
    };
    match pending.lock().remove(&request_id) {
        Some(reply) => {
            let _ = reply.send(event);
        }
        None => {
            warn!(target = "seqstream::websocket", request_id, "reply for unknown request");
        }
    }
}

fn unexpected_event(request: &str, event: &ServerEvent) -> TransportError {
    TransportError::InvalidResponse(format!("unexpected reply to {request}: {event:?}"))
}
