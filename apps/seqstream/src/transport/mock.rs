use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CloseOutcome, SendOutcome, Transport, TransportError, TransportKind};
use crate::context::{ContextId, ServerCounters};
use crate::reconcile::UploadOutcome;
use crate::record::Record;

/// In-memory transport replaying scripted replies.
///
/// Once a script runs dry, sends are accepted and the close keeps every
/// record that was ever accepted.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    fail_open: bool,
    send_script: Mutex<VecDeque<Result<SendOutcome, TransportError>>>,
    close_script: Mutex<VecDeque<Result<CloseOutcome, TransportError>>>,
    poisoned: HashSet<String>,
    attempts: Mutex<Vec<Vec<String>>>,
    accepted: Mutex<Vec<String>>,
    opened_with: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub(crate) fn script_send(self, reply: Result<SendOutcome, TransportError>) -> Self {
        self.send_script.lock().push_back(reply);
        self
    }

    pub(crate) fn script_close(self, reply: Result<CloseOutcome, TransportError>) -> Self {
        self.close_script.lock().push_back(reply);
        self
    }

    /// Every batch containing `identifier` fails with a hard error.
    pub(crate) fn poison(mut self, identifier: &str) -> Self {
        self.poisoned.insert(identifier.to_string());
        self
    }

    /// Identifiers of every send attempt, in call order.
    pub(crate) fn attempts(&self) -> Vec<Vec<String>> {
        self.attempts.lock().clone()
    }

    pub(crate) fn accepted(&self) -> Vec<String> {
        self.accepted.lock().clone()
    }

    pub(crate) fn opened_with(&self) -> Vec<String> {
        self.opened_with.lock().clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open_context(&self, filenames: &[String]) -> Result<ContextId, TransportError> {
        if self.fail_open {
            return Err(TransportError::Server("context store unavailable".into()));
        }
        *self.opened_with.lock() = filenames.to_vec();
        Ok(ContextId::new("ctx-1"))
    }

    async fn send_batch(
        &self,
        _context: &ContextId,
        batch: &[Record],
    ) -> Result<SendOutcome, TransportError> {
        let identifiers: Vec<String> = batch
            .iter()
            .map(|record| record.identifier().to_string())
            .collect();
        self.attempts.lock().push(identifiers.clone());
        tokio::task::yield_now().await;

        if identifiers.iter().any(|id| self.poisoned.contains(id)) {
            return Err(TransportError::Server("poisoned batch".into()));
        }
        let reply = self
            .send_script
            .lock()
            .pop_front()
            .unwrap_or(Ok(SendOutcome::Accepted(ServerCounters::default())));
        if matches!(reply, Ok(SendOutcome::Accepted(_))) {
            self.accepted.lock().extend(identifiers);
        }
        reply
    }

    async fn close_context(&self, _context: &ContextId) -> Result<CloseOutcome, TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.close_script.lock().pop_front();
        match scripted {
            Some(reply) => reply,
            None => {
                let accepted = self.accepted();
                Ok(CloseOutcome::Closed(UploadOutcome {
                    records_processed: accepted.len() as u64,
                    kept_identifiers: accepted.into_iter().collect(),
                }))
            }
        }
    }
}
