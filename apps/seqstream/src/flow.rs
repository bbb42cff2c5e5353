use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::context::{ContextError, ContextSnapshot, TransferContext};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::record::Record;
use crate::transport::{SendOutcome, Transport, TransportError};

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("batch failed after {attempts} attempts: {last_error}")]
    MaxAttemptsExceeded {
        attempts: u32,
        #[source]
        last_error: TransportError,
    },
    #[error("server kept signalling overload for {waited:?} (limit {horizon:?})")]
    OverloadWaitExceeded { waited: Duration, horizon: Duration },
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Result of delivering one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub snapshot: ContextSnapshot,
    pub hard_errors: u32,
    pub overloads: u32,
    pub waited: Duration,
}

/// Retry rules for a single batch.
///
/// Overload replies are waited out and the identical batch is resent; they
/// never count against `max_attempts`. Hard errors are retried immediately
/// until `max_attempts` sends have failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowPolicy {
    max_attempts: u32,
    overload_horizon: Option<Duration>,
}

impl Default for FlowPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_ATTEMPTS, None)
    }
}

impl FlowPolicy {
    /// `max_attempts` below one is raised to one.
    pub fn new(max_attempts: u32, overload_horizon: Option<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            overload_horizon,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn overload_horizon(&self) -> Option<Duration> {
        self.overload_horizon
    }

    pub async fn deliver(
        &self,
        transport: &dyn Transport,
        context: &TransferContext,
        batch: &[Record],
        partition: usize,
        progress: &dyn ProgressSink,
    ) -> Result<Delivery, PartitionError> {
        let mut hard_errors = 0u32;
        let mut overloads = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            context.ensure_open()?;
            match transport.send_batch(context.id(), batch).await {
                Ok(SendOutcome::Accepted(counters)) => {
                    let snapshot = context.apply(counters);
                    progress.emit(ProgressEvent::Counters(snapshot));
                    return Ok(Delivery {
                        snapshot,
                        hard_errors,
                        overloads,
                        waited,
                    });
                }
                Ok(SendOutcome::Overload(signal)) => {
                    overloads += 1;
                    let snapshot = context.apply(signal.counters());
                    progress.emit(ProgressEvent::Counters(snapshot));

                    let delay = signal.delay();
                    if let Some(horizon) = self.overload_horizon {
                        let total = waited.saturating_add(delay);
                        if total > horizon {
                            return Err(PartitionError::OverloadWaitExceeded {
                                waited: total,
                                horizon,
                            });
                        }
                    }
                    debug!(
                        target = "seqstream::flow",
                        partition,
                        delay_ms = delay.as_millis() as u64,
                        pending_bytes = snapshot.pending_bytes,
                        "server overloaded; backing off"
                    );
                    progress.emit(ProgressEvent::Backoff {
                        partition: Some(partition),
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                    waited = waited.saturating_add(delay);
                }
                Err(err) => {
                    hard_errors += 1;
                    if hard_errors >= self.max_attempts {
                        return Err(PartitionError::MaxAttemptsExceeded {
                            attempts: hard_errors,
                            last_error: err,
                        });
                    }
                    warn!(
                        target = "seqstream::flow",
                        partition,
                        attempt = hard_errors,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "send failed; retrying"
                    );
                    progress.emit(ProgressEvent::Retrying {
                        partition,
                        attempt: hard_errors,
                        error: err.to_string(),
                    });
                }
            }
        }
    }
}
