//! Progress events emitted by the engine.
//!
//! The engine never renders anything itself. Front ends subscribe through a
//! [`ProgressSink`]: a closure, a [`ChannelSink`], or [`NoProgress`].

use std::ops::Range;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::context::{ContextId, ContextSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Context opened; `total_records` will be streamed over `partitions` senders.
    Started {
        context: ContextId,
        total_records: usize,
        partitions: usize,
        budget_bytes: u64,
    },
    BatchAccepted {
        partition: usize,
        records: Range<usize>,
        records_sent: usize,
    },
    Counters(ContextSnapshot),
    Backoff {
        partition: Option<usize>,
        delay: Duration,
    },
    Retrying {
        partition: usize,
        attempt: u32,
        error: String,
    },
    PartitionFinished {
        partition: usize,
        records_sent: usize,
    },
    PartitionFailed {
        partition: usize,
        error: String,
    },
    Closing,
    Finished {
        kept: usize,
        records_processed: u64,
    },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded channel. Events are dropped silently
/// once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

pub fn channel() -> (ChannelSink, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, rx)
}
