//! Client-side view of one remote processing context.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;

/// Opaque context token issued by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ContextState::Open => "open",
            ContextState::Closing => "closing",
            ContextState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Counters reported by the server. Replies omit fields freely; a missing
/// counter leaves the local value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCounters {
    pub pending_bytes: Option<u64>,
    pub records_processed: Option<u64>,
}

impl ServerCounters {
    pub fn new(pending_bytes: Option<u64>, records_processed: Option<u64>) -> Self {
        Self {
            pending_bytes,
            records_processed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub state: ContextState,
    pub pending_bytes: u64,
    pub records_processed: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("cannot {operation} context {id}: context is {state}")]
    InvalidState {
        id: ContextId,
        state: ContextState,
        operation: &'static str,
    },
}

/// Shared by every partition of an upload. Counters are only ever written
/// from server replies; across partitions the last write wins, so readers
/// must treat them as aggregate progress rather than a ledger.
#[derive(Debug)]
pub struct TransferContext {
    id: ContextId,
    state: RwLock<ContextState>,
    pending_bytes: AtomicU64,
    records_processed: AtomicU64,
}

impl TransferContext {
    pub fn opened(id: ContextId) -> Self {
        Self {
            id,
            state: RwLock::new(ContextState::Open),
            pending_bytes: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn state(&self) -> ContextState {
        *self.state.read()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes.load(Ordering::Acquire)
    }

    pub fn records_processed(&self) -> u64 {
        self.records_processed.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            state: self.state(),
            pending_bytes: self.pending_bytes(),
            records_processed: self.records_processed(),
        }
    }

    /// Stores whatever counters the server reported and returns the result.
    pub fn apply(&self, counters: ServerCounters) -> ContextSnapshot {
        if let Some(pending) = counters.pending_bytes {
            self.pending_bytes.store(pending, Ordering::Release);
        }
        if let Some(processed) = counters.records_processed {
            self.records_processed.store(processed, Ordering::Release);
        }
        self.snapshot()
    }

    pub fn ensure_open(&self) -> Result<(), ContextError> {
        self.expect_state(ContextState::Open, "send to")
    }

    /// `OPEN -> CLOSING`. Fails when a close was already started.
    pub fn begin_close(&self) -> Result<(), ContextError> {
        let mut state = self.state.write();
        if *state != ContextState::Open {
            return Err(self.invalid(*state, "close"));
        }
        *state = ContextState::Closing;
        Ok(())
    }

    /// `CLOSING -> CLOSED`.
    pub fn finish_close(&self, records_processed: u64) -> Result<(), ContextError> {
        let mut state = self.state.write();
        if *state != ContextState::Closing {
            return Err(self.invalid(*state, "finish closing"));
        }
        *state = ContextState::Closed;
        self.records_processed
            .store(records_processed, Ordering::Release);
        self.pending_bytes.store(0, Ordering::Release);
        Ok(())
    }

    fn expect_state(
        &self,
        expected: ContextState,
        operation: &'static str,
    ) -> Result<(), ContextError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(self.invalid(state, operation))
        }
    }

    fn invalid(&self, state: ContextState, operation: &'static str) -> ContextError {
        ContextError::InvalidState {
            id: self.id.clone(),
            state,
            operation,
        }
    }
}
