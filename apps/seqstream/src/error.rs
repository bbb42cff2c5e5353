use thiserror::Error;

use crate::context::ContextError;
use crate::pool::PoolReport;
use crate::record::RecordError;
use crate::transport::TransportError;

/// Errors that abort an upload as a whole. Failures confined to one
/// partition are reported through [`crate::pool::PoolReport`] instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Input(#[from] RecordError),
    #[error("could not create a processing context: {0}")]
    ContextCreation(#[source] TransportError),
    #[error(transparent)]
    InvalidState(#[from] ContextError),
    #[error("closing the context failed: {0}")]
    Close(#[source] TransportError),
    #[error("server was still working after {polls} close attempts")]
    CloseRetriesExhausted { polls: u32 },
    /// Closing failed after some partitions had already failed; the pool
    /// report is kept so those failures are not lost.
    #[error(
        "{source} ({failed} of {total} partitions had already failed)",
        failed = .pool.failures().count(),
        total = .pool.partitions.len()
    )]
    PartialUpload {
        pool: PoolReport,
        #[source]
        source: Box<EngineError>,
    },
    #[error("failed to compress {filename}: {source}")]
    Compress {
        filename: String,
        #[source]
        source: std::io::Error,
    },
}
