pub mod chunker;
pub mod config;
pub mod context;
pub mod error;
pub mod flow;
pub mod pool;
pub mod progress;
pub mod reconcile;
pub mod record;
pub mod sink;
pub mod telemetry;
pub mod transport;
pub mod uploader;

pub use config::EngineConfig;
pub use error::EngineError;
pub use record::{InputBuffer, MediaType, RecordSet};
pub use uploader::{UploadReport, Uploader};
