//! Destinations for filtered outputs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::reconcile::OutputFile;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to write {0:?}: not a plain file name")]
    InvalidName(String),
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn deliver(&self, file: &OutputFile) -> Result<(), SinkError>;
}

/// Writes every output into one directory, replacing existing files.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Target path for `file`. Names that would escape the directory are refused.
    pub fn path_for(&self, file: &OutputFile) -> Result<PathBuf, SinkError> {
        let name = Path::new(&file.filename);
        match name.file_name() {
            Some(base) if base == name.as_os_str() => Ok(self.dir.join(base)),
            _ => Err(SinkError::InvalidName(file.filename.clone())),
        }
    }
}

#[async_trait]
impl OutputSink for DirectorySink {
    async fn deliver(&self, file: &OutputFile) -> Result<(), SinkError> {
        let path = self.path_for(file)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SinkError::Io {
                path: self.dir.clone(),
                source,
            })?;
        tokio::fs::write(&path, &file.bytes)
            .await
            .map_err(|source| SinkError::Io {
                path: path.clone(),
                source,
            })?;
        info!(
            target = "seqstream::sink",
            path = %path.display(),
            bytes = file.bytes.len(),
            compressed = file.compressed,
            "output written"
        );
        Ok(())
    }
}

/// Keeps outputs in memory, for embedders that hand bytes on themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    files: Mutex<Vec<OutputFile>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> Vec<OutputFile> {
        self.files.lock().clone()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn deliver(&self, file: &OutputFile) -> Result<(), SinkError> {
        self.files.lock().push(file.clone());
        Ok(())
    }
}

/// Hands every output to `sink`, stopping at the first failure.
pub async fn deliver_all(sink: &dyn OutputSink, files: &[OutputFile]) -> Result<(), SinkError> {
    for file in files {
        sink.deliver(file).await?;
    }
    Ok(())
}
