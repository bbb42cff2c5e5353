use std::sync::Arc;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::context::{ContextId, TransferContext};
use crate::error::EngineError;
use crate::pool::{PoolReport, WorkerPool};
use crate::progress::{NoProgress, ProgressSink};
use crate::reconcile::{OutputFile, ReconciliationStage, UploadOutcome};
use crate::record::{InputBuffer, RecordSet};
use crate::transport::Transport;

/// Everything an upload produced, including partitions that failed.
#[derive(Debug)]
pub struct UploadReport {
    pub context_id: ContextId,
    pub pool: PoolReport,
    pub outcome: UploadOutcome,
    pub outputs: Vec<OutputFile>,
}

impl UploadReport {
    /// True when every record reached the server.
    pub fn is_complete(&self) -> bool {
        self.pool.is_complete()
    }

    pub fn kept(&self) -> usize {
        self.outcome.kept_identifiers.len()
    }

    /// One line per failed partition, or `None` when nothing failed.
    pub fn failure_summary(&self) -> Option<String> {
        if self.is_complete() {
            return None;
        }
        let failed: Vec<String> = self
            .pool
            .failures()
            .map(|(partition, err)| {
                format!(
                    "partition {} (records {}..{}): {err}",
                    partition.index, partition.range.start, partition.range.end
                )
            })
            .collect();
        Some(format!(
            "{} of {} partitions failed; {}",
            failed.len(),
            self.pool.partitions.len(),
            failed.join("; ")
        ))
    }
}

/// Drives one upload end to end: validate, open a context, stream every
/// partition, close, and rebuild the filtered outputs.
pub struct Uploader {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    progress: Arc<dyn ProgressSink>,
}

impl Uploader {
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        Self {
            transport,
            config,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn upload(
        &self,
        inputs: &[InputBuffer],
        budget_bytes: u64,
    ) -> Result<UploadReport, EngineError> {
        let record_set = RecordSet::parse(inputs)?;
        self.upload_records(&record_set, budget_bytes).await
    }

    /// Partition failures do not abort the upload: the context is still
    /// closed and the report carries both the errors and the verdict.
    pub async fn upload_records(
        &self,
        record_set: &RecordSet,
        budget_bytes: u64,
    ) -> Result<UploadReport, EngineError> {
        let transport = self.transport.as_ref();
        let progress = self.progress.as_ref();

        let context_id = transport
            .open_context(&record_set.filenames())
            .await
            .map_err(EngineError::ContextCreation)?;
        info!(
            target = "seqstream::upload",
            context = %context_id,
            transport = transport.kind().label(),
            records = record_set.record_count(),
            streams = record_set.streams().len(),
            "context created"
        );
        let context = TransferContext::opened(context_id.clone());

        let pool = WorkerPool::new(transport, &context, self.config.flow_policy(), progress)
            .run(record_set.records(), self.config.workers, budget_bytes)
            .await;
        if !pool.is_complete() {
            warn!(
                target = "seqstream::upload",
                context = %context_id,
                records_sent = pool.records_sent(),
                "closing context after partial failure"
            );
        }

        let reconciliation =
            match ReconciliationStage::new(transport, self.config.close_policy(), progress)
                .finish(&context, record_set)
                .await
            {
                Ok(reconciliation) => reconciliation,
                Err(err) if pool.is_complete() => return Err(err),
                Err(err) => {
                    for (partition, failure) in pool.failures() {
                        warn!(
                            target = "seqstream::upload",
                            context = %context_id,
                            partition = partition.index,
                            records = ?partition.range,
                            error = %failure,
                            "partition failed before close error"
                        );
                    }
                    return Err(EngineError::PartialUpload {
                        pool,
                        source: Box::new(err),
                    });
                }
            };

        Ok(UploadReport {
            context_id,
            pool,
            outcome: reconciliation.outcome,
            outputs: reconciliation.outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;
    use crate::record::tests::fastq_text;
    use crate::record::{MediaType, RecordError};
    use crate::transport::TransportError;
    use crate::transport::mock::ScriptedTransport;
    use parking_lot::Mutex;

    fn inputs() -> Vec<InputBuffer> {
        vec![
            InputBuffer::new(
                "s_R1.fastq",
                MediaType::PlainText,
                fastq_text(&["a", "b", "c", "d", "e"], "ACGTACGT"),
            ),
            InputBuffer::new(
                "s_R2.fastq",
                MediaType::PlainText,
                fastq_text(&["a2", "b2", "c2", "d2", "e2"], "TTTT"),
            ),
        ]
    }

    #[tokio::test]
    async fn uploads_every_record_and_filters_outputs() {
        let transport = Arc::new(ScriptedTransport::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let uploader = Uploader::new(transport.clone(), EngineConfig::default().with_workers(2))
            .with_progress(Arc::new(move |event: ProgressEvent| sink.lock().push(event)));

        let report = uploader.upload(&inputs(), 24).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.failure_summary(), None);
        assert_eq!(report.context_id.as_str(), "ctx-1");
        assert_eq!(
            transport.opened_with(),
            vec!["s_R1.fastq".to_string(), "s_R2.fastq".to_string()]
        );
        assert_eq!(report.pool.records_sent(), 5);
        assert_eq!(report.kept(), 5);
        assert_eq!(report.outputs.len(), 2);
        assert_eq!(report.outputs[1].filename, "filtered.s_R2.fastq");
        assert_eq!(
            report.outputs[1].bytes.as_ref(),
            fastq_text(&["a2", "b2", "c2", "d2", "e2"], "TTTT").as_bytes()
        );

        let events = events.lock();
        assert!(matches!(events.first(), Some(ProgressEvent::Started { partitions: 2, .. })));
        assert!(matches!(events.last(), Some(ProgressEvent::Finished { kept: 5, .. })));
    }

    #[tokio::test]
    async fn partial_failure_still_closes_and_reports() {
        let transport = Arc::new(ScriptedTransport::new().poison("@c"));
        let uploader = Uploader::new(
            transport.clone(),
            EngineConfig::default().with_workers(5).with_max_attempts(2),
        );

        let report = uploader.upload(&inputs(), 1).await.unwrap();

        assert!(!report.is_complete());
        assert_eq!(transport.close_calls(), 1);
        assert_eq!(report.kept(), 4);
        let summary = report.failure_summary().unwrap();
        assert!(summary.starts_with("1 of 5 partitions failed; partition 2 (records 2..3)"));
        assert!(!String::from_utf8_lossy(&report.outputs[0].bytes).contains("@c\n"));
    }

    #[tokio::test]
    async fn close_failure_keeps_partition_failures() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .poison("@c")
                .script_close(Err(TransportError::Server("close refused".into()))),
        );
        let uploader = Uploader::new(
            transport.clone(),
            EngineConfig::default().with_workers(5).with_max_attempts(2),
        );

        let err = uploader.upload(&inputs(), 1).await.unwrap_err();

        assert_eq!(transport.close_calls(), 1);
        assert!(err.to_string().ends_with("(1 of 5 partitions had already failed)"));
        match err {
            EngineError::PartialUpload { pool, source } => {
                let failed: Vec<usize> = pool.failures().map(|(partition, _)| partition.index).collect();
                assert_eq!(failed, vec![2]);
                assert!(matches!(*source, EngineError::Close(TransportError::Server(_))));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_failure_without_partition_failures_is_passed_through() {
        let transport = Arc::new(
            ScriptedTransport::new().script_close(Err(TransportError::Server("close refused".into()))),
        );
        let uploader = Uploader::new(transport, EngineConfig::default().with_workers(2));

        let err = uploader.upload(&inputs(), 24).await.unwrap_err();

        assert!(matches!(err, EngineError::Close(TransportError::Server(_))));
    }

    #[tokio::test]
    async fn open_failure_is_fatal() {
        let transport = Arc::new(ScriptedTransport::failing_open());
        let uploader = Uploader::new(transport.clone(), EngineConfig::default());

        let err = uploader.upload(&inputs(), 100).await.unwrap_err();

        assert!(matches!(err, EngineError::ContextCreation(_)));
        assert!(transport.attempts().is_empty());
        assert_eq!(transport.close_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_input_fails_before_any_network_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let uploader = Uploader::new(transport.clone(), EngineConfig::default());
        let mut inputs = inputs();
        inputs[1] = InputBuffer::new("s_R2.fastq", MediaType::PlainText, fastq_text(&["a2"], "T"));

        let err = uploader.upload(&inputs, 100).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Input(RecordError::PairingMismatch { .. })
        ));
        assert!(transport.opened_with().is_empty());
    }
}
