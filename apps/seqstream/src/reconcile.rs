//! Close handshake and filtered-output reconstruction.

use std::collections::HashSet;
use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use crate::config::DEFAULT_MAX_CLOSE_POLLS;
use crate::context::TransferContext;
use crate::error::EngineError;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::record::RecordSet;
use crate::transport::{CloseOutcome, Transport};

/// Prefix given to every reconstructed file.
pub const FILTERED_PREFIX: &str = "filtered.";

/// Server verdict once a context is closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOutcome {
    pub kept_identifiers: HashSet<String>,
    pub records_processed: u64,
}

/// One filtered output, ready for an [`crate::sink::OutputSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub filename: String,
    pub bytes: Bytes,
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePolicy {
    pub max_polls: u32,
}

impl Default for ClosePolicy {
    fn default() -> Self {
        Self {
            max_polls: DEFAULT_MAX_CLOSE_POLLS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub outcome: UploadOutcome,
    pub outputs: Vec<OutputFile>,
}

pub struct ReconciliationStage<'a> {
    transport: &'a dyn Transport,
    policy: ClosePolicy,
    progress: &'a dyn ProgressSink,
}

impl<'a> ReconciliationStage<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        policy: ClosePolicy,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            transport,
            policy,
            progress,
        }
    }

    /// Closes the context and rebuilds one filtered file per input stream.
    pub async fn finish(
        &self,
        context: &TransferContext,
        record_set: &RecordSet,
    ) -> Result<Reconciliation, EngineError> {
        let outcome = self.close(context).await?;
        let outputs = reconstruct(record_set, &outcome.kept_identifiers)?;
        Ok(Reconciliation { outcome, outputs })
    }

    /// Sends the close request, waiting out still-working replies until the
    /// server returns its verdict or the poll ceiling is hit.
    pub async fn close(&self, context: &TransferContext) -> Result<UploadOutcome, EngineError> {
        context.begin_close()?;
        self.progress.emit(ProgressEvent::Closing);
        let max_polls = self.policy.max_polls.max(1);

        let mut polls = 0u32;
        loop {
            polls += 1;
            let reply = self
                .transport
                .close_context(context.id())
                .await
                .map_err(EngineError::Close)?;
            match reply {
                CloseOutcome::Closed(outcome) => {
                    context.finish_close(outcome.records_processed)?;
                    info!(
                        target = "seqstream::reconcile",
                        context = %context.id(),
                        kept = outcome.kept_identifiers.len(),
                        processed = outcome.records_processed,
                        polls,
                        "context closed"
                    );
                    self.progress.emit(ProgressEvent::Finished {
                        kept: outcome.kept_identifiers.len(),
                        records_processed: outcome.records_processed,
                    });
                    return Ok(outcome);
                }
                CloseOutcome::StillWorking(signal) => {
                    let snapshot = context.apply(signal.counters());
                    self.progress.emit(ProgressEvent::Counters(snapshot));
                    if polls >= max_polls {
                        return Err(EngineError::CloseRetriesExhausted { polls });
                    }
                    let delay = signal.delay();
                    debug!(
                        target = "seqstream::reconcile",
                        polls,
                        delay_ms = delay.as_millis() as u64,
                        pending_bytes = snapshot.pending_bytes,
                        "server still working"
                    );
                    self.progress.emit(ProgressEvent::Backoff {
                        partition: None,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Keeps the records whose identifier is in `kept`, in input order, and
/// serializes them back per stream. Output is a pure function of its inputs.
pub fn reconstruct(
    record_set: &RecordSet,
    kept: &HashSet<String>,
) -> Result<Vec<OutputFile>, EngineError> {
    let survivors: Vec<_> = record_set
        .records()
        .iter()
        .filter(|record| kept.contains(record.identifier()))
        .collect();

    record_set
        .streams()
        .iter()
        .enumerate()
        .map(|(stream, info)| -> Result<OutputFile, EngineError> {
            let mut text = String::new();
            for record in &survivors {
                for line in &record.reads()[stream] {
                    text.push_str(line);
                    text.push('\n');
                }
            }

            let filename = format!("{FILTERED_PREFIX}{}", info.name);
            let compressed = info.media_type.is_compressed();
            let bytes = if compressed {
                gzip(text.as_bytes()).map_err(|source| EngineError::Compress {
                    filename: filename.clone(),
                    source,
                })?
            } else {
                text.into_bytes()
            };
            Ok(OutputFile {
                filename,
                bytes: Bytes::from(bytes),
                compressed,
            })
        })
        .collect()
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextId, ContextState};
    use crate::progress::NoProgress;
    use crate::record::tests::{fastq_text, gzip as gzip_text};
    use crate::record::{InputBuffer, MediaType};
    use crate::transport::mock::ScriptedTransport;
    use crate::transport::RetrySignal;
    use crate::transport::TransportError;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    fn kept(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn still_working() -> Result<CloseOutcome, TransportError> {
        Ok(CloseOutcome::StillWorking(
            RetrySignal::new(0.5).with_counters(Some(64), Some(2)),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn polls_through_still_working_then_filters() {
        let transport = ScriptedTransport::new()
            .script_close(still_working())
            .script_close(still_working())
            .script_close(Ok(CloseOutcome::Closed(UploadOutcome {
                kept_identifiers: kept(&["@r3", "@r1"]),
                records_processed: 3,
            })));
        let record_set = RecordSet::parse(&[InputBuffer::new(
            "reads.fastq",
            MediaType::PlainText,
            fastq_text(&["r1", "r2", "r3"], "ACGT"),
        )])
        .unwrap();
        let context = TransferContext::opened(ContextId::new("ctx-1"));

        let result = ReconciliationStage::new(&transport, ClosePolicy::default(), &NoProgress)
            .finish(&context, &record_set)
            .await
            .unwrap();

        assert_eq!(transport.close_calls(), 3);
        assert_eq!(context.state(), ContextState::Closed);
        assert_eq!(context.records_processed(), 3);
        assert_eq!(result.outputs.len(), 1);
        let output = &result.outputs[0];
        assert_eq!(output.filename, "filtered.reads.fastq");
        assert!(!output.compressed);
        assert_eq!(
            std::str::from_utf8(&output.bytes).unwrap(),
            fastq_text(&["r1", "r3"], "ACGT")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_gives_up_after_poll_ceiling() {
        let transport = ScriptedTransport::new()
            .script_close(still_working())
            .script_close(still_working())
            .script_close(still_working());
        let context = TransferContext::opened(ContextId::new("ctx-1"));

        let err = ReconciliationStage::new(&transport, ClosePolicy { max_polls: 2 }, &NoProgress)
            .close(&context)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::CloseRetriesExhausted { polls: 2 }));
        assert_eq!(transport.close_calls(), 2);
        assert_eq!(context.pending_bytes(), 64);
        assert_eq!(context.state(), ContextState::Closing);
    }

    #[tokio::test]
    async fn second_close_is_rejected() {
        let transport = ScriptedTransport::new();
        let context = TransferContext::opened(ContextId::new("ctx-1"));
        let stage = ReconciliationStage::new(&transport, ClosePolicy::default(), &NoProgress);

        stage.close(&context).await.unwrap();
        let err = stage.close(&context).await.unwrap_err();

        assert!(matches!(err, EngineError::InvalidState(_)));
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn close_transport_error_is_surfaced() {
        let transport = ScriptedTransport::new()
            .script_close(Err(TransportError::Server("gone".into())));
        let context = TransferContext::opened(ContextId::new("ctx-1"));

        let err = ReconciliationStage::new(&transport, ClosePolicy::default(), &NoProgress)
            .close(&context)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Close(TransportError::Server(_))));
    }

    #[test]
    fn paired_gzip_streams_are_filtered_and_recompressed() {
        let r1 = InputBuffer::new(
            "sample_R1.fastq.gz",
            MediaType::Gzip,
            gzip_text(&fastq_text(&["a", "b", "c"], "ACGT")),
        );
        let r2 = InputBuffer::new(
            "sample_R2.fastq",
            MediaType::PlainText,
            fastq_text(&["a/2", "b/2", "c/2"], "GG"),
        );
        let record_set = RecordSet::parse(&[r1, r2]).unwrap();

        let outputs = reconstruct(&record_set, &kept(&["@b"])).unwrap();

        assert_eq!(outputs[0].filename, "filtered.sample_R1.fastq.gz");
        assert!(outputs[0].compressed);
        let mut decoded = String::new();
        MultiGzDecoder::new(outputs[0].bytes.as_ref())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, fastq_text(&["b"], "ACGT"));

        assert_eq!(outputs[1].filename, "filtered.sample_R2.fastq");
        assert!(!outputs[1].compressed);
        assert_eq!(outputs[1].bytes.as_ref(), fastq_text(&["b/2"], "GG").as_bytes());
    }

    #[test]
    fn reconstruction_is_byte_identical_across_runs() {
        let input = InputBuffer::new(
            "reads.fq.gz",
            MediaType::Gzip,
            gzip_text(&fastq_text(&["r1", "r2", "r3", "r4"], "ACGTTGCA")),
        );
        let record_set = RecordSet::parse(&[input]).unwrap();
        let keep = kept(&["@r2", "@r4"]);

        let first = reconstruct(&record_set, &keep).unwrap();
        let second = reconstruct(&record_set, &keep).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn nothing_kept_yields_empty_outputs() {
        let record_set = RecordSet::parse(&[InputBuffer::new(
            "reads.fq",
            MediaType::PlainText,
            fastq_text(&["r1"], "A"),
        )])
        .unwrap();
        let outputs = reconstruct(&record_set, &HashSet::new()).unwrap();
        assert!(outputs[0].bytes.is_empty());
    }
}
