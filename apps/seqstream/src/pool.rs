//! Parallel partitioned dispatch.
//!
//! The record set is cut into contiguous partitions, one per sender. Every
//! partition runs its own chunk-and-send loop; the loops are futures joined
//! on the caller's task and only meet at the shared [`TransferContext`].

use std::ops::Range;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::chunker::Batches;
use crate::context::TransferContext;
use crate::flow::{FlowPolicy, PartitionError};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::record::Record;
use crate::transport::Transport;

/// Splits `0..record_count` into at most `min(worker_count, record_count)`
/// contiguous ranges of `ceil(record_count / partitions)` records. Trailing
/// ranges that would be empty are dropped, so no range is ever empty.
pub fn partition_ranges(record_count: usize, worker_count: usize) -> Vec<Range<usize>> {
    if record_count == 0 {
        return Vec::new();
    }
    let partitions = worker_count.clamp(1, record_count);
    let size = record_count.div_ceil(partitions);
    (0..partitions)
        .map(|index| {
            let start = index * size;
            start..(start + size).min(record_count)
        })
        .filter(|range| range.start < range.end)
        .collect()
}

#[derive(Debug)]
pub struct PartitionReport {
    pub index: usize,
    pub range: Range<usize>,
    pub records_sent: usize,
    pub batches_sent: usize,
    pub result: Result<(), PartitionError>,
}

impl PartitionReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct PoolReport {
    pub partitions: Vec<PartitionReport>,
}

impl PoolReport {
    pub fn is_complete(&self) -> bool {
        self.partitions.iter().all(PartitionReport::is_ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&PartitionReport, &PartitionError)> {
        self.partitions
            .iter()
            .filter_map(|report| report.result.as_ref().err().map(|err| (report, err)))
    }

    pub fn records_sent(&self) -> usize {
        self.partitions.iter().map(|report| report.records_sent).sum()
    }

    pub fn batches_sent(&self) -> usize {
        self.partitions.iter().map(|report| report.batches_sent).sum()
    }
}

pub struct WorkerPool<'a> {
    transport: &'a dyn Transport,
    context: &'a TransferContext,
    policy: FlowPolicy,
    progress: &'a dyn ProgressSink,
}

impl<'a> WorkerPool<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        context: &'a TransferContext,
        policy: FlowPolicy,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            transport,
            context,
            policy,
            progress,
        }
    }

    /// Streams every record and waits for all partitions. A failing partition
    /// never cancels its siblings; its error is kept in the report.
    pub async fn run(&self, records: &[Record], worker_count: usize, budget_bytes: u64) -> PoolReport {
        let ranges = partition_ranges(records.len(), worker_count);
        info!(
            target = "seqstream::pool",
            context = %self.context.id(),
            records = records.len(),
            partitions = ranges.len(),
            budget_bytes,
            "starting upload"
        );
        self.progress.emit(ProgressEvent::Started {
            context: self.context.id().clone(),
            total_records: records.len(),
            partitions: ranges.len(),
            budget_bytes,
        });

        let partitions = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| self.run_partition(index, range, records, budget_bytes));
        let partitions = join_all(partitions).await;

        let report = PoolReport { partitions };
        if !report.is_complete() {
            warn!(
                target = "seqstream::pool",
                failed = report.failures().count(),
                records_sent = report.records_sent(),
                "upload finished with failed partitions"
            );
        }
        report
    }

    async fn run_partition(
        &self,
        index: usize,
        range: Range<usize>,
        records: &[Record],
        budget_bytes: u64,
    ) -> PartitionReport {
        let mut records_sent = 0;
        let mut batches_sent = 0;

        for (span, batch) in Batches::new(records, range.clone(), budget_bytes) {
            let delivered = self
                .policy
                .deliver(self.transport, self.context, batch, index, self.progress)
                .await;
            if let Err(err) = delivered {
                warn!(
                    target = "seqstream::pool",
                    partition = index,
                    offset = span.start,
                    error = %err,
                    "partition failed"
                );
                self.progress.emit(ProgressEvent::PartitionFailed {
                    partition: index,
                    error: err.to_string(),
                });
                return PartitionReport {
                    index,
                    range,
                    records_sent,
                    batches_sent,
                    result: Err(err),
                };
            }
            records_sent += batch.len();
            batches_sent += 1;
            self.progress.emit(ProgressEvent::BatchAccepted {
                partition: index,
                records: span,
                records_sent,
            });
        }

        debug!(
            target = "seqstream::pool",
            partition = index,
            records_sent,
            batches_sent,
            "partition finished"
        );
        self.progress.emit(ProgressEvent::PartitionFinished {
            partition: index,
            records_sent,
        });
        PartitionReport {
            index,
            range,
            records_sent,
            batches_sent,
            result: Ok(()),
        }
    }
}
