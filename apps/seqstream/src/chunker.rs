use std::ops::Range;

use crate::record::Record;

/// Carves the next batch out of `records[range_start..range_end]`.
///
/// Records are accumulated while the batch stays within `budget_bytes` of
/// flow-control size. A record that alone exceeds the budget is still sent
/// on its own. Returns the batch together with the offset to resume from;
/// an empty batch with `new_offset == range_start` means the range is done.
pub fn next_batch(
    records: &[Record],
    range_start: usize,
    range_end: usize,
    budget_bytes: u64,
) -> (&[Record], usize) {
    let range_end = range_end.min(records.len());
    if range_start >= range_end {
        return (&[], range_start);
    }

    let mut accumulated = 0u64;
    let mut offset = range_start;
    while offset < range_end {
        let size = records[offset].flow_size();
        if offset > range_start && accumulated + size > budget_bytes {
            break;
        }
        accumulated += size;
        offset += 1;
    }

    (&records[range_start..offset], offset)
}

/// Iterator over every batch of a partition range.
pub struct Batches<'a> {
    records: &'a [Record],
    cursor: usize,
    end: usize,
    budget_bytes: u64,
}

impl<'a> Batches<'a> {
    pub fn new(records: &'a [Record], range: Range<usize>, budget_bytes: u64) -> Self {
        Self {
            records,
            cursor: range.start,
            end: range.end,
            budget_bytes,
        }
    }

    /// Offset of the first record not yet handed out.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl<'a> Iterator for Batches<'a> {
    type Item = (Range<usize>, &'a [Record]);

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.cursor;
        let (batch, new_offset) = next_batch(self.records, start, self.end, self.budget_bytes);
        if batch.is_empty() {
            return None;
        }
        self.cursor = new_offset;
        Some((start..new_offset, batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records_with_sizes(sizes: &[usize]) -> Vec<Record> {
        sizes
            .iter()
            .enumerate()
            .map(|(index, size)| {
                Record::new(vec![[
                    format!("@r{index}"),
                    "A".repeat(*size),
                    "+".to_string(),
                    "I".repeat(*size),
                ]])
            })
            .collect()
    }

    #[test]
    fn eight_records_with_three_record_budget_yield_3_3_2() {
        let records = records_with_sizes(&[10; 8]);
        let sizes: Vec<usize> = Batches::new(&records, 0..8, 30)
            .map(|(_, batch)| batch.len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 2]);
    }

    #[test]
    fn oversized_record_is_sent_alone() {
        let records = records_with_sizes(&[5, 100, 5]);
        let (batch, offset) = next_batch(&records, 0, 3, 20);
        assert_eq!(batch.len(), 1);
        assert_eq!(offset, 1);
        let (batch, offset) = next_batch(&records, 1, 3, 20);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].identifier(), "@r1");
        assert_eq!(offset, 2);
    }

    #[test]
    fn exhausted_range_returns_start_offset() {
        let records = records_with_sizes(&[10, 10]);
        let (batch, offset) = next_batch(&records, 2, 2, 100);
        assert!(batch.is_empty());
        assert_eq!(offset, 2);
    }

    #[test]
    fn zero_budget_degrades_to_single_record_batches() {
        let records = records_with_sizes(&[3, 4, 5]);
        let count = Batches::new(&records, 0..3, 0).count();
        assert_eq!(count, 3);
    }

    #[test]
    fn batches_concatenate_to_the_original_range() {
        let sizes = [7, 1, 13, 2, 2, 9, 30, 1, 1, 4, 11, 6];
        let records = records_with_sizes(&sizes);
        for budget in [1, 5, 8, 15, 31, 64, 1_000] {
            for range in [0..12, 3..9, 5..6, 11..12] {
                let mut rebuilt = Vec::new();
                let mut expected_start = range.start;
                for (span, batch) in Batches::new(&records, range.clone(), budget) {
                    assert_eq!(span.start, expected_start);
                    assert!(!batch.is_empty());
                    let total: u64 = batch.iter().map(Record::flow_size).sum();
                    assert!(batch.len() == 1 || total <= budget);
                    expected_start = span.end;
                    rebuilt.extend(batch.iter().cloned());
                }
                assert_eq!(rebuilt.as_slice(), &records[range]);
            }
        }
    }
}
