#![allow(dead_code)]

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use seqstream_core::record::{InputBuffer, MediaType};
use seqstream_proto::WireRecord;

pub const RECORDS: usize = 20;
const SEQUENCE_LEN: usize = 10;

/// The stub filter drops any read whose first-stream sequence contains an N.
pub fn is_kept(index: usize) -> bool {
    index % 3 != 0
}

pub fn keeps(record: &WireRecord) -> bool {
    !record[0][1].contains('N')
}

fn read(id: &str, sequence: &str) -> String {
    format!("{id}\n{sequence}\n+\n{}\n", "I".repeat(sequence.len()))
}

pub fn forward_text(indices: impl IntoIterator<Item = usize>) -> String {
    indices
        .into_iter()
        .map(|index| {
            let sequence = if is_kept(index) {
                "ACGTACGTAC"
            } else {
                "ACGTNACGTA"
            };
            read(&format!("@read{index}/1"), sequence)
        })
        .collect()
}

pub fn reverse_text(indices: impl IntoIterator<Item = usize>) -> String {
    indices
        .into_iter()
        .map(|index| read(&format!("@read{index}/2"), &"T".repeat(SEQUENCE_LEN)))
        .collect()
}

pub fn kept_indices() -> impl Iterator<Item = usize> {
    (0..RECORDS).filter(|index| is_kept(*index))
}

pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(text.as_bytes()).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

pub fn gunzip(bytes: &[u8]) -> String {
    let mut text = String::new();
    MultiGzDecoder::new(bytes)
        .read_to_string(&mut text)
        .expect("gunzip");
    text
}

/// A gzipped forward file and a plain reverse file.
pub fn paired_inputs() -> Vec<InputBuffer> {
    vec![
        InputBuffer::new(
            "sample_R1.fastq.gz",
            MediaType::Gzip,
            gzip(&forward_text(0..RECORDS)),
        ),
        InputBuffer::new(
            "sample_R2.fastq",
            MediaType::PlainText,
            reverse_text(0..RECORDS),
        ),
    ]
}
