//! FASTQ record framing.
//!
//! Inputs arrive as raw buffers with a declared media type. Each buffer is
//! decoded into lines and the paired streams are zipped in lock-step into
//! [`Record`]s, one read per stream.

use std::io::Read;
use std::ops::Range;

use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use seqstream_proto::{ReadLines, WireRecord};
use thiserror::Error;

pub const LINES_PER_RECORD: usize = 4;
pub const MAX_PAIRED_STREAMS: usize = 2;

/// Extensions the filesystem byte source accepts.
pub const ALLOWED_EXTENSIONS: [&str; 4] = [".fastq.gz", ".fq.gz", ".fastq", ".fq"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Gzip,
    PlainText,
}

impl MediaType {
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime.split(';').next().unwrap_or(mime).trim();
        if essence.eq_ignore_ascii_case("application/gzip")
            || essence.eq_ignore_ascii_case("application/x-gzip")
        {
            MediaType::Gzip
        } else {
            MediaType::PlainText
        }
    }

    /// Media type a file picker would declare for `name`, or `None` when the
    /// extension is not one of [`ALLOWED_EXTENSIONS`].
    pub fn declared_for(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase();
        let extension = ALLOWED_EXTENSIONS
            .iter()
            .find(|extension| lowered.ends_with(*extension))?;
        if extension.ends_with(".gz") {
            Some(MediaType::Gzip)
        } else {
            Some(MediaType::PlainText)
        }
    }

    pub fn as_mime(self) -> &'static str {
        match self {
            MediaType::Gzip => "application/gzip",
            MediaType::PlainText => "text/plain",
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, MediaType::Gzip)
    }
}

/// One raw input file as handed over by the byte source.
#[derive(Debug, Clone)]
pub struct InputBuffer {
    pub name: String,
    pub media_type: MediaType,
    pub bytes: Bytes,
}

impl InputBuffer {
    pub fn new(name: impl Into<String>, media_type: MediaType, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            media_type,
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub media_type: MediaType,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("no input files were supplied")]
    NoInputs,
    #[error("only one or two paired files can be uploaded, got {0}")]
    TooManyInputs(usize),
    #[error(
        "{name}: found a number of lines not divisible by 4 ({lines}), likely a corrupted file"
    )]
    MalformedInput { name: String, lines: usize },
    #[error("the files have a different line count ({counts:?}) and can therefore not be paired")]
    PairingMismatch { counts: Vec<usize> },
    #[error("{name}: contains no reads")]
    EmptyInput { name: String },
    #[error("{name}: failed to decompress gzip data: {source}")]
    Decompress {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name}: content is not valid UTF-8")]
    Encoding { name: String },
}

/// One read from every paired stream, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    reads: Vec<ReadLines>,
}

impl Record {
    pub fn new(reads: Vec<ReadLines>) -> Self {
        Self { reads }
    }

    /// Identifier line of the first stream; the server reports kept reads by it.
    pub fn identifier(&self) -> &str {
        self.reads
            .first()
            .map(|read| read[0].as_str())
            .unwrap_or_default()
    }

    pub fn reads(&self) -> &[ReadLines] {
        &self.reads
    }

    /// Flow-control size: sequence bytes summed over the paired reads.
    pub fn flow_size(&self) -> u64 {
        self.reads.iter().map(|read| read[1].len() as u64).sum()
    }

    pub fn to_wire(&self) -> WireRecord {
        self.reads.clone()
    }
}

#[derive(Debug, Clone)]
pub struct RecordSet {
    streams: Vec<StreamInfo>,
    records: Vec<Record>,
}

impl RecordSet {
    /// Decodes and validates the inputs. Fails before anything touches the
    /// network when a stream is not 4-line framed or the pairs disagree.
    pub fn parse(inputs: &[InputBuffer]) -> Result<Self, RecordError> {
        if inputs.is_empty() {
            return Err(RecordError::NoInputs);
        }
        if inputs.len() > MAX_PAIRED_STREAMS {
            return Err(RecordError::TooManyInputs(inputs.len()));
        }

        let decoded = inputs
            .iter()
            .map(decode_lines)
            .collect::<Result<Vec<_>, _>>()?;

        for (input, lines) in inputs.iter().zip(&decoded) {
            if lines.len() % LINES_PER_RECORD != 0 {
                return Err(RecordError::MalformedInput {
                    name: input.name.clone(),
                    lines: lines.len(),
                });
            }
        }

        let counts: Vec<usize> = decoded.iter().map(Vec::len).collect();
        if counts.iter().any(|count| *count != counts[0]) {
            return Err(RecordError::PairingMismatch { counts });
        }
        if counts[0] == 0 {
            return Err(RecordError::EmptyInput {
                name: inputs[0].name.clone(),
            });
        }

        let record_count = counts[0] / LINES_PER_RECORD;
        let mut streams: Vec<std::vec::IntoIter<String>> =
            decoded.into_iter().map(Vec::into_iter).collect();
        let mut records = Vec::with_capacity(record_count);
        for _ in 0..record_count {
            let reads = streams.iter_mut().map(take_read).collect();
            records.push(Record { reads });
        }

        Ok(Self {
            streams: inputs
                .iter()
                .map(|input| StreamInfo {
                    name: input.name.clone(),
                    media_type: input.media_type,
                })
                .collect(),
            records,
        })
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn filenames(&self) -> Vec<String> {
        self.streams.iter().map(|stream| stream.name.clone()).collect()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn slice(&self, range: Range<usize>) -> &[Record] {
        &self.records[range]
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Lines per stream; every stream has the same count.
    pub fn total_line_count(&self) -> usize {
        self.records.len() * LINES_PER_RECORD
    }

    pub fn flow_size(&self, range: Range<usize>) -> u64 {
        self.records[range].iter().map(Record::flow_size).sum()
    }
}

fn take_read(lines: &mut std::vec::IntoIter<String>) -> ReadLines {
    let mut next = || lines.next().unwrap_or_default();
    [next(), next(), next(), next()]
}

fn decode_lines(input: &InputBuffer) -> Result<Vec<String>, RecordError> {
    let mut text = match input.media_type {
        MediaType::Gzip => {
            let mut raw = Vec::new();
            MultiGzDecoder::new(input.bytes.as_ref())
                .read_to_end(&mut raw)
                .map_err(|source| RecordError::Decompress {
                    name: input.name.clone(),
                    source,
                })?;
            String::from_utf8(raw).map_err(|_| RecordError::Encoding {
                name: input.name.clone(),
            })?
        }
        MediaType::PlainText => {
            String::from_utf8(input.bytes.to_vec()).map_err(|_| RecordError::Encoding {
                name: input.name.clone(),
            })?
        }
    };
    // Trailing blank lines are not part of any record.
    let trimmed = text.trim_end().len();
    text.truncate(trimmed);
    Ok(text.lines().map(str::to_owned).collect())
}
