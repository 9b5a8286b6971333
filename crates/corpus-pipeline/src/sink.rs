//! Sink boundary: where accepted shards and rejections go.
//!
//! Both sinks are append-only from the pipeline's point of view; it never
//! reads them back. Concrete file formats live outside this crate.

use std::path::{Path, PathBuf};

use crate::document::{Document, RejectionRecord};
use crate::Result;

/// Where a shard belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDestination {
    pub out_dir: PathBuf,
    pub source: String,
    pub shard_index: u64,
}

impl ShardDestination {
    pub fn new(out_dir: &Path, source: &str, shard_index: u64) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
            source: source.to_string(),
            shard_index,
        }
    }

    /// `<out_dir>/docs/source=<source>/shard_<index>`, without extension.
    pub fn stem(&self) -> PathBuf {
        self.out_dir
            .join("docs")
            .join(format!("source={}", self.source))
            .join(format!("shard_{:06}", self.shard_index))
    }
}

pub trait ShardWriter {
    /// Write one batch of accepted documents and return where it went.
    fn write_shard(&mut self, documents: &[Document], destination: &ShardDestination) -> Result<PathBuf>;
}

pub trait RejectionSink {
    fn append(&mut self, records: &[RejectionRecord]) -> Result<()>;
}

/// Keeps shards in memory.
#[derive(Debug, Default)]
pub struct MemoryShardWriter {
    shards: Vec<(ShardDestination, Vec<Document>)>,
}

impl MemoryShardWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shards(&self) -> &[(ShardDestination, Vec<Document>)] {
        &self.shards
    }

    /// All written documents, in write order.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.shards.iter().flat_map(|(_, docs)| docs.iter())
    }

    pub fn document_count(&self) -> usize {
        self.shards.iter().map(|(_, docs)| docs.len()).sum()
    }
}

impl ShardWriter for MemoryShardWriter {
    fn write_shard(&mut self, documents: &[Document], destination: &ShardDestination) -> Result<PathBuf> {
        self.shards.push((destination.clone(), documents.to_vec()));
        Ok(destination.stem())
    }
}

/// Keeps rejection records in memory.
#[derive(Debug, Default)]
pub struct MemoryRejectionSink {
    records: Vec<RejectionRecord>,
    flushes: usize,
}

impl MemoryRejectionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[RejectionRecord] {
        &self.records
    }

    /// Number of non-empty batches received.
    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl RejectionSink for MemoryRejectionSink {
    fn append(&mut self, records: &[RejectionRecord]) -> Result<()> {
        if !records.is_empty() {
            self.records.extend_from_slice(records);
            self.flushes += 1;
        }
        Ok(())
    }
}
