//! Chunk hash store: exact matching of normalized text chunks.

use std::collections::HashMap;
use std::path::Path;

use corpus_core::Digest256;

use crate::schema::{FingerprintKind, FingerprintRecord, FingerprintValue, HashParams};
use crate::store::{FingerprintStore, StoreBase, StoreStats};
use crate::Result;

/// Trim and collapse every whitespace run to a single space.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split normalized `text` into character chunks of `chunk_size`, each
/// starting `chunk_size - overlap` characters after the previous one. The last
/// chunk ends at the end of the text. A `chunk_size` of 0 yields the whole
/// normalized text as one chunk.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Vec::new();
    }
    if chunk_size == 0 {
        return vec![normalized];
    }

    let chars: Vec<char> = normalized.chars().collect();
    let total = chars.len();
    let step = chunk_size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + chunk_size).min(total);
        chunks.push(chars[start..end].iter().collect());
        if end >= total {
            break;
        }
        start += step;
    }
    chunks
}

/// `(chunk_id, hash)` pairs; the chunk id is the 0-based chunk index.
pub fn chunk_hashes(text: &str, chunk_size: usize, overlap: usize) -> Vec<(String, Digest256)> {
    chunk_text(text, chunk_size, overlap)
        .iter()
        .enumerate()
        .map(|(i, chunk)| (i.to_string(), Digest256::from_text(&normalize_whitespace(chunk))))
        .collect()
}

/// Global chunk hash store. Lookups are exact.
#[derive(Debug)]
pub struct ChunkHashStore {
    base: StoreBase,
    records: Vec<FingerprintRecord>,
    index: HashMap<Digest256, Vec<usize>>,
}

impl ChunkHashStore {
    pub fn open(root: &Path, params: HashParams) -> Result<Self> {
        let (base, live) = StoreBase::open(root, FingerprintKind::ChunkHash, params)?;
        let mut store = Self {
            base,
            records: Vec::with_capacity(live.len()),
            index: HashMap::new(),
        };
        for record in live {
            store.index(record);
        }
        Ok(store)
    }

    /// Chunk hashes of `text` under this store's chunking parameters.
    pub fn chunk_hashes(&self, text: &str) -> Vec<(String, Digest256)> {
        let params = self.base.params();
        chunk_hashes(text, params.chunk_size, params.chunk_overlap)
    }

    fn index(&mut self, record: FingerprintRecord) {
        if let FingerprintValue::ChunkHash(hash) = record.value {
            self.index.entry(hash).or_default().push(self.records.len());
            self.records.push(record);
        }
    }
}

impl FingerprintStore for ChunkHashStore {
    type Query = Digest256;

    fn kind(&self) -> FingerprintKind {
        self.base.kind()
    }

    fn hash_params(&self) -> &HashParams {
        self.base.params()
    }

    fn query(&self, hash: &Digest256) -> Vec<&FingerprintRecord> {
        self.index
            .get(hash)
            .map(|positions| positions.iter().map(|&p| &self.records[p]).collect())
            .unwrap_or_default()
    }

    fn add(&mut self, record: FingerprintRecord) -> Result<bool> {
        if !self.base.admit(&record)? {
            return Ok(false);
        }
        self.index(record);
        Ok(true)
    }

    fn flush(&mut self) -> Result<()> {
        self.base.flush()
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn stats(&self) -> StoreStats {
        self.base.stats()
    }
}
