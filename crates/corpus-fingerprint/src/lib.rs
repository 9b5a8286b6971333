//! Global fingerprint deduplication.
//!
//! Three append-only stores persist fingerprints across runs and sources:
//!
//! - SimHash: 64-bit signature, near-duplicates within a Hamming radius
//! - MinHash + LSH: banded signatures, near-duplicates above a Jaccard threshold
//! - Chunk hash: SHA-256 of normalized fixed-size chunks, partial overlap
//!
//! [`GlobalFingerprintManager`] computes fingerprints for a document, queries
//! the stores, resolves conflicts by source and document-type priority, and
//! commits the fingerprints of kept documents.

pub mod chunk_hash;
pub mod manager;
pub mod metrics;
pub mod minhash;
pub mod priority;
pub mod schema;
pub mod simhash;
pub mod store;

use std::hash::Hasher;
use std::path::PathBuf;

use siphasher::sip::SipHasher13;

pub use chunk_hash::{chunk_hashes, chunk_text, normalize_whitespace, ChunkHashStore};
pub use manager::{FingerprintSet, GlobalFingerprintManager};
pub use metrics::{FingerprintMetrics, SourceCounters};
pub use minhash::{optimal_bands, MinHashStore, MinHasher};
pub use priority::{
    document_type_priority_rank, rank, should_keep_incoming_by_priority,
    should_keep_incoming_by_type_and_source, source_priority_rank, PriorityPolicy,
};
pub use schema::{
    DedupAction, DedupDecision, DocumentRef, FingerprintKind, FingerprintRecord,
    FingerprintValue, HashParams, MinHashSignature,
};
pub use simhash::{hamming_distance, simhash, SimHashStore};
pub use store::{FingerprintStore, RecordLog, StoreStats};

/// Error types for fingerprint operations
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Fingerprint kind mismatch: store holds {expected}, got {actual}")]
    KindMismatch {
        expected: FingerprintKind,
        actual: FingerprintKind,
    },

    #[error(transparent)]
    Core(#[from] corpus_core::CoreError),
}

impl FingerprintError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, FingerprintError>;

/// Process-independent 64-bit hash; persisted signatures depend on it.
pub(crate) fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(bytes);
    hasher.finish()
}
