//! Global fingerprint schema and decision types.
//!
//! Records carry no document text, only the fingerprint plus enough metadata to
//! answer "have we seen this, where did it come from, is it partial?". The hash
//! parameters are stored with every record so that changing them later never
//! silently compares incompatible fingerprints.

use chrono::{DateTime, Utc};
use corpus_core::{Digest256, DocId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which matching strategy produced a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintKind {
    Simhash,
    Minhash,
    ChunkHash,
}

impl FingerprintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simhash => "simhash",
            Self::Minhash => "minhash",
            Self::ChunkHash => "chunk_hash",
        }
    }
}

impl fmt::Display for FingerprintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Versioned numeric knobs that produced a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashParams {
    pub fingerprint_version: String,
    #[serde(default)]
    pub shingle_size: usize,
    #[serde(default)]
    pub num_hashes: usize,
    #[serde(default)]
    pub bit_width: u32,
    #[serde(default)]
    pub max_tokens: usize,
    #[serde(default)]
    pub chunk_size: usize,
    #[serde(default)]
    pub chunk_overlap: usize,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            fingerprint_version: "v1".to_string(),
            shingle_size: 5,
            num_hashes: 128,
            bit_width: 64,
            max_tokens: 2000,
            chunk_size: 512,
            chunk_overlap: 0,
        }
    }
}

impl HashParams {
    pub fn simhash(version: &str, max_tokens: usize) -> Self {
        Self {
            fingerprint_version: version.to_string(),
            max_tokens,
            ..Default::default()
        }
    }

    pub fn minhash(version: &str, shingle_size: usize, num_hashes: usize) -> Self {
        Self {
            fingerprint_version: version.to_string(),
            shingle_size,
            num_hashes,
            ..Default::default()
        }
    }

    pub fn chunk_hash(version: &str, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            fingerprint_version: version.to_string(),
            chunk_size,
            chunk_overlap,
            ..Default::default()
        }
    }

    /// Fingerprints are only comparable within one fingerprint version.
    pub fn is_comparable(&self, other: &HashParams) -> bool {
        self.fingerprint_version == other.fingerprint_version
    }
}

/// Near-duplicate signature: the minimum hash value under each hash function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinHashSignature(Vec<u64>);

impl MinHashSignature {
    pub fn new(values: Vec<u64>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Estimated Jaccard similarity: the fraction of agreeing positions.
    /// Signatures of different lengths are never similar.
    pub fn jaccard(&self, other: &MinHashSignature) -> f64 {
        if self.0.is_empty() || self.0.len() != other.0.len() {
            return 0.0;
        }
        let equal = self.0.iter().zip(&other.0).filter(|(a, b)| a == b).count();
        equal as f64 / self.0.len() as f64
    }
}

/// A fingerprint value, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FingerprintValue {
    Simhash(#[serde(with = "hex_u64")] u64),
    Minhash(MinHashSignature),
    ChunkHash(Digest256),
}

impl FingerprintValue {
    pub fn kind(&self) -> FingerprintKind {
        match self {
            Self::Simhash(_) => FingerprintKind::Simhash,
            Self::Minhash(_) => FingerprintKind::Minhash,
            Self::ChunkHash(_) => FingerprintKind::ChunkHash,
        }
    }
}

mod hex_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:016x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let digits = raw.trim_start_matches("0x");
        u64::from_str_radix(digits, 16).map_err(de::Error::custom)
    }
}

/// The document a fingerprint is being computed for or compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentRef<'a> {
    pub doc_id: DocId,
    /// Upstream identifier from the source, when it has one.
    pub raw_id: Option<&'a str>,
    pub source: &'a str,
    pub language: &'a str,
}

impl<'a> DocumentRef<'a> {
    pub fn new(doc_id: DocId, source: &'a str) -> Self {
        Self {
            doc_id,
            raw_id: None,
            source,
            language: "en",
        }
    }

    pub fn with_raw_id(mut self, raw_id: &'a str) -> Self {
        self.raw_id = Some(raw_id);
        self
    }

    pub fn with_language(mut self, language: &'a str) -> Self {
        self.language = language;
        self
    }
}

/// A single durable fingerprint entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint_id: Uuid,
    pub value: FingerprintValue,
    pub doc_id: DocId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Run that committed the record; empty for records written before runs
    /// were tracked.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub hash_params: HashParams,
}

fn default_language() -> String {
    "en".to_string()
}

impl FingerprintRecord {
    pub fn new(value: FingerprintValue, owner: &DocumentRef<'_>, hash_params: HashParams) -> Self {
        Self {
            fingerprint_id: Uuid::new_v4(),
            value,
            doc_id: owner.doc_id,
            raw_id: owner.raw_id.map(str::to_string),
            chunk_id: None,
            source: owner.source.to_string(),
            language: owner.language.to_string(),
            run_id: String::new(),
            created_at: Utc::now(),
            hash_params,
        }
    }

    pub fn with_chunk_id(mut self, chunk_id: impl Into<String>) -> Self {
        self.chunk_id = Some(chunk_id.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn kind(&self) -> FingerprintKind {
        self.value.kind()
    }

    /// Whether this record was committed for `doc` itself earlier in run
    /// `run_id` (before a crash and resume), as opposed to a different
    /// document or an earlier run. A document without an upstream id has no
    /// identity beyond its text and never owns a record.
    pub fn belongs_to(&self, doc: &DocumentRef<'_>, run_id: &str) -> bool {
        let Some(raw_id) = doc.raw_id.filter(|id| !id.is_empty()) else {
            return false;
        };
        !run_id.is_empty()
            && self.run_id == run_id
            && self.doc_id == doc.doc_id
            && self.source == doc.source
            && self.raw_id.as_deref() == Some(raw_id)
    }

    pub(crate) fn owner_key(&self) -> OwnerKey {
        OwnerKey {
            doc_id: self.doc_id,
            source: self.source.clone(),
            raw_id: self.raw_id.clone(),
            chunk_id: self.chunk_id.clone(),
        }
    }
}

/// Identity of a committed record, used to make commits idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct OwnerKey {
    doc_id: DocId,
    source: String,
    raw_id: Option<String>,
    chunk_id: Option<String>,
}

/// Action taken by the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DedupAction {
    Drop,
    Keep,
    /// Keep, but record that part of the document overlaps prior content.
    KeepLink,
}

impl DedupAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drop => "DROP",
            Self::Keep => "KEEP",
            Self::KeepLink => "KEEP_LINK",
        }
    }
}

impl fmt::Display for DedupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of querying the global stores and running the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupDecision {
    pub action: DedupAction,
    pub match_type: Option<FingerprintKind>,
    pub existing_doc_ids: Vec<DocId>,
    pub existing_sources: Vec<String>,
    /// 0-indexed chunk ids of the incoming document that were seen before.
    pub duplicate_chunk_ids: Vec<String>,
    /// A match was found but the incoming document outranked it.
    pub superseded: bool,
    pub reason: String,
}

impl DedupDecision {
    pub fn keep() -> Self {
        Self {
            action: DedupAction::Keep,
            match_type: None,
            existing_doc_ids: Vec::new(),
            existing_sources: Vec::new(),
            duplicate_chunk_ids: Vec::new(),
            superseded: false,
            reason: String::new(),
        }
    }

    pub fn is_drop(&self) -> bool {
        self.action == DedupAction::Drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_serialization_shape() {
        let doc = DocumentRef::new(DocId::from_text("hello"), "wiki").with_raw_id("row-1");
        let record = FingerprintRecord::new(
            FingerprintValue::Simhash(0xdead_beef),
            &doc,
            HashParams::simhash("v1", 2000),
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["value"]["kind"], "simhash");
        assert_eq!(json["value"]["value"], "00000000deadbeef");
        assert_eq!(json["doc_id"], doc.doc_id.to_hex());
        assert_eq!(json["raw_id"], "row-1");
        assert!(json.get("chunk_id").is_none());
        assert!(json.get("run_id").is_none());

        let back: FingerprintRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_without_run_id_still_loads() {
        let doc = DocumentRef::new(DocId::from_text("hello"), "wiki");
        let record = FingerprintRecord::new(
            FingerprintValue::Simhash(3),
            &doc,
            HashParams::simhash("v1", 2000),
        )
        .with_run_id("run_a");

        let mut json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["run_id"], "run_a");
        json.as_object_mut().unwrap().remove("run_id");

        let back: FingerprintRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.run_id, "");
    }

    #[test]
    fn test_belongs_to() {
        let id = DocId::from_text("same text");
        let a = DocumentRef::new(id, "web").with_raw_id("1");
        let record = FingerprintRecord::new(
            FingerprintValue::Simhash(1),
            &a,
            HashParams::default(),
        )
        .with_run_id("run_a");

        assert!(record.belongs_to(&a, "run_a"));
        assert!(!record.belongs_to(&a, "run_b"));
        assert!(!record.belongs_to(&a, ""));
        assert!(!record.belongs_to(&DocumentRef::new(id, "books").with_raw_id("1"), "run_a"));
        assert!(!record.belongs_to(&DocumentRef::new(id, "web").with_raw_id("2"), "run_a"));
    }

    #[test]
    fn test_empty_raw_id_owns_nothing() {
        let id = DocId::from_text("same text");
        let anonymous = DocumentRef::new(id, "web").with_raw_id("");
        let record = FingerprintRecord::new(
            FingerprintValue::Simhash(1),
            &anonymous,
            HashParams::default(),
        )
        .with_run_id("run_a");

        assert!(!record.belongs_to(&anonymous, "run_a"));
        assert!(!record.belongs_to(&DocumentRef::new(id, "web"), "run_a"));
    }

    #[test]
    fn test_minhash_jaccard() {
        let a = MinHashSignature::new(vec![1, 2, 3, 4]);
        let b = MinHashSignature::new(vec![1, 2, 9, 9]);
        let c = MinHashSignature::new(vec![1, 2]);

        assert_eq!(a.jaccard(&a), 1.0);
        assert_eq!(a.jaccard(&b), 0.5);
        assert_eq!(a.jaccard(&c), 0.0);
    }

    #[test]
    fn test_version_comparability() {
        let v1 = HashParams::minhash("v1", 5, 128);
        let v1_other = HashParams::minhash("v1", 7, 64);
        let v2 = HashParams::minhash("v2", 5, 128);

        assert!(v1.is_comparable(&v1_other));
        assert!(!v1.is_comparable(&v2));
    }

    #[test]
    fn test_action_wire_names() {
        assert_eq!(serde_json::to_string(&DedupAction::KeepLink).unwrap(), "\"KEEP_LINK\"");
        assert_eq!(DedupAction::Drop.to_string(), "DROP");
    }
}
