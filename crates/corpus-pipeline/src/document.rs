//! Normalized document record and stage verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use corpus_core::DocId;
use corpus_fingerprint::DocumentRef;

/// Characters hashed for the provisional identity assigned at ingestion.
const PROVISIONAL_ID_CHARS: usize = 512;

/// Machine-readable rejection reason codes.
pub mod reasons {
    pub const LICENSE_UNKNOWN: &str = "LICENSE_UNKNOWN";
    pub const LICENSE_DISALLOWED: &str = "LICENSE_DISALLOWED";
    pub const LICENSE_NOT_ALLOWED: &str = "LICENSE_NOT_ALLOWED";
    pub const TOO_SHORT: &str = "TOO_SHORT";
    pub const ENTROPY_OUT_OF_RANGE: &str = "ENTROPY_OUT_OF_RANGE";
    pub const DUP_EXACT: &str = "DUP_EXACT";
    pub const DUP_GLOBAL: &str = "DUP_GLOBAL";
    pub const PII_EMAIL: &str = "PII_EMAIL";
    pub const RUNTIME_ERROR: &str = "RUNTIME_ERROR";

    /// Stage name recorded for faults caught at the driver boundary.
    pub const RUNTIME_ERROR_STAGE: &str = "runtime_error";
}

/// A document as delivered by a source, before any stage has run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDocument {
    /// Upstream identifier, unique within its source.
    pub id: String,
    pub text: String,
    pub source_name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub license_version: Option<String>,
    /// Originating file for multi-file sources.
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub extra_metadata: HashMap<String, serde_json::Value>,
}

impl RawDocument {
    pub fn new(
        id: impl Into<String>,
        source_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source_name: source_name.into(),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    pub fn with_source_file(mut self, path: impl Into<String>) -> Self {
        self.source_file = Some(path.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra_metadata.insert(key.into(), value);
        self
    }
}

/// The unit of work flowing through the stage chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    // identity
    pub doc_id: DocId,
    pub source: String,
    pub text: String,
    /// Upstream identifier from the source.
    pub raw_id: String,

    // provenance
    pub url: Option<String>,
    pub license: Option<String>,
    pub license_version: Option<String>,
    pub lang: String,
    pub source_file: Option<String>,

    // lifecycle stats
    pub chars: Option<usize>,
    pub bytes_utf8: Option<usize>,
    pub entropy: Option<f64>,
    pub tokens: Option<u64>,
    pub ppl: Option<f64>,
    pub quality_score: Option<f64>,

    pub dup_group_id: Option<u64>,

    pub pii_flag: bool,
    pub pii_types: Vec<String>,

    // governance
    pub policy_version: String,
    pub data_tag: Option<String>,
    /// Append-only audit log of applied transforms.
    pub transform_chain: Vec<String>,
    pub created_at: DateTime<Utc>,

    pub extra: HashMap<String, serde_json::Value>,
}

impl Document {
    /// Normalize a raw document. The identity is provisional until a dedup
    /// stage recomputes it over the final text.
    pub fn from_raw(raw: RawDocument, policy_version: &str) -> Self {
        let head: String = raw.text.chars().take(PROVISIONAL_ID_CHARS).collect();
        Self {
            doc_id: DocId::from_text(&head),
            source: raw.source_name,
            text: raw.text,
            raw_id: raw.id,
            url: raw.url,
            license: raw.license,
            license_version: raw.license_version,
            lang: "en".to_string(),
            source_file: raw.source_file,
            chars: None,
            bytes_utf8: None,
            entropy: None,
            tokens: None,
            ppl: None,
            quality_score: None,
            dup_group_id: None,
            pii_flag: false,
            pii_types: Vec::new(),
            policy_version: policy_version.to_string(),
            data_tag: None,
            transform_chain: Vec::new(),
            created_at: Utc::now(),
            extra: raw.extra_metadata,
        }
    }

    /// Recompute the identity over the full current text.
    pub fn finalize_id(&mut self) -> DocId {
        self.doc_id = DocId::from_text(&self.text);
        self.doc_id
    }

    pub fn push_transform(&mut self, entry: impl Into<String>) {
        self.transform_chain.push(entry.into());
    }

    /// Borrowed identity view for the fingerprint manager.
    pub fn fingerprint_ref(&self) -> DocumentRef<'_> {
        DocumentRef::new(self.doc_id, &self.source)
            .with_raw_id(&self.raw_id)
            .with_language(&self.lang)
    }
}

/// Immutable per-stage verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub accepted: bool,
    pub stage: String,
    #[serde(default)]
    pub reason_code: String,
    #[serde(default)]
    pub reason_detail: String,
}

impl Decision {
    pub fn accept(stage: &str) -> Self {
        Self {
            accepted: true,
            stage: stage.to_string(),
            reason_code: String::new(),
            reason_detail: String::new(),
        }
    }

    pub fn reject(stage: &str, reason_code: &str, reason_detail: impl Into<String>) -> Self {
        Self {
            accepted: false,
            stage: stage.to_string(),
            reason_code: reason_code.to_string(),
            reason_detail: reason_detail.into(),
        }
    }
}

/// Entry emitted to the rejection sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub doc_id: String,
    pub source: String,
    #[serde(default)]
    pub source_file: Option<String>,
    pub stage: String,
    pub reason_code: String,
    pub reason_detail: String,
    pub timestamp: DateTime<Utc>,
}

impl RejectionRecord {
    pub fn from_decision(doc: &Document, decision: &Decision) -> Self {
        Self {
            doc_id: doc.doc_id.to_hex(),
            source: doc.source.clone(),
            source_file: doc.source_file.clone(),
            stage: decision.stage.clone(),
            reason_code: decision.reason_code.clone(),
            reason_detail: decision.reason_detail.clone(),
            timestamp: Utc::now(),
        }
    }

    /// A fault caught at the driver boundary.
    pub fn runtime_error(doc: &Document, message: impl Into<String>) -> Self {
        let decision = Decision::reject(
            reasons::RUNTIME_ERROR_STAGE,
            reasons::RUNTIME_ERROR,
            message,
        );
        Self::from_decision(doc, &decision)
    }

    /// A record the source failed to deliver; there is no document to describe.
    pub fn source_error(source: &str, message: impl Into<String>) -> Self {
        Self {
            doc_id: String::new(),
            source: source.to_string(),
            source_file: None,
            stage: reasons::RUNTIME_ERROR_STAGE.to_string(),
            reason_code: reasons::RUNTIME_ERROR.to_string(),
            reason_detail: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_raw_uses_provisional_identity() {
        let long_text = "x".repeat(600);
        let raw = RawDocument::new("r1", "web", long_text.clone())
            .with_license("cc-by")
            .with_metadata("lang_hint", serde_json::json!("en"));
        let doc = Document::from_raw(raw, "policy_v0");

        assert_eq!(doc.doc_id, DocId::from_text(&"x".repeat(512)));
        assert_eq!(doc.source, "web");
        assert_eq!(doc.raw_id, "r1");
        assert_eq!(doc.license.as_deref(), Some("cc-by"));
        assert_eq!(doc.lang, "en");
        assert_eq!(doc.policy_version, "policy_v0");
        assert!(doc.extra.contains_key("lang_hint"));

        let mut doc = doc;
        assert_eq!(doc.finalize_id(), DocId::from_text(&long_text));
    }

    #[test]
    fn test_rejection_record_from_decision() {
        let doc = Document::from_raw(
            RawDocument::new("r1", "web", "hello").with_source_file("part-0.jsonl"),
            "policy_v0",
        );
        let decision = Decision::reject("quality_gate", reasons::TOO_SHORT, "chars=5");
        let record = RejectionRecord::from_decision(&doc, &decision);

        assert_eq!(record.doc_id, doc.doc_id.to_hex());
        assert_eq!(record.stage, "quality_gate");
        assert_eq!(record.reason_code, "TOO_SHORT");
        assert_eq!(record.source_file.as_deref(), Some("part-0.jsonl"));

        let fault = RejectionRecord::runtime_error(&doc, "boom");
        assert_eq!(fault.stage, "runtime_error");
        assert_eq!(fault.reason_code, "RUNTIME_ERROR");
        assert_eq!(fault.reason_detail, "boom");
    }

    #[test]
    fn test_accept_has_empty_reason() {
        let decision = Decision::accept("sanitize");
        assert!(decision.accepted);
        assert!(decision.reason_code.is_empty());
    }
}
