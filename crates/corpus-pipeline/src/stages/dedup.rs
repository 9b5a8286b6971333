//! Deduplication stages: run-local exact matching and the global fingerprint
//! check.

use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use corpus_core::{DedupConfig, DocId};
use corpus_fingerprint::GlobalFingerprintManager;

use crate::document::{reasons, Decision, Document};
use crate::stage::{Stage, StageLayer};
use crate::Result;

/// Rejects exact repeats of text already accepted in this process and
/// finalizes the document identity.
#[derive(Debug, Default)]
pub struct ExactDedupStage {
    seen: HashSet<DocId>,
}

impl ExactDedupStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> usize {
        self.seen.len()
    }
}

impl Stage for ExactDedupStage {
    fn name(&self) -> &'static str {
        "exact_dedup"
    }

    fn apply(&mut self, doc: &mut Document) -> Result<Decision> {
        let digest = doc.finalize_id();
        if !self.seen.insert(digest) {
            return Ok(Decision::reject(
                self.name(),
                reasons::DUP_EXACT,
                "duplicate content hash",
            ));
        }
        doc.dup_group_id = Some(digest.group_key());
        doc.push_transform("exact_dedup_v1");
        Ok(Decision::accept(self.name()))
    }
}

/// Checks documents against the persistent cross-run fingerprint stores and
/// commits fingerprints of every document it lets through.
pub struct GlobalDedupStage {
    manager: GlobalFingerprintManager,
}

impl GlobalDedupStage {
    pub fn new(manager: GlobalFingerprintManager) -> Self {
        Self { manager }
    }

    /// Open the stores under `config.root_path`, resolved against `out_dir`,
    /// for run `run_id`.
    pub fn open(config: &DedupConfig, out_dir: &Path, run_id: &str) -> Result<Self> {
        let root = GlobalFingerprintManager::resolve_root(config, out_dir);
        Ok(Self::new(GlobalFingerprintManager::open(config, root, run_id)?))
    }

    pub fn manager(&self) -> &GlobalFingerprintManager {
        &self.manager
    }
}

impl Stage for GlobalDedupStage {
    fn name(&self) -> &'static str {
        "global_dedup"
    }

    fn layer(&self) -> StageLayer {
        StageLayer::Dedup
    }

    fn apply(&mut self, doc: &mut Document) -> Result<Decision> {
        doc.finalize_id();
        let fingerprints = self.manager.compute_fingerprints(&doc.text);
        let decision = self.manager.decide(&doc.fingerprint_ref(), &fingerprints);

        if decision.is_drop() {
            doc.push_transform("global_dedup_dropped_v1");
            let detail = if decision.reason.is_empty() {
                match decision.match_type {
                    Some(kind) => format!("match_type={}", kind),
                    None => "match_type=unknown".to_string(),
                }
            } else {
                decision.reason.clone()
            };
            return Ok(Decision::reject(self.name(), reasons::DUP_GLOBAL, detail));
        }

        let committed = self
            .manager
            .add_fingerprints(&doc.fingerprint_ref(), &fingerprints)?;

        if decision.duplicate_chunk_ids.is_empty() {
            doc.push_transform("global_dedup_kept_v1");
        } else {
            doc.push_transform(format!(
                "global_dedup_keep_link_chunks={}_v1",
                decision.duplicate_chunk_ids.len()
            ));
        }
        if decision.match_type.is_some() {
            doc.extra
                .insert("global_dedup".to_string(), serde_json::to_value(&decision)?);
        }

        debug!(
            doc_id = %doc.doc_id,
            source = %doc.source,
            action = %decision.action,
            committed,
            "Global dedup passed"
        );
        Ok(Decision::accept(self.name()))
    }

    fn flush(&mut self) -> Result<()> {
        self.manager.flush()?;
        Ok(())
    }

    fn summary(&self) -> Option<String> {
        Some(self.manager.metrics().summary())
    }
}
