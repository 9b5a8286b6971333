//! Global fingerprint manager: fingerprints, store queries and the decision
//! engine behind one check/commit protocol.
//!
//! A document is checked once (`decide`), and only a non-`DROP` verdict is
//! followed by `add_fingerprints`. Records committed for the same document in
//! the current run are never treated as matches, so re-checking a document
//! that was committed before a crash yields the same verdict it originally
//! had. Records from earlier runs always match.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use corpus_core::{DedupConfig, Digest256, DocId};
use tracing::{debug, info};

use crate::chunk_hash::ChunkHashStore;
use crate::metrics::FingerprintMetrics;
use crate::minhash::MinHashStore;
use crate::priority::PriorityPolicy;
use crate::schema::{
    DedupAction, DedupDecision, DocumentRef, FingerprintKind, FingerprintRecord,
    FingerprintValue, HashParams, MinHashSignature,
};
use crate::simhash::SimHashStore;
use crate::store::{FingerprintStore, StoreStats};
use crate::Result;

/// Fingerprints of one document for every enabled store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FingerprintSet {
    pub simhash: Option<u64>,
    pub minhash: Option<MinHashSignature>,
    /// `(chunk_id, hash)` in chunk order.
    pub chunks: Vec<(String, Digest256)>,
}

/// Owning document ids and sources of foreign matches, deduplicated in
/// first-seen order.
#[derive(Debug, Default)]
struct Matches {
    doc_ids: Vec<DocId>,
    sources: Vec<String>,
}

impl Matches {
    fn collect<'r>(
        records: impl IntoIterator<Item = &'r FingerprintRecord>,
        doc: &DocumentRef<'_>,
        run_id: &str,
    ) -> Self {
        let mut matches = Self::default();
        for record in records.into_iter().filter(|r| !r.belongs_to(doc, run_id)) {
            if !matches.doc_ids.contains(&record.doc_id) {
                matches.doc_ids.push(record.doc_id);
            }
            if !matches.sources.contains(&record.source) {
                matches.sources.push(record.source.clone());
            }
        }
        matches
    }

    fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    fn merge_into(self, decision: &mut DedupDecision) {
        for id in self.doc_ids {
            if !decision.existing_doc_ids.contains(&id) {
                decision.existing_doc_ids.push(id);
            }
        }
        for source in self.sources {
            if !decision.existing_sources.contains(&source) {
                decision.existing_sources.push(source);
            }
        }
    }
}

/// Coordinates the SimHash, MinHash and chunk hash stores.
///
/// Not thread-safe by contract: one manager owns its stores and callers
/// serialize access.
#[derive(Debug)]
pub struct GlobalFingerprintManager {
    root: PathBuf,
    run_id: String,
    simhash: Option<SimHashStore>,
    minhash: Option<MinHashStore>,
    chunk: Option<ChunkHashStore>,
    simhash_drop_on_match: bool,
    minhash_drop_on_match: bool,
    chunk_drop_on_match: bool,
    priority: PriorityPolicy,
    metrics: FingerprintMetrics,
}

impl GlobalFingerprintManager {
    /// `config.root_path` when absolute, else joined onto `base_dir`.
    pub fn resolve_root(config: &DedupConfig, base_dir: &Path) -> PathBuf {
        let root = Path::new(&config.root_path);
        if root.is_absolute() {
            root.to_path_buf()
        } else {
            base_dir.join(root)
        }
    }

    /// Open every enabled store under `root` for run `run_id`. Any store
    /// failing to open is an error: a silently disabled strategy would change
    /// dedup results.
    pub fn open(config: &DedupConfig, root: impl AsRef<Path>, run_id: impl Into<String>) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        let run_id = run_id.into();
        let version = config.fingerprint_version.as_str();

        let simhash = if config.simhash.enabled {
            Some(SimHashStore::open(
                &root,
                config.simhash.max_hamming,
                HashParams::simhash(version, config.simhash.max_tokens),
            )?)
        } else {
            None
        };
        let minhash = if config.minhash.enabled {
            Some(MinHashStore::open(
                &root,
                config.minhash.threshold,
                HashParams::minhash(version, config.minhash.shingle_size, config.minhash.num_hashes),
            )?)
        } else {
            None
        };
        let chunk = if config.chunk_hash.enabled {
            Some(ChunkHashStore::open(
                &root,
                HashParams::chunk_hash(
                    version,
                    config.chunk_hash.chunk_size,
                    config.chunk_hash.chunk_overlap,
                ),
            )?)
        } else {
            None
        };

        let manager = Self {
            root,
            run_id,
            simhash,
            minhash,
            chunk,
            simhash_drop_on_match: config.simhash.drop_on_match,
            minhash_drop_on_match: config.minhash.drop_on_match,
            chunk_drop_on_match: config.chunk_hash.drop_on_match,
            priority: PriorityPolicy::from_config(config),
            metrics: FingerprintMetrics::new(),
        };

        info!(
            root = %manager.root.display(),
            run_id = %manager.run_id,
            version,
            simhash = manager.simhash.as_ref().map(|s| s.len()),
            minhash = manager.minhash.as_ref().map(|s| s.len()),
            chunk_hash = manager.chunk.as_ref().map(|s| s.len()),
            "Global fingerprint stores opened"
        );
        Ok(manager)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn enabled_kinds(&self) -> Vec<FingerprintKind> {
        let mut kinds = Vec::new();
        if self.simhash.is_some() {
            kinds.push(FingerprintKind::Simhash);
        }
        if self.minhash.is_some() {
            kinds.push(FingerprintKind::Minhash);
        }
        if self.chunk.is_some() {
            kinds.push(FingerprintKind::ChunkHash);
        }
        kinds
    }

    /// Load counters for each enabled store.
    pub fn store_stats(&self) -> Vec<(FingerprintKind, StoreStats)> {
        let mut stats = Vec::new();
        if let Some(store) = &self.simhash {
            stats.push((store.kind(), store.stats()));
        }
        if let Some(store) = &self.minhash {
            stats.push((store.kind(), store.stats()));
        }
        if let Some(store) = &self.chunk {
            stats.push((store.kind(), store.stats()));
        }
        stats
    }

    pub fn metrics(&self) -> &FingerprintMetrics {
        &self.metrics
    }

    pub fn priority(&self) -> &PriorityPolicy {
        &self.priority
    }

    pub fn compute_fingerprints(&self, text: &str) -> FingerprintSet {
        FingerprintSet {
            simhash: self.simhash.as_ref().and_then(|s| s.signature(text)),
            minhash: self.minhash.as_ref().and_then(|s| s.signature(text)),
            chunks: self
                .chunk
                .as_ref()
                .map(|s| s.chunk_hashes(text))
                .unwrap_or_default(),
        }
    }

    /// Compute fingerprints for `text` and decide.
    pub fn query_and_decide(&mut self, doc: &DocumentRef<'_>, text: &str) -> DedupDecision {
        let fingerprints = self.compute_fingerprints(text);
        self.decide(doc, &fingerprints)
    }

    /// Query the stores in SimHash, MinHash, chunk order and decide.
    pub fn decide(&mut self, doc: &DocumentRef<'_>, fingerprints: &FingerprintSet) -> DedupDecision {
        let mut decision = DedupDecision::keep();

        if let (Some(store), Some(signature)) = (&self.simhash, fingerprints.simhash) {
            let matches = Matches::collect(store.query(&signature), doc, &self.run_id);
            if !matches.is_empty() {
                decision.match_type = Some(FingerprintKind::Simhash);
                matches.merge_into(&mut decision);
                if self.simhash_drop_on_match {
                    return self.resolve(
                        doc,
                        decision,
                        "SimHash match (coarse duplicate)",
                        "SimHash match but incoming has higher priority; keep",
                    );
                }
            }
        }

        if let (Some(store), Some(signature)) = (&self.minhash, fingerprints.minhash.as_ref()) {
            let matches = Matches::collect(store.query(signature), doc, &self.run_id);
            if !matches.is_empty() {
                decision.match_type = Some(FingerprintKind::Minhash);
                matches.merge_into(&mut decision);
                if self.minhash_drop_on_match {
                    return self.resolve(
                        doc,
                        decision,
                        "MinHash near-duplicate",
                        "MinHash match but incoming has higher priority; keep",
                    );
                }
            }
        }

        if let Some(store) = &self.chunk {
            let mut duplicate_chunk_ids = Vec::new();
            let mut seen = HashSet::new();
            for (chunk_id, hash) in &fingerprints.chunks {
                // Repeated chunks within the document are checked once.
                if !seen.insert(hash) {
                    continue;
                }
                let matches = Matches::collect(store.query(hash), doc, &self.run_id);
                if !matches.is_empty() {
                    duplicate_chunk_ids.push(chunk_id.clone());
                    matches.merge_into(&mut decision);
                }
            }
            if !duplicate_chunk_ids.is_empty() {
                decision.match_type = Some(FingerprintKind::ChunkHash);
                decision.duplicate_chunk_ids = duplicate_chunk_ids;
                if self.chunk_drop_on_match {
                    return self.resolve(
                        doc,
                        decision,
                        "Duplicate chunks",
                        "Chunk match but incoming has higher priority; keep",
                    );
                }
                decision.action = DedupAction::KeepLink;
                decision.reason = "Partial chunk overlap; keep with link".to_string();
            }
        }

        self.metrics.record_decision(doc.source, &decision);
        decision
    }

    /// Apply priority resolution to a decisive match.
    fn resolve(
        &mut self,
        doc: &DocumentRef<'_>,
        mut decision: DedupDecision,
        drop_reason: &str,
        keep_reason: &str,
    ) -> DedupDecision {
        if self
            .priority
            .should_keep_incoming(doc.source, &decision.existing_sources)
        {
            decision.action = DedupAction::Keep;
            decision.superseded = true;
            decision.reason = keep_reason.to_string();
        } else {
            decision.action = DedupAction::Drop;
            decision.reason = drop_reason.to_string();
            if decision.existing_sources.iter().any(|s| s != doc.source) {
                self.metrics.record_cross_dataset_collision(doc.source);
            }
        }
        debug!(
            doc_id = %doc.doc_id,
            source = doc.source,
            action = %decision.action,
            match_type = ?decision.match_type,
            existing = ?decision.existing_sources,
            "Fingerprint match resolved"
        );
        self.metrics.record_decision(doc.source, &decision);
        decision
    }

    /// Persist the fingerprints of a kept document. Returns how many records
    /// were newly added; records already committed for `doc` are skipped.
    pub fn add_fingerprints(&mut self, doc: &DocumentRef<'_>, fingerprints: &FingerprintSet) -> Result<usize> {
        let mut added = 0;

        if let (Some(store), Some(signature)) = (self.simhash.as_mut(), fingerprints.simhash) {
            let record = FingerprintRecord::new(
                FingerprintValue::Simhash(signature),
                doc,
                store.hash_params().clone(),
            )
            .with_run_id(self.run_id.as_str());
            added += usize::from(store.add(record)?);
        }

        if let (Some(store), Some(signature)) = (self.minhash.as_mut(), fingerprints.minhash.as_ref()) {
            let record = FingerprintRecord::new(
                FingerprintValue::Minhash(signature.clone()),
                doc,
                store.hash_params().clone(),
            )
            .with_run_id(self.run_id.as_str());
            added += usize::from(store.add(record)?);
        }

        if let Some(store) = self.chunk.as_mut() {
            for (chunk_id, hash) in &fingerprints.chunks {
                let record = FingerprintRecord::new(
                    FingerprintValue::ChunkHash(*hash),
                    doc,
                    store.hash_params().clone(),
                )
                .with_chunk_id(chunk_id.clone())
                .with_run_id(self.run_id.as_str());
                added += usize::from(store.add(record)?);
            }
        }

        Ok(added)
    }

    /// Make every added record durable.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(store) = self.simhash.as_mut() {
            store.flush()?;
        }
        if let Some(store) = self.minhash.as_mut() {
            store.flush()?;
        }
        if let Some(store) = self.chunk.as_mut() {
            store.flush()?;
        }
        Ok(())
    }
}
