//! Dedup outcome counters, per source and in total.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::{DedupAction, DedupDecision, FingerprintKind};

const TOP_SOURCES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounters {
    pub checked: u64,
    pub dropped: u64,
    pub kept: u64,
    pub kept_linked: u64,
    /// Kept because the document outranked the sources it matched.
    pub kept_despite_match: u64,
    pub simhash_hits: u64,
    pub minhash_hits: u64,
    /// Duplicated chunks, not documents.
    pub chunk_hash_hits: u64,
    pub cross_dataset_collisions: u64,
}

impl SourceCounters {
    fn record(&mut self, decision: &DedupDecision) {
        self.checked += 1;
        match decision.action {
            DedupAction::Drop => self.dropped += 1,
            DedupAction::Keep => self.kept += 1,
            DedupAction::KeepLink => self.kept_linked += 1,
        }
        if decision.superseded {
            self.kept_despite_match += 1;
        }
        match decision.match_type {
            Some(FingerprintKind::Simhash) => self.simhash_hits += 1,
            Some(FingerprintKind::Minhash) => self.minhash_hits += 1,
            Some(FingerprintKind::ChunkHash) | None => {}
        }
        self.chunk_hash_hits += decision.duplicate_chunk_ids.len() as u64;
    }
}

/// Accumulated dedup metrics for one manager lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FingerprintMetrics {
    pub total: SourceCounters,
    pub sources: BTreeMap<String, SourceCounters>,
}

impl FingerprintMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decision(&mut self, source: &str, decision: &DedupDecision) {
        self.total.record(decision);
        self.sources
            .entry(source.to_string())
            .or_default()
            .record(decision);
    }

    pub fn record_cross_dataset_collision(&mut self, source: &str) {
        self.total.cross_dataset_collisions += 1;
        self.sources
            .entry(source.to_string())
            .or_default()
            .cross_dataset_collisions += 1;
    }

    pub fn source(&self, source: &str) -> Option<&SourceCounters> {
        self.sources.get(source)
    }

    pub fn duplication_rate_pct(&self) -> f64 {
        percent(self.total.dropped, self.total.checked)
    }

    pub fn cross_dataset_collision_rate_pct(&self) -> f64 {
        percent(self.total.cross_dataset_collisions, self.total.checked)
    }

    /// Sources with the most dropped documents, highest first; ties by name.
    pub fn top_duplicated_sources(&self, n: usize) -> Vec<(String, u64)> {
        let mut ranked: Vec<(String, u64)> = self
            .sources
            .iter()
            .filter(|(_, c)| c.dropped > 0)
            .map(|(name, c)| (name.clone(), c.dropped))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    /// Human-readable report for operators.
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FingerprintMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.total;
        writeln!(f, "=== Global Fingerprint Metrics ===")?;
        writeln!(f, "Total checked: {}", t.checked)?;
        writeln!(f, "Total dropped (duplicates): {}", t.dropped)?;
        writeln!(f, "Total kept: {}", t.kept)?;
        writeln!(f, "Total kept (linked): {}", t.kept_linked)?;
        writeln!(f, "Kept despite match: {}", t.kept_despite_match)?;
        writeln!(f, "Duplication rate: {:.2}%", self.duplication_rate_pct())?;
        writeln!(
            f,
            "Cross-dataset collisions: {} ({:.2}%)",
            t.cross_dataset_collisions,
            self.cross_dataset_collision_rate_pct()
        )?;
        writeln!(f, "SimHash hits: {}", t.simhash_hits)?;
        writeln!(f, "MinHash hits: {}", t.minhash_hits)?;
        writeln!(f, "Chunk hash hits: {}", t.chunk_hash_hits)?;
        write!(f, "Top duplicated sources:")?;
        for (source, dropped) in self.top_duplicated_sources(TOP_SOURCES) {
            write!(f, "\n  {}: {}", source, dropped)?;
        }
        Ok(())
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decision(action: DedupAction, match_type: Option<FingerprintKind>) -> DedupDecision {
        DedupDecision {
            action,
            match_type,
            ..DedupDecision::keep()
        }
    }

    #[test]
    fn test_counts_per_source_and_total() {
        let mut metrics = FingerprintMetrics::new();
        metrics.record_decision("web", &DedupDecision::keep());
        metrics.record_decision("web", &decision(DedupAction::Drop, Some(FingerprintKind::Simhash)));
        metrics.record_cross_dataset_collision("web");
        metrics.record_decision(
            "books",
            &DedupDecision {
                superseded: true,
                ..decision(DedupAction::Keep, Some(FingerprintKind::Minhash))
            },
        );
        metrics.record_decision(
            "books",
            &DedupDecision {
                duplicate_chunk_ids: vec!["0".into(), "2".into()],
                ..decision(DedupAction::KeepLink, Some(FingerprintKind::ChunkHash))
            },
        );

        assert_eq!(metrics.total.checked, 4);
        assert_eq!(metrics.total.dropped, 1);
        assert_eq!(metrics.total.kept, 2);
        assert_eq!(metrics.total.kept_linked, 1);
        assert_eq!(metrics.total.kept_despite_match, 1);
        assert_eq!(metrics.total.chunk_hash_hits, 2);
        assert_eq!(metrics.source("web").unwrap().cross_dataset_collisions, 1);
        assert_eq!(metrics.source("books").unwrap().minhash_hits, 1);
        assert_eq!(metrics.duplication_rate_pct(), 25.0);
        assert_eq!(metrics.top_duplicated_sources(5), vec![("web".to_string(), 1)]);
    }

    #[test]
    fn test_summary_layout() {
        let mut metrics = FingerprintMetrics::new();
        metrics.record_decision("web", &decision(DedupAction::Drop, Some(FingerprintKind::Simhash)));

        let summary = metrics.summary();
        assert!(summary.starts_with("=== Global Fingerprint Metrics ===\n"));
        assert!(summary.contains("Duplication rate: 100.00%"));
        assert!(summary.ends_with("Top duplicated sources:\n  web: 1"));
        assert_eq!(format!("{}", metrics), summary);
    }

    #[test]
    fn test_display_lists_every_counter() {
        let mut metrics = FingerprintMetrics::new();
        metrics.record_decision("web", &DedupDecision::keep());
        metrics.record_decision("books", &decision(DedupAction::Drop, Some(FingerprintKind::Minhash)));
        metrics.record_cross_dataset_collision("books");

        let expected = "=== Global Fingerprint Metrics ===\n\
            Total checked: 2\n\
            Total dropped (duplicates): 1\n\
            Total kept: 1\n\
            Total kept (linked): 0\n\
            Kept despite match: 0\n\
            Duplication rate: 50.00%\n\
            Cross-dataset collisions: 1 (50.00%)\n\
            SimHash hits: 0\n\
            MinHash hits: 1\n\
            Chunk hash hits: 0\n\
            Top duplicated sources:\n  books: 1";
        assert_eq!(metrics.to_string(), expected);
    }

    #[test]
    fn test_empty_rates_are_zero() {
        let metrics = FingerprintMetrics::new();
        assert_eq!(metrics.duplication_rate_pct(), 0.0);
        assert_eq!(metrics.cross_dataset_collision_rate_pct(), 0.0);
    }
}
