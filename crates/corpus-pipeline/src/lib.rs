//! Corpus build pipeline.
//!
//! Documents from each named source run through a short-circuiting
//! [`StageChain`]; accepted documents are batched into shards, rejections go to
//! a rejection sink, and per-source progress is checkpointed so an interrupted
//! build resumes where it last durably stopped.
//!
//! # Modules
//!
//! - `document`: the normalized record, stage verdicts and reason codes
//! - `stage`: the stage contract and chain runner
//! - `stages`: built-in stages and the name registry
//! - `checkpoint`: resumable per-run progress
//! - `source` / `sink`: collaborator boundaries
//! - `driver`: the per-source run loop

pub mod checkpoint;
pub mod document;
pub mod driver;
pub mod sink;
pub mod source;
pub mod stage;
pub mod stages;

use std::path::PathBuf;

pub use checkpoint::{CheckpointReport, CheckpointState, CheckpointStore, FileStats, SourceProgress};
pub use document::{reasons, Decision, Document, RawDocument, RejectionRecord};
pub use driver::{
    CancellationFlag, PipelineDriver, ResumeDrift, RunManifest, RunSummary, SourceReport,
};
pub use sink::{MemoryRejectionSink, MemoryShardWriter, RejectionSink, ShardDestination, ShardWriter};
pub use source::{DocumentSource, IterSource};
pub use stage::{ChainOutcome, FnStage, Stage, StageChain, StageCounters, StageLayer};
pub use stages::{
    ExactDedupStage, GlobalDedupStage, LicenseGate, LicensePolicy, PiiDetector, PiiGate,
    QualityGate, SanitizeStage, StageContext, StageRegistry,
};

/// Error types for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] corpus_fingerprint::FingerprintError),

    #[error(transparent)]
    Core(#[from] corpus_core::CoreError),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Stage {stage} failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Stage {stage} panicked: {message}")]
    StagePanicked { stage: String, message: String },

    #[error("Source {source_name} failed: {message}")]
    Source { source_name: String, message: String },

    #[error("Sink failed: {0}")]
    Sink(String),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn stage(stage: &str, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::UnknownStage("tokenize".to_string());
        assert_eq!(err.to_string(), "Unknown stage: tokenize");

        let err = PipelineError::stage("quality_gate", "bad entropy");
        assert_eq!(err.to_string(), "Stage quality_gate failed: bad entropy");
    }
}
