//! Per-source run loop.
//!
//! Each source is drained sequentially through the stage chain. Accepted
//! documents are batched into shards and rejections buffered for the rejection
//! sink. At every durable point (shard full, checkpoint cadence reached, end of
//! source, cancellation) the driver writes the pending shard, flushes
//! rejections, flushes the stages, and only then saves the checkpoint, so the
//! checkpoint never runs ahead of committed output or fingerprints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use corpus_core::{CorpusConfig, RunConfig};

use crate::checkpoint::{CheckpointReport, CheckpointState, CheckpointStore, FileStats, SourceProgress};
use crate::document::{Document, RejectionRecord};
use crate::sink::{RejectionSink, ShardDestination, ShardWriter};
use crate::source::DocumentSource;
use crate::stage::{ChainOutcome, StageChain, StageCounters};
use crate::stages::{StageContext, StageRegistry};
use crate::{PipelineError, Result};

/// Shared stop signal, checked between documents.
pub type CancellationFlag = Arc<AtomicBool>;

/// Source ended before the recorded number of already-processed records could
/// be skipped. Resume was not exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeDrift {
    pub source: String,
    pub expected_skip: u64,
    pub actual_skip: u64,
}

/// Outcome of one source in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    /// Records skipped as already processed.
    pub resumed_from: u64,
    /// Records consumed in this run.
    pub processed: u64,
    pub written: u64,
    pub rejected: u64,
    pub runtime_errors: u64,
    pub shards_written: u64,
    pub next_shard_index: u64,
    pub drift: Option<ResumeDrift>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub policy_version: String,
    pub total_processed: u64,
    pub total_written: u64,
    pub total_rejected: u64,
    pub runtime_errors: u64,
    pub sources: Vec<SourceReport>,
    pub stage_counts: BTreeMap<String, StageCounters>,
    pub cancelled: bool,
    pub manifest_path: PathBuf,
}

impl RunSummary {
    pub fn source(&self, name: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.source == name)
    }

    pub fn resume_drift(&self) -> Vec<&ResumeDrift> {
        self.sources.iter().filter_map(|s| s.drift.as_ref()).collect()
    }
}

/// Written to `<out_dir>/manifests/<run_id>.json` at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub policy_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_written_docs: u64,
    pub total_rejected_docs: u64,
    pub total_processed_docs: u64,
    pub cancelled: bool,
    pub sources: BTreeMap<String, SourceProgress>,
    pub stage_counts: BTreeMap<String, StageCounters>,
    /// Operator reports from stages, e.g. global dedup metrics.
    pub stage_summaries: BTreeMap<String, String>,
    pub resume_drift: Vec<ResumeDrift>,
    pub checkpoint: PathBuf,
}

/// Drives sources through the stage chain with checkpointed progress.
pub struct PipelineDriver<W, R> {
    run: RunConfig,
    run_id: String,
    out_dir: PathBuf,
    chain: StageChain,
    checkpoints: CheckpointStore,
    state: CheckpointState,
    writer: W,
    rejections: R,
    cancel: CancellationFlag,
    started_at: DateTime<Utc>,
}

/// Mutable state of the source currently being drained.
struct SourceRun {
    name: String,
    processed: u64,
    shard_index: u64,
    file_stats: BTreeMap<String, FileStats>,
    shard: Vec<Document>,
    pending: Vec<RejectionRecord>,
    report: SourceReport,
}

impl<W, R> PipelineDriver<W, R>
where
    W: ShardWriter,
    R: RejectionSink,
{
    /// Create a driver and load the checkpoint per `run.resume_mode`.
    pub fn new(
        run: &RunConfig,
        run_id: impl Into<String>,
        out_dir: impl Into<PathBuf>,
        chain: StageChain,
        writer: W,
        rejections: R,
    ) -> Result<Self> {
        let run_id = run_id.into();
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir).map_err(|e| PipelineError::io(&out_dir, e))?;
        let checkpoints = CheckpointStore::open(&out_dir, &run_id)?;
        let state = checkpoints.load(run.resume_mode, run.checkpoint_id.as_deref())?;

        Ok(Self {
            run: run.clone(),
            run_id,
            out_dir,
            chain,
            checkpoints,
            state,
            writer,
            rejections,
            cancel: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
        })
    }

    /// Resolve the run id and output directory, then build the chain from
    /// `config.stages`.
    pub fn from_config(
        config: &CorpusConfig,
        registry: &StageRegistry,
        first_source: Option<&str>,
        writer: W,
        rejections: R,
    ) -> Result<Self> {
        config.validate()?;
        let run_id = config.run.resolve_run_id(first_source);
        let out_dir = config.run.resolve_out_dir(&run_id);
        fs::create_dir_all(&out_dir).map_err(|e| PipelineError::io(&out_dir, e))?;

        let ctx = StageContext {
            config,
            out_dir: &out_dir,
            run_id: &run_id,
        };
        let chain = registry.build_chain(&config.stages, &ctx)?;
        info!(run_id = %run_id, stages = ?chain.list(), "Stage chain built");

        Self::new(&config.run, run_id, out_dir, chain, writer, rejections)
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancellation_flag(&self) -> CancellationFlag {
        Arc::clone(&self.cancel)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    pub fn chain(&self) -> &StageChain {
        &self.chain
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn rejections(&self) -> &R {
        &self.rejections
    }

    pub fn into_parts(self) -> (W, R) {
        (self.writer, self.rejections)
    }

    pub fn checkpoint_report(&self) -> CheckpointReport<'_> {
        self.checkpoints.report(&self.state)
    }

    /// Write a named snapshot of the current progress.
    pub fn snapshot(&self, checkpoint_id: &str) -> Result<PathBuf> {
        self.checkpoints.snapshot(&self.state, checkpoint_id)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Drain every source in order and write the run manifest.
    pub fn run(&mut self, sources: &mut [Box<dyn DocumentSource>]) -> Result<RunSummary> {
        let mut reports = Vec::with_capacity(sources.len());
        for source in sources.iter_mut() {
            if self.is_cancelled() {
                break;
            }
            reports.push(self.run_source(source.as_mut())?);
        }
        self.finish(reports)
    }

    /// Drain one source, resuming from its checkpointed position.
    pub fn run_source(&mut self, source: &mut dyn DocumentSource) -> Result<SourceReport> {
        let name = source.name().to_string();
        let progress = self.state.source(&name).cloned().unwrap_or_default();
        let mut current = SourceRun {
            name: name.clone(),
            processed: progress.processed_docs,
            shard_index: progress.next_shard_index,
            file_stats: progress.file_stats,
            shard: Vec::new(),
            pending: Vec::new(),
            report: SourceReport {
                source: name.clone(),
                resumed_from: progress.processed_docs,
                ..Default::default()
            },
        };

        info!(
            source = %name,
            resume_processed = current.processed,
            resume_shard_idx = current.shard_index,
            "Starting source"
        );

        let shard_docs = self.run.shard_docs.max(1);
        let checkpoint_every = self.run.checkpoint_every() as u64;
        let log_every = self.run.log_every_docs.max(1) as u64;
        let policy_version = self.run.policy_version.clone();

        let mut stream = source.stream();

        let mut skipped = 0u64;
        while skipped < current.processed {
            if stream.next().is_none() {
                break;
            }
            skipped += 1;
        }
        if skipped < current.processed {
            warn!(
                source = %name,
                expected = current.processed,
                skipped,
                "Source ended before the resume position; resume was not exact"
            );
            current.report.drift = Some(ResumeDrift {
                source: name.clone(),
                expected_skip: current.processed,
                actual_skip: skipped,
            });
        }

        let mut since_checkpoint = 0u64;
        loop {
            if self.is_cancelled() {
                info!(source = %name, processed = current.processed, "Cancellation requested");
                current.report.cancelled = true;
                break;
            }
            let item = match stream.next() {
                Some(item) => item,
                None => break,
            };

            current.processed += 1;
            current.report.processed += 1;
            since_checkpoint += 1;

            match item {
                Ok(raw) => {
                    let doc = Document::from_raw(raw, &policy_version);
                    self.process(&mut current, doc);
                }
                Err(e) => {
                    error!(source = %name, error = %e, "Source failed to produce a record");
                    current.report.rejected += 1;
                    current.report.runtime_errors += 1;
                    current
                        .pending
                        .push(RejectionRecord::source_error(&name, e.to_string()));
                }
            }

            if current.shard.len() >= shard_docs || since_checkpoint >= checkpoint_every {
                self.durable_point(&mut current)?;
                since_checkpoint = 0;
            } else if current.processed % log_every == 0 {
                self.flush_rejections(&mut current.pending)?;
            }

            if current.processed % log_every == 0 {
                info!(
                    source = %name,
                    processed = current.processed,
                    written = current.report.written,
                    rejected = current.report.rejected,
                    "Progress"
                );
            }
        }
        drop(stream);

        self.durable_point(&mut current)?;
        current.report.next_shard_index = current.shard_index;

        let report = current.report;
        info!(
            source = %name,
            processed = report.processed,
            written = report.written,
            rejected = report.rejected,
            runtime_errors = report.runtime_errors,
            shards = report.shards_written,
            "Source complete"
        );
        for (file, stats) in &current.file_stats {
            info!(
                source = %name,
                file = %file,
                processed = stats.processed,
                written = stats.written,
                rejected = stats.rejected,
                "Per-file statistics"
            );
        }
        Ok(report)
    }

    /// Run one document through the chain and route it.
    fn process(&mut self, current: &mut SourceRun, mut doc: Document) {
        let file_key = doc
            .source_file
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let stats = current.file_stats.entry(file_key).or_default();
        stats.processed += 1;

        match self.chain.run(&mut doc) {
            Ok(ChainOutcome::Accepted) => {
                stats.written += 1;
                current.report.written += 1;
                current.shard.push(doc);
            }
            Ok(ChainOutcome::Rejected(decision)) => {
                stats.rejected += 1;
                current.report.rejected += 1;
                current
                    .pending
                    .push(RejectionRecord::from_decision(&doc, &decision));
            }
            Err(e) => {
                error!(
                    source = %current.name,
                    doc_id = %doc.doc_id,
                    raw_id = %doc.raw_id,
                    error = %e,
                    "Unhandled error in document processing"
                );
                stats.rejected += 1;
                current.report.rejected += 1;
                current.report.runtime_errors += 1;
                current
                    .pending
                    .push(RejectionRecord::runtime_error(&doc, e.to_string()));
            }
        }
    }

    /// Write the pending shard, flush rejections and stages, then checkpoint.
    fn durable_point(&mut self, current: &mut SourceRun) -> Result<()> {
        if !current.shard.is_empty() {
            let destination = ShardDestination::new(&self.out_dir, &current.name, current.shard_index);
            let path = self.writer.write_shard(&current.shard, &destination)?;
            info!(
                source = %current.name,
                shard_idx = current.shard_index,
                docs = current.shard.len(),
                path = %path.display(),
                "Shard written"
            );
            current.shard.clear();
            current.shard_index += 1;
            current.report.shards_written += 1;
        }

        self.flush_rejections(&mut current.pending)?;
        self.chain.flush()?;

        self.state.sources.insert(
            current.name.clone(),
            SourceProgress {
                processed_docs: current.processed,
                next_shard_index: current.shard_index,
                file_stats: current.file_stats.clone(),
            },
        );
        self.checkpoints.save(&mut self.state)
    }

    fn flush_rejections(&mut self, pending: &mut Vec<RejectionRecord>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        self.rejections.append(pending)?;
        pending.clear();
        Ok(())
    }

    fn finish(&mut self, reports: Vec<SourceReport>) -> Result<RunSummary> {
        let cancelled = self.is_cancelled() || reports.iter().any(|r| r.cancelled);
        let total_written: u64 = reports.iter().map(|r| r.written).sum();
        let total_rejected: u64 = reports.iter().map(|r| r.rejected).sum();
        let runtime_errors: u64 = reports.iter().map(|r| r.runtime_errors).sum();
        let stage_counts = self.chain.counters_by_name();
        let resume_drift: Vec<ResumeDrift> =
            reports.iter().filter_map(|r| r.drift.clone()).collect();

        let manifest = RunManifest {
            run_id: self.run_id.clone(),
            policy_version: self.run.policy_version.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            total_written_docs: total_written,
            total_rejected_docs: total_rejected,
            total_processed_docs: total_written + total_rejected,
            cancelled,
            sources: self.state.sources.clone(),
            stage_counts: stage_counts.clone(),
            stage_summaries: self.chain.summaries(),
            resume_drift,
            checkpoint: self.checkpoints.live_path(),
        };
        let manifest_path = self.write_manifest(&manifest)?;

        for (stage, summary) in &manifest.stage_summaries {
            info!(stage = %stage, "{}", summary);
        }
        info!(
            run_id = %self.run_id,
            written = total_written,
            rejected = total_rejected,
            cancelled,
            manifest = %manifest_path.display(),
            "Run complete"
        );

        Ok(RunSummary {
            run_id: self.run_id.clone(),
            policy_version: self.run.policy_version.clone(),
            total_processed: total_written + total_rejected,
            total_written,
            total_rejected,
            runtime_errors,
            sources: reports,
            stage_counts,
            cancelled,
            manifest_path,
        })
    }

    fn write_manifest(&self, manifest: &RunManifest) -> Result<PathBuf> {
        let dir = self.out_dir.join("manifests");
        fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        let path = dir.join(format!("{}.json", self.run_id));
        let body = serde_json::to_vec_pretty(manifest)?;
        fs::write(&path, body).map_err(|e| PipelineError::io(&path, e))?;
        Ok(path)
    }
}
