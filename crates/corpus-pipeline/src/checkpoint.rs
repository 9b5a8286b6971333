//! Durable per-run, per-source progress.
//!
//! The live checkpoint lives at `<out_dir>/checkpoints/<run_id>.json`; named
//! snapshots at `<out_dir>/checkpoints/<run_id>/<id>.json`. Saves write a
//! temporary file and rename it into place, so a crash never leaves a
//! half-written checkpoint behind.
//!
//! Resume is a linear skip of already-processed records, which is only exact
//! for sources that iterate in the same order on every run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use corpus_core::ResumeMode;

use crate::{PipelineError, Result};

/// Per-input-file counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub processed: u64,
    pub written: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProgress {
    /// Records consumed from the source, accepted or not.
    pub processed_docs: u64,
    pub next_shard_index: u64,
    #[serde(default)]
    pub file_stats: BTreeMap<String, FileStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub run_id: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resume_mode: ResumeMode,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceProgress>,
}

impl CheckpointState {
    pub fn new(run_id: impl Into<String>, resume_mode: ResumeMode) -> Self {
        Self {
            run_id: run_id.into(),
            updated_at: Utc::now(),
            resume_mode,
            sources: BTreeMap::new(),
        }
    }

    pub fn source(&self, name: &str) -> Option<&SourceProgress> {
        self.sources.get(name)
    }

    pub fn total_processed(&self) -> u64 {
        self.sources.values().map(|s| s.processed_docs).sum()
    }

    /// Restart every source from its first record.
    ///
    /// Only read progress is discarded. Each source keeps its
    /// `next_shard_index`, so a `beginning` rerun writes new shards after the
    /// ones already on disk instead of overwriting them. Use `ignore` to drop
    /// shard numbering as well.
    fn rewind(&mut self) {
        for progress in self.sources.values_mut() {
            progress.processed_docs = 0;
            progress.file_stats.clear();
        }
    }
}

/// Loads and atomically saves checkpoint state for one run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    run_id: String,
}

impl CheckpointStore {
    pub fn open(out_dir: impl AsRef<Path>, run_id: impl Into<String>) -> Result<Self> {
        let dir = out_dir.as_ref().join("checkpoints");
        fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        Ok(Self {
            dir,
            run_id: run_id.into(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn live_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.run_id))
    }

    pub fn snapshot_path(&self, checkpoint_id: &str) -> PathBuf {
        self.dir
            .join(&self.run_id)
            .join(format!("{}.json", checkpoint_id))
    }

    /// Load the state a run should start from.
    ///
    /// - `auto`: the live checkpoint, or a fresh state
    /// - `beginning`: every source restarts at record 0, shard indices kept
    /// - `ignore`: a fresh state
    /// - `checkpoint`: the named snapshot, falling back to the live checkpoint
    pub fn load(&self, mode: ResumeMode, checkpoint_id: Option<&str>) -> Result<CheckpointState> {
        let loaded = match mode {
            ResumeMode::Auto | ResumeMode::Beginning => self.read(&self.live_path())?,
            ResumeMode::Ignore => None,
            ResumeMode::Checkpoint => {
                let snapshot = match checkpoint_id {
                    Some(id) => self.read(&self.snapshot_path(id))?,
                    None => None,
                };
                if snapshot.is_none() {
                    warn!(
                        run_id = %self.run_id,
                        checkpoint_id = checkpoint_id.unwrap_or(""),
                        "Named checkpoint not found; falling back to live checkpoint"
                    );
                    self.read(&self.live_path())?
                } else {
                    snapshot
                }
            }
        };

        let mut state = loaded.unwrap_or_else(|| CheckpointState::new(&self.run_id, mode));
        // Beginning rewinds read progress but not shard numbering.
        if mode == ResumeMode::Beginning {
            state.rewind();
        }
        state.run_id = self.run_id.clone();
        state.resume_mode = mode;

        info!(
            run_id = %self.run_id,
            resume_mode = %mode,
            sources = state.sources.len(),
            processed = state.total_processed(),
            "Checkpoint loaded"
        );
        Ok(state)
    }

    /// Read a checkpoint file. Missing, empty and unparsable files are absent.
    fn read(&self, path: &Path) -> Result<Option<CheckpointState>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::io(path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            warn!(path = %path.display(), "Empty checkpoint file; starting fresh");
            return Ok(None);
        }
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unparsable checkpoint file; starting fresh");
                Ok(None)
            }
        }
    }

    /// Stamp `updated_at` and atomically replace the live checkpoint.
    pub fn save(&self, state: &mut CheckpointState) -> Result<()> {
        state.updated_at = Utc::now();
        write_atomic(&self.live_path(), state)
    }

    /// Write a named historical copy that `resume_mode = checkpoint` can load.
    pub fn snapshot(&self, state: &CheckpointState, checkpoint_id: &str) -> Result<PathBuf> {
        let path = self.snapshot_path(checkpoint_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        write_atomic(&path, state)?;
        Ok(path)
    }

    pub fn report<'a>(&'a self, state: &'a CheckpointState) -> CheckpointReport<'a> {
        CheckpointReport { store: self, state }
    }
}

fn write_atomic(path: &Path, state: &CheckpointState) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(state)?;
    {
        let mut file = fs::File::create(&tmp).map_err(|e| PipelineError::io(&tmp, e))?;
        file.write_all(&body).map_err(|e| PipelineError::io(&tmp, e))?;
        file.sync_all().map_err(|e| PipelineError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| PipelineError::io(path, e))
}

/// Human-readable progress report for operators.
pub struct CheckpointReport<'a> {
    store: &'a CheckpointStore,
    state: &'a CheckpointState,
}

impl fmt::Display for CheckpointReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state;
        writeln!(f, "=== Checkpoint Report ===")?;
        writeln!(f, "Run: {}", state.run_id)?;
        writeln!(f, "Checkpoint: {}", self.store.live_path().display())?;
        writeln!(f, "Updated: {}", state.updated_at.to_rfc3339())?;
        writeln!(f, "Resume mode: {}", state.resume_mode)?;
        writeln!(f, "Total processed: {}", state.total_processed())?;

        if state.sources.is_empty() {
            writeln!(f, "No sources recorded.")?;
        }
        for (name, progress) in &state.sources {
            writeln!(
                f,
                "Source {}: processed={} next_shard={}",
                name, progress.processed_docs, progress.next_shard_index
            )?;
            for (file, stats) in &progress.file_stats {
                writeln!(
                    f,
                    "  {}: processed={} written={} rejected={}",
                    file, stats.processed, stats.written, stats.rejected
                )?;
            }
        }

        writeln!(
            f,
            "To resume, rerun with run_id={} and resume_mode=auto.",
            state.run_id
        )?;
        write!(
            f,
            "Note: resume skips already-processed records in source order; sources \
             without a deterministic order may repeat or skip records at the boundary."
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(run_id: &str) -> CheckpointState {
        let mut state = CheckpointState::new(run_id, ResumeMode::Auto);
        let mut progress = SourceProgress {
            processed_docs: 120,
            next_shard_index: 3,
            file_stats: BTreeMap::new(),
        };
        progress.file_stats.insert(
            "part-0.jsonl".to_string(),
            FileStats {
                processed: 120,
                written: 100,
                rejected: 20,
            },
        );
        state.sources.insert("wiki".to_string(), progress);
        state
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), "r1").unwrap();

        let mut state = sample("r1");
        store.save(&mut state).unwrap();
        let loaded = store.load(ResumeMode::Auto, None).unwrap();

        assert_eq!(loaded, state);
        assert!(!dir.path().join("checkpoints").join("r1.json.tmp").exists());
    }

    #[test]
    fn test_missing_checkpoint_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), "r1").unwrap();

        let state = store.load(ResumeMode::Auto, None).unwrap();
        assert_eq!(state.run_id, "r1");
        assert!(state.sources.is_empty());
    }

    #[test]
    fn test_corrupt_and_empty_checkpoints_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), "r1").unwrap();

        fs::write(store.live_path(), b"").unwrap();
        assert!(store.load(ResumeMode::Auto, None).unwrap().sources.is_empty());

        fs::write(store.live_path(), b"{\"run_id\": \"r1\", \"sour").unwrap();
        assert!(store.load(ResumeMode::Auto, None).unwrap().sources.is_empty());
    }

    #[test]
    fn test_beginning_keeps_shard_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), "r1").unwrap();
        store.save(&mut sample("r1")).unwrap();

        let state = store.load(ResumeMode::Beginning, None).unwrap();
        let wiki = state.source("wiki").unwrap();
        assert_eq!(wiki.processed_docs, 0);
        assert_eq!(wiki.next_shard_index, 3);
        assert!(wiki.file_stats.is_empty());
        assert_eq!(state.resume_mode, ResumeMode::Beginning);

        let state = store.load(ResumeMode::Ignore, None).unwrap();
        assert!(state.sources.is_empty());
    }

    #[test]
    fn test_named_snapshot_with_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), "r1").unwrap();

        let mut early = sample("r1");
        early.sources.get_mut("wiki").unwrap().processed_docs = 50;
        let path = store.snapshot(&early, "before_wiki").unwrap();
        assert!(path.ends_with("r1/before_wiki.json"));

        store.save(&mut sample("r1")).unwrap();

        let state = store.load(ResumeMode::Checkpoint, Some("before_wiki")).unwrap();
        assert_eq!(state.source("wiki").unwrap().processed_docs, 50);

        let state = store.load(ResumeMode::Checkpoint, Some("missing")).unwrap();
        assert_eq!(state.source("wiki").unwrap().processed_docs, 120);
    }

    #[test]
    fn test_report_lists_sources_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), "r1").unwrap();
        let state = sample("r1");

        let report = store.report(&state).to_string();
        assert!(report.starts_with("=== Checkpoint Report ===\n"));
        assert!(report.contains("Source wiki: processed=120 next_shard=3"));
        assert!(report.contains("  part-0.jsonl: processed=120 written=100 rejected=20"));
        assert!(report.contains("resume_mode=auto"));
    }
}
