//! Store trait and the append-only record log shared by all stores.
//!
//! Each store persists to `<root>/<kind>/records.jsonl`, one JSON record per
//! line. On open the log is replayed into the in-memory index; unparseable
//! lines are skipped, and records from another fingerprint version are kept
//! on disk but never compared.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::schema::{FingerprintKind, FingerprintRecord, HashParams, OwnerKey};
use crate::{FingerprintError, Result};

const RECORDS_FILE: &str = "records.jsonl";

/// A persistent, queryable set of fingerprints of one kind.
///
/// Stores are single-writer: one process appends to a given root at a time.
pub trait FingerprintStore {
    /// What a lookup is keyed by.
    type Query: ?Sized;

    fn kind(&self) -> FingerprintKind;

    /// Parameters new records must be produced with.
    fn hash_params(&self) -> &HashParams;

    /// Comparable records matching `query`, in insertion order.
    fn query(&self, query: &Self::Query) -> Vec<&FingerprintRecord>;

    /// Insert and persist a record. Returns `false` when a record with the same
    /// owner and chunk is already present.
    fn add(&mut self, record: FingerprintRecord) -> Result<bool>;

    /// Make all added records durable.
    fn flush(&mut self) -> Result<()>;

    /// Number of comparable records held in memory.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> StoreStats;
}

/// Load counters for a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Records usable for comparison.
    pub live: usize,
    /// Records written under a different fingerprint version.
    pub stale: usize,
    /// Lines that failed to parse or had the wrong kind.
    pub corrupt: usize,
}

/// Append-only JSON-lines file of fingerprint records.
#[derive(Debug)]
pub struct RecordLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    needs_newline: bool,
}

impl RecordLog {
    /// Open (creating the directory if needed) the log under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| FingerprintError::io(dir, e))?;
        let path = dir.join(RECORDS_FILE);
        let needs_newline = Self::missing_trailing_newline(&path)?;
        Ok(Self {
            path,
            writer: None,
            needs_newline,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A crash mid-append can leave a partial last line. The next append must
    /// start on a fresh line so the partial one stays isolated.
    fn missing_trailing_newline(path: &Path) -> Result<bool> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(FingerprintError::io(path, e)),
        };
        let len = file
            .metadata()
            .map_err(|e| FingerprintError::io(path, e))?
            .len();
        if len == 0 {
            return Ok(false);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| FingerprintError::io(path, e))?;
        Ok(last[0] != b'\n')
    }

    /// Read every parseable record. Returns the records and the number of
    /// lines that could not be parsed.
    pub fn replay(&self) -> Result<(Vec<FingerprintRecord>, usize)> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(FingerprintError::io(&self.path, e)),
        };

        let mut records = Vec::new();
        let mut corrupt = 0;
        for (line_no, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line.map_err(|e| FingerprintError::io(&self.path, e))?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<FingerprintRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    corrupt += 1;
                    warn!(
                        path = %self.path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping unparseable fingerprint record"
                    );
                }
            }
        }
        Ok((records, corrupt))
    }

    pub fn append(&mut self, record: &FingerprintRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        if std::mem::take(&mut self.needs_newline) {
            line.insert(0, b'\n');
        }
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| FingerprintError::io(&self.path, e))?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            writer
                .write_all(&line)
                .map_err(|e| FingerprintError::io(&self.path, e))?;
        }
        Ok(())
    }

    /// Flush buffered appends and sync them to disk.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| FingerprintError::io(&self.path, e))?;
            writer
                .get_ref()
                .sync_data()
                .map_err(|e| FingerprintError::io(&self.path, e))?;
        }
        Ok(())
    }
}

/// Log, owner-key set and load counters common to every store.
#[derive(Debug)]
pub(crate) struct StoreBase {
    kind: FingerprintKind,
    params: HashParams,
    log: RecordLog,
    keys: HashSet<OwnerKey>,
    stats: StoreStats,
}

impl StoreBase {
    /// Open `<root>/<kind>` and return the comparable records to index.
    pub(crate) fn open(
        root: &Path,
        kind: FingerprintKind,
        params: HashParams,
    ) -> Result<(Self, Vec<FingerprintRecord>)> {
        let log = RecordLog::open(&root.join(kind.as_str()))?;
        let (records, corrupt) = log.replay()?;

        let mut base = Self {
            kind,
            params,
            log,
            keys: HashSet::new(),
            stats: StoreStats {
                corrupt,
                ..Default::default()
            },
        };

        let mut live = Vec::with_capacity(records.len());
        for record in records {
            if record.kind() != kind {
                base.stats.corrupt += 1;
            } else if !record.hash_params.is_comparable(&base.params) {
                base.stats.stale += 1;
            } else if base.keys.insert(record.owner_key()) {
                live.push(record);
            }
        }
        base.stats.live = live.len();

        debug!(
            kind = %kind,
            path = %base.log.path().display(),
            live = base.stats.live,
            stale = base.stats.stale,
            corrupt = base.stats.corrupt,
            "Fingerprint store loaded"
        );
        if base.stats.stale > 0 {
            warn!(
                kind = %kind,
                stale = base.stats.stale,
                version = %base.params.fingerprint_version,
                "Ignoring fingerprints from other versions"
            );
        }

        Ok((base, live))
    }

    pub(crate) fn kind(&self) -> FingerprintKind {
        self.kind
    }

    pub(crate) fn params(&self) -> &HashParams {
        &self.params
    }

    pub(crate) fn stats(&self) -> StoreStats {
        self.stats
    }

    /// Validate and persist `record`. Returns `false` for a repeat commit.
    pub(crate) fn admit(&mut self, record: &FingerprintRecord) -> Result<bool> {
        if record.kind() != self.kind {
            return Err(FingerprintError::KindMismatch {
                expected: self.kind,
                actual: record.kind(),
            });
        }
        if !record.hash_params.is_comparable(&self.params) {
            return Err(FingerprintError::InvalidConfig(format!(
                "{} record has fingerprint version {}, store uses {}",
                self.kind, record.hash_params.fingerprint_version, self.params.fingerprint_version
            )));
        }
        if !self.keys.insert(record.owner_key()) {
            return Ok(false);
        }
        self.log.append(record)?;
        self.stats.live += 1;
        Ok(true)
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.log.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DocumentRef, FingerprintValue};
    use corpus_core::DocId;
    use pretty_assertions::assert_eq;

    fn record(text: &str, version: &str) -> FingerprintRecord {
        let doc = DocumentRef::new(DocId::from_text(text), "web");
        FingerprintRecord::new(
            FingerprintValue::Simhash(7),
            &doc,
            HashParams::simhash(version, 2000),
        )
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RecordLog::open(dir.path()).unwrap();
        let a = record("a", "v1");
        let b = record("b", "v1");
        log.append(&a).unwrap();
        log.append(&b).unwrap();
        log.flush().unwrap();

        let (records, corrupt) = RecordLog::open(dir.path()).unwrap().replay().unwrap();
        assert_eq!(records, vec![a, b]);
        assert_eq!(corrupt, 0);
    }

    #[test]
    fn test_partial_last_line_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let a = record("a", "v1");
        {
            let mut log = RecordLog::open(dir.path()).unwrap();
            log.append(&a).unwrap();
            log.flush().unwrap();
        }
        let path = dir.path().join(RECORDS_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"fingerprint_id\": \"trunc").unwrap();
        drop(file);

        let b = record("b", "v1");
        let mut log = RecordLog::open(dir.path()).unwrap();
        log.append(&b).unwrap();
        log.flush().unwrap();

        let (records, corrupt) = log.replay().unwrap();
        assert_eq!(records, vec![a, b]);
        assert_eq!(corrupt, 1);
    }

    #[test]
    fn test_base_separates_stale_versions_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let current = record("a", "v1");
        {
            let (mut base, _) =
                StoreBase::open(dir.path(), FingerprintKind::Simhash, HashParams::simhash("v1", 2000))
                    .unwrap();
            assert!(base.admit(&current).unwrap());
            assert!(!base.admit(&current.clone()).unwrap());
            base.flush().unwrap();
        }

        let (base, live) =
            StoreBase::open(dir.path(), FingerprintKind::Simhash, HashParams::simhash("v2", 2000))
                .unwrap();
        assert!(live.is_empty());
        assert_eq!(base.stats(), StoreStats { live: 0, stale: 1, corrupt: 0 });

        let (_, live) =
            StoreBase::open(dir.path(), FingerprintKind::Simhash, HashParams::simhash("v1", 2000))
                .unwrap();
        assert_eq!(live, vec![current]);
    }

    #[test]
    fn test_admit_rejects_wrong_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (mut base, _) =
            StoreBase::open(dir.path(), FingerprintKind::Minhash, HashParams::default()).unwrap();
        let err = base.admit(&record("a", "v1")).unwrap_err();
        assert!(matches!(err, FingerprintError::KindMismatch { .. }));
    }
}
