use ::config::{Config, Environment, File};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{CoreError, Result};

/// Top-level corpus build configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    pub run: RunConfig,
    /// Ordered stage names; see the stage registry in `corpus-pipeline`.
    pub stages: Vec<String>,
    pub dedup: DedupConfig,
    pub quality: QualityPolicy,
    pub license: LicensePolicyConfig,
    pub pii: PiiPolicyConfig,
    pub logging: LoggingConfig,
}

impl CorpusConfig {
    /// Load configuration from `CORPUS__*` environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_env("CORPUS")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(Self::environment(prefix))
            .build()?;
        Self::finish(config.try_deserialize()?)
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Self::environment("CORPUS"))
            .build()?;
        Self::finish(config.try_deserialize()?)
    }

    fn environment(prefix: &str) -> Environment {
        Environment::with_prefix(prefix)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("stages")
            .with_list_parse_key("dedup.source_priority")
            .with_list_parse_key("dedup.document_type_priority")
            .with_list_parse_key("pii.detectors")
    }

    fn finish(config: Self) -> Result<Self> {
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run.shard_docs == 0 {
            return Err(CoreError::InvalidConfig(
                "run.shard_docs must be greater than 0".to_string(),
            ));
        }
        if self.run.checkpoint_every_docs == Some(0) {
            return Err(CoreError::InvalidConfig(
                "run.checkpoint_every_docs must be greater than 0".to_string(),
            ));
        }
        self.dedup.validate()
    }
}

/// Resume behaviour for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    /// Load the live checkpoint when present, else start fresh.
    #[default]
    Auto,
    /// Restart every source from its first record. Shard numbering is kept so
    /// earlier output is not overwritten.
    Beginning,
    /// Discard all prior progress; a forced full rerun.
    Ignore,
    /// Load a named historical snapshot, falling back to the live checkpoint.
    Checkpoint,
}

impl ResumeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Beginning => "beginning",
            Self::Ignore => "ignore",
            Self::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for ResumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResumeMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "beginning" => Ok(Self::Beginning),
            "ignore" => Ok(Self::Ignore),
            "checkpoint" => Ok(Self::Checkpoint),
            other => Err(CoreError::InvalidConfig(format!(
                "unknown resume mode: {}",
                other
            ))),
        }
    }
}

/// Run-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub run_id_auto: Option<RunIdAuto>,
    /// Output root; `{run_id}` is substituted.
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    #[serde(default = "default_shard_docs")]
    pub shard_docs: usize,
    /// Defaults to `shard_docs` when unset.
    #[serde(default)]
    pub checkpoint_every_docs: Option<usize>,
    #[serde(default = "default_log_every_docs")]
    pub log_every_docs: usize,
    #[serde(default = "default_policy_version")]
    pub policy_version: String,
    #[serde(default)]
    pub resume_mode: ResumeMode,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            run_id_auto: None,
            out_dir: default_out_dir(),
            shard_docs: default_shard_docs(),
            checkpoint_every_docs: None,
            log_every_docs: default_log_every_docs(),
            policy_version: default_policy_version(),
            resume_mode: ResumeMode::default(),
            checkpoint_id: None,
        }
    }
}

impl RunConfig {
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_out_dir(mut self, out_dir: impl Into<String>) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    pub fn with_shard_docs(mut self, shard_docs: usize) -> Self {
        self.shard_docs = shard_docs;
        self
    }

    pub fn with_resume_mode(mut self, mode: ResumeMode) -> Self {
        self.resume_mode = mode;
        self
    }

    pub fn checkpoint_every(&self) -> usize {
        self.checkpoint_every_docs.unwrap_or(self.shard_docs).max(1)
    }

    /// Explicit `run_id`, else an auto-generated one, else `"run"`.
    pub fn resolve_run_id(&self, first_source: Option<&str>) -> String {
        if let Some(explicit) = self.run_id.as_deref().map(str::trim) {
            if !explicit.is_empty() {
                return explicit.to_string();
            }
        }
        match &self.run_id_auto {
            Some(auto) if auto.enabled => auto.generate(first_source),
            _ => "run".to_string(),
        }
    }

    pub fn resolve_out_dir(&self, run_id: &str) -> PathBuf {
        PathBuf::from(self.out_dir.replace("{run_id}", run_id))
    }
}

fn default_out_dir() -> String {
    "storage".to_string()
}

fn default_shard_docs() -> usize {
    5000
}

fn default_log_every_docs() -> usize {
    1000
}

fn default_policy_version() -> String {
    "policy_v0".to_string()
}

/// Auto-generated run identifier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIdAuto {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_prefix_digits")]
    pub prefix_digits: usize,
    #[serde(default = "default_suffix_digits")]
    pub suffix_digits: usize,
    #[serde(default = "default_true")]
    pub include_input_name: bool,
    #[serde(default = "default_separator")]
    pub separator: String,
}

impl Default for RunIdAuto {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix_digits: default_prefix_digits(),
            suffix_digits: default_suffix_digits(),
            include_input_name: true,
            separator: default_separator(),
        }
    }
}

impl RunIdAuto {
    pub fn generate(&self, first_source: Option<&str>) -> String {
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        self.compose(first_source, &stamp)
    }

    fn compose(&self, first_source: Option<&str>, stamp: &str) -> String {
        let mut parts = Vec::new();
        if self.include_input_name {
            let name: String = first_source
                .unwrap_or("run")
                .chars()
                .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
                .collect();
            parts.push(if name.is_empty() { "run".to_string() } else { name });
        }
        let prefix = &stamp[..self.prefix_digits.min(stamp.len())];
        if !prefix.is_empty() {
            parts.push(prefix.to_string());
        }
        let suffix = &stamp[stamp.len() - self.suffix_digits.min(stamp.len())..];
        if !suffix.is_empty() {
            parts.push(suffix.to_string());
        }
        if parts.is_empty() {
            "run".to_string()
        } else {
            parts.join(&self.separator)
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_prefix_digits() -> usize {
    4
}

fn default_suffix_digits() -> usize {
    6
}

fn default_separator() -> String {
    "_".to_string()
}

/// Global fingerprint deduplication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Store root, relative to the run output directory unless absolute.
    #[serde(default = "default_fingerprint_root")]
    pub root_path: String,
    #[serde(default = "default_fingerprint_version")]
    pub fingerprint_version: String,
    #[serde(default)]
    pub simhash: SimHashOptions,
    #[serde(default)]
    pub minhash: MinHashOptions,
    #[serde(default)]
    pub chunk_hash: ChunkHashOptions,
    /// Source names, highest priority first.
    #[serde(default)]
    pub source_priority: Vec<String>,
    /// Document families, highest priority first.
    #[serde(default)]
    pub document_type_priority: Vec<String>,
    #[serde(default)]
    pub source_to_document_type: HashMap<String, String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            root_path: default_fingerprint_root(),
            fingerprint_version: default_fingerprint_version(),
            simhash: SimHashOptions::default(),
            minhash: MinHashOptions::default(),
            chunk_hash: ChunkHashOptions::default(),
            source_priority: Vec::new(),
            document_type_priority: Vec::new(),
            source_to_document_type: HashMap::new(),
        }
    }
}

impl DedupConfig {
    pub fn with_root_path(mut self, root: impl Into<String>) -> Self {
        self.root_path = root.into();
        self
    }

    pub fn with_source_priority(mut self, order: Vec<String>) -> Self {
        self.source_priority = order;
        self
    }

    pub fn with_document_types(
        mut self,
        order: Vec<String>,
        mapping: HashMap<String, String>,
    ) -> Self {
        self.document_type_priority = order;
        self.source_to_document_type = mapping;
        self
    }

    pub fn only_chunk_hash(mut self) -> Self {
        self.simhash.enabled = false;
        self.minhash.enabled = false;
        self.chunk_hash.enabled = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.fingerprint_version.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "dedup.fingerprint_version must not be empty".to_string(),
            ));
        }
        if self.minhash.enabled {
            if self.minhash.num_hashes == 0 {
                return Err(CoreError::InvalidConfig(
                    "dedup.minhash.num_hashes must be greater than 0".to_string(),
                ));
            }
            if self.minhash.shingle_size == 0 {
                return Err(CoreError::InvalidConfig(
                    "dedup.minhash.shingle_size must be greater than 0".to_string(),
                ));
            }
            if !(self.minhash.threshold > 0.0 && self.minhash.threshold <= 1.0) {
                return Err(CoreError::InvalidConfig(format!(
                    "dedup.minhash.threshold must be in (0, 1], got {}",
                    self.minhash.threshold
                )));
            }
        }
        if self.chunk_hash.enabled
            && self.chunk_hash.chunk_size > 0
            && self.chunk_hash.chunk_overlap >= self.chunk_hash.chunk_size
        {
            return Err(CoreError::InvalidConfig(
                "dedup.chunk_hash.chunk_overlap must be less than chunk_size".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_fingerprint_root() -> String {
    "fingerprints_global".to_string()
}

fn default_fingerprint_version() -> String {
    "v1".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimHashOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_hamming")]
    pub max_hamming: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_true")]
    pub drop_on_match: bool,
}

impl Default for SimHashOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hamming: default_max_hamming(),
            max_tokens: default_max_tokens(),
            drop_on_match: true,
        }
    }
}

fn default_max_hamming() -> u32 {
    3
}

fn default_max_tokens() -> usize {
    2000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinHashOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_minhash_threshold")]
    pub threshold: f64,
    #[serde(default = "default_shingle_size")]
    pub shingle_size: usize,
    #[serde(default = "default_num_hashes")]
    pub num_hashes: usize,
    #[serde(default = "default_true")]
    pub drop_on_match: bool,
}

impl Default for MinHashOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_minhash_threshold(),
            shingle_size: default_shingle_size(),
            num_hashes: default_num_hashes(),
            drop_on_match: true,
        }
    }
}

fn default_minhash_threshold() -> f64 {
    0.9
}

fn default_shingle_size() -> usize {
    5
}

fn default_num_hashes() -> usize {
    128
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkHashOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Characters per chunk; 0 hashes the whole normalized text as one chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub chunk_overlap: usize,
    /// Drop documents with duplicated chunks instead of keeping them with a link.
    #[serde(default)]
    pub drop_on_match: bool,
}

impl Default for ChunkHashOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: default_chunk_size(),
            chunk_overlap: 0,
            drop_on_match: false,
        }
    }
}

fn default_chunk_size() -> usize {
    512
}

/// Length and entropy thresholds for the quality gate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityPolicy {
    #[serde(default)]
    pub min_chars: usize,
    #[serde(default)]
    pub entropy: EntropyRange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntropyRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl EntropyRange {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Allow/deny lists for the license gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicensePolicyConfig {
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub disallowed: Vec<String>,
    #[serde(default = "default_true")]
    pub require_license: bool,
}

impl Default for LicensePolicyConfig {
    fn default() -> Self {
        Self {
            allowed: Vec::new(),
            disallowed: Vec::new(),
            require_license: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiiMode {
    /// Reject documents with any detection.
    #[default]
    Drop,
    /// Keep documents but set the PII flag and types.
    Flag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiiPolicyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: PiiMode,
    /// Detector names, e.g. `email`, `phone`.
    #[serde(default = "default_pii_detectors")]
    pub detectors: Vec<String>,
}

impl Default for PiiPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: PiiMode::Drop,
            detectors: default_pii_detectors(),
        }
    }
}

fn default_pii_detectors() -> Vec<String> {
    vec!["email".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CorpusConfig::default();

        assert_eq!(config.run.shard_docs, 5000);
        assert_eq!(config.run.checkpoint_every(), 5000);
        assert_eq!(config.run.resume_mode, ResumeMode::Auto);
        assert_eq!(config.dedup.simhash.max_hamming, 3);
        assert_eq!(config.dedup.minhash.num_hashes, 128);
        assert_eq!(config.dedup.chunk_hash.chunk_size, 512);
        assert!(!config.dedup.chunk_hash.drop_on_match);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
stages = ["sanitize", "global_dedup"]

[run]
run_id = "nightly"
shard_docs = 100
resume_mode = "ignore"

[dedup]
source_priority = ["books", "wiki"]
document_type_priority = ["books", "web"]

[dedup.source_to_document_type]
gutenberg = "books"
cc_main = "web"

[dedup.minhash]
threshold = 0.8

[dedup.chunk_hash]
chunk_size = 256
chunk_overlap = 32
"#
        )
        .unwrap();

        let config = CorpusConfig::load_from_file(path.to_str().unwrap()).unwrap();

        assert_eq!(config.stages, vec!["sanitize", "global_dedup"]);
        assert_eq!(config.run.run_id.as_deref(), Some("nightly"));
        assert_eq!(config.run.shard_docs, 100);
        assert_eq!(config.run.resume_mode, ResumeMode::Ignore);
        assert_eq!(config.dedup.source_priority, vec!["books", "wiki"]);
        assert_eq!(
            config.dedup.source_to_document_type.get("gutenberg").map(String::as_str),
            Some("books")
        );
        assert_eq!(config.dedup.minhash.threshold, 0.8);
        assert_eq!(config.dedup.minhash.num_hashes, 128);
        assert_eq!(config.dedup.chunk_hash.chunk_overlap, 32);
        assert_eq!(config.run.log_every_docs, 1000);
    }

    #[test]
    fn test_invalid_chunk_overlap_rejected() {
        let mut config = CorpusConfig::default();
        config.dedup.chunk_hash.chunk_size = 10;
        config.dedup.chunk_hash.chunk_overlap = 10;
        assert!(config.validate().is_err());

        config.dedup.chunk_hash.chunk_overlap = 9;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resume_mode_parsing() {
        assert_eq!("AUTO".parse::<ResumeMode>().unwrap(), ResumeMode::Auto);
        assert_eq!("checkpoint".parse::<ResumeMode>().unwrap(), ResumeMode::Checkpoint);
        assert!("rewind".parse::<ResumeMode>().is_err());
        assert_eq!(ResumeMode::Beginning.to_string(), "beginning");
    }

    #[test]
    fn test_resolve_run_id() {
        let explicit = RunConfig::default().with_run_id("  my_run ");
        assert_eq!(explicit.resolve_run_id(Some("ignored")), "my_run");

        let fallback = RunConfig::default();
        assert_eq!(fallback.resolve_run_id(None), "run");

        let auto = RunIdAuto::default();
        assert_eq!(
            auto.compose(Some("common pile/v2"), "20260101123456"),
            "common_pile_v2_2026_123456"
        );

        let no_name = RunIdAuto {
            include_input_name: false,
            separator: "-".to_string(),
            ..Default::default()
        };
        assert_eq!(no_name.compose(None, "20260101123456"), "2026-123456");
    }

    #[test]
    fn test_resolve_out_dir() {
        let run = RunConfig::default().with_out_dir("storage/{run_id}/out");
        assert_eq!(run.resolve_out_dir("r1"), PathBuf::from("storage/r1/out"));
    }

    #[test]
    fn test_entropy_range() {
        let range = EntropyRange {
            min: Some(1.0),
            max: Some(5.0),
        };
        assert!(range.contains(3.0));
        assert!(!range.contains(0.5));
        assert!(!range.contains(6.0));
        assert!(EntropyRange::default().contains(100.0));
    }
}
