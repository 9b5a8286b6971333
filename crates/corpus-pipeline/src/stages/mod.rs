//! Built-in stages and the name-based stage registry.

mod dedup;
mod policy;
mod text;

pub use dedup::{ExactDedupStage, GlobalDedupStage};
pub use policy::{
    detector_by_name, EmailDetector, LicenseGate, LicensePolicy, ListLicensePolicy, PhoneDetector,
    PiiDetector, PiiGate, PiiSignal,
};
pub use text::{char_entropy, sanitize, QualityGate, SanitizeStage};

use std::collections::BTreeMap;
use std::path::Path;

use corpus_core::CorpusConfig;

use crate::stage::{Stage, StageChain};
use crate::{PipelineError, Result};

/// What a stage factory may read while building its stage.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub config: &'a CorpusConfig,
    /// Run output directory; relative store roots resolve against it.
    pub out_dir: &'a Path,
    pub run_id: &'a str,
}

type StageFactory = Box<dyn Fn(&StageContext<'_>) -> Result<Box<dyn Stage>> + Send + Sync>;

/// Maps stage names to factories.
pub struct StageRegistry {
    factories: BTreeMap<String, StageFactory>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Create with the built-in stages
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("sanitize", |_| Ok(Box::new(SanitizeStage)));
        registry.register("license_gate", |ctx| {
            Ok(Box::new(LicenseGate::from_config(&ctx.config.license)))
        });
        registry.register("quality_gate", |ctx| {
            Ok(Box::new(QualityGate::new(ctx.config.quality.clone())))
        });
        registry.register("exact_dedup", |_| Ok(Box::new(ExactDedupStage::new())));
        registry.register("pii_gate", |ctx| {
            Ok(Box::new(PiiGate::from_config(&ctx.config.pii)?))
        });
        registry.register("global_dedup", |ctx| {
            Ok(Box::new(GlobalDedupStage::open(&ctx.config.dedup, ctx.out_dir, ctx.run_id)?))
        });
        registry
    }

    /// Register a factory, replacing any existing one with the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&StageContext<'_>) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// List registered stage names
    pub fn list(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, name: &str, ctx: &StageContext<'_>) -> Result<Box<dyn Stage>> {
        let factory = self
            .factories
            .get(name.trim())
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))?;
        factory(ctx)
    }

    /// Build a chain from `names`, in order. Every name must be registered.
    pub fn build_chain(&self, names: &[String], ctx: &StageContext<'_>) -> Result<StageChain> {
        if let Some(unknown) = names.iter().find(|n| !self.contains(n.trim())) {
            return Err(PipelineError::UnknownStage(unknown.clone()));
        }
        let mut chain = StageChain::new();
        for name in names {
            chain.push(self.create(name, ctx)?);
        }
        Ok(chain)
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Decision, Document, RawDocument};
    use crate::stage::{ChainOutcome, FnStage};
    use pretty_assertions::assert_eq;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_registered() {
        let registry = StageRegistry::with_defaults();
        assert_eq!(
            registry.list(),
            vec![
                "exact_dedup",
                "global_dedup",
                "license_gate",
                "pii_gate",
                "quality_gate",
                "sanitize"
            ]
        );
    }

    #[test]
    fn test_unknown_stage_fails_build() {
        let registry = StageRegistry::with_defaults();
        let config = CorpusConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let ctx = StageContext {
            config: &config,
            out_dir: dir.path(),
            run_id: "test_run",
        };

        let err = registry
            .build_chain(&names(&["sanitize", "tokenize"]), &ctx)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::UnknownStage(ref name) if name == "tokenize"));
    }

    #[test]
    fn test_build_chain_in_order() {
        let mut registry = StageRegistry::with_defaults();
        registry.register("tag", |_| {
            Ok(Box::new(FnStage::new("tag", |doc: &mut Document| {
                doc.data_tag = Some("training".to_string());
                Ok(Decision::accept("tag"))
            })))
        });

        let mut config = CorpusConfig::default();
        config.license.require_license = false;
        let dir = tempfile::tempdir().unwrap();
        let ctx = StageContext {
            config: &config,
            out_dir: dir.path(),
            run_id: "test_run",
        };

        let mut chain = registry
            .build_chain(
                &names(&["sanitize", "license_gate", "exact_dedup", "tag", "global_dedup"]),
                &ctx,
            )
            .unwrap();
        assert_eq!(
            chain.list(),
            vec!["sanitize", "license_gate", "exact_dedup", "tag", "global_dedup"]
        );

        let mut doc = Document::from_raw(
            RawDocument::new("r1", "web", "<p>Hello   there, general reader.</p>"),
            "policy_v0",
        );
        assert_eq!(chain.run(&mut doc).unwrap(), ChainOutcome::Accepted);
        assert_eq!(doc.text, "Hello there, general reader.");
        assert_eq!(doc.data_tag.as_deref(), Some("training"));
        assert_eq!(
            doc.transform_chain,
            vec!["sanitize_v1", "license_gate_v1", "exact_dedup_v1", "global_dedup_kept_v1"]
        );
    }
}
