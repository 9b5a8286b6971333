//! Stage contract and the short-circuiting chain runner.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::debug;

use crate::document::{reasons, Decision, Document};
use crate::{PipelineError, Result};

/// Broad grouping of a stage, used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageLayer {
    Preprocessing,
    Governance,
    Quality,
    Dedup,
}

impl StageLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preprocessing => "preprocessing",
            Self::Governance => "governance",
            Self::Quality => "quality",
            Self::Dedup => "dedup",
        }
    }
}

impl fmt::Display for StageLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, stateful processing unit.
///
/// `apply` may mutate the document and must tolerate being re-invoked for a
/// document that was processed before a crash but never durably committed.
/// Returning `Err` (or panicking) is a fault, not a rejection: the driver turns
/// it into a `RUNTIME_ERROR` rejection and moves on.
pub trait Stage: Send {
    /// Stage name
    fn name(&self) -> &'static str;

    fn layer(&self) -> StageLayer {
        StageLayer::Preprocessing
    }

    /// Process document through this stage
    fn apply(&mut self, doc: &mut Document) -> Result<Decision>;

    /// Make any buffered state durable. Called before each checkpoint save.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Operator-facing report, included in the run manifest.
    fn summary(&self) -> Option<String> {
        None
    }
}

/// Stage built from a closure
pub struct FnStage<F>
where
    F: FnMut(&mut Document) -> Result<Decision> + Send,
{
    name: &'static str,
    layer: StageLayer,
    processor: F,
}

impl<F> FnStage<F>
where
    F: FnMut(&mut Document) -> Result<Decision> + Send,
{
    pub fn new(name: &'static str, processor: F) -> Self {
        Self {
            name,
            layer: StageLayer::Preprocessing,
            processor,
        }
    }

    pub fn with_layer(mut self, layer: StageLayer) -> Self {
        self.layer = layer;
        self
    }
}

impl<F> Stage for FnStage<F>
where
    F: FnMut(&mut Document) -> Result<Decision> + Send,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn layer(&self) -> StageLayer {
        self.layer
    }

    fn apply(&mut self, doc: &mut Document) -> Result<Decision> {
        (self.processor)(doc)
    }
}

/// Per-stage traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounters {
    pub input: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Rejections by reason code.
    pub reasons: BTreeMap<String, u64>,
}

impl StageCounters {
    fn reject(&mut self, reason_code: &str) {
        self.rejected += 1;
        let key = if reason_code.is_empty() {
            "UNSPECIFIED"
        } else {
            reason_code
        };
        *self.reasons.entry(key.to_string()).or_insert(0) += 1;
    }
}

/// Result of running a document through the whole chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Accepted,
    Rejected(Decision),
}

struct Slot {
    stage: Box<dyn Stage>,
    counters: StageCounters,
}

/// Ordered stages run sequentially per document; the first rejection stops
/// the chain.
#[derive(Default)]
pub struct StageChain {
    slots: Vec<Slot>,
}

impl StageChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, stage: Box<dyn Stage>) -> Self {
        self.push(stage);
        self
    }

    pub fn push(&mut self, stage: Box<dyn Stage>) {
        self.slots.push(Slot {
            stage,
            counters: StageCounters::default(),
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// List stage names in execution order
    pub fn list(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.stage.name()).collect()
    }

    /// Run `doc` through every stage.
    ///
    /// A stage error or panic is returned as `StageFailed` / `StagePanicked`;
    /// the document should then be treated as rejected with a runtime error.
    pub fn run(&mut self, doc: &mut Document) -> Result<ChainOutcome> {
        for slot in &mut self.slots {
            let name = slot.stage.name();
            slot.counters.input += 1;

            let stage = &mut slot.stage;
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.apply(doc)));

            match outcome {
                Ok(Ok(decision)) if decision.accepted => slot.counters.accepted += 1,
                Ok(Ok(decision)) => {
                    slot.counters.reject(&decision.reason_code);
                    debug!(
                        stage = name,
                        doc_id = %doc.doc_id,
                        source = %doc.source,
                        reason = %decision.reason_code,
                        "Document rejected"
                    );
                    return Ok(ChainOutcome::Rejected(decision));
                }
                Ok(Err(e)) => {
                    slot.counters.reject(reasons::RUNTIME_ERROR);
                    return Err(PipelineError::stage(name, e.to_string()));
                }
                Err(payload) => {
                    slot.counters.reject(reasons::RUNTIME_ERROR);
                    return Err(PipelineError::StagePanicked {
                        stage: name.to_string(),
                        message: panic_message(payload.as_ref()),
                    });
                }
            }
        }
        Ok(ChainOutcome::Accepted)
    }

    /// Flush every stage in order, stopping at the first failure.
    pub fn flush(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            slot.stage.flush()?;
        }
        Ok(())
    }

    /// Counters keyed by stage name, in execution order.
    pub fn counters(&self) -> Vec<(&'static str, &StageCounters)> {
        self.slots
            .iter()
            .map(|s| (s.stage.name(), &s.counters))
            .collect()
    }

    pub fn counters_by_name(&self) -> BTreeMap<String, StageCounters> {
        self.slots
            .iter()
            .map(|s| (s.stage.name().to_string(), s.counters.clone()))
            .collect()
    }

    /// Reports from stages that provide one, keyed by stage name.
    pub fn summaries(&self) -> BTreeMap<String, String> {
        self.slots
            .iter()
            .filter_map(|s| s.stage.summary().map(|text| (s.stage.name().to_string(), text)))
            .collect()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RawDocument;
    use pretty_assertions::assert_eq;

    fn doc(text: &str) -> Document {
        Document::from_raw(RawDocument::new("r", "web", text), "policy_v0")
    }

    fn upper() -> Box<dyn Stage> {
        Box::new(FnStage::new("upper", |doc: &mut Document| {
            doc.text = doc.text.to_uppercase();
            doc.push_transform("upper_v1");
            Ok(Decision::accept("upper"))
        }))
    }

    fn reject_short() -> Box<dyn Stage> {
        Box::new(FnStage::new("min_len", |doc: &mut Document| {
            if doc.text.len() < 5 {
                Ok(Decision::reject("min_len", reasons::TOO_SHORT, "short"))
            } else {
                Ok(Decision::accept("min_len"))
            }
        }))
    }

    #[test]
    fn test_chain_runs_in_order() {
        let mut chain = StageChain::new().add(upper()).add(reject_short());
        assert_eq!(chain.list(), vec!["upper", "min_len"]);

        let mut d = doc("hello world");
        assert_eq!(chain.run(&mut d).unwrap(), ChainOutcome::Accepted);
        assert_eq!(d.text, "HELLO WORLD");
        assert_eq!(d.transform_chain, vec!["upper_v1"]);
    }

    #[test]
    fn test_chain_short_circuits() {
        let mut chain = StageChain::new().add(reject_short()).add(upper());

        let mut d = doc("hi");
        match chain.run(&mut d).unwrap() {
            ChainOutcome::Rejected(decision) => {
                assert_eq!(decision.stage, "min_len");
                assert_eq!(decision.reason_code, "TOO_SHORT");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(d.text, "hi");

        let counters = chain.counters_by_name();
        assert_eq!(counters["min_len"].rejected, 1);
        assert_eq!(counters["min_len"].reasons["TOO_SHORT"], 1);
        assert_eq!(counters["upper"].input, 0);
    }

    #[test]
    fn test_stage_error_is_reported() {
        let failing = FnStage::new("broken", |_: &mut Document| {
            Err(PipelineError::Sink("disk full".to_string()))
        });
        let mut chain = StageChain::new().add(Box::new(failing));

        let err = chain.run(&mut doc("text")).unwrap_err();
        assert!(matches!(err, PipelineError::StageFailed { ref stage, .. } if stage == "broken"));
        assert_eq!(chain.counters_by_name()["broken"].reasons["RUNTIME_ERROR"], 1);
    }

    #[test]
    fn test_stage_panic_is_caught() {
        let panicking = FnStage::new("explodes", |_: &mut Document| -> Result<Decision> {
            panic!("bad record")
        });
        let mut chain = StageChain::new().add(Box::new(panicking)).add(upper());

        match chain.run(&mut doc("text")).unwrap_err() {
            PipelineError::StagePanicked { stage, message } => {
                assert_eq!(stage, "explodes");
                assert_eq!(message, "bad record");
            }
            other => panic!("unexpected error: {}", other),
        }

        let mut next = doc("still running");
        assert_eq!(chain.run(&mut next).unwrap(), ChainOutcome::Accepted);
    }
}
