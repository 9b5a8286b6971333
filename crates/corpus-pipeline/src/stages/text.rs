//! Text cleanup and cheap quality heuristics.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use corpus_core::QualityPolicy;

use crate::document::{reasons, Decision, Document};
use crate::stage::{Stage, StageLayer};
use crate::Result;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Replace simple HTML tags with spaces and collapse whitespace.
pub fn sanitize(text: &str) -> String {
    let stripped = TAG_RE.replace_all(text, " ");
    WS_RE.replace_all(&stripped, " ").trim().to_string()
}

/// Character-level Shannon entropy in bits.
///
/// Very low values usually mean boilerplate; very high values, encoding junk.
pub fn char_entropy(text: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in text.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    let n = total as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / n;
            -p * p.log2()
        })
        .sum()
}

/// Strips markup and normalizes whitespace.
#[derive(Debug, Default)]
pub struct SanitizeStage;

impl Stage for SanitizeStage {
    fn name(&self) -> &'static str {
        "sanitize"
    }

    fn apply(&mut self, doc: &mut Document) -> Result<Decision> {
        doc.text = sanitize(&doc.text);
        doc.push_transform("sanitize_v1");
        Ok(Decision::accept(self.name()))
    }
}

/// Length and entropy gate; fills the character, byte and entropy stats.
#[derive(Debug, Clone)]
pub struct QualityGate {
    policy: QualityPolicy,
}

impl QualityGate {
    pub fn new(policy: QualityPolicy) -> Self {
        Self { policy }
    }
}

impl Stage for QualityGate {
    fn name(&self) -> &'static str {
        "quality_gate"
    }

    fn layer(&self) -> StageLayer {
        StageLayer::Quality
    }

    fn apply(&mut self, doc: &mut Document) -> Result<Decision> {
        let chars = doc.text.chars().count();
        doc.chars = Some(chars);
        doc.bytes_utf8 = Some(doc.text.len());
        if chars < self.policy.min_chars {
            return Ok(Decision::reject(
                self.name(),
                reasons::TOO_SHORT,
                format!("chars={}", chars),
            ));
        }

        let entropy = char_entropy(&doc.text);
        doc.entropy = Some(entropy);
        if !self.policy.entropy.contains(entropy) {
            return Ok(Decision::reject(
                self.name(),
                reasons::ENTROPY_OUT_OF_RANGE,
                format!("entropy={:.3}", entropy),
            ));
        }

        doc.push_transform("quality_gate_v1");
        Ok(Decision::accept(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RawDocument;
    use corpus_core::EntropyRange;
    use pretty_assertions::assert_eq;

    fn doc(text: &str) -> Document {
        Document::from_raw(RawDocument::new("r", "web", text), "policy_v0")
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(
            sanitize("<p>Hello,\n\n  <b>world</b></p>  "),
            "Hello, world"
        );
        assert_eq!(sanitize("   "), "");
    }

    #[test]
    fn test_char_entropy() {
        assert_eq!(char_entropy(""), 0.0);
        assert_eq!(char_entropy("aaaa"), 0.0);
        assert!((char_entropy("abab") - 1.0).abs() < 1e-12);
        assert!((char_entropy("abcd") - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_sanitize_stage_records_transform() {
        let mut d = doc("<div>a  b</div>");
        let decision = SanitizeStage.apply(&mut d).unwrap();
        assert!(decision.accepted);
        assert_eq!(d.text, "a b");
        assert_eq!(d.transform_chain, vec!["sanitize_v1"]);
    }

    #[test]
    fn test_quality_gate_too_short() {
        let mut gate = QualityGate::new(QualityPolicy {
            min_chars: 10,
            entropy: EntropyRange::default(),
        });
        let mut d = doc("héllo");
        let decision = gate.apply(&mut d).unwrap();

        assert!(!decision.accepted);
        assert_eq!(decision.reason_code, "TOO_SHORT");
        assert_eq!(decision.reason_detail, "chars=5");
        assert_eq!(d.chars, Some(5));
        assert_eq!(d.bytes_utf8, Some(6));
        assert!(d.transform_chain.is_empty());
    }

    #[test]
    fn test_quality_gate_entropy_range() {
        let mut gate = QualityGate::new(QualityPolicy {
            min_chars: 0,
            entropy: EntropyRange {
                min: Some(1.5),
                max: None,
            },
        });

        let mut low = doc("abababab");
        let decision = gate.apply(&mut low).unwrap();
        assert_eq!(decision.reason_code, "ENTROPY_OUT_OF_RANGE");
        assert_eq!(decision.reason_detail, "entropy=1.000");

        let mut ok = doc("abcdabcd");
        assert!(gate.apply(&mut ok).unwrap().accepted);
        assert_eq!(ok.transform_chain, vec!["quality_gate_v1"]);
    }
}
