//! Governance gates: license policy and PII detection.
//!
//! Both gates consume pluggable policies through narrow traits so that
//! deployments can swap in their own license registry or PII detectors.

use once_cell::sync::Lazy;
use regex::Regex;

use corpus_core::{LicensePolicyConfig, PiiMode, PiiPolicyConfig};

use crate::document::{reasons, Decision, Document};
use crate::stage::{Stage, StageLayer};
use crate::{PipelineError, Result};

/// Decides whether a document's license permits inclusion.
pub trait LicensePolicy: Send {
    /// `Some((reason_code, detail))` when the document must be rejected.
    fn check(&self, license: Option<&str>) -> Option<(&'static str, String)>;
}

/// Allow/deny list policy. Matching is case-insensitive.
#[derive(Debug, Clone)]
pub struct ListLicensePolicy {
    allowed: Vec<String>,
    disallowed: Vec<String>,
    require_license: bool,
}

impl ListLicensePolicy {
    pub fn from_config(config: &LicensePolicyConfig) -> Self {
        let lower = |items: &[String]| -> Vec<String> {
            items.iter().map(|s| s.trim().to_lowercase()).collect()
        };
        Self {
            allowed: lower(&config.allowed),
            disallowed: lower(&config.disallowed),
            require_license: config.require_license,
        }
    }
}

impl LicensePolicy for ListLicensePolicy {
    fn check(&self, license: Option<&str>) -> Option<(&'static str, String)> {
        let license = match license.map(str::trim).filter(|l| !l.is_empty()) {
            Some(license) => license,
            None if self.require_license => {
                return Some((reasons::LICENSE_UNKNOWN, "missing license metadata".to_string()))
            }
            None => return None,
        };

        let key = license.to_lowercase();
        if self.disallowed.contains(&key) {
            return Some((reasons::LICENSE_DISALLOWED, format!("license={}", license)));
        }
        if !self.allowed.is_empty() && !self.allowed.contains(&key) {
            return Some((reasons::LICENSE_NOT_ALLOWED, format!("license={}", license)));
        }
        None
    }
}

pub struct LicenseGate {
    policy: Box<dyn LicensePolicy>,
}

impl LicenseGate {
    pub fn new(policy: Box<dyn LicensePolicy>) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &LicensePolicyConfig) -> Self {
        Self::new(Box::new(ListLicensePolicy::from_config(config)))
    }
}

impl Stage for LicenseGate {
    fn name(&self) -> &'static str {
        "license_gate"
    }

    fn layer(&self) -> StageLayer {
        StageLayer::Governance
    }

    fn apply(&mut self, doc: &mut Document) -> Result<Decision> {
        if let Some((code, detail)) = self.policy.check(doc.license.as_deref()) {
            return Ok(Decision::reject(self.name(), code, detail));
        }
        doc.push_transform("license_gate_v1");
        Ok(Decision::accept(self.name()))
    }
}

/// One detected PII occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct PiiSignal {
    pub kind: &'static str,
    /// Byte offsets into the text.
    pub span: (usize, usize),
    pub confidence: f32,
}

pub trait PiiDetector: Send {
    fn name(&self) -> &'static str;

    fn detect(&self, text: &str) -> Vec<PiiSignal>;
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\+?\d{1,3}[\s-]?)?(?:\d[\s-]?){9,12}").unwrap());

#[derive(Debug, Default)]
pub struct EmailDetector;

impl PiiDetector for EmailDetector {
    fn name(&self) -> &'static str {
        "email"
    }

    fn detect(&self, text: &str) -> Vec<PiiSignal> {
        EMAIL_RE
            .find_iter(text)
            .map(|m| PiiSignal {
                kind: "email",
                span: (m.start(), m.end()),
                confidence: 0.99,
            })
            .collect()
    }
}

/// Loose international phone heuristic; tune per region.
#[derive(Debug, Default)]
pub struct PhoneDetector;

impl PiiDetector for PhoneDetector {
    fn name(&self) -> &'static str {
        "phone"
    }

    fn detect(&self, text: &str) -> Vec<PiiSignal> {
        PHONE_RE
            .find_iter(text)
            .filter(|m| {
                let before = text[..m.start()].chars().next_back();
                let after = text[m.end()..].chars().next();
                !before.map_or(false, |c| c.is_ascii_digit())
                    && !after.map_or(false, |c| c.is_ascii_digit())
            })
            .map(|m| PiiSignal {
                kind: "phone",
                span: (m.start(), m.end()),
                confidence: 0.85,
            })
            .collect()
    }
}

/// Look up a built-in detector by name.
pub fn detector_by_name(name: &str) -> Option<Box<dyn PiiDetector>> {
    match name.trim().to_lowercase().as_str() {
        "email" => Some(Box::new(EmailDetector)),
        "phone" => Some(Box::new(PhoneDetector)),
        _ => None,
    }
}

/// Runs detectors and either rejects or flags documents with findings.
pub struct PiiGate {
    enabled: bool,
    mode: PiiMode,
    detectors: Vec<Box<dyn PiiDetector>>,
}

impl PiiGate {
    pub fn new(mode: PiiMode, detectors: Vec<Box<dyn PiiDetector>>) -> Self {
        Self {
            enabled: true,
            mode,
            detectors,
        }
    }

    pub fn from_config(config: &PiiPolicyConfig) -> Result<Self> {
        let detectors = config
            .detectors
            .iter()
            .map(|name| {
                detector_by_name(name).ok_or_else(|| {
                    PipelineError::Core(corpus_core::CoreError::InvalidConfig(format!(
                        "unknown PII detector: {}",
                        name
                    )))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            enabled: config.enabled,
            mode: config.mode,
            detectors,
        })
    }
}

impl Stage for PiiGate {
    fn name(&self) -> &'static str {
        "pii_gate"
    }

    fn layer(&self) -> StageLayer {
        StageLayer::Governance
    }

    fn apply(&mut self, doc: &mut Document) -> Result<Decision> {
        if !self.enabled {
            return Ok(Decision::accept(self.name()));
        }

        let mut kinds: Vec<&'static str> = Vec::new();
        for detector in &self.detectors {
            for signal in detector.detect(&doc.text) {
                if !kinds.contains(&signal.kind) {
                    kinds.push(signal.kind);
                }
            }
        }

        if let Some(first) = kinds.first().copied() {
            doc.pii_flag = true;
            doc.pii_types = kinds.iter().map(|k| k.to_string()).collect();
            if self.mode == PiiMode::Drop {
                // e.g. PII_EMAIL, PII_PHONE
                let code = format!("PII_{}", first.to_uppercase());
                return Ok(Decision::reject(
                    self.name(),
                    &code,
                    format!("{} detected", first),
                ));
            }
        }

        doc.push_transform("pii_gate_v1");
        Ok(Decision::accept(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RawDocument;
    use pretty_assertions::assert_eq;

    fn doc(text: &str, license: Option<&str>) -> Document {
        let mut raw = RawDocument::new("r", "web", text);
        raw.license = license.map(str::to_string);
        Document::from_raw(raw, "policy_v0")
    }

    fn gate(allowed: &[&str], disallowed: &[&str]) -> LicenseGate {
        LicenseGate::from_config(&LicensePolicyConfig {
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            disallowed: disallowed.iter().map(|s| s.to_string()).collect(),
            require_license: true,
        })
    }

    #[test]
    fn test_license_gate_reasons() {
        let mut gate = gate(&["CC-BY", "MIT"], &["proprietary"]);

        let decision = gate.apply(&mut doc("t", None)).unwrap();
        assert_eq!(decision.reason_code, "LICENSE_UNKNOWN");
        assert_eq!(decision.reason_detail, "missing license metadata");

        let decision = gate.apply(&mut doc("t", Some("Proprietary"))).unwrap();
        assert_eq!(decision.reason_code, "LICENSE_DISALLOWED");
        assert_eq!(decision.reason_detail, "license=Proprietary");

        let decision = gate.apply(&mut doc("t", Some("GPL-3.0"))).unwrap();
        assert_eq!(decision.reason_code, "LICENSE_NOT_ALLOWED");

        let mut ok = doc("t", Some("cc-by"));
        assert!(gate.apply(&mut ok).unwrap().accepted);
        assert_eq!(ok.transform_chain, vec!["license_gate_v1"]);
    }

    #[test]
    fn test_license_optional_when_not_required() {
        let policy = ListLicensePolicy::from_config(&LicensePolicyConfig {
            require_license: false,
            ..Default::default()
        });
        assert_eq!(policy.check(None), None);
        assert_eq!(policy.check(Some("anything")), None);
    }

    #[test]
    fn test_email_detector() {
        let signals = EmailDetector.detect("write to jane.doe@example.org today");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, "email");
        assert_eq!(signals[0].span, (9, 29));
    }

    #[test]
    fn test_phone_detector_requires_digit_boundaries() {
        assert_eq!(PhoneDetector.detect("call +91 98765 43210 now").len(), 1);
        assert!(PhoneDetector.detect("order 12345").is_empty());
    }

    #[test]
    fn test_pii_gate_drop_and_flag() {
        let mut drop = PiiGate::new(PiiMode::Drop, vec![Box::new(EmailDetector)]);
        let mut d = doc("contact me at someone@example.com", None);
        let decision = drop.apply(&mut d).unwrap();
        assert_eq!(decision.reason_code, reasons::PII_EMAIL);
        assert_eq!(decision.reason_detail, "email detected");
        assert!(d.pii_flag);

        let mut flag = PiiGate::new(PiiMode::Flag, vec![Box::new(EmailDetector)]);
        let mut d = doc("contact me at someone@example.com", None);
        assert!(flag.apply(&mut d).unwrap().accepted);
        assert_eq!(d.pii_types, vec!["email"]);
        assert_eq!(d.transform_chain, vec!["pii_gate_v1"]);

        let mut clean = doc("nothing to see", None);
        assert!(drop.apply(&mut clean).unwrap().accepted);
        assert!(!clean.pii_flag);
    }

    #[test]
    fn test_unknown_detector_fails_config() {
        let config = PiiPolicyConfig {
            detectors: vec!["ssn".to_string()],
            ..Default::default()
        };
        assert!(PiiGate::from_config(&config).is_err());
    }
}
