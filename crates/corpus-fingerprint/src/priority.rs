//! Priority resolution between an incoming document and existing matches.
//!
//! Ranks are list positions: 0 is the highest priority, and names matching no
//! entry rank after every listed entry. Matching is case-insensitive: an
//! entry matches when it occurs anywhere in the name (equality and prefixes
//! included).

use std::collections::HashMap;

use corpus_core::DedupConfig;

const UNKNOWN_TYPE: &str = "unknown";

/// Rank of `name` in `order`. An empty order ranks everything 0.
pub fn rank(name: &str, order: &[String]) -> usize {
    if order.is_empty() {
        return 0;
    }
    let name = name.trim().to_lowercase();
    order
        .iter()
        .map(|label| label.trim().to_lowercase())
        .position(|label| !label.is_empty() && name.contains(&label))
        .unwrap_or(order.len())
}

pub fn source_priority_rank(source: &str, priority_order: &[String]) -> usize {
    rank(source, priority_order)
}

pub fn document_type_priority_rank(doc_type: &str, type_order: &[String]) -> usize {
    rank(doc_type, type_order)
}

/// Keep the incoming document only if its source strictly outranks every
/// existing source. With no order configured the existing document wins.
pub fn should_keep_incoming_by_priority(
    incoming_source: &str,
    existing_sources: &[String],
    priority_order: &[String],
) -> bool {
    if priority_order.is_empty() {
        return false;
    }
    let incoming = source_priority_rank(incoming_source, priority_order);
    match existing_sources
        .iter()
        .map(|s| source_priority_rank(s, priority_order))
        .min()
    {
        Some(best_existing) => incoming < best_existing,
        None => true,
    }
}

/// Family rank first; on a tie, source rank within the family when a source
/// order is configured, else keep the existing document.
pub fn should_keep_incoming_by_type_and_source(
    incoming_source: &str,
    existing_sources: &[String],
    document_type_priority: &[String],
    source_to_document_type: &HashMap<String, String>,
    source_priority: &[String],
) -> bool {
    if document_type_priority.is_empty() || source_to_document_type.is_empty() {
        return false;
    }
    let type_of = |source: &str| {
        source_to_document_type
            .get(source)
            .map(String::as_str)
            .filter(|t| !t.is_empty())
            .unwrap_or(UNKNOWN_TYPE)
            .to_string()
    };

    let incoming = document_type_priority_rank(&type_of(incoming_source), document_type_priority);
    let Some(best_existing) = existing_sources
        .iter()
        .map(|s| document_type_priority_rank(&type_of(s), document_type_priority))
        .min()
    else {
        return true;
    };

    if incoming < best_existing {
        true
    } else if incoming > best_existing {
        false
    } else {
        should_keep_incoming_by_priority(incoming_source, existing_sources, source_priority)
    }
}

/// Configured priority orders, applied by the decision engine on a match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityPolicy {
    pub source_priority: Vec<String>,
    pub document_type_priority: Vec<String>,
    pub source_to_document_type: HashMap<String, String>,
}

impl PriorityPolicy {
    pub fn from_config(config: &DedupConfig) -> Self {
        Self {
            source_priority: config.source_priority.clone(),
            document_type_priority: config.document_type_priority.clone(),
            source_to_document_type: config.source_to_document_type.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.source_priority.is_empty()
            || (!self.document_type_priority.is_empty() && !self.source_to_document_type.is_empty())
    }

    /// Whether `incoming_source` displaces the sources it matched.
    pub fn should_keep_incoming(&self, incoming_source: &str, existing_sources: &[String]) -> bool {
        if !self.document_type_priority.is_empty() && !self.source_to_document_type.is_empty() {
            return should_keep_incoming_by_type_and_source(
                incoming_source,
                existing_sources,
                &self.document_type_priority,
                &self.source_to_document_type,
                &self.source_priority,
            );
        }
        should_keep_incoming_by_priority(incoming_source, existing_sources, &self.source_priority)
    }
}
