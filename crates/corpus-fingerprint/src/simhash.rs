//! SimHash store: coarse near-duplicate detection by Hamming distance.
//!
//! Lookups use a banded index. With a radius of `k` the 64 bits are split into
//! `k + 1` bands; two signatures within distance `k` must agree on at least one
//! whole band, so only records sharing a band value are compared.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::schema::{FingerprintKind, FingerprintRecord, FingerprintValue, HashParams};
use crate::stable_hash;
use crate::store::{FingerprintStore, StoreBase, StoreStats};
use crate::Result;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9_]{2,}").expect("valid regex"));

const BITS: u32 = 64;

/// 64-bit SimHash over the first `max_tokens` word tokens of `text`.
///
/// Tokens are runs of at least two ASCII letters, digits or underscores in the
/// lowercased text. Text with no tokens hashes to 0.
pub fn simhash(text: &str, max_tokens: usize) -> u64 {
    let lowered = text.to_lowercase();
    let mut weights = [0i64; BITS as usize];
    for token in WORD_RE.find_iter(&lowered).take(max_tokens) {
        let h = stable_hash(token.as_str().as_bytes());
        for (bit, weight) in weights.iter_mut().enumerate() {
            if (h >> bit) & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }
    weights
        .iter()
        .enumerate()
        .filter(|(_, w)| **w > 0)
        .fold(0u64, |acc, (bit, _)| acc | (1u64 << bit))
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// `(shift, mask)` for each band.
fn band_layout(max_hamming: u32) -> Vec<(u32, u64)> {
    let bands = max_hamming + 1;
    let base = BITS / bands;
    let extra = BITS % bands;
    let mut shift = 0;
    (0..bands)
        .map(|i| {
            let width = base + u32::from(i < extra);
            let mask = if width >= BITS { u64::MAX } else { (1u64 << width) - 1 };
            let band = (shift, mask);
            shift += width;
            band
        })
        .collect()
}

/// Global SimHash store.
#[derive(Debug)]
pub struct SimHashStore {
    base: StoreBase,
    max_hamming: u32,
    records: Vec<FingerprintRecord>,
    layout: Vec<(u32, u64)>,
    bands: Vec<HashMap<u64, Vec<usize>>>,
}

impl SimHashStore {
    pub fn open(root: &Path, max_hamming: u32, params: HashParams) -> Result<Self> {
        let (base, live) = StoreBase::open(root, FingerprintKind::Simhash, params)?;
        // Radius 64 or more matches everything; no banding needed.
        let layout = if max_hamming < BITS {
            band_layout(max_hamming)
        } else {
            Vec::new()
        };
        let mut store = Self {
            base,
            max_hamming,
            records: Vec::with_capacity(live.len()),
            bands: vec![HashMap::new(); layout.len()],
            layout,
        };
        for record in live {
            store.index(record);
        }
        Ok(store)
    }

    /// Signature of `text` under this store's token cap; `None` when the text
    /// has no tokens.
    pub fn signature(&self, text: &str) -> Option<u64> {
        if !WORD_RE.is_match(&text.to_lowercase()) {
            debug!(chars = text.chars().count(), "No SimHash tokens in text; skipping signature");
            return None;
        }
        Some(simhash(text, self.base.params().max_tokens))
    }

    pub fn max_hamming(&self) -> u32 {
        self.max_hamming
    }

    fn index(&mut self, record: FingerprintRecord) {
        if let FingerprintValue::Simhash(signature) = record.value {
            let position = self.records.len();
            for ((shift, mask), band) in self.layout.iter().zip(self.bands.iter_mut()) {
                band.entry((signature >> shift) & mask)
                    .or_default()
                    .push(position);
            }
            self.records.push(record);
        }
    }

    fn signature_of(record: &FingerprintRecord) -> Option<u64> {
        match record.value {
            FingerprintValue::Simhash(signature) => Some(signature),
            _ => None,
        }
    }
}

impl FingerprintStore for SimHashStore {
    type Query = u64;

    fn kind(&self) -> FingerprintKind {
        self.base.kind()
    }

    fn hash_params(&self) -> &HashParams {
        self.base.params()
    }

    fn query(&self, signature: &u64) -> Vec<&FingerprintRecord> {
        if self.layout.is_empty() {
            return self.records.iter().collect();
        }

        let mut candidates = BTreeSet::new();
        for ((shift, mask), band) in self.layout.iter().zip(&self.bands) {
            if let Some(positions) = band.get(&((signature >> shift) & mask)) {
                candidates.extend(positions.iter().copied());
            }
        }

        candidates
            .into_iter()
            .map(|position| &self.records[position])
            .filter(|record| {
                Self::signature_of(record)
                    .map_or(false, |other| hamming_distance(*signature, other) <= self.max_hamming)
            })
            .collect()
    }

    fn add(&mut self, record: FingerprintRecord) -> Result<bool> {
        if !self.base.admit(&record)? {
            return Ok(false);
        }
        self.index(record);
        Ok(true)
    }

    fn flush(&mut self) -> Result<()> {
        self.base.flush()
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn stats(&self) -> StoreStats {
        self.base.stats()
    }
}
