//! MinHash + LSH store: near-duplicate detection above a Jaccard threshold.
//!
//! Signatures are the per-function minima of `(a * h + b) mod (2^61 - 1)` over
//! the stable hashes `h` of overlapping character shingles. Signatures are split
//! into `bands` groups of `rows` values; two documents become candidates when
//! any band hashes identically, and candidates are confirmed by estimated
//! Jaccard similarity. The banding is rebuilt from the record log on open.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tracing::debug;

use crate::schema::{
    FingerprintKind, FingerprintRecord, FingerprintValue, HashParams, MinHashSignature,
};
use crate::stable_hash;
use crate::store::{FingerprintStore, StoreBase, StoreStats};
use crate::{FingerprintError, Result};

const MERSENNE_PRIME: u64 = (1 << 61) - 1;
const COEFFICIENT_SEED: u64 = 0x5eed_0f_5eed;
const INTEGRATION_STEPS: usize = 100;

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Deterministic MinHash signature generator.
#[derive(Debug, Clone)]
pub struct MinHasher {
    shingle_size: usize,
    coefficients: Vec<(u64, u64)>,
}

impl MinHasher {
    pub fn new(shingle_size: usize, num_hashes: usize) -> Self {
        let mut state = COEFFICIENT_SEED;
        let coefficients = (0..num_hashes)
            .map(|_| {
                let a = splitmix64(&mut state) % (MERSENNE_PRIME - 1) + 1;
                let b = splitmix64(&mut state) % MERSENNE_PRIME;
                (a, b)
            })
            .collect();
        Self {
            shingle_size: shingle_size.max(1),
            coefficients,
        }
    }

    pub fn num_hashes(&self) -> usize {
        self.coefficients.len()
    }

    /// Overlapping character shingles; text shorter than one shingle is a
    /// single shingle.
    pub fn shingles<'a>(&self, text: &'a str) -> Vec<&'a str> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        bounds.push(text.len());
        let chars = bounds.len() - 1;
        if chars <= self.shingle_size {
            return vec![text];
        }
        (0..=chars - self.shingle_size)
            .map(|start| &text[bounds[start]..bounds[start + self.shingle_size]])
            .collect()
    }

    /// `None` for empty text.
    pub fn signature(&self, text: &str) -> Option<MinHashSignature> {
        let shingles = self.shingles(text);
        if shingles.is_empty() {
            return None;
        }
        let hashes: Vec<u64> = shingles
            .iter()
            .map(|s| stable_hash(s.as_bytes()) % MERSENNE_PRIME)
            .collect();
        let mins = self
            .coefficients
            .iter()
            .map(|&(a, b)| {
                hashes
                    .iter()
                    .map(|&h| permute(a, b, h))
                    .min()
                    .unwrap_or(u64::MAX)
            })
            .collect();
        Some(MinHashSignature::new(mins))
    }
}

fn permute(a: u64, b: u64, h: u64) -> u64 {
    ((u128::from(a) * u128::from(h) + u128::from(b)) % u128::from(MERSENNE_PRIME)) as u64
}

/// Probability that a pair with similarity `s` shares at least one band.
fn collision_probability(s: f64, bands: usize, rows: usize) -> f64 {
    1.0 - (1.0 - s.powi(rows as i32)).powi(bands as i32)
}

fn integrate(from: f64, to: f64, f: impl Fn(f64) -> f64) -> f64 {
    let step = (to - from) / INTEGRATION_STEPS as f64;
    (0..INTEGRATION_STEPS)
        .map(|i| f(from + (i as f64 + 0.5) * step) * step)
        .sum()
}

/// Band/row split minimising the equally weighted false-positive and
/// false-negative areas around `threshold`.
pub fn optimal_bands(threshold: f64, num_hashes: usize) -> (usize, usize) {
    let mut best = (1, num_hashes.max(1));
    let mut best_error = f64::MAX;
    for bands in 1..=num_hashes {
        for rows in 1..=num_hashes / bands {
            let false_positive =
                integrate(0.0, threshold, |s| collision_probability(s, bands, rows));
            let false_negative =
                integrate(threshold, 1.0, |s| 1.0 - collision_probability(s, bands, rows));
            let error = 0.5 * false_positive + 0.5 * false_negative;
            if error < best_error {
                best_error = error;
                best = (bands, rows);
            }
        }
    }
    best
}

/// Global MinHash + LSH store.
#[derive(Debug)]
pub struct MinHashStore {
    base: StoreBase,
    hasher: MinHasher,
    threshold: f64,
    rows: usize,
    records: Vec<FingerprintRecord>,
    bands: Vec<HashMap<u64, Vec<usize>>>,
}

impl MinHashStore {
    pub fn open(root: &Path, threshold: f64, params: HashParams) -> Result<Self> {
        if params.num_hashes == 0 || params.shingle_size == 0 {
            return Err(FingerprintError::InvalidConfig(
                "minhash needs num_hashes > 0 and shingle_size > 0".to_string(),
            ));
        }
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(FingerprintError::InvalidConfig(format!(
                "minhash threshold must be in (0, 1], got {}",
                threshold
            )));
        }

        let hasher = MinHasher::new(params.shingle_size, params.num_hashes);
        let (bands, rows) = optimal_bands(threshold, params.num_hashes);
        let (base, live) = StoreBase::open(root, FingerprintKind::Minhash, params)?;
        debug!(threshold, bands, rows, "MinHash LSH layout");

        let mut store = Self {
            base,
            hasher,
            threshold,
            rows,
            records: Vec::with_capacity(live.len()),
            bands: vec![HashMap::new(); bands],
        };
        for record in live {
            store.index(record);
        }
        Ok(store)
    }

    pub fn signature(&self, text: &str) -> Option<MinHashSignature> {
        self.hasher.signature(text)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn band_keys<'a>(&'a self, signature: &'a MinHashSignature) -> impl Iterator<Item = u64> + 'a {
        signature
            .values()
            .chunks(self.rows)
            .take(self.bands.len())
            .map(|rows| {
                let bytes: Vec<u8> = rows.iter().flat_map(|v| v.to_le_bytes()).collect();
                stable_hash(&bytes)
            })
    }

    fn index(&mut self, record: FingerprintRecord) {
        let FingerprintValue::Minhash(signature) = &record.value else {
            return;
        };
        if signature.len() != self.hasher.num_hashes() {
            debug!(
                doc_id = %record.doc_id,
                len = signature.len(),
                "Skipping MinHash record with mismatched signature length"
            );
            return;
        }
        let position = self.records.len();
        let keys: Vec<u64> = self.band_keys(signature).collect();
        for (band, key) in self.bands.iter_mut().zip(keys) {
            band.entry(key).or_default().push(position);
        }
        self.records.push(record);
    }
}

impl FingerprintStore for MinHashStore {
    type Query = MinHashSignature;

    fn kind(&self) -> FingerprintKind {
        self.base.kind()
    }

    fn hash_params(&self) -> &HashParams {
        self.base.params()
    }

    fn query(&self, signature: &MinHashSignature) -> Vec<&FingerprintRecord> {
        let mut candidates = BTreeSet::new();
        for (band, key) in self.bands.iter().zip(self.band_keys(signature)) {
            if let Some(positions) = band.get(&key) {
                candidates.extend(positions.iter().copied());
            }
        }

        candidates
            .into_iter()
            .map(|position| &self.records[position])
            .filter(|record| match &record.value {
                FingerprintValue::Minhash(other) => signature.jaccard(other) >= self.threshold,
                _ => false,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DocumentRef;
    use corpus_core::DocId;
    use pretty_assertions::assert_eq;

    fn store(root: &Path, threshold: f64) -> MinHashStore {
        MinHashStore::open(root, threshold, HashParams::minhash("v1", 5, 128)).unwrap()
    }

    fn record(store: &MinHashStore, text: &str, source: &str) -> FingerprintRecord {
        let doc = DocumentRef::new(DocId::from_text(text), source);
        FingerprintRecord::new(
            FingerprintValue::Minhash(store.signature(text).unwrap()),
            &doc,
            store.hash_params().clone(),
        )
    }

    const LONG_TEXT: &str = "Deduplication removes repeated passages from a training corpus so \
        that models do not memorise boilerplate. Near duplicates differ only in small edits \
        such as punctuation, casing or a changed word here and there, and they are surprisingly \
        common in crawled web data collected over many months.";

    #[test]
    fn test_shingles() {
        let hasher = MinHasher::new(3, 4);
        assert_eq!(hasher.shingles("abcde"), vec!["abc", "bcd", "cde"]);
        assert_eq!(hasher.shingles("ab"), vec!["ab"]);
        assert_eq!(hasher.shingles("héllo"), vec!["hél", "éll", "llo"]);
        assert!(hasher.shingles("").is_empty());
        assert!(hasher.signature("").is_none());
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = MinHasher::new(5, 64).signature(LONG_TEXT).unwrap();
        let b = MinHasher::new(5, 64).signature(LONG_TEXT).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_optimal_bands_fit_signature() {
        for (threshold, num_hashes) in [(0.9, 128), (0.5, 128), (0.8, 16), (1.0, 1)] {
            let (bands, rows) = optimal_bands(threshold, num_hashes);
            assert!(bands * rows <= num_hashes);
            assert!(bands >= 1 && rows >= 1);
        }
        let (_, strict_rows) = optimal_bands(0.9, 128);
        let (_, loose_rows) = optimal_bands(0.5, 128);
        assert!(strict_rows > loose_rows);
    }

    #[test]
    fn test_near_duplicate_found_and_distinct_text_not() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), 0.5);
        let original = record(&store, LONG_TEXT, "web");
        store.add(original).unwrap();

        let edited = LONG_TEXT.replace("surprisingly", "very");
        let signature = store.signature(&edited).unwrap();
        let hits = store.query(&signature);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "web");

        let unrelated = store
            .signature("A completely different paragraph about sailing boats and tides.")
            .unwrap();
        assert!(store.query(&unrelated).is_empty());
    }

    #[test]
    fn test_banding_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = store(dir.path(), 0.9);
            let rec = record(&store, LONG_TEXT, "books");
            assert!(store.add(rec).unwrap());
            store.flush().unwrap();
        }
        let store = store(dir.path(), 0.9);
        assert_eq!(store.len(), 1);
        let signature = store.signature(LONG_TEXT).unwrap();
        assert_eq!(store.query(&signature)[0].source, "books");
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MinHashStore::open(dir.path(), 0.0, HashParams::minhash("v1", 5, 128)).is_err());
        assert!(MinHashStore::open(dir.path(), 0.9, HashParams::minhash("v1", 5, 0)).is_err());
    }
}
