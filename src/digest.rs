use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AggregatorError, Result};

// ─── Defaults ────────────────────────────────────────────────────

/// Percentiles reported when a config does not name its own.
pub const DEFAULT_PERCENTILES: [f64; 9] = [75.0, 90.0, 93.0, 94.0, 95.0, 96.0, 97.0, 98.0, 99.0];

// ─── SampleKey ───────────────────────────────────────────────────

/// A quantized observed value used as a digest bucket key.
///
/// Always finite, with `-0.0` folded into `0.0`, so the total order
/// from `f64::total_cmp` agrees with numeric order.
#[derive(Debug, Clone, Copy)]
pub struct SampleKey(f64);

impl SampleKey {
    pub fn new(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        Some(Self(if value == 0.0 { 0.0 } else { value }))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for SampleKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SampleKey {}

impl PartialOrd for SampleKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SampleKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ─── Percentiles ─────────────────────────────────────────────────

/// A validated, ascending list of percentiles, each in `(0, 100]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Percentiles(Vec<f64>);

impl Percentiles {
    pub fn new(mut values: Vec<f64>) -> Result<Self> {
        if values.is_empty() {
            return Err(AggregatorError::Config("percentile list is empty".into()));
        }
        if let Some(bad) = values
            .iter()
            .find(|p| !p.is_finite() || **p <= 0.0 || **p > 100.0)
        {
            return Err(AggregatorError::Config(format!(
                "percentile {bad} is outside (0, 100]"
            )));
        }
        values.sort_by(f64::total_cmp);
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Percentiles {
    fn default() -> Self {
        Self(DEFAULT_PERCENTILES.to_vec())
    }
}

// ─── HistogramDigest ─────────────────────────────────────────────

/// Count of occurrences per quantized value, plus the cached total.
///
/// `total` always equals the sum of all bucket counts; merging is a
/// per-key sum, so it is commutative and associative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "DigestWire", try_from = "DigestWire")]
pub struct HistogramDigest {
    buckets: BTreeMap<SampleKey, u64>,
    total: u64,
}

/// Wire shape: `{"data": [[value, count], ...], "count": total}`.
#[derive(Serialize, Deserialize)]
struct DigestWire {
    data: Vec<(f64, u64)>,
    count: u64,
}

impl HistogramDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// The well-formed stand-in for "no samples": one zero-count bucket at 0.
    pub fn sentinel() -> Self {
        let mut digest = Self::new();
        digest.buckets.insert(SampleKey(0.0), 0);
        digest
    }

    pub fn record(&mut self, key: SampleKey) -> Result<()> {
        self.record_n(key, 1)
    }

    /// Fails without touching the digest if `total` would overflow.
    pub fn record_n(&mut self, key: SampleKey, count: u64) -> Result<()> {
        // A bucket never exceeds `total`, so checking `total` covers it.
        self.total = self.total.checked_add(count).ok_or_else(count_overflow)?;
        *self.buckets.entry(key).or_insert(0) += count;
        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of distinct buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Buckets in ascending value order.
    pub fn iter(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.buckets.iter().map(|(k, c)| (k.0, *c))
    }

    /// Fails without touching the digest if `total` would overflow.
    pub fn merge(&mut self, other: &HistogramDigest) -> Result<()> {
        self.total = self.total.checked_add(other.total).ok_or_else(count_overflow)?;
        for (key, count) in &other.buckets {
            *self.buckets.entry(*key).or_insert(0) += count;
        }
        Ok(())
    }

    pub fn merge_all<'a>(digests: impl IntoIterator<Item = &'a HistogramDigest>) -> Result<Self> {
        let mut merged = Self::new();
        for digest in digests {
            merged.merge(digest)?;
        }
        Ok(merged)
    }

    /// Value at each percentile, in the order of `percentiles`.
    ///
    /// Threshold for `p` is `floor(total * p / 100)`; the reported value is
    /// the smallest key whose cumulative count (inclusive) is `>=` the
    /// threshold. One key may satisfy several thresholds at once. An empty
    /// digest yields an empty list.
    pub fn percentiles(&self, percentiles: &Percentiles) -> Vec<f64> {
        let thresholds: Vec<u64> = percentiles
            .as_slice()
            .iter()
            .map(|p| (self.total as f64 * p / 100.0).floor() as u64)
            .collect();

        let mut result = Vec::with_capacity(thresholds.len());
        let mut pending = thresholds.iter().peekable();
        let mut cumulative = 0u64;

        for (key, count) in &self.buckets {
            cumulative += count;
            while let Some(&&threshold) = pending.peek() {
                if cumulative < threshold {
                    break;
                }
                result.push(key.0);
                pending.next();
            }
            if pending.peek().is_none() {
                break;
            }
        }

        result
    }
}

fn count_overflow() -> AggregatorError {
    AggregatorError::Aggregation("digest count overflows u64".into())
}

impl From<HistogramDigest> for DigestWire {
    fn from(digest: HistogramDigest) -> Self {
        Self {
            data: digest.iter().collect(),
            count: digest.total,
        }
    }
}

impl TryFrom<DigestWire> for HistogramDigest {
    type Error = AggregatorError;

    fn try_from(wire: DigestWire) -> Result<Self> {
        let mut digest = Self::new();
        for (value, count) in wire.data {
            let key = SampleKey::new(value).ok_or_else(|| {
                AggregatorError::InvalidInput(format!("digest key {value} is not finite"))
            })?;
            digest.total = digest.total.checked_add(count).ok_or_else(|| {
                AggregatorError::InvalidInput("digest count overflow".into())
            })?;
            *digest.buckets.entry(key).or_insert(0) += count;
        }
        if digest.total != wire.count {
            return Err(AggregatorError::InvalidInput(format!(
                "digest count {} does not match bucket sum {}",
                wire.count, digest.total
            )));
        }
        Ok(digest)
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn key(v: f64) -> SampleKey {
        SampleKey::new(v).unwrap()
    }

    fn digest_of(values: &[f64]) -> HistogramDigest {
        let mut digest = HistogramDigest::new();
        for v in values {
            digest.record(key(*v)).unwrap();
        }
        digest
    }

    fn pct(values: &[f64]) -> Percentiles {
        Percentiles::new(values.to_vec()).unwrap()
    }

    #[test]
    fn total_tracks_bucket_sum() {
        let mut digest = digest_of(&[1.0, 1.0, 2.0]);
        digest.record_n(key(5.0), 7).unwrap();
        assert_eq!(digest.total(), 10);
        assert_eq!(digest.iter().map(|(_, c)| c).sum::<u64>(), 10);
        assert_eq!(digest.len(), 3);
    }

    #[test]
    fn negative_zero_is_zero() {
        let mut digest = HistogramDigest::new();
        digest.record(key(-0.0)).unwrap();
        digest.record(key(0.0)).unwrap();
        assert_eq!(digest.iter().collect::<Vec<_>>(), vec![(0.0, 2)]);
    }

    #[test]
    fn non_finite_keys_are_rejected() {
        assert!(SampleKey::new(f64::NAN).is_none());
        assert!(SampleKey::new(f64::INFINITY).is_none());
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let h1 = digest_of(&[1.0, 2.0, 2.0, 9.0]);
        let h2 = digest_of(&[2.0, 3.0]);
        let h3 = HistogramDigest::sentinel();

        let mut a = h1.clone();
        a.merge(&h2).unwrap();
        let mut b = h2.clone();
        b.merge(&h1).unwrap();
        assert_eq!(a, b);

        let mut left = a.clone();
        left.merge(&h3).unwrap();
        let mut h23 = h2.clone();
        h23.merge(&h3).unwrap();
        let mut right = h1.clone();
        right.merge(&h23).unwrap();
        assert_eq!(left, right);
        assert_eq!(left.total(), 6);
    }

    #[test]
    fn median_of_two_identical_hosts() {
        let samples: Vec<f64> = (0..100).map(f64::from).collect();
        let host = digest_of(&samples);
        let merged = HistogramDigest::merge_all([&host, &host]).unwrap();
        assert_eq!(merged.total(), 200);
        assert_eq!(merged.percentiles(&pct(&[50.0])), vec![49.0]);
    }

    #[test]
    fn threshold_tie_is_inclusive() {
        // total 4, p50 → threshold 2; cumulative at key 10 is exactly 2.
        let digest = digest_of(&[10.0, 10.0, 20.0, 30.0]);
        assert_eq!(digest.percentiles(&pct(&[50.0])), vec![10.0]);
        // p75 → threshold 3, reached at 20.
        assert_eq!(digest.percentiles(&pct(&[75.0])), vec![20.0]);
    }

    #[test]
    fn threshold_is_floored() {
        // total 3, p50 → floor(1.5) = 1, reached by the first key.
        let digest = digest_of(&[1.0, 2.0, 3.0]);
        assert_eq!(digest.percentiles(&pct(&[50.0])), vec![1.0]);
    }

    #[test]
    fn one_key_satisfies_several_thresholds() {
        let mut digest = digest_of(&[1.0]);
        digest.record_n(key(5.0), 98).unwrap();
        digest.record(key(7.0)).unwrap();
        assert_eq!(
            digest.percentiles(&pct(&[50.0, 90.0, 99.0, 100.0])),
            vec![5.0, 5.0, 5.0, 7.0]
        );
    }

    #[test]
    fn sentinel_reports_zero() {
        let digest = HistogramDigest::sentinel();
        assert_eq!(digest.total(), 0);
        assert_eq!(digest.percentiles(&pct(&[50.0, 99.0])), vec![0.0, 0.0]);
    }

    #[test]
    fn empty_digest_reports_nothing() {
        assert!(HistogramDigest::new().percentiles(&pct(&[50.0])).is_empty());
    }

    #[test]
    fn split_invariance() {
        let mut rng = StdRng::seed_from_u64(42);
        let percentiles = Percentiles::default();
        for _ in 0..20 {
            let len = rng.gen_range(1..500usize);
            let xs: Vec<f64> = (0..len).map(|_| f64::from(rng.gen_range(0..1000u32))).collect();
            let split = rng.gen_range(0..=len);
            let whole = digest_of(&xs);
            let parts = HistogramDigest::merge_all([&digest_of(&xs[..split]), &digest_of(&xs[split..])]).unwrap();
            assert_eq!(parts, whole);
            assert_eq!(parts.percentiles(&percentiles), whole.percentiles(&percentiles));
        }
    }

    #[test]
    fn percentiles_are_validated_and_sorted() {
        assert_eq!(pct(&[99.0, 50.0, 75.0]).as_slice(), &[50.0, 75.0, 99.0]);
        assert!(Percentiles::new(vec![]).is_err());
        assert!(Percentiles::new(vec![0.0]).is_err());
        assert!(Percentiles::new(vec![100.5]).is_err());
        assert!(Percentiles::new(vec![f64::NAN]).is_err());
        assert_eq!(Percentiles::default().len(), 9);
    }

    #[test]
    fn wire_form_round_trips() {
        let digest = digest_of(&[3.0, 1.0, 1.0]);
        let bytes = rmp_serde::to_vec_named(&digest).unwrap();
        let back: HistogramDigest = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn wire_form_rejects_inconsistent_count() {
        let bytes = rmp_serde::to_vec_named(&DigestWire {
            data: vec![(1.0, 2), (2.0, 1)],
            count: 4,
        })
        .unwrap();
        assert!(rmp_serde::from_slice::<HistogramDigest>(&bytes).is_err());
    }

    #[test]
    fn record_overflow_leaves_digest_intact() {
        let mut digest = HistogramDigest::new();
        digest.record_n(key(1.0), u64::MAX - 1).unwrap();
        let before = digest.clone();

        let err = digest.record_n(key(2.0), 2).unwrap_err();
        assert!(matches!(err, AggregatorError::Aggregation(_)));
        assert_eq!(digest, before);
        digest.record(key(2.0)).unwrap();
        assert_eq!(digest.total(), u64::MAX);
    }

    #[test]
    fn merge_overflow_is_an_error() {
        let mut big = HistogramDigest::new();
        big.record_n(key(3.0), u64::MAX / 2 + 1).unwrap();

        let mut acc = big.clone();
        assert!(acc.merge(&big).is_err());
        assert_eq!(acc, big);
        assert!(HistogramDigest::merge_all([&big, &big]).is_err());
    }
}
