use hdrhistogram::Histogram;
use serde::Serialize;

/// Latency distribution of one operation, in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
}

impl LatencySummary {
    /// All zeroes when nothing has been recorded yet.
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::default();
        }

        Self {
            count: hist.len(),
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            p999: hist.value_at_quantile(0.999),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_is_zeroed() {
        let hist = Histogram::<u64>::new(3).unwrap();
        assert_eq!(LatencySummary::from_histogram(&hist), LatencySummary::default());
    }

    #[test]
    fn summary_tracks_recorded_values() {
        let mut hist = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
        for v in 1..=1000 {
            hist.record(v).unwrap();
        }
        let summary = LatencySummary::from_histogram(&hist);
        assert_eq!(summary.count, 1000);
        assert_eq!(summary.min, 1);
        assert_eq!(summary.max, 1000);
        assert!((summary.p50 as i64 - 500).abs() <= 1);
        assert!(summary.p99 >= summary.p95);
    }
}
