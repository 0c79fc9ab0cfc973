use serde::Deserialize;

use super::{host_of, lines, parse_config, parse_sample, percentiles, AlgorithmConfig, Aggregator, Meta, Window};
use crate::digest::{HistogramDigest, Percentiles, SampleKey};
use crate::error::{AggregatorError, Result};

#[derive(Debug, Deserialize)]
struct QuantileConfig {
    #[serde(default)]
    values: Option<Vec<f64>>,
}

/// Integer-keyed histogram of every numeric sample a host reports,
/// reduced to percentile values at group level.
#[derive(Debug, Clone)]
pub struct QuantileDigest {
    percentiles: Percentiles,
}

impl QuantileDigest {
    pub fn from_config(config: &AlgorithmConfig) -> Result<Self> {
        let config: QuantileConfig = parse_config(config)?;
        Ok(Self {
            percentiles: percentiles(config.values)?,
        })
    }

    pub fn percentiles(&self) -> &Percentiles {
        &self.percentiles
    }
}

/// Samples of one line, truncated to their integer key.
///
/// A leading non-numeric token is a metric name and is ignored.
fn parse_line(line: &str) -> std::result::Result<HistogramDigest, String> {
    let mut tokens = line.split_whitespace().peekable();
    if tokens.peek().is_some_and(|first| first.parse::<f64>().is_err()) {
        tokens.next();
    }
    let mut digest = HistogramDigest::new();
    for token in tokens {
        let value = parse_sample(token)?;
        let key = SampleKey::new(value.trunc()).ok_or_else(|| format!("'{token}' is out of range"))?;
        digest.record(key).map_err(|e| e.to_string())?;
    }
    Ok(digest)
}

impl Aggregator for QuantileDigest {
    type Partial = HistogramDigest;
    type Group = Vec<i64>;

    fn aggregate_host(&self, payload: &[u8], _window: Window, meta: &Meta) -> Result<HistogramDigest> {
        let mut digest = HistogramDigest::new();
        for line in lines(payload) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed = parse_line(line)
                .and_then(|line_digest| digest.merge(&line_digest).map_err(|e| e.to_string()));
            if let Err(reason) = parsed {
                let err = AggregatorError::parse(line, reason);
                tracing::warn!(host = host_of(meta), "{err}");
            }
        }

        if digest.is_empty() {
            return Ok(HistogramDigest::sentinel());
        }
        Ok(digest)
    }

    fn aggregate_group(&self, partials: Vec<HistogramDigest>) -> Result<Vec<i64>> {
        if partials.is_empty() {
            return Err(AggregatorError::Aggregation("no data to aggregate".into()));
        }
        let merged = HistogramDigest::merge_all(&partials)?;
        tracing::debug!(total = merged.total(), buckets = merged.len(), "digests merged");
        Ok(merged
            .percentiles(&self.percentiles)
            .into_iter()
            .map(|value| value as i64)
            .collect())
    }
}
