use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    default_factor, default_timings_marker, host_of, lines, parse_config, parse_sample, AlgorithmConfig,
    Aggregator, Meta, Window,
};
use crate::error::{AggregatorError, Result};

#[derive(Debug, Deserialize)]
struct ApdexConfig {
    satisfied: f64,
    tolerating: f64,
    #[serde(default = "default_factor")]
    factor: f64,
    #[serde(default = "default_timings_marker")]
    timings_is: String,
}

/// `(satisfied, tolerating, frustrated)` sample counts for one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApdexCounts(pub u64, pub u64, pub u64);

impl ApdexCounts {
    /// Fails without touching `self` if any count or the total would overflow.
    fn add(&mut self, other: ApdexCounts) -> Result<()> {
        let overflow = || AggregatorError::Aggregation("apdex counts overflow u64".into());
        let sum = ApdexCounts(
            self.0.checked_add(other.0).ok_or_else(overflow)?,
            self.1.checked_add(other.1).ok_or_else(overflow)?,
            self.2.checked_add(other.2).ok_or_else(overflow)?,
        );
        sum.0
            .checked_add(sum.1)
            .and_then(|total| total.checked_add(sum.2))
            .ok_or_else(overflow)?;
        *self = sum;
        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.0.saturating_add(self.1).saturating_add(self.2)
    }

    /// `(satisfied + tolerating / 2) / total`, or `None` with no samples.
    pub fn score(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        Some((self.0 as f64 + self.1 as f64 / 2.0) / total as f64)
    }
}

/// Application Performance Index over timing metrics.
#[derive(Debug, Clone)]
pub struct Apdex {
    satisfied: f64,
    tolerating: f64,
    factor: f64,
    marker: String,
}

impl Apdex {
    pub fn from_config(config: &AlgorithmConfig) -> Result<Self> {
        let config: ApdexConfig = parse_config(config)?;
        if config.tolerating < config.satisfied {
            return Err(AggregatorError::Config(format!(
                "tolerating ({}) must not be less than satisfied ({})",
                config.tolerating, config.satisfied
            )));
        }
        Ok(Self {
            satisfied: config.satisfied,
            tolerating: config.tolerating,
            factor: config.factor,
            marker: config.timings_is,
        })
    }

    fn classify(&self, value: f64, counts: &mut ApdexCounts) {
        if value < self.satisfied {
            counts.0 += 1;
        } else if value < self.tolerating {
            counts.1 += 1;
        } else {
            counts.2 += 1;
        }
    }

    fn count_line(&self, values: &str) -> std::result::Result<ApdexCounts, String> {
        let mut counts = ApdexCounts::default();
        for token in values.split_whitespace() {
            self.classify(parse_sample(token)? * self.factor, &mut counts);
        }
        Ok(counts)
    }
}

impl Aggregator for Apdex {
    type Partial = BTreeMap<String, ApdexCounts>;
    type Group = BTreeMap<String, f64>;

    fn aggregate_host(&self, payload: &[u8], _window: Window, meta: &Meta) -> Result<Self::Partial> {
        let mut result = BTreeMap::new();
        for line in lines(payload) {
            let line = line.trim();
            let (name, values) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            if name.is_empty() || !name.contains(&self.marker) {
                continue;
            }
            let counted = self.count_line(values).and_then(|counts| {
                result
                    .entry(name.to_owned())
                    .or_insert_with(ApdexCounts::default)
                    .add(counts)
                    .map_err(|e| e.to_string())
            });
            if let Err(reason) = counted {
                let err = AggregatorError::parse(line, reason);
                tracing::warn!(host = host_of(meta), "{err}");
            }
        }
        Ok(result)
    }

    fn aggregate_group(&self, partials: Vec<Self::Partial>) -> Result<Self::Group> {
        let mut totals: BTreeMap<String, ApdexCounts> = BTreeMap::new();
        for partial in partials {
            for (name, counts) in partial {
                totals.entry(name).or_default().add(counts)?;
            }
        }

        Ok(totals
            .into_iter()
            .filter_map(|(name, counts)| match counts.score() {
                Some(score) => Some((name, score)),
                None => {
                    tracing::debug!(metric = %name, "no samples, apdex omitted");
                    None
                }
            })
            .collect())
    }
}
