use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    default_factor, default_timings_marker, default_true, host_of, lines, parse_config, parse_sample,
    percentiles, yes_no, AlgorithmConfig, Aggregator, Meta, Window,
};
use crate::digest::{HistogramDigest, Percentiles, SampleKey};
use crate::error::{AggregatorError, Result};

// ─── Configuration ───────────────────────────────────────────────

/// Characters a metric name must not contain.
const FORBIDDEN_NAME_CHARS: [char; 4] = ['<', '>', ';', '\\'];

/// Suffix of every derived percentage metric.
const PERCENTAGE_SUFFIX: &str = "err_prc";

#[derive(Debug, Deserialize)]
struct MultimetricsConfig {
    #[serde(default)]
    values: Option<Vec<f64>>,
    #[serde(default = "default_true", deserialize_with = "yes_no")]
    rps: bool,
    #[serde(default = "default_timings_marker")]
    timings_is: String,
    #[serde(default = "default_factor")]
    factor: f64,
    #[serde(default)]
    get_prc: Option<PercentageSetting>,
}

/// `get_prc` is either a `{pattern: "num/den"}` map or `false`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PercentageSetting {
    Rules(BTreeMap<String, String>),
    Switch(bool),
}

/// One percentage-derivation rule: for metrics containing `pattern`,
/// report `<prefix>.numerator` as a percentage of `<prefix>.denominator`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PercentageRule {
    pub pattern: String,
    pub numerator: String,
    pub denominator: String,
}

impl PercentageRule {
    fn parse(pattern: String, ratio: &str) -> Result<Self> {
        match ratio.split_once('/') {
            Some((numerator, denominator))
                if !numerator.is_empty() && !denominator.is_empty() && !denominator.contains('/') =>
            {
                Ok(Self {
                    pattern,
                    numerator: numerator.to_owned(),
                    denominator: denominator.to_owned(),
                })
            }
            _ => Err(AggregatorError::Config(format!(
                "percentage rule for '{pattern}' must look like 'numerator/denominator', got '{ratio}'"
            ))),
        }
    }
}

// ─── Result shapes ───────────────────────────────────────────────

/// Per-host value of one metric: a counter sum or a timing digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostValue {
    Scalar(f64),
    Timings(HistogramDigest),
}

/// Per-group value of one metric: a counter sum or timing percentiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupValue {
    Scalar(f64),
    Quantiles(Vec<f64>),
}

impl GroupValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(value) => Some(*value),
            Self::Quantiles(_) => None,
        }
    }
}

// ─── Multimetrics ────────────────────────────────────────────────

/// General-purpose packer: counters (optionally as rates), timing
/// histograms in plain or `value@count` packed form, and derived
/// percentages.
///
/// Payload lines look like:
///
/// ```text
/// api.2xx 3000
/// uploader_timings_request_post 0.001 0.002 0.001
/// @uploader_timings_request_put 0.001@300 0.002@3
/// ```
#[derive(Debug, Clone)]
pub struct Multimetrics {
    percentiles: Percentiles,
    rps: bool,
    marker: String,
    factor: f64,
    rules: Vec<PercentageRule>,
}

impl Multimetrics {
    pub fn from_config(config: &AlgorithmConfig) -> Result<Self> {
        let config: MultimetricsConfig = parse_config(config)?;
        let rules = match config.get_prc {
            None | Some(PercentageSetting::Switch(false)) => Vec::new(),
            Some(PercentageSetting::Switch(true)) => {
                return Err(AggregatorError::Config(
                    "get_prc must be a map of pattern to 'numerator/denominator'".into(),
                ))
            }
            Some(PercentageSetting::Rules(rules)) => rules
                .into_iter()
                .map(|(pattern, ratio)| PercentageRule::parse(pattern, &ratio))
                .collect::<Result<_>>()?,
        };

        Ok(Self {
            percentiles: percentiles(config.values)?,
            rps: config.rps,
            marker: config.timings_is,
            factor: config.factor,
            rules,
        })
    }

    pub fn is_timings(&self, name: &str) -> bool {
        name.starts_with('@') || name.contains(&self.marker)
    }

    /// `(value, count)` pairs of one timing line.
    fn parse_timings(name: &str, values: &str) -> std::result::Result<Vec<(SampleKey, u64)>, String> {
        let packed = name.starts_with('@');
        let mut samples = Vec::new();
        for token in values.split_whitespace() {
            let (value, count) = if packed {
                match token.split_once('@') {
                    Some((value, count)) if !value.is_empty() => (value, parse_count(count)?),
                    // '@25' or a bare value carry no usable count
                    _ => continue,
                }
            } else {
                (token, 1)
            };
            let key = SampleKey::new(parse_sample(value)?).ok_or_else(|| format!("'{value}' is out of range"))?;
            samples.push((key, count));
        }
        Ok(samples)
    }

    fn record_line(
        &self,
        result: &mut BTreeMap<String, HostValue>,
        name: &str,
        values: &str,
        window: Window,
    ) -> std::result::Result<(), String> {
        if self.is_timings(name) {
            let values = values.replace([',', '-', ':'], " ");
            if values.trim().is_empty() {
                return Ok(());
            }
            let mut line_digest = HistogramDigest::new();
            for (key, count) in Self::parse_timings(name, &values)? {
                line_digest.record_n(key, count).map_err(|e| e.to_string())?;
            }
            let entry = result
                .entry(name.to_owned())
                .or_insert_with(|| HostValue::Timings(HistogramDigest::new()));
            if let HostValue::Timings(digest) = entry {
                digest.merge(&line_digest).map_err(|e| e.to_string())?;
            }
        } else {
            let mut sum = values
                .split_whitespace()
                .map(parse_sample)
                .sum::<std::result::Result<f64, String>>()?;
            if self.rps {
                sum /= window.seconds();
            }
            let entry = result.entry(name.to_owned()).or_insert(HostValue::Scalar(0.0));
            if let HostValue::Scalar(total) = entry {
                *total += sum;
            }
        }
        Ok(())
    }

    fn derive_percentages(&self, result: &mut BTreeMap<String, GroupValue>) {
        for rule in &self.rules {
            let mut derived: BTreeMap<String, f64> = BTreeMap::new();
            for metric in result.keys().filter(|m| m.contains(&rule.pattern)) {
                let prefix = metric.rsplit_once('.').map_or(metric.as_str(), |(prefix, _)| prefix);
                let target = format!("{prefix}.{PERCENTAGE_SUFFIX}");
                if derived.contains_key(&target) {
                    continue;
                }
                let lookup = |suffix: &str| {
                    result
                        .get(&format!("{prefix}.{suffix}"))
                        .and_then(GroupValue::as_scalar)
                };
                derived.insert(target, percentage(lookup(&rule.numerator), lookup(&rule.denominator)));
            }
            result.extend(derived.into_iter().map(|(name, value)| (name, GroupValue::Scalar(value))));
        }
    }
}

/// Occurrence count of a packed `value@count` token.
///
/// Digest buckets hold whole occurrences, so a fractional count is
/// truncated (`2.9` counts twice). Negative counts and counts beyond
/// `u64` are rejected.
fn parse_count(token: &str) -> std::result::Result<u64, String> {
    let count = parse_sample(token)?;
    if count < 0.0 {
        return Err(format!("negative count '{token}'"));
    }
    // `u64::MAX as f64` rounds up to 2^64, the first value that does not fit
    if count >= u64::MAX as f64 {
        return Err(format!("count '{token}' is too large"));
    }
    Ok(count as u64)
}

/// `numerator` as a percentage of `denominator`, rounded to 2 digits.
///
/// Missing numerator → 0, missing denominator → 100, numerator above
/// denominator → 100, both zero → 0.
fn percentage(numerator: Option<f64>, denominator: Option<f64>) -> f64 {
    match (numerator, denominator) {
        (None, _) => 0.0,
        (Some(_), None) => 100.0,
        (Some(num), Some(den)) if den < num => 100.0,
        (Some(_), Some(den)) if den == 0.0 => 0.0,
        (Some(num), Some(den)) => (num * 100.0 / den * 100.0).round() / 100.0,
    }
}

/// Running group-level merge of one metric.
enum Merged {
    Scalar(f64),
    Timings(HistogramDigest),
}

impl From<HostValue> for Merged {
    fn from(value: HostValue) -> Self {
        match value {
            HostValue::Scalar(v) => Self::Scalar(v),
            HostValue::Timings(digest) => Self::Timings(digest),
        }
    }
}

impl Aggregator for Multimetrics {
    type Partial = BTreeMap<String, HostValue>;
    type Group = BTreeMap<String, GroupValue>;

    fn aggregate_host(&self, payload: &[u8], window: Window, meta: &Meta) -> Result<Self::Partial> {
        let mut result = BTreeMap::new();
        for raw in lines(payload) {
            let line = raw.trim().replace('\t', " ");
            if line.is_empty() {
                continue;
            }
            let (name, values) = match line.split_once(' ') {
                Some((name, values)) => (name.trim(), values.trim()),
                None => (line.as_str(), ""),
            };
            if name.contains(FORBIDDEN_NAME_CHARS) {
                tracing::error!(
                    host = host_of(meta),
                    metric = name,
                    "metric name contains forbidden symbols '<>;\\'"
                );
                continue;
            }
            if let Err(reason) = self.record_line(&mut result, name, values, window) {
                let err = AggregatorError::parse(&line, reason);
                tracing::error!(host = host_of(meta), "{err}");
            }
        }
        Ok(result)
    }

    fn aggregate_group(&self, partials: Vec<Self::Partial>) -> Result<Self::Group> {
        if partials.is_empty() {
            return Err(AggregatorError::Aggregation("no data to aggregate".into()));
        }

        let mut merged: BTreeMap<String, Merged> = BTreeMap::new();
        for partial in partials {
            for (name, value) in partial {
                let mut slot = match merged.entry(name) {
                    Entry::Vacant(slot) => {
                        slot.insert(Merged::from(value));
                        continue;
                    }
                    Entry::Occupied(slot) => slot,
                };
                let compatible = match (slot.get_mut(), value) {
                    (Merged::Scalar(sum), HostValue::Scalar(v)) => {
                        *sum += v;
                        true
                    }
                    (Merged::Timings(acc), HostValue::Timings(digest)) => {
                        acc.merge(&digest)?;
                        true
                    }
                    _ => false,
                };
                if !compatible {
                    return Err(AggregatorError::Aggregation(format!(
                        "metric '{}' mixes counters and timings",
                        slot.key()
                    )));
                }
            }
        }

        let mut result = BTreeMap::new();
        for (name, value) in merged {
            match value {
                Merged::Scalar(sum) => {
                    result.insert(name, GroupValue::Scalar(sum));
                }
                Merged::Timings(digest) if digest.is_empty() => continue,
                Merged::Timings(digest) => {
                    let quantiles = digest
                        .percentiles(&self.percentiles)
                        .into_iter()
                        .map(|value| value * self.factor)
                        .collect();
                    let name = name.strip_prefix('@').map(str::to_owned).unwrap_or(name);
                    result.insert(name, GroupValue::Quantiles(quantiles));
                }
            }
        }

        self.derive_percentages(&mut result);
        Ok(result)
    }
}

// ─── Tests ───────────────────────────────────────────────────────
