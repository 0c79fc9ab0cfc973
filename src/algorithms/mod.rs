pub mod apdex;
pub mod multimetrics;
pub mod quantile;

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::digest::Percentiles;
use crate::error::{AggregatorError, Result};

pub use apdex::Apdex;
pub use multimetrics::Multimetrics;
pub use quantile::QuantileDigest;

// ─── Shared request types ────────────────────────────────────────

/// Free-form algorithm configuration as sent by the caller.
pub type AlgorithmConfig = serde_json::Map<String, Value>;

/// Caller-supplied metadata (hostname, group tags, ...).
pub type Meta = BTreeMap<String, String>;

/// The `(previous, current)` timestamps bounding one aggregation interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub previous: i64,
    pub current: i64,
}

impl Window {
    pub fn new(previous: i64, current: i64) -> Self {
        Self { previous, current }
    }

    /// Interval length used for rate normalization, never below 1.
    pub fn seconds(&self) -> f64 {
        self.current.saturating_sub(self.previous).max(1) as f64
    }
}

// ─── The algorithm contract ──────────────────────────────────────

/// A stateless two-stage reduction.
///
/// `aggregate_host` turns one host's raw payload into a partial result;
/// `aggregate_group` folds any number of partials (one per host, in any
/// grouping) into a group result. Both must be pure.
pub trait Aggregator: Send + Sync {
    type Partial: Serialize + DeserializeOwned;
    type Group: Serialize;

    fn aggregate_host(&self, payload: &[u8], window: Window, meta: &Meta) -> Result<Self::Partial>;

    fn aggregate_group(&self, partials: Vec<Self::Partial>) -> Result<Self::Group>;
}

/// Object-safe view of an [`Aggregator`] working on encoded results.
///
/// Undecodable partials surface as `InvalidInput`; the typed results
/// never leave the algorithm that produced them.
pub trait DynAggregator: Send + Sync {
    fn aggregate_host_encoded(&self, payload: &[u8], window: Window, meta: &Meta) -> Result<Vec<u8>>;

    fn aggregate_group_encoded(&self, partials: &[&[u8]]) -> Result<Vec<u8>>;
}

impl<A: Aggregator> DynAggregator for A {
    fn aggregate_host_encoded(&self, payload: &[u8], window: Window, meta: &Meta) -> Result<Vec<u8>> {
        let partial = self.aggregate_host(payload, window, meta)?;
        encode(&partial)
    }

    fn aggregate_group_encoded(&self, partials: &[&[u8]]) -> Result<Vec<u8>> {
        let partials = partials
            .iter()
            .enumerate()
            .map(|(idx, raw)| {
                rmp_serde::from_slice(raw).map_err(|e| {
                    AggregatorError::InvalidInput(format!("payload #{idx} is not a valid partial result: {e}"))
                })
            })
            .collect::<Result<Vec<A::Partial>>>()?;
        let group = self.aggregate_group(partials)?;
        encode(&group)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| AggregatorError::Aggregation(format!("unable to encode result: {e}")))
}

// ─── Algorithm catalog ───────────────────────────────────────────

/// The built-in algorithms a plugin manifest can register under a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmKind {
    Quantile,
    Apdex,
    Multimetrics,
}

impl AlgorithmKind {
    pub fn build(self, config: &AlgorithmConfig) -> Result<Box<dyn DynAggregator>> {
        Ok(match self {
            Self::Quantile => Box::new(QuantileDigest::from_config(config)?),
            Self::Apdex => Box::new(Apdex::from_config(config)?),
            Self::Multimetrics => Box::new(Multimetrics::from_config(config)?),
        })
    }
}

// ─── Config helpers ──────────────────────────────────────────────

/// Deserialize an algorithm's typed config, ignoring keys it does not know.
pub(crate) fn parse_config<T: DeserializeOwned>(config: &AlgorithmConfig) -> Result<T> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| AggregatorError::Config(e.to_string()))
}

pub(crate) fn percentiles(values: Option<Vec<f64>>) -> Result<Percentiles> {
    values.map_or_else(|| Ok(Percentiles::default()), Percentiles::new)
}

pub(crate) fn default_timings_marker() -> String {
    "_timings".into()
}

pub(crate) fn default_factor() -> f64 {
    1.0
}

pub(crate) fn default_true() -> bool {
    true
}

/// Accepts `true`/`false` as well as the historical `"yes"`/`"no"` strings.
pub(crate) fn yes_no<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(flag) => Ok(flag),
        Flag::Text(text) => match text.as_str() {
            "yes" | "true" => Ok(true),
            "no" | "false" => Ok(false),
            other => Err(D::Error::custom(format!("expected yes/no, got '{other}'"))),
        },
    }
}

/// Whether a service-level boolean switch (e.g. `logHostResult`) is on.
pub fn config_flag(config: &AlgorithmConfig, key: &str) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(false)
}

// ─── Payload helpers ─────────────────────────────────────────────

/// Newline-separated lines of a raw payload, decoded lossily.
pub(crate) fn lines(payload: &[u8]) -> impl Iterator<Item = Cow<'_, str>> {
    payload
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .map(String::from_utf8_lossy)
}

/// A single finite numeric sample.
pub(crate) fn parse_sample(token: &str) -> std::result::Result<f64, String> {
    let value: f64 = token
        .parse()
        .map_err(|e| format!("'{token}': {e}"))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(format!("'{token}' is not a finite number"))
    }
}

/// Host name from the request metadata, for log lines.
pub(crate) fn host_of(meta: &Meta) -> &str {
    meta.get("host").map(String::as_str).unwrap_or("-")
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> AlgorithmConfig {
        match value {
            Value::Object(map) => map,
            _ => panic!("config must be an object"),
        }
    }

    #[test]
    fn window_seconds_is_at_least_one() {
        assert_eq!(Window::new(0, 2).seconds(), 2.0);
        assert_eq!(Window::new(5, 5).seconds(), 1.0);
        assert_eq!(Window::new(10, 3).seconds(), 1.0);
    }

    #[test]
    fn yes_no_accepts_both_spellings() {
        #[derive(Deserialize)]
        struct Flags {
            #[serde(deserialize_with = "yes_no")]
            rps: bool,
        }

        let on: Flags = parse_config(&config(json!({"rps": "yes"}))).unwrap();
        let off: Flags = parse_config(&config(json!({"rps": false}))).unwrap();
        assert!(on.rps);
        assert!(!off.rps);
        assert!(parse_config::<Flags>(&config(json!({"rps": "maybe"}))).is_err());
    }

    #[test]
    fn config_flag_defaults_to_off() {
        let cfg = config(json!({"logHostResult": true, "logGroupResult": "yes"}));
        assert!(config_flag(&cfg, "logHostResult"));
        assert!(!config_flag(&cfg, "logGroupResult"));
        assert!(!config_flag(&cfg, "missing"));
    }

    #[test]
    fn lines_strip_carriage_returns() {
        let payload = b"a 1\r\nb 2\n\nc";
        let collected: Vec<_> = lines(payload).collect();
        assert_eq!(collected, vec!["a 1", "b 2", "", "c"]);
    }

    #[test]
    fn parse_sample_rejects_non_finite() {
        assert_eq!(parse_sample("1.5"), Ok(1.5));
        assert!(parse_sample("inf").is_err());
        assert!(parse_sample("NaN").is_err());
        assert!(parse_sample("x").is_err());
    }

    #[test]
    fn every_kind_builds_from_a_valid_config() {
        let cfg = config(json!({"satisfied": 10, "tolerating": 20}));
        for kind in [AlgorithmKind::Quantile, AlgorithmKind::Apdex, AlgorithmKind::Multimetrics] {
            assert!(kind.build(&cfg).is_ok(), "{kind:?}");
        }
    }

    #[test]
    fn encoded_group_rejects_garbage() {
        let quant = QuantileDigest::from_config(&AlgorithmConfig::new()).unwrap();
        let err = quant.aggregate_group_encoded(&[b"\xc1".as_slice()]).unwrap_err();
        assert!(matches!(err, AggregatorError::InvalidInput(_)), "{err:?}");
    }
}
