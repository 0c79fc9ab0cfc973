use std::sync::Arc;

use crate::algorithms::{config_flag, AlgorithmConfig, DynAggregator};
use crate::error::{AggregatorError, Result};
use crate::protocol::{AggregateGroupRequest, AggregateHostRequest, AggregateResponse};
use crate::registry::PluginRegistry;

/// Config switch: log every host-level result.
const LOG_HOST_RESULT: &str = "logHostResult";
/// Config switch: log every group-level result.
const LOG_GROUP_RESULT: &str = "logGroupResult";

/// Resolves an aggregator by class name and runs one reduction stage.
///
/// Holds no request-scoped state: the same request always produces the
/// same response, so callers may retry freely.
pub struct AggregationService {
    registry: Arc<PluginRegistry>,
}

impl AggregationService {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    fn resolve(&self, class_name: &str, config: &AlgorithmConfig) -> Result<Box<dyn DynAggregator>> {
        self.registry.maybe_reload();
        self.registry.get(class_name)?.construct(config)
    }

    pub fn aggregate_host(&self, request: &AggregateHostRequest) -> Result<AggregateResponse> {
        let span = tracing::info_span!("aggregate_host", task_id = %request.task_id, class = %request.class_name);
        let _enter = span.enter();

        let result = self
            .resolve(&request.class_name, &request.config)
            .and_then(|aggregator| {
                aggregator.aggregate_host_encoded(&request.payload, request.window, &request.meta)
            })
            .inspect_err(|err| tracing::error!(meta = ?request.meta, "aggregate host failed: {err}"))?;

        if config_flag(&request.config, LOG_HOST_RESULT) {
            tracing::info!(meta = ?request.meta, "aggregate host result: {}", describe(&result));
        }
        Ok(AggregateResponse { result: result.into() })
    }

    pub fn aggregate_group(&self, request: &AggregateGroupRequest) -> Result<AggregateResponse> {
        let span = tracing::info_span!("aggregate_group", task_id = %request.task_id, class = %request.class_name);
        let _enter = span.enter();

        let partials: Vec<&[u8]> = request.payload.iter().map(|p| p.as_ref()).collect();
        let result = self
            .resolve(&request.class_name, &request.config)
            .and_then(|aggregator| aggregator.aggregate_group_encoded(&partials))
            .inspect_err(|err| tracing::error!(meta = ?request.meta, "aggregate group failed: {err}"))?;

        if config_flag(&request.config, LOG_GROUP_RESULT) {
            tracing::info!(meta = ?request.meta, "aggregate group result: {}", describe(&result));
        }
        Ok(AggregateResponse { result: result.into() })
    }
}

/// Human-readable rendering of an encoded result, for log lines.
fn describe(encoded: &[u8]) -> String {
    match rmp_serde::from_slice::<serde_json::Value>(encoded) {
        Ok(value) => value.to_string(),
        Err(e) => format!("<{} bytes, undecodable: {e}>", encoded.len()),
    }
}

/// Decode a result produced by [`AggregationService`].
pub fn decode_result<T: serde::de::DeserializeOwned>(response: &AggregateResponse) -> Result<T> {
    rmp_serde::from_slice(&response.result).map_err(|e| AggregatorError::InvalidInput(e.to_string()))
}

// ─── Tests ───────────────────────────────────────────────────────
