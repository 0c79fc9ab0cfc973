pub mod collector;
pub mod percentiles;

use axum::http::StatusCode;
use serde::Serialize;

pub use collector::{OperationStats, ServiceStats, StatsSnapshot};
pub use percentiles::LatencySummary;

/// The remote operations a worker accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Ping,
    AggregateHost,
    AggregateGroup,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Self::Ping, Self::AggregateHost, Self::AggregateGroup];

    /// Maps a request path to its operation; `None` for anything else.
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/ping" => Some(Self::Ping),
            "/aggregate/host" => Some(Self::AggregateHost),
            "/aggregate/group" => Some(Self::AggregateGroup),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Outcome class of a finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    NotFound,
    InvalidArgument,
    Internal,
}

impl Outcome {
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            s if s.is_success() => Self::Ok,
            StatusCode::NOT_FOUND => Self::NotFound,
            s if s.is_client_error() => Self::InvalidArgument,
            _ => Self::Internal,
        }
    }
}

/// A single timing observation, written by the timing middleware.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub operation: Operation,
    /// Total handler wall time in microseconds
    pub latency_us: u64,
    pub outcome: Outcome,
}
