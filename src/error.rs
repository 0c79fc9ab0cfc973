use thiserror::Error;

// ─── Error taxonomy ──────────────────────────────────────────────

/// Every failure the aggregation engine can produce.
///
/// `Parse` and `PluginLoad` are recovered where they happen (one input
/// line, one plugin module) and only show up in logs; the rest fail the
/// request they belong to.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("class '{0}' not found")]
    PluginNotFound(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("unable to parse '{line}': {reason}")]
    Parse { line: String, reason: String },

    #[error("failed to load plugin module '{module}': {reason}")]
    PluginLoad { module: String, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("aggregation failed: {0}")]
    Aggregation(String),
}

/// RPC status class a failure is surfaced as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    NotFound,
    InvalidArgument,
    Internal,
}

impl AggregatorError {
    pub fn status(&self) -> StatusClass {
        match self {
            Self::PluginNotFound(_) => StatusClass::NotFound,
            Self::Config(_) | Self::InvalidInput(_) | Self::Parse { .. } => {
                StatusClass::InvalidArgument
            }
            Self::PluginLoad { .. } | Self::Aggregation(_) => StatusClass::Internal,
        }
    }

    pub(crate) fn parse(line: &str, reason: impl ToString) -> Self {
        Self::Parse {
            line: line.to_owned(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
