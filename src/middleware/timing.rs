use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::{Operation, Outcome, Sample};
use crate::AppState;

/// Records every aggregation RPC into the worker's stats and adds two
/// response headers:
///
///   X-Response-Time-Us  total handler wall time in microseconds
///   Server-Timing       same value in the standard Server-Timing format
pub async fn timing_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let operation = Operation::from_path(req.uri().path());

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();
    let us = elapsed.as_micros() as u64;

    if let Ok(val) = us.to_string().parse() {
        response.headers_mut().insert("X-Response-Time-Us", val);
    }

    let server_timing = format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(val) = server_timing.parse() {
        response.headers_mut().insert("Server-Timing", val);
    }

    if let Some(operation) = operation {
        let status = response.status();
        state.stats.record(Sample {
            operation,
            latency_us: us,
            outcome: Outcome::from_status(status),
        });
        tracing::debug!(?operation, status = status.as_u16(), latency_us = us, "request finished");
    }

    response
}
