use axum::{
    async_trait,
    extract::{FromRequest, Request},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::algorithms::{AlgorithmConfig, Meta, Window};
use crate::handlers::AppError;

/// Content type of every request and response body.
pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

// ─── Messages ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pong {}

/// One host's raw samples for one interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateHostRequest {
    pub task_id: String,
    pub class_name: String,
    #[serde(default)]
    pub config: AlgorithmConfig,
    pub payload: Bytes,
    pub window: Window,
    #[serde(default)]
    pub meta: Meta,
}

/// Encoded partial results to fold into one group result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateGroupRequest {
    pub task_id: String,
    pub class_name: String,
    #[serde(default)]
    pub config: AlgorithmConfig,
    pub payload: Vec<Bytes>,
    #[serde(default)]
    pub meta: Meta,
}

/// `result` is a MessagePack document only the algorithm interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub result: Bytes,
}

// ─── Codec ───────────────────────────────────────────────────────

/// MessagePack body, the counterpart of `axum::Json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPack<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for MsgPack<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state).await.map_err(|e| match e.status() {
            StatusCode::PAYLOAD_TOO_LARGE => AppError::TooLarge(e.body_text()),
            _ => AppError::BadRequest(e.body_text()),
        })?;
        rmp_serde::from_slice(&body)
            .map(MsgPack)
            .map_err(|e| AppError::BadRequest(format!("malformed request: {e}")))
    }
}

impl<T: Serialize> IntoResponse for MsgPack<T> {
    fn into_response(self) -> Response {
        match rmp_serde::to_vec_named(&self.0) {
            Ok(body) => ([(header::CONTENT_TYPE, MSGPACK_CONTENT_TYPE)], body).into_response(),
            Err(e) => AppError::Internal(format!("unable to encode response: {e}")).into_response(),
        }
    }
}
