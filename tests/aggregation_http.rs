use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;

use fleet_aggregator::algorithms::multimetrics::GroupValue;
use fleet_aggregator::algorithms::{AlgorithmConfig, Meta, Window};
use fleet_aggregator::protocol::{
    AggregateGroupRequest, AggregateHostRequest, AggregateResponse, Pong, MSGPACK_CONTENT_TYPE,
};
use fleet_aggregator::registry::PluginRegistry;
use fleet_aggregator::{server, AppState};

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

struct Harness {
    _plugins: TempDir,
    app: Router,
}

fn harness() -> Harness {
    let plugins = TempDir::new().unwrap();
    let manifest = json!({"aggregators": {
        "Quant": {"algorithm": "quantile"},
        "Apdex": {"algorithm": "apdex", "defaults": {"satisfied": 60, "tolerating": 120}},
        "Multimetrics": {"algorithm": "multimetrics"}
    }});
    std::fs::write(plugins.path().join("core.json"), manifest.to_string()).unwrap();

    let registry = PluginRegistry::new(plugins.path(), Duration::from_secs(300));
    let app = server::create_router(Arc::new(AppState::new(registry)), MAX_MESSAGE_SIZE);
    Harness { _plugins: plugins, app }
}

fn config(value: serde_json::Value) -> AlgorithmConfig {
    value.as_object().cloned().unwrap_or_default()
}

async fn call(app: &Router, method: Method, uri: &str, body: Vec<u8>) -> (StatusCode, Bytes) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
        .body(Body::from(body))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, to_bytes(response.into_body(), usize::MAX).await.unwrap())
}

async fn rpc<Req: Serialize, Resp: DeserializeOwned>(app: &Router, uri: &str, request: &Req) -> Resp {
    let (status, body) = call(app, Method::POST, uri, rmp_serde::to_vec_named(request).unwrap()).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    rmp_serde::from_slice(&body).unwrap()
}

async fn host(app: &Router, class: &str, cfg: serde_json::Value, payload: &str, window: Window) -> Bytes {
    let request = AggregateHostRequest {
        task_id: "task-42".into(),
        class_name: class.into(),
        config: config(cfg),
        payload: Bytes::copy_from_slice(payload.as_bytes()),
        window,
        meta: Meta::from([("host".to_owned(), "web-01".to_owned())]),
    };
    let response: AggregateResponse = rpc(app, "/aggregate/host", &request).await;
    response.result
}

async fn group<T: DeserializeOwned>(app: &Router, class: &str, cfg: serde_json::Value, partials: Vec<Bytes>) -> T {
    let request = AggregateGroupRequest {
        task_id: "task-42".into(),
        class_name: class.into(),
        config: config(cfg),
        payload: partials,
        meta: Meta::new(),
    };
    let response: AggregateResponse = rpc(app, "/aggregate/group", &request).await;
    rmp_serde::from_slice(&response.result).unwrap()
}

#[tokio::test]
async fn ping_answers_pong() {
    let h = harness();
    let (status, body) = call(&h.app, Method::GET, "/ping", vec![]).await;
    assert_eq!(status, StatusCode::OK);
    let _: Pong = rmp_serde::from_slice(&body).unwrap();
}

#[tokio::test]
async fn quantile_median_over_two_hosts() {
    let h = harness();
    let first: String = (0..50).map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
    let second: String = (50..100).map(|v| v.to_string()).collect::<Vec<_>>().join(" ");

    let cfg = json!({"values": [50]});
    let a = host(&h.app, "Quant", cfg.clone(), &first, Window::default()).await;
    let b = host(&h.app, "Quant", cfg.clone(), &second, Window::default()).await;

    let result: Vec<i64> = group(&h.app, "Quant", cfg, vec![a, b]).await;
    assert_eq!(result, vec![49]);
}

#[tokio::test]
async fn apdex_with_module_defaults() {
    let h = harness();
    let partial = host(&h.app, "Apdex", json!({}), "api_timings 10 20 30 90 200", Window::default()).await;

    let scores: BTreeMap<String, f64> = group(&h.app, "Apdex", json!({}), vec![partial]).await;
    assert_eq!(scores["api_timings"], 0.7);
}

#[tokio::test]
async fn multimetrics_rate_and_error_percentage() {
    let h = harness();
    let cfg = json!({"rps": "yes", "get_prc": {"5xx": "5xx/total"}});
    let payload = "site.5xx 2\nsite.total 8\nsite.req_timings 10 20 30";
    let a = host(&h.app, "Multimetrics", cfg.clone(), payload, Window::new(100, 102)).await;
    let b = host(&h.app, "Multimetrics", cfg.clone(), payload, Window::new(100, 102)).await;

    let result: BTreeMap<String, GroupValue> = group(&h.app, "Multimetrics", cfg, vec![a, b]).await;
    assert_eq!(result["site.total"], GroupValue::Scalar(8.0));
    assert_eq!(result["site.5xx"], GroupValue::Scalar(2.0));
    assert_eq!(result["site.err_prc"], GroupValue::Scalar(25.0));
    assert!(matches!(result["site.req_timings"], GroupValue::Quantiles(ref q) if q.len() == 9));
}

#[tokio::test]
async fn unknown_class_is_404() {
    let h = harness();
    let request = AggregateHostRequest {
        task_id: "t".into(),
        class_name: "Missing".into(),
        config: AlgorithmConfig::new(),
        payload: Bytes::from_static(b"a 1"),
        window: Window::default(),
        meta: Meta::new(),
    };
    let (status, body) = call(&h.app, Method::POST, "/aggregate/host", rmp_serde::to_vec_named(&request).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["status"], 404);
    assert!(error["error"].as_str().unwrap().contains("Missing"));
}

#[tokio::test]
async fn malformed_body_is_400() {
    let h = harness();
    let (status, _) = call(&h.app, Method::POST, "/aggregate/group", b"not msgpack".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn undecodable_partial_is_400() {
    let h = harness();
    let request = AggregateGroupRequest {
        task_id: "t".into(),
        class_name: "Quant".into(),
        config: AlgorithmConfig::new(),
        payload: vec![Bytes::from_static(b"\xc1")],
        meta: Meta::new(),
    };
    let (status, _) = call(&h.app, Method::POST, "/aggregate/group", rmp_serde::to_vec_named(&request).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn empty_group_is_500() {
    let h = harness();
    let request = AggregateGroupRequest {
        task_id: "t".into(),
        class_name: "Quant".into(),
        config: AlgorithmConfig::new(),
        payload: vec![],
        meta: Meta::new(),
    };
    let (status, _) = call(&h.app, Method::POST, "/aggregate/group", rmp_serde::to_vec_named(&request).unwrap()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn oversized_body_is_413() {
    let h = harness();
    let (status, _) = call(&h.app, Method::POST, "/aggregate/host", vec![0u8; MAX_MESSAGE_SIZE + 1]).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn stats_count_requests() {
    let h = harness();
    call(&h.app, Method::GET, "/ping", vec![]).await;
    call(&h.app, Method::POST, "/aggregate/host", b"junk".to_vec()).await;

    let (status, body) = call(&h.app, Method::GET, "/stats", vec![]).await;
    assert_eq!(status, StatusCode::OK);
    let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["total_requests"], 2);
    assert_eq!(stats["operations"][0]["operation"], "ping");
    assert_eq!(stats["operations"][0]["ok"], 1);
    assert_eq!(stats["operations"][1]["invalid_argument"], 1);
}
