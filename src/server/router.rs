use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

use pagepulse_health_breaker::{HealthReport, HealthVerdict};

use crate::metrics;

use super::state::ServeState;

pub fn build_router(state: ServeState) -> Router {
    Router::new()
        .route("/health-proxy", get(health_proxy_handler))
        .route("/runtime-beacon", post(runtime_beacon_handler))
        .route("/web-version", get(web_version_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/refresh/status", get(refresh_status_handler))
        .route("/refresh/pause", post(refresh_pause_handler))
        .route("/refresh/resume", post(refresh_resume_handler))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// Maps a breaker-guarded check onto the relay's wire contract. Shared
/// with the one-shot `check` CLI command.
pub fn report_body(report: &HealthReport, api_url: &str) -> (StatusCode, Value) {
    let web = serde_json::to_value(&report.web).unwrap_or(Value::Null);
    match &report.verdict {
        HealthVerdict::Live { api } => (
            StatusCode::OK,
            json!({
                "api": api,
                "web": web,
                "checked_at": report.checked_at,
            }),
        ),
        HealthVerdict::Cooldown {
            retry_after_seconds,
        } => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "error": "api_cooldown",
                "api_url": api_url,
                "retry_after_seconds": retry_after_seconds,
                "web": web,
                "checked_at": report.checked_at,
            }),
        ),
        HealthVerdict::UpstreamFailure {
            details,
            retry_after_seconds,
        } => (
            StatusCode::BAD_GATEWAY,
            json!({
                "error": "api_unreachable",
                "api_url": api_url,
                "details": details,
                "retry_after_seconds": retry_after_seconds,
                "web": web,
                "checked_at": report.checked_at,
            }),
        ),
    }
}

async fn health_proxy_handler(State(state): State<ServeState>) -> impl IntoResponse {
    let report = state.proxy.check().await;
    let (status, body) = report_body(&report, state.proxy.api_url());
    (status, Json(body))
}

async fn runtime_beacon_handler(State(state): State<ServeState>, body: Bytes) -> Response {
    match state.forwarder.forward(body.to_vec()).await {
        Ok((status, upstream_body)) => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                [(
                    axum::http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                )],
                upstream_body,
            )
                .into_response()
        }
        Err(err) => {
            warn!(target: "relay", %err, "runtime beacon forward failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": "runtime_beacon_failed",
                    "details": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn web_version_handler() -> Json<Value> {
    Json(json!({
        "web": {
            "updated_at": crate::BUILD_DATE,
        }
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "git_hash": crate::GIT_HASH,
    }))
}

async fn metrics_handler() -> Response {
    metrics::register_metrics();
    let registry = metrics::global_registry();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(?err, "failed to encode prometheus metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response();
    }

    match String::from_utf8(buffer) {
        Ok(body) => match HeaderValue::from_str(encoder.format_type()) {
            Ok(content_type) => {
                ([(axum::http::header::CONTENT_TYPE, content_type)], body).into_response()
            }
            Err(err) => {
                error!(?err, "failed to build content-type header for metrics");
                (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
            }
        },
        Err(err) => {
            error!(?err, "failed to convert prometheus metrics to utf8");
            (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
        }
    }
}

async fn refresh_status_handler(State(state): State<ServeState>) -> Json<Value> {
    let status = state.poller.status();
    Json(serde_json::to_value(&status).unwrap_or(Value::Null))
}

async fn refresh_pause_handler(State(state): State<ServeState>) -> Json<Value> {
    state.poller.pause();
    Json(json!({ "enabled": false }))
}

async fn refresh_resume_handler(State(state): State<ServeState>) -> Json<Value> {
    state.poller.resume();
    Json(json!({ "enabled": true }))
}
