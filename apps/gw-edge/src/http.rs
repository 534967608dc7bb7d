//! 健康检查与指标 HTTP 端点。
//!
//! - GET /health
//! - GET /metrics

use api_contract::{HealthResponse, MetricsSnapshotDto};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use domain::HealthState;
use gw_health::HealthMonitor;
use gw_telemetry::{metrics, new_request_ids};
use std::sync::Arc;
use tracing::Instrument;

/// 健康状态来源。
pub trait HealthSource: Send + Sync {
    fn current_health(&self) -> HealthState;
}

impl HealthSource for HealthMonitor {
    fn current_health(&self) -> HealthState {
        self.last_health()
    }
}

#[derive(Clone)]
pub struct HttpState {
    health: Arc<dyn HealthSource>,
}

impl HttpState {
    pub fn new(health: Arc<dyn HealthSource>) -> Self {
        Self { health }
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        .with_state(state)
        // 注入 request_id/trace_id
        .layer(middleware::from_fn(request_context))
}

/// Critical 时返回 503，便于编排器探活。
async fn health(State(state): State<HttpState>) -> Response {
    let health = state.health.current_health();
    let status = if health == HealthState::Critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(HealthResponse {
            health: health.as_str().to_string(),
            code: health.code(),
        }),
    )
        .into_response()
}

async fn get_metrics() -> Response {
    let snapshot = metrics().snapshot();
    (
        StatusCode::OK,
        Json(MetricsSnapshotDto {
            connect_attempts: snapshot.connect_attempts,
            connect_failures: snapshot.connect_failures,
            session_invalidations: snapshot.session_invalidations,
            events_sent: snapshot.events_sent,
            properties_reported: snapshot.properties_reported,
            methods_received: snapshot.methods_received,
            method_failures: snapshot.method_failures,
            invoke_calls: snapshot.invoke_calls,
            chunked_calls: snapshot.chunked_calls,
            chunked_polls: snapshot.chunked_polls,
            chunked_failures: snapshot.chunked_failures,
            pages_fetched: snapshot.pages_fetched,
            health_degraded: snapshot.health_degraded,
            restarts_requested: snapshot.restarts_requested,
            devices_provisioned: snapshot.devices_provisioned,
            devices_deprovisioned: snapshot.devices_deprovisioned,
            cache_write_failures: snapshot.cache_write_failures,
        }),
    )
        .into_response()
}

async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let ids = new_request_ids();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(ids.clone());

    let span = tracing::info_span!(
        "request",
        request_id = %ids.request_id,
        trace_id = %ids.trace_id,
        method = %method,
        path = %path
    );

    let mut response = next.run(req).instrument(span).await;
    response.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&ids.request_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response.headers_mut().insert(
        "x-trace-id",
        HeaderValue::from_str(&ids.trace_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response
}
