//! Integration tests for the poller API endpoints

#[path = "../src/api.rs"]
#[allow(dead_code)]
mod api;

use api::{create_router, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use poller_lib::{
    health::{components, HealthRegistry},
    observability::PollerMetrics,
    scheduler::{CycleReport, CycleStatus},
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::with_poller_components().await;

    let metrics = PollerMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_while_waiting_for_history() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::DATASET, "Insufficient history")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    // No-data cycles are normal; still operational
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["dataset"]["message"],
        "Insufficient history"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_sink_failed() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::SINK, "database is locked")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_before_model_loaded() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::MODEL, "inference failed")
        .await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Component unhealthy: model");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.set_model_info("Baseline", "quantiles");
    state.metrics.observe_cycle(&CycleReport {
        started_at: Utc::now(),
        status: CycleStatus::Written { rows: 20 },
        dt_data: Duration::from_millis(12),
        dt_pred: Duration::from_millis(34),
        dt_total: Duration::from_millis(46),
    });

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("forecast_poller_data_latency_seconds_bucket"));
    assert!(metrics_text.contains("forecast_poller_inference_latency_seconds_count"));
    assert!(metrics_text.contains("forecast_poller_cycle_latency_seconds_sum"));
    assert!(metrics_text.contains("forecast_poller_rows_written_total"));
    assert!(metrics_text.contains("forecast_poller_model_info"));
}

#[tokio::test]
async fn test_serve_reports_port_in_use() {
    let (_app, state) = setup_test_app().await;

    let taken = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let err = api::serve(port, state.clone()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to bind API server"));

    // The background task ends instead of hanging once the bind fails
    let handle = api::spawn(port, state);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("API task should stop when the port is taken")
        .unwrap();
}
