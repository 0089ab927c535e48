//! HTTP surface: metrics exposition, health probes and dashboard queries

use std::time::Duration;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::dashboard::{MonitoringService, SeriesCategory};
use crate::health::HealthStatus;
use crate::Result;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Build the router for the monitoring endpoints
pub fn router(service: MonitoringService) -> Router {
    let health_path = service.config.health.endpoint.clone();
    Router::new()
        .route(service.config.prometheus.path.as_str(), get(metrics))
        .route(health_path.as_str(), get(health))
        .route("/health/ready", get(ready))
        .route("/health/live", get(live))
        .route("/alerts", get(alerts))
        .route("/dashboard/statistics", get(statistics))
        .route("/dashboard/export", get(export))
        .with_state(service)
}

/// Bind and serve until the provided future resolves
pub async fn serve<F>(service: MonitoringService, port: u16, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Monitoring HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn metrics(State(service): State<MonitoringService>) -> Response {
    let body = service.registry.export_text().await;
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response()
}

/// Degraded still answers 200 so uptime monitors only page on true outages
async fn health(State(service): State<MonitoringService>) -> Response {
    let report = service.health.run_all_checks().await;
    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report)).into_response()
}

/// Readiness: critical checks only
async fn ready(State(service): State<MonitoringService>) -> Response {
    let report = service.health.run_critical_checks().await;
    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report)).into_response()
}

/// Liveness: answers whenever the process can serve requests at all
async fn live() -> Response {
    Json(serde_json::json!({
        "status": "alive",
        "timestamp": chrono::Utc::now(),
    }))
    .into_response()
}

async fn alerts(State(service): State<MonitoringService>) -> Response {
    let active = service.alerts.active_alerts().await;
    let history = service.alerts.alert_history(100).await;
    Json(serde_json::json!({
        "active": active,
        "history": history,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct StatisticsQuery {
    category: Option<String>,

    /// Window size in minutes, default 60
    minutes: Option<u64>,
}

async fn statistics(
    State(service): State<MonitoringService>,
    Query(query): Query<StatisticsQuery>,
) -> Response {
    let window = Duration::from_secs(query.minutes.unwrap_or(60) * 60);
    let categories = match resolve_categories(query.category.as_deref()) {
        Ok(categories) => categories,
        Err(response) => return response,
    };

    let mut stats = Vec::with_capacity(categories.len());
    for category in categories {
        stats.push(service.dashboard.get_statistics(category, window).await);
    }
    Json(stats).into_response()
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    /// Required; exports are per series
    category: Option<String>,

    /// "json" (default) or "csv"
    format: Option<String>,

    minutes: Option<u64>,
}

async fn export(
    State(service): State<MonitoringService>,
    Query(query): Query<ExportQuery>,
) -> Response {
    let window = Duration::from_secs(query.minutes.unwrap_or(24 * 60) * 60);
    let category = match query.category.as_deref() {
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "category query parameter is required" })),
            )
                .into_response()
        }
        Some(raw) => match SeriesCategory::parse(raw) {
            Some(category) => category,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("unknown category: {}", raw) })),
                )
                    .into_response()
            }
        },
    };

    match query.format.as_deref().unwrap_or("json") {
        "csv" => {
            let body = service.dashboard.export_csv(category, window).await;
            ([(header::CONTENT_TYPE, "text/csv")], body).into_response()
        }
        "json" => match service.dashboard.export_json(category, window).await {
            Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response(),
        },
        other => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("unknown format: {}", other) })),
        )
            .into_response(),
    }
}

fn resolve_categories(
    raw: Option<&str>,
) -> std::result::Result<Vec<SeriesCategory>, Response> {
    match raw {
        None => Ok(vec![
            SeriesCategory::System,
            SeriesCategory::Workflow,
            SeriesCategory::Performance,
            SeriesCategory::Business,
        ]),
        Some(raw) => match SeriesCategory::parse(raw) {
            Some(category) => Ok(vec![category]),
            None => Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("unknown category: {}", raw) })),
            )
                .into_response()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;
    use crate::health::HealthCheckResult;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn service() -> MonitoringService {
        MonitoringService::new(MonitoringConfig::default())
    }

    #[tokio::test]
    async fn test_metrics_endpoint_content_type() {
        let service = service();
        service.registry.register_gauge("active_sessions", "Active learner sessions").await;
        service
            .registry
            .record_sample(&crate::metrics::MetricSample::gauge("active_sessions", 7.0))
            .await;

        let app = router(service);
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PROMETHEUS_CONTENT_TYPE
        );
        let body = body_string(response).await;
        assert!(body.contains("app_active_sessions 7"));
    }

    #[tokio::test]
    async fn test_health_endpoint_degraded_is_200() {
        let service = service();
        service
            .health
            .register_fn("db", false, || async { Ok(HealthCheckResult::pass("db", "ok")) })
            .await;
        service
            .health
            .register_fn("cache", false, || async {
                Ok(HealthCheckResult::fail("cache", "down"))
            })
            .await;

        let app = router(service);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("\"status\":\"degraded\""));
    }

    #[tokio::test]
    async fn test_health_endpoint_unhealthy_is_503() {
        let service = service();
        service
            .health
            .register_fn("db", false, || async {
                Ok(HealthCheckResult::fail("db", "down"))
            })
            .await;

        let app = router(service);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_liveness_always_answers() {
        let app = router(service());
        let response = app
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_export_requires_category() {
        let app = router(service());
        let response = app
            .oneshot(
                Request::get("/dashboard/export?format=csv")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        assert!(body.contains("category query parameter is required"));
    }

    #[tokio::test]
    async fn test_export_rejects_unknown_category() {
        let app = router(service());
        let response = app
            .oneshot(
                Request::get("/dashboard/export?category=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_export_csv() {
        let service = service();
        service
            .dashboard
            .record_point(
                SeriesCategory::Business,
                std::collections::HashMap::from([("signups".to_string(), 3.0)]),
            )
            .await;

        let app = router(service);
        let response = app
            .oneshot(
                Request::get("/dashboard/export?category=business&format=csv")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.starts_with("timestamp,signups"));
    }
}
