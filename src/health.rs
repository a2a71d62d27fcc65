//! Health and metrics endpoints. The health check probes the database so a
//! dead pool shows up as `degraded` instead of a silent 200.

use crate::state::AppState;
use crate::store::CallStore;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /`: service banner.
pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "service": "call-processing-backend",
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// `GET /health`: liveness plus database connectivity.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    let database_ok = state.store.ping().await.is_ok();
    let status = if database_ok { "healthy" } else { "degraded" };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "call-processing-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "database": if database_ok { "connected" } else { "unreachable" },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "active_connections": metrics.active_connections,
            "subscribers": state.notifier.subscriber_count()
        }
    }))
}

/// `GET /metrics`: per-endpoint request statistics.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms()
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            },
            "active_connections": metrics.active_connections,
            "subscribers": state.notifier.subscriber_count()
        },
        "endpoints": endpoint_stats
    }))
}
