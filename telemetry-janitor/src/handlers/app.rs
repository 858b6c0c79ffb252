use std::future::ready;

use axum::{routing::get, Router};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use telemetry_common::metrics::setup_metrics_routes;

pub fn app(liveness: HealthRegistry, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));

    match metrics {
        Some(handle) => setup_metrics_routes(router, handle),
        None => router,
    }
}

pub async fn index() -> &'static str {
    "telemetry janitor"
}
