use std::future::ready;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use telemetry_common::metrics::setup_metrics_routes;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::adapter::Ingestor;
use crate::endpoint;
use crate::time::TimeSource;

#[derive(Clone)]
pub struct State {
    pub ingestor: Ingestor,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub max_body_bytes: usize,
}

async fn index() -> &'static str {
    "telemetry ingress"
}

pub fn router<TZ: TimeSource + Send + Sync + 'static>(
    timesource: TZ,
    liveness: HealthRegistry,
    ingestor: Ingestor,
    max_body_bytes: usize,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let state = State {
        ingestor,
        timesource: Arc::new(timesource),
        max_body_bytes,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route(
            "/tenants/:tenant_id/devices/:device_id/telemetry",
            post(endpoint::telemetry),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Don't install metrics unless asked to, installing a global recorder
    // when used as a library (during tests etc) does not work well
    match metrics {
        Some(handle) => setup_metrics_routes(router, handle),
        None => router,
    }
}
