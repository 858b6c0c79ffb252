use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use telemetry_common::deadletter::ReprocessPolicy;
use telemetry_common::metrics::setup_metrics_routes;
use telemetry_common::pipeline::Pipeline;
use tower_http::trace::TraceLayer;

use super::dead_letters;
use crate::auth::Tokens;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub tokens: Tokens,
    pub policy: ReprocessPolicy,
}

pub fn app(state: AppState, liveness: HealthRegistry, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/dead-letters", get(dead_letters::list))
        .route("/dead-letters/reprocess", post(dead_letters::reprocess))
        .route("/dead-letters/delete", post(dead_letters::delete))
        .route("/dead-letters/:id", get(dead_letters::detail))
        .route("/dead-letters/:id/suggestions", get(dead_letters::suggestions))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    match metrics {
        Some(handle) => setup_metrics_routes(router, handle),
        None => router,
    }
}

pub async fn index() -> &'static str {
    "dead-letter api"
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `oneshot`

    use crate::handlers::testing::Harness;

    #[tokio::test]
    async fn index() {
        let app = Harness::new().app(Default::default());

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"dead-letter api");
    }
}
