use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use telemetry_common::metrics::setup_metrics_recorder;
use telemetry_common::pipeline::Pipeline;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use dead_letter_api::auth::Tokens;
use dead_letter_api::config::Config;
use dead_letter_api::handlers::{app, AppState};

async fn shutdown(token: CancellationToken) {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
    token.cancel();
}

async fn listen(app: Router, bind: String, token: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    telemetry_common::logging::init(config.log_format == "json");

    let liveness = HealthRegistry::new("liveness");
    let token = CancellationToken::new();

    let pool = config
        .pipeline
        .postgres
        .connect()
        .await
        .expect("failed to connect to postgres");
    let producer_liveness = liveness
        .register("rdkafka_producer".to_string(), Duration::from_secs(30))
        .await;
    let pipeline = Arc::new(
        Pipeline::connect(&config.pipeline, pool, producer_liveness)
            .expect("failed to initialize pipeline"),
    );

    if config.refresh_schemas {
        let schemas = pipeline.validator().schemas().clone();
        let token = token.clone();
        tokio::spawn(async move { schemas.refresh_loop(token).await });
    }

    let state = AppState {
        pipeline,
        tokens: Tokens::new(config.operator_token.clone(), config.admin_token.clone()),
        policy: config.dead_letter_reprocess_policy,
    };
    let recorder = setup_metrics_recorder().expect("failed to install metrics recorder");
    let app = app(state, liveness, Some(recorder));

    tokio::spawn(shutdown(token.clone()));

    match listen(app, config.bind(), token).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start dead-letter-api http server, {}", e),
    }
}
