//! Consume telemetry envelopes from the raw topic and drive each one to storage or the dead-letter store.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use health::HealthRegistry;
use telemetry_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use telemetry_common::pipeline::Pipeline;
use telemetry_common::retry::RetryPolicy;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use telemetry_worker::config::Config;
use telemetry_worker::consumer::{create_consumer, EnvelopeProcessor, TelemetryConsumer};
use telemetry_worker::error::WorkerError;

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

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = Config::init_from_env().expect("Invalid configuration:");
    telemetry_common::logging::init(config.log_format == "json");

    let liveness = HealthRegistry::new("liveness");
    let token = CancellationToken::new();

    let pool = config.pipeline.postgres.connect().await?;
    if config.run_migrations {
        sqlx::migrate!("../migrations").run(&pool).await?;
    }

    let producer_liveness = liveness
        .register("rdkafka_producer".to_string(), Duration::from_secs(30))
        .await;
    let pipeline = Arc::new(Pipeline::connect(
        &config.pipeline,
        pool,
        producer_liveness,
    )?);

    {
        let schemas = pipeline.validator().schemas().clone();
        let token = token.clone();
        tokio::spawn(async move { schemas.refresh_loop(token).await });
    }

    let backoff = RetryPolicy::build(2, config.error_backoff_initial_ms.0)
        .maximum_interval(config.error_backoff_maximum_ms.0)
        .provide();

    let mut consumers = JoinSet::new();
    for index in 0..config.worker_concurrency.max(1) {
        let name = format!("consumer-{index}");
        let consumer_liveness = liveness
            .register(name.clone(), Duration::from_secs(60))
            .await;
        let consumer = create_consumer(&config, consumer_liveness.clone())?;
        let consumer = TelemetryConsumer::new(
            name,
            consumer,
            config.pipeline.kafka.kafka_raw_topic.clone(),
            EnvelopeProcessor::new(pipeline.clone(), backoff.clone()),
            consumer_liveness,
        );
        consumers.spawn(consumer.run(token.clone()));
    }

    let bind = config.bind();
    let recorder = setup_metrics_recorder().expect("failed to install metrics recorder");
    tokio::task::spawn(async move {
        let router = Router::new()
            .route("/", get(|| ready("telemetry worker")))
            .route("/_liveness", get(move || ready(liveness.get_status())));
        serve(setup_metrics_routes(router, recorder), &bind)
            .await
            .expect("failed to start serving metrics");
    });

    tokio::spawn(shutdown(token.clone()));

    while let Some(joined) = consumers.join_next().await {
        if let Err(e) = joined {
            tracing::error!("consumer task panicked: {}", e);
            // Take the other consumers down too
            token.cancel();
        }
    }

    Ok(())
}
