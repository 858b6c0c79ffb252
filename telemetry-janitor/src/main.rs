use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use health::HealthRegistry;
use telemetry_common::deadletter::PgDeadLetterStore;
use telemetry_common::metrics::setup_metrics_recorder;
use telemetry_common::timeseries::PgTimeSeriesStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use telemetry_janitor::cleanup::{cleanup_loop, parse_modes, Cleaner, CleanerModeName};
use telemetry_janitor::config::Config;
use telemetry_janitor::dead_letters::DeadLetterCleaner;
use telemetry_janitor::handlers;
use telemetry_janitor::partitions::PartitionCleaner;

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
async fn main() -> Result<()> {
    let config = Config::init_from_env()?;
    telemetry_common::logging::init(config.log_format == "json");

    let modes = parse_modes(&config.modes)?;
    let pool = config.postgres.connect().await?;

    let cleaners: Vec<Box<dyn Cleaner>> = modes
        .iter()
        .map(|mode| -> Box<dyn Cleaner> {
            match mode {
                CleanerModeName::DeadLetters => Box::new(DeadLetterCleaner::new(
                    Arc::new(PgDeadLetterStore::new(pool.clone())),
                    config.dead_letter_retention_days,
                    config.cleanup_batch_limit,
                )),
                CleanerModeName::Partitions => Box::new(PartitionCleaner::new(
                    PgTimeSeriesStore::new(pool.clone()),
                    config.partition_days_ahead,
                )),
            }
        })
        .collect();

    let liveness = HealthRegistry::new("liveness");
    let interval = Duration::from_secs(config.cleanup_interval_secs);
    // A missed run is tolerated, two in a row mark the janitor as stalled
    let cleanup_liveness = liveness
        .register("cleanup".to_string(), interval * 2 + Duration::from_secs(60))
        .await;

    let token = CancellationToken::new();
    tokio::spawn(shutdown(token.clone()));

    let cleanup_loop = Box::pin(cleanup_loop(
        cleaners,
        interval,
        cleanup_liveness,
        token.clone(),
    ));

    let recorder_handle = setup_metrics_recorder()?;
    let app = handlers::app(liveness, Some(recorder_handle));
    let http_server = Box::pin(listen(app, config.bind(), token.clone()));

    match select(http_server, cleanup_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start telemetry-janitor http server, {}", e),
        },
        Either::Right((_, _)) => {
            if !token.is_cancelled() {
                tracing::error!("telemetry-janitor cleanup task exited")
            }
        }
    };

    Ok(())
}
