use rdkafka::error::KafkaError;
use telemetry_common::pipeline::SetupError;
use thiserror::Error;

/// Errors that stop a consumer, message-level faults are handled in the loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("kafka consumer error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to set up the pipeline: {0}")]
    Setup(#[from] SetupError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
