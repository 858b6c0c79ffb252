//! Drives one envelope to exactly one terminal state: a row in the
//! time-series store, or a record in the dead-letter store.
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use health::HealthHandle;
use rdkafka::error::KafkaError;
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::deadletter::{
    DeadLetterError, DeadLetterRouter, KafkaDeadLetterPublisher, PgDeadLetterStore,
    ReprocessPolicy, ReprocessReport, Revalidate,
};
use crate::envelope::TelemetryEnvelope;
use crate::events::{
    KafkaOutcomeSink, LogOutcomeSink, OutcomeSink, OutcomeStage, ValidationOutcomeEvent,
};
use crate::kafka::{create_producer, JsonProducer};
use crate::schema::{HttpSchemaRegistry, LookupError, ResolveOptions, SchemaLookupClient};
use crate::timeseries::{
    PgTimeSeriesStore, StoredTelemetryRecord, TelemetryWriter, WriteOutcome,
};
use crate::validation::{ErrorCategory, Rejection, ValidationResult, Validator};

/// Infrastructure faults only; validation and storage failures are dead letters.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to persist dead letter: {0}")]
    DeadLetter(#[from] DeadLetterError),
}

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to create kafka producer: {0}")]
    Kafka(#[from] KafkaError),
    #[error("invalid schema registry client: {0}")]
    Registry(#[from] LookupError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Stored(WriteOutcome),
    DeadLettered { id: Uuid, category: ErrorCategory },
}

pub struct Pipeline {
    validator: Validator,
    writer: TelemetryWriter,
    router: DeadLetterRouter,
    outcomes: Arc<dyn OutcomeSink>,
}

impl Pipeline {
    pub fn new(
        validator: Validator,
        writer: TelemetryWriter,
        router: DeadLetterRouter,
        outcomes: Arc<dyn OutcomeSink>,
    ) -> Self {
        Self {
            validator,
            writer,
            router,
            outcomes,
        }
    }

    /// Wires the Postgres stores, the HTTP schema registry and the Kafka publishers.
    pub fn connect(
        config: &PipelineConfig,
        pool: PgPool,
        kafka_liveness: HealthHandle,
    ) -> Result<Self, SetupError> {
        let registry = HttpSchemaRegistry::new(
            &config.schema.schema_registry_url,
            config.schema.schema_registry_timeout_ms.0,
        )?;
        let schemas = Arc::new(SchemaLookupClient::from_config(
            &config.schema,
            Arc::new(registry),
        ));
        let validator = Validator::new(
            schemas,
            config.schema.lookup_policy(),
            config.schema.compiled_schema_cache_capacity,
        );

        let writer = TelemetryWriter::new(
            Arc::new(PgTimeSeriesStore::new(pool.clone())),
            config.retry.storage_policy(),
            config.postgres.storage_write_timeout_ms.0,
        );

        let producer = JsonProducer::new(
            create_producer(&config.kafka, kafka_liveness)?,
            config.kafka.buffer_publish_timeout_ms.0,
        );
        let router = DeadLetterRouter::new(
            Arc::new(PgDeadLetterStore::new(pool)),
            Arc::new(KafkaDeadLetterPublisher::new(
                producer.clone(),
                config.kafka.kafka_dead_letter_topic.clone(),
            )),
            config.retry.storage_policy(),
        );

        let outcomes: Arc<dyn OutcomeSink> = if config.log_outcomes {
            Arc::new(LogOutcomeSink)
        } else {
            Arc::new(KafkaOutcomeSink::new(
                producer,
                config.kafka.kafka_outcome_topic.clone(),
            ))
        };

        Ok(Self::new(validator, writer, router, outcomes))
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn router(&self) -> &DeadLetterRouter {
        &self.router
    }

    pub async fn process(&self, mut envelope: TelemetryEnvelope) -> Result<Disposition, PipelineError> {
        let start = Instant::now();
        match self.store(&mut envelope, ResolveOptions::default()).await {
            Ok((outcome, validation)) => {
                self.outcomes
                    .emit(ValidationOutcomeEvent::accepted(
                        &envelope,
                        &validation,
                        elapsed_ms(start),
                        OutcomeStage::Realtime,
                    ))
                    .await;
                Ok(Disposition::Stored(outcome))
            }
            Err(rejection) => {
                let record = self.router.reject(&envelope, &rejection).await?;
                debug!(
                    "envelope {} dead-lettered as {}: {}",
                    envelope.envelope_id, rejection.category, rejection.message
                );
                self.outcomes
                    .emit(ValidationOutcomeEvent::rejected(
                        &envelope,
                        &rejection,
                        elapsed_ms(start),
                        OutcomeStage::Realtime,
                    ))
                    .await;
                Ok(Disposition::DeadLettered {
                    id: record.id,
                    category: rejection.category,
                })
            }
        }
    }

    pub async fn reprocess(&self, ids: &[Uuid], policy: ReprocessPolicy) -> ReprocessReport {
        self.router.reprocess(ids, self, policy).await
    }

    async fn store(
        &self,
        envelope: &mut TelemetryEnvelope,
        options: ResolveOptions,
    ) -> Result<(WriteOutcome, ValidationResult), Rejection> {
        let record = self.validator.validate(envelope, options).await?;
        let validation = record.validation.clone();
        let stored = StoredTelemetryRecord::from_validated(envelope, record);

        match self.writer.write(&stored).await {
            Ok(outcome) => Ok((outcome, validation)),
            Err(e) => Err(Rejection::storage(e.to_string(), validation)),
        }
    }
}

#[async_trait]
impl Revalidate for Pipeline {
    async fn revalidate(&self, envelope: &mut TelemetryEnvelope) -> Result<WriteOutcome, Rejection> {
        let start = Instant::now();
        let options = ResolveOptions {
            bypass_negative_cache: true,
        };
        let result = self.store(envelope, options).await;

        let event = match &result {
            Ok((_, validation)) => ValidationOutcomeEvent::accepted(
                envelope,
                validation,
                elapsed_ms(start),
                OutcomeStage::Reprocess,
            ),
            Err(rejection) => ValidationOutcomeEvent::rejected(
                envelope,
                rejection,
                elapsed_ms(start),
                OutcomeStage::Reprocess,
            ),
        };
        self.outcomes.emit(event).await;
        result.map(|(outcome, _)| outcome)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
