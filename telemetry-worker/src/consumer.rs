use std::sync::Arc;

use health::HealthHandle;
use metrics::{counter, histogram};
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::Message;
use telemetry_common::config::KafkaConfig;
use telemetry_common::envelope::{SourceOffset, TelemetryEnvelope};
use telemetry_common::kafka::{client_config, KafkaContext};
use telemetry_common::pipeline::{Disposition, Pipeline};
use telemetry_common::retry::RetryPolicy;
use telemetry_common::timeseries::WriteOutcome;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;

pub fn create_consumer(
    config: &Config,
    liveness: HealthHandle,
) -> Result<StreamConsumer<KafkaContext>, KafkaError> {
    let kafka: &KafkaConfig = &config.pipeline.kafka;
    let mut client_config = client_config(kafka);
    client_config
        .set("group.id", config.kafka_consumer_group.as_str())
        .set("enable.auto.offset.store", "false")
        .set("enable.auto.commit", "true")
        .set(
            "auto.commit.interval.ms",
            config.kafka_auto_commit_interval_ms.to_string(),
        )
        .set("auto.offset.reset", &config.kafka_consumer_offset_reset);

    let consumer: StreamConsumer<KafkaContext> =
        client_config.create_with_context(KafkaContext::new(liveness))?;
    consumer.subscribe(&[kafka.kafka_raw_topic.as_str()])?;

    Ok(consumer)
}

/// Parses a buffer message, tagging it with where it was read from.
pub fn decode_envelope(
    payload: Option<&[u8]>,
    source: SourceOffset,
) -> Result<TelemetryEnvelope, serde_json::Error> {
    let mut envelope: TelemetryEnvelope = serde_json::from_slice(payload.unwrap_or_default())?;
    envelope.source_offset = Some(source);
    Ok(envelope)
}

/// Drives envelopes to a terminal state, waiting out infrastructure faults.
pub struct EnvelopeProcessor {
    pipeline: Arc<Pipeline>,
    backoff: RetryPolicy,
}

impl EnvelopeProcessor {
    pub fn new(pipeline: Arc<Pipeline>, backoff: RetryPolicy) -> Self {
        Self { pipeline, backoff }
    }

    /// Returns `None` only when cancelled before a terminal state was reached,
    /// in which case the offset must not be stored.
    pub async fn process(
        &self,
        envelope: TelemetryEnvelope,
        token: &CancellationToken,
    ) -> Option<Disposition> {
        let mut attempt = 1;
        loop {
            match self.pipeline.process(envelope.clone()).await {
                Ok(disposition) => {
                    record_disposition(&disposition);
                    return Some(disposition);
                }
                Err(e) => {
                    counter!("telemetry_worker_pipeline_errors_total").increment(1);
                    let interval = self.backoff.retry_interval(attempt);
                    error!(
                        envelope_id = %envelope.envelope_id,
                        attempt,
                        "failed to reach a terminal state, retrying in {:?}: {}",
                        interval,
                        e
                    );
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn record_disposition(disposition: &Disposition) {
    match disposition {
        Disposition::Stored(WriteOutcome::Inserted) => {
            counter!("telemetry_worker_envelopes_total", "result" => "stored").increment(1)
        }
        Disposition::Stored(WriteOutcome::Updated) => {
            counter!("telemetry_worker_envelopes_total", "result" => "stored_duplicate")
                .increment(1)
        }
        Disposition::DeadLettered { category, .. } => counter!(
            "telemetry_worker_envelopes_total",
            "result" => "dead_lettered",
            "category" => category.as_str()
        )
        .increment(1),
    }
}

pub struct TelemetryConsumer {
    name: String,
    consumer: StreamConsumer<KafkaContext>,
    topic: String,
    processor: EnvelopeProcessor,
    liveness: HealthHandle,
}

impl TelemetryConsumer {
    pub fn new(
        name: String,
        consumer: StreamConsumer<KafkaContext>,
        topic: String,
        processor: EnvelopeProcessor,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name,
            consumer,
            topic,
            processor,
            liveness,
        }
    }

    /// Processes messages one by one until cancelled, then commits and leaves the group.
    pub async fn run(self, token: CancellationToken) {
        info!(consumer = %self.name, topic = %self.topic, "starting consumer");

        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                received = self.consumer.recv() => received,
            };

            let (decoded, partition, offset) = match received {
                Ok(message) => {
                    let source = SourceOffset {
                        topic: message.topic().to_owned(),
                        partition: message.partition(),
                        offset: message.offset(),
                    };
                    (
                        decode_envelope(message.payload(), source),
                        message.partition(),
                        message.offset(),
                    )
                }
                Err(e) => {
                    counter!("telemetry_worker_recv_errors_total").increment(1);
                    warn!(consumer = %self.name, "failed to receive message: {}", e);
                    continue;
                }
            };
            self.liveness.report_healthy().await;

            match decoded {
                Ok(envelope) => {
                    let start = std::time::Instant::now();
                    if self.processor.process(envelope, &token).await.is_none() {
                        debug!(consumer = %self.name, partition, offset, "cancelled mid-message");
                        break;
                    }
                    histogram!("telemetry_worker_processing_duration_seconds")
                        .record(start.elapsed().as_secs_f64());
                }
                Err(e) => {
                    // Ingress only publishes envelopes, anything else is a poison pill
                    counter!("telemetry_worker_undecodable_total").increment(1);
                    error!(
                        consumer = %self.name,
                        partition,
                        offset,
                        "skipping undecodable message: {}",
                        e
                    );
                }
            }

            store_offset(&self.consumer, &self.name, &self.topic, partition, offset);
        }

        info!(consumer = %self.name, "draining consumer");
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            // Nothing stored since the last auto commit
            warn!(consumer = %self.name, "final commit failed: {}", e);
        }
        self.consumer.unsubscribe();
        info!(consumer = %self.name, "consumer stopped");
    }
}

/// Marks a message as done. A failure here only means the partition moved to another
/// member mid-message; the envelope is already terminal and a replay converges.
fn store_offset<C: ConsumerContext + 'static>(
    consumer: &StreamConsumer<C>,
    name: &str,
    topic: &str,
    partition: i32,
    offset: i64,
) -> bool {
    match consumer.store_offset(topic, partition, offset) {
        Ok(()) => true,
        Err(e) => {
            counter!("telemetry_worker_offset_store_errors_total").increment(1);
            warn!(
                consumer = %name,
                partition,
                offset,
                "failed to store offset, message may be redelivered: {}",
                e
            );
            false
        }
    }
}
