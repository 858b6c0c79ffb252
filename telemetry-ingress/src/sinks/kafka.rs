use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, histogram};
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureProducer, Producer};
use telemetry_common::config::KafkaConfig;
use telemetry_common::envelope::TelemetryEnvelope;
use telemetry_common::kafka::{await_ack, create_producer, enqueue, KafkaContext, KafkaSinkError};
use tokio::task::JoinSet;
use tracing::{error, info_span, instrument, Instrument};

use crate::api::IngressError;
use crate::sinks::TelemetrySink;

pub fn report_dropped(cause: &'static str, count: u64) {
    counter!("telemetry_ingress_dropped_total", "cause" => cause).increment(count);
}

#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    publish_timeout: Duration,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> anyhow::Result<KafkaSink> {
        let producer = create_producer(config, liveness)?;

        Ok(KafkaSink {
            producer,
            topic: config.kafka_raw_topic.clone(),
            publish_timeout: config.buffer_publish_timeout_ms.0,
        })
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }

    fn kafka_send(
        producer: &FutureProducer<KafkaContext>,
        topic: &str,
        envelope: &TelemetryEnvelope,
    ) -> Result<DeliveryFuture, IngressError> {
        let payload = serde_json::to_vec(envelope).map_err(|e| {
            error!("failed to serialize envelope: {}", e);
            IngressError::BufferUnavailable
        })?;

        // Buffer outages are counted by the caller, once per lost envelope
        enqueue(producer, topic, envelope.key(), &payload).map_err(|e| match e {
            KafkaSinkError::MessageTooLarge => {
                report_dropped("kafka_message_size", 1);
                IngressError::PayloadTooLarge
            }
            _ => IngressError::BufferUnavailable,
        })
    }

    async fn process_ack(delivery: DeliveryFuture, timeout: Duration) -> Result<(), IngressError> {
        match await_ack(delivery, timeout).await {
            Ok(()) => {
                counter!("telemetry_ingress_published_total").increment(1);
                Ok(())
            }
            Err(KafkaSinkError::MessageTooLarge) => {
                // Rejected by broker due to message size
                report_dropped("kafka_message_size", 1);
                Err(IngressError::PayloadTooLarge)
            }
            Err(e) => {
                error!("failed to publish to the buffer: {}", e);
                Err(IngressError::BufferUnavailable)
            }
        }
    }
}

#[async_trait]
impl TelemetrySink for KafkaSink {
    #[instrument(skip_all)]
    async fn send(&self, envelope: TelemetryEnvelope) -> Result<(), IngressError> {
        let ack = Self::kafka_send(&self.producer, &self.topic, &envelope)?;
        histogram!("telemetry_ingress_batch_size").record(1.0);
        Self::process_ack(ack, self.publish_timeout)
            .instrument(info_span!("ack_wait_one"))
            .await
    }

    #[instrument(skip_all)]
    async fn send_batch(&self, envelopes: Vec<TelemetryEnvelope>) -> Result<(), IngressError> {
        let mut set = JoinSet::new();
        let batch_size = envelopes.len();
        for envelope in envelopes {
            // Enqueue sequentially to keep per-device ordering in the producer queue
            let ack = match Self::kafka_send(&self.producer, &self.topic, &envelope) {
                Ok(ack) => ack,
                Err(err) => {
                    set.abort_all();
                    return Err(err);
                }
            };

            // Then wait concurrently for the write ACKs from brokers
            set.spawn(Self::process_ack(ack, self.publish_timeout));
        }

        // Fail the batch on first failure
        async move {
            while let Some(res) = set.join_next().await {
                match res {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        set.abort_all();
                        return Err(err);
                    }
                    Err(err) => {
                        set.abort_all();
                        error!("join error while waiting on Kafka ACK: {:?}", err);
                        return Err(IngressError::BufferUnavailable);
                    }
                }
            }
            Ok(())
        }
        .instrument(info_span!("ack_wait_many"))
        .await?;

        histogram!("telemetry_ingress_batch_size").record(batch_size as f64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use health::HealthRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};
    use serde_json::json;
    use telemetry_common::config::EnvMsDuration;
    use telemetry_common::envelope::{IngressContext, Protocol};

    fn config(hosts: String) -> KafkaConfig {
        KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_producer_message_max_bytes: 1_000_000,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_owned(),
            kafka_tls: false,
            kafka_hosts: hosts,
            kafka_raw_topic: "telemetry_raw".to_owned(),
            kafka_dead_letter_topic: "telemetry_dead_letters".to_owned(),
            kafka_outcome_topic: "telemetry_validation_outcomes".to_owned(),
            buffer_publish_timeout_ms: EnvMsDuration(Duration::from_millis(2000)),
        }
    }

    fn envelope(payload: serde_json::Value) -> TelemetryEnvelope {
        let ctx = IngressContext {
            tenant_id: "tenant-a".to_owned(),
            device_id: "dev-1".to_owned(),
            device_type_id: None,
            protocol: Protocol::Http,
            received_at: Utc::now(),
        };
        TelemetryEnvelope::from_value(&ctx, &payload)
    }

    #[tokio::test]
    async fn kafka_sink_error_handling() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("kafka".to_string(), Duration::from_secs(30))
            .await;
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let sink = KafkaSink::new(&config(cluster.bootstrap_servers()), handle)
            .expect("failed to create sink");
        let small = envelope(json!({"battery": 91.5}));

        // Wait for producer to be healthy, to keep the message timeout short and tests faster
        for _ in 0..20 {
            if sink.send(small.clone()).await.is_ok() {
                break;
            }
        }

        sink.send(small.clone())
            .await
            .expect("failed to send one initial envelope");
        sink.send_batch(vec![small.clone(), small.clone()])
            .await
            .expect("failed to send initial batch");

        // Producer should reject a 2MB message, twice the configured `message.max.bytes`
        let big = envelope(json!({"blob": "x".repeat(2_000_000)}));
        match sink.send(big).await {
            Err(IngressError::PayloadTooLarge) => {} // Expected
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };

        // Unretriable broker errors
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_INVALID_PARTITIONS; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match sink.send_batch(vec![small.clone(), small.clone()]).await {
            Err(IngressError::BufferUnavailable) => {} // Expected
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };

        // Transient errors, messages should go through OK
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 2];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        sink.send(small.clone())
            .await
            .expect("failed to send one envelope after recovery");

        // Sustained transient errors exhaust the message timeout
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 50];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match sink.send(small.clone()).await {
            Err(IngressError::BufferUnavailable) => {} // Expected
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };
    }
}
