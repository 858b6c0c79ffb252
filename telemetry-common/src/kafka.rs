use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::consumer::ConsumerContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;

#[derive(Error, Debug)]
pub enum KafkaSinkError {
    #[error("message is too large for the buffer")]
    MessageTooLarge,
    #[error("buffer unavailable: {0}")]
    Unavailable(String),
    #[error("buffer did not acknowledge within {0:?}")]
    Timeout(Duration),
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl KafkaContext {
    pub fn new(liveness: HealthHandle) -> Self {
        Self { liveness }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // The main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();

        gauge!("telemetry_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("telemetry_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("telemetry_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("telemetry_kafka_producer_queue_bytes").set(stats.msg_size as f64);

        for (_, broker) in stats.brokers {
            let id_string = format!("{}", broker.nodeid);
            if let Some(rtt) = broker.rtt {
                gauge!(
                    "telemetry_kafka_rtt_latency_us",
                    "quantile" => "p50",
                    "broker" => id_string.clone()
                )
                .set(rtt.p50 as f64);
                gauge!(
                    "telemetry_kafka_rtt_latency_us",
                    "quantile" => "p99",
                    "broker" => id_string.clone()
                )
                .set(rtt.p99 as f64);
            }
            counter!(
                "telemetry_kafka_broker_tx_errors_total",
                "broker" => id_string.clone()
            )
            .absolute(broker.txerrs);
            counter!(
                "telemetry_kafka_broker_request_timeouts",
                "broker" => id_string
            )
            .absolute(broker.req_timeouts);
        }
    }
}

impl ConsumerContext for KafkaContext {}

/// Client settings shared by producers and consumers.
pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };
    client_config
}

pub fn create_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

    let mut client_config = client_config(config);
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.max.bytes",
            config.kafka_producer_message_max_bytes.to_string(),
        )
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("compression.codec", &config.kafka_compression_codec)
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(KafkaContext::new(liveness))?;

    // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
    drop(producer.client().fetch_metadata(
        Some("__consumer_offsets"),
        Timeout::After(Duration::new(10, 0)),
    )?);
    info!("connected to Kafka brokers");

    Ok(producer)
}

/// Enqueues one record, mapping local rejections.
pub fn enqueue(
    producer: &FutureProducer<KafkaContext>,
    topic: &str,
    key: &str,
    payload: &[u8],
) -> Result<DeliveryFuture, KafkaSinkError> {
    match producer.send_result(FutureRecord {
        topic,
        payload: Some(payload),
        partition: None,
        key: Some(key),
        timestamp: None,
        headers: None,
    }) {
        Ok(ack) => Ok(ack),
        Err((e, _)) => match e.rdkafka_error_code() {
            Some(RDKafkaErrorCode::MessageSizeTooLarge) => Err(KafkaSinkError::MessageTooLarge),
            _ => {
                error!("failed to produce to {}: {}", topic, e);
                Err(KafkaSinkError::Unavailable(e.to_string()))
            }
        },
    }
}

/// Waits for the broker ack of one enqueued record.
pub async fn await_ack(delivery: DeliveryFuture, timeout: Duration) -> Result<(), KafkaSinkError> {
    match tokio::time::timeout(timeout, delivery).await {
        Err(_) => Err(KafkaSinkError::Timeout(timeout)),
        Ok(Err(_)) => {
            // Cancelled due to timeout while retrying
            counter!("telemetry_kafka_produce_errors_total").increment(1);
            Err(KafkaSinkError::Unavailable(
                "delivery cancelled before write timeout".to_owned(),
            ))
        }
        Ok(Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _)))) => {
            Err(KafkaSinkError::MessageTooLarge)
        }
        Ok(Ok(Err((err, _)))) => {
            counter!("telemetry_kafka_produce_errors_total").increment(1);
            Err(KafkaSinkError::Unavailable(err.to_string()))
        }
        Ok(Ok(Ok(_))) => Ok(()),
    }
}

/// Publishes JSON documents, used for the dead-letter and outcome topics.
#[derive(Clone)]
pub struct JsonProducer {
    producer: FutureProducer<KafkaContext>,
    ack_timeout: Duration,
}

impl JsonProducer {
    pub fn new(producer: FutureProducer<KafkaContext>, ack_timeout: Duration) -> Self {
        Self {
            producer,
            ack_timeout,
        }
    }

    pub async fn send<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(), KafkaSinkError> {
        let payload = serde_json::to_vec(value)?;
        let ack = enqueue(&self.producer, topic, key, &payload)?;
        await_ack(ack, self.ack_timeout).await
    }

    /// Enqueues without waiting for the broker. Delivery failures are only counted
    /// and logged; enqueue order is kept, so per-key ordering holds.
    pub fn send_detached<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(), KafkaSinkError> {
        let payload = serde_json::to_vec(value)?;
        let ack = enqueue(&self.producer, topic, key, &payload)?;
        let ack_timeout = self.ack_timeout;
        let topic = topic.to_owned();
        tokio::spawn(async move {
            if let Err(e) = await_ack(ack, ack_timeout).await {
                counter!("telemetry_kafka_delivery_failures_total", "topic" => topic.clone())
                    .increment(1);
                warn!(topic = %topic, "delivery failed: {}", e);
            }
        });
        Ok(())
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvMsDuration;
    use health::HealthRegistry;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use rdkafka::mocking::MockCluster;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};
    use serde_json::json;

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
            buffer_publish_timeout_ms: EnvMsDuration(Duration::from_millis(1000)),
        }
    }

    #[tokio::test]
    async fn publishes_json_to_mock_cluster() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("kafka".to_string(), Duration::from_secs(30))
            .await;
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let producer = create_producer(&config(cluster.bootstrap_servers()), handle)
            .expect("failed to create producer");
        let producer = JsonProducer::new(producer, Duration::from_secs(5));

        producer
            .send("telemetry_dead_letters", "dev-1", &json!({"device_id": "dev-1"}))
            .await
            .expect("failed to publish");
    }

    fn delivery_failures(snapshotter: &Snapshotter) -> u64 {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| key.key().name() == "telemetry_kafka_delivery_failures_total")
            .map_or(0, |(_, _, _, value)| match value {
                DebugValue::Counter(count) => count,
                _ => 0,
            })
    }

    #[test]
    fn detached_delivery_failures_are_counted() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let registry = HealthRegistry::new("liveness");
                let handle = registry
                    .register("kafka".to_string(), Duration::from_secs(30))
                    .await;
                let cluster = MockCluster::new(1).expect("failed to create mock brokers");
                let producer = create_producer(&config(cluster.bootstrap_servers()), handle)
                    .expect("failed to create producer");
                let producer = JsonProducer::new(producer, Duration::from_secs(5));
                let topic = "telemetry_validation_outcomes";

                // Wait for the producer to be connected
                for _ in 0..20 {
                    if producer.send(topic, "dev-1", &json!({"n": 0})).await.is_ok() {
                        break;
                    }
                }

                producer
                    .send_detached(topic, "dev-1", &json!({"n": 1}))
                    .expect("failed to enqueue");
                tokio::time::sleep(Duration::from_millis(200)).await;
                assert_eq!(delivery_failures(&snapshotter), 0);

                let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_INVALID_PARTITIONS; 1];
                cluster.request_errors(RDKafkaApiKey::Produce, &err);
                producer
                    .send_detached(topic, "dev-1", &json!({"n": 2}))
                    .expect("failed to enqueue");
                for _ in 0..50 {
                    if delivery_failures(&snapshotter) > 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            });
        });

        assert_eq!(delivery_failures(&snapshotter), 1);
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected_locally() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("kafka".to_string(), Duration::from_secs(30))
            .await;
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let producer = create_producer(&config(cluster.bootstrap_servers()), handle)
            .expect("failed to create producer");
        let producer = JsonProducer::new(producer, Duration::from_secs(5));

        let big = "x".repeat(2_000_000);
        let error = producer
            .send("telemetry_dead_letters", "dev-1", &json!({"blob": big}))
            .await
            .unwrap_err();
        assert!(matches!(error, KafkaSinkError::MessageTooLarge));
    }
}
