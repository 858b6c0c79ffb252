use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use telemetry_common::envelope::{IngressContext, Protocol};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::adapter::Ingestor;
use crate::api::IngressError;
use crate::config::MqttConfig;
use crate::time::TimeSource;

#[derive(Debug, PartialEq, Eq)]
pub struct DeviceTopic {
    pub tenant_id: String,
    pub device_id: String,
}

/// Subscription filter matching `{prefix}{tenant}/devices/{device}/telemetry`.
pub fn subscription(prefix: &str) -> String {
    format!("{prefix}+/devices/+/telemetry")
}

pub fn parse_topic(prefix: &str, topic: &str) -> Option<DeviceTopic> {
    let rest = topic.strip_prefix(prefix)?;
    let mut parts = rest.split('/');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some(tenant_id), Some("devices"), Some(device_id), Some("telemetry"), None)
            if !tenant_id.is_empty() && !device_id.is_empty() =>
        {
            Some(DeviceTopic {
                tenant_id: tenant_id.to_owned(),
                device_id: device_id.to_owned(),
            })
        }
        _ => None,
    }
}

pub struct MqttSubscriber {
    config: MqttConfig,
    ingestor: Ingestor,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    liveness: HealthHandle,
}

impl MqttSubscriber {
    pub fn new(
        config: MqttConfig,
        ingestor: Ingestor,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            config,
            ingestor,
            timesource,
            liveness,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            &self.config.mqtt_client_id,
            &self.config.mqtt_host,
            self.config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.mqtt_keep_alive_secs));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) =
            (&self.config.mqtt_username, &self.config.mqtt_password)
        {
            options.set_credentials(username, password);
        }
        options
    }

    /// Runs until the token is cancelled. The event loop reconnects on its own on the
    /// next poll after an error, after waiting for the configured backoff.
    pub async fn run(self, token: CancellationToken) {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 100);
        let filter = subscription(&self.config.mqtt_topic_prefix);

        info!(
            host = %self.config.mqtt_host,
            port = self.config.mqtt_port,
            filter = %filter,
            "starting MQTT subscriber"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("shutdown signal received");
                    if let Err(e) = client.disconnect().await {
                        debug!("failed to disconnect from MQTT broker: {}", e);
                    }
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to MQTT broker");
                        self.liveness.report_healthy().await;
                        // Sessions are clean, subscribe again on every connection
                        if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                            error!("failed to subscribe to {}: {}", filter, e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.liveness.report_healthy().await;
                        self.handle_publish(&publish.topic, &publish.payload).await;
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        self.liveness.report_healthy().await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(self.config.mqtt_reconnect_backoff_ms.0) => {}
                        }
                    }
                }
            }
        }

        info!("MQTT subscriber stopped");
    }

    /// Ingests one publish. Failures are counted and logged, MQTT has no way to answer them.
    pub async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let span = info_span!(
            parent: Span::none(),
            "mqtt_message",
            topic = %topic,
            payload_size = payload.len(),
        );

        async {
            let Some(parsed) = parse_topic(&self.config.mqtt_topic_prefix, topic) else {
                warn!("failed to parse MQTT topic, skipping message");
                return;
            };

            let ctx = IngressContext {
                tenant_id: parsed.tenant_id,
                device_id: parsed.device_id,
                device_type_id: None,
                protocol: Protocol::Mqtt,
                received_at: self.timesource.current_time(),
            };

            match self.ingestor.ingest(&ctx, payload).await {
                Ok(summary) => debug!(
                    device_id = %ctx.device_id,
                    accepted = summary.accepted,
                    rate_limited = summary.rate_limited,
                    "ingested MQTT publish"
                ),
                Err(IngressError::RateLimited) => {}
                Err(IngressError::EmptyBatch) => {
                    debug!(device_id = %ctx.device_id, "empty MQTT batch");
                }
                Err(e) => {
                    warn!(device_id = %ctx.device_id, "failed to ingest MQTT publish: {}", e);
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};
    use health::HealthRegistry;
    use telemetry_common::config::EnvMsDuration;

    use super::*;
    use crate::auth::AllowAll;
    use crate::limiter::RateLimiter;
    use crate::sinks::memory::MemorySink;
    use crate::time::FixedTime;

    fn config(prefix: &str) -> MqttConfig {
        MqttConfig {
            mqtt_enabled: true,
            mqtt_host: "localhost".to_owned(),
            mqtt_port: 1883,
            mqtt_client_id: "test".to_owned(),
            mqtt_topic_prefix: prefix.to_owned(),
            mqtt_username: None,
            mqtt_password: None,
            mqtt_keep_alive_secs: 30,
            mqtt_reconnect_backoff_ms: EnvMsDuration(Duration::from_millis(10)),
        }
    }

    async fn subscriber(sink: MemorySink, prefix: &str) -> MqttSubscriber {
        let limiter = RateLimiter::new(
            100,
            Duration::from_secs(60),
            HashMap::new(),
            Duration::from_secs(600),
        );
        let ingestor = Ingestor::new(Arc::new(sink), limiter, Arc::new(AllowAll {}));
        let liveness = HealthRegistry::new("liveness")
            .register("mqtt".to_owned(), Duration::from_secs(30))
            .await;
        let timesource = FixedTime {
            time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };

        MqttSubscriber::new(config(prefix), ingestor, Arc::new(timesource), liveness)
    }

    #[test]
    fn parses_device_topics() {
        assert_eq!(
            parse_topic("", "tenant-a/devices/dev-1/telemetry"),
            Some(DeviceTopic {
                tenant_id: "tenant-a".to_owned(),
                device_id: "dev-1".to_owned(),
            })
        );
        assert_eq!(
            parse_topic("fleet/", "fleet/tenant-a/devices/dev-1/telemetry"),
            Some(DeviceTopic {
                tenant_id: "tenant-a".to_owned(),
                device_id: "dev-1".to_owned(),
            })
        );

        assert_eq!(parse_topic("fleet/", "tenant-a/devices/dev-1/telemetry"), None);
        assert_eq!(parse_topic("", "tenant-a/devices/dev-1"), None);
        assert_eq!(parse_topic("", "tenant-a/devices/dev-1/telemetry/extra"), None);
        assert_eq!(parse_topic("", "tenant-a/gateways/dev-1/telemetry"), None);
        assert_eq!(parse_topic("", "/devices//telemetry"), None);
    }

    #[test]
    fn subscription_uses_prefix() {
        assert_eq!(subscription(""), "+/devices/+/telemetry");
        assert_eq!(subscription("fleet/"), "fleet/+/devices/+/telemetry");
    }

    #[tokio::test]
    async fn publishes_are_ingested() {
        let sink = MemorySink::default();
        let subscriber = subscriber(sink.clone(), "").await;

        subscriber
            .handle_publish("tenant-a/devices/dev-1/telemetry", br#"[{"battery": 1}, {"battery": 2}]"#)
            .await;
        subscriber
            .handle_publish("not/a/device/topic", br#"{"battery": 3}"#)
            .await;

        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), 2);
        assert!(envelopes.iter().all(|e| e.protocol == Protocol::Mqtt));
        assert!(envelopes.iter().all(|e| e.tenant_id == "tenant-a"));
    }

    #[tokio::test]
    async fn malformed_publishes_are_forwarded() {
        let sink = MemorySink::default();
        let subscriber = subscriber(sink.clone(), "").await;

        subscriber
            .handle_publish("tenant-a/devices/dev-1/telemetry", b"\xff\xfe")
            .await;

        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert!(envelopes[0].malformed);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let subscriber = subscriber(MemorySink::default(), "").await;
        let token = CancellationToken::new();
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), subscriber.run(token))
            .await
            .expect("subscriber did not stop");
    }
}
