use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::envelope::TelemetryEnvelope;
use crate::kafka::JsonProducer;
use crate::validation::{ErrorCategory, Rejection, ValidationResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStage {
    Realtime,
    Reprocess,
}

/// One validation decision, published to the monitoring stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcomeEvent {
    pub envelope_id: Uuid,
    pub device_id: String,
    pub tenant_id: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<i32>,
    pub latency_ms: u64,
    pub stage: OutcomeStage,
    pub occurred_at: DateTime<Utc>,
}

impl ValidationOutcomeEvent {
    pub fn accepted(
        envelope: &TelemetryEnvelope,
        validation: &ValidationResult,
        latency_ms: u64,
        stage: OutcomeStage,
    ) -> Self {
        Self {
            envelope_id: envelope.envelope_id,
            device_id: envelope.device_id.clone(),
            tenant_id: envelope.tenant_id.clone(),
            valid: true,
            error_category: None,
            error_summary: None,
            schema_id: validation.schema_id.clone(),
            schema_version: validation.schema_version,
            latency_ms,
            stage,
            occurred_at: Utc::now(),
        }
    }

    pub fn rejected(
        envelope: &TelemetryEnvelope,
        rejection: &Rejection,
        latency_ms: u64,
        stage: OutcomeStage,
    ) -> Self {
        Self {
            envelope_id: envelope.envelope_id,
            device_id: envelope.device_id.clone(),
            tenant_id: envelope.tenant_id.clone(),
            valid: false,
            error_category: Some(rejection.category),
            error_summary: Some(rejection.message.clone()),
            schema_id: rejection.validation.schema_id.clone(),
            schema_version: rejection.validation.schema_version,
            latency_ms,
            stage,
            occurred_at: Utc::now(),
        }
    }
}

/// Best-effort: a failed emit is logged and never affects the envelope.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn emit(&self, event: ValidationOutcomeEvent);
}

pub struct KafkaOutcomeSink {
    producer: JsonProducer,
    topic: String,
}

impl KafkaOutcomeSink {
    pub fn new(producer: JsonProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl OutcomeSink for KafkaOutcomeSink {
    async fn emit(&self, event: ValidationOutcomeEvent) {
        // Outcomes are advisory, delivery is not awaited on the processing path
        if let Err(e) = self
            .producer
            .send_detached(&self.topic, &event.device_id, &event)
        {
            counter!("telemetry_outcome_publish_failures_total").increment(1);
            warn!("failed to publish outcome for envelope {}: {}", event.envelope_id, e);
        }
    }
}

pub struct LogOutcomeSink;

#[async_trait]
impl OutcomeSink for LogOutcomeSink {
    async fn emit(&self, event: ValidationOutcomeEvent) {
        info!(
            envelope_id = %event.envelope_id,
            device_id = %event.device_id,
            valid = event.valid,
            category = event.error_category.map(|c| c.as_str()),
            latency_ms = event.latency_ms,
            "validation outcome"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::tests::context;
    use serde_json::json;

    #[test]
    fn rejected_event_serializes_category() {
        let envelope = TelemetryEnvelope::from_value(&context("dev-1"), &json!({"t": 1}));
        let event = ValidationOutcomeEvent::rejected(
            &envelope,
            &Rejection::timeout("registry down"),
            12,
            OutcomeStage::Realtime,
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["valid"], json!(false));
        assert_eq!(value["error_category"], json!("timeout"));
        assert_eq!(value["stage"], json!("realtime"));
        assert!(value.get("schema_id").is_none());
    }
}
