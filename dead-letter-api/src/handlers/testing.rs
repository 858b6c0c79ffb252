use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, Utc};
use health::HealthRegistry;
use telemetry_common::deadletter::{
    DeadLetterRecord, DeadLetterRouter, DeadLetterStore, ReprocessPolicy,
};
use telemetry_common::envelope::{IngressContext, Protocol, TelemetryEnvelope};
use telemetry_common::memory::{
    InMemoryDeadLetterStore, InMemorySchemaRegistry, InMemoryTimeSeriesStore,
    RecordingOutcomeSink, RecordingPublisher,
};
use telemetry_common::pipeline::Pipeline;
use telemetry_common::retry::RetryPolicy;
use telemetry_common::schema::SchemaLookupClient;
use telemetry_common::timeseries::TelemetryWriter;
use telemetry_common::validation::{Rejection, Validator};

use super::{app, AppState};
use crate::auth::Tokens;

fn fast_policy() -> RetryPolicy {
    RetryPolicy::build(1, Duration::from_millis(1))
        .max_attempts(3)
        .provide()
}

/// A pipeline over in-memory stores, exposed through the API router.
pub struct Harness {
    pub registry: Arc<InMemorySchemaRegistry>,
    pub rows: Arc<InMemoryTimeSeriesStore>,
    pub dead_letters: Arc<InMemoryDeadLetterStore>,
    pub outcomes: Arc<RecordingOutcomeSink>,
    pipeline: Arc<Pipeline>,
}

impl Harness {
    pub fn new() -> Self {
        let registry = Arc::new(InMemorySchemaRegistry::default());
        let rows = Arc::new(InMemoryTimeSeriesStore::default());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::default());
        let outcomes = Arc::new(RecordingOutcomeSink::default());

        let schemas = SchemaLookupClient::new(
            registry.clone(),
            Duration::from_secs(300),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        let pipeline = Pipeline::new(
            Validator::new(Arc::new(schemas), fast_policy(), 16),
            TelemetryWriter::new(rows.clone(), fast_policy(), Duration::from_millis(200)),
            DeadLetterRouter::new(
                dead_letters.clone(),
                Arc::new(RecordingPublisher::default()),
                fast_policy(),
            ),
            outcomes.clone(),
        );

        Self {
            registry,
            rows,
            dead_letters,
            outcomes,
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn app(&self, tokens: Tokens) -> Router {
        self.app_with_policy(tokens, ReprocessPolicy::Mark)
    }

    pub fn app_with_policy(&self, tokens: Tokens, policy: ReprocessPolicy) -> Router {
        let state = AppState {
            pipeline: self.pipeline.clone(),
            tokens,
            policy,
        };
        app(state, HealthRegistry::new("liveness"), None)
    }

    /// Stores a dead letter for a payload received from `device_id` at `received_at`.
    pub async fn seed(
        &self,
        device_id: &str,
        payload: serde_json::Value,
        rejection: Rejection,
        received_at: DateTime<Utc>,
    ) -> DeadLetterRecord {
        let ctx = IngressContext {
            tenant_id: "tenant-a".to_owned(),
            device_id: device_id.to_owned(),
            device_type_id: None,
            protocol: Protocol::Http,
            received_at,
        };
        let envelope = TelemetryEnvelope::from_value(&ctx, &payload);
        self.dead_letters
            .upsert(&DeadLetterRecord::new(&envelope, &rejection, Utc::now()))
            .await
            .unwrap()
    }
}
