use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, histogram};
use telemetry_common::envelope::TelemetryEnvelope;
use tracing::info;

use crate::api::IngressError;
use crate::sinks::TelemetrySink;

pub struct PrintSink {}

impl PrintSink {
    /// Marks the liveness component unhealthy so this sink never passes a probe.
    pub async fn new(liveness: HealthHandle) -> Self {
        liveness.report_status(health::ComponentStatus::Unhealthy).await;
        Self {}
    }
}

#[async_trait]
impl TelemetrySink for PrintSink {
    async fn send(&self, envelope: TelemetryEnvelope) -> Result<(), IngressError> {
        info!("single envelope: {:?}", envelope);
        counter!("telemetry_ingress_published_total").increment(1);

        Ok(())
    }

    async fn send_batch(&self, envelopes: Vec<TelemetryEnvelope>) -> Result<(), IngressError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of envelopes");
        let _enter = span.enter();

        histogram!("telemetry_ingress_batch_size").record(envelopes.len() as f64);
        counter!("telemetry_ingress_published_total").increment(envelopes.len() as u64);
        for envelope in envelopes {
            info!("envelope: {:?}", envelope);
        }

        Ok(())
    }
}
