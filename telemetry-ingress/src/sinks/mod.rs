use async_trait::async_trait;
use telemetry_common::envelope::TelemetryEnvelope;

use crate::api::IngressError;

pub mod kafka;
pub mod memory;
pub mod print;

#[async_trait]
pub trait TelemetrySink {
    async fn send(&self, envelope: TelemetryEnvelope) -> Result<(), IngressError>;
    async fn send_batch(&self, envelopes: Vec<TelemetryEnvelope>) -> Result<(), IngressError>;
}
