use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use telemetry_common::envelope::TelemetryEnvelope;

use crate::api::IngressError;
use crate::sinks::TelemetrySink;

/// Keeps published envelopes in memory, for tests and embedding.
#[derive(Clone, Default)]
pub struct MemorySink {
    envelopes: Arc<Mutex<Vec<TelemetryEnvelope>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn envelopes(&self) -> Vec<TelemetryEnvelope> {
        self.lock().clone()
    }

    pub fn set_available(&self, available: bool) {
        *self
            .unavailable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = !available;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TelemetryEnvelope>> {
        self.envelopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), IngressError> {
        if *self
            .unavailable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            Err(IngressError::BufferUnavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn send(&self, envelope: TelemetryEnvelope) -> Result<(), IngressError> {
        self.check_available()?;
        self.lock().push(envelope);
        Ok(())
    }

    async fn send_batch(&self, envelopes: Vec<TelemetryEnvelope>) -> Result<(), IngressError> {
        self.check_available()?;
        self.lock().extend(envelopes);
        Ok(())
    }
}
