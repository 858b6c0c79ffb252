//! Protocol-independent ingestion: decoding, splitting a publish into envelopes,
//! admission through the rate limiter and publishing to the durable buffer.
//! The HTTP endpoint and the MQTT subscriber are thin shells around [`Ingestor`].

use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use flate2::read::GzDecoder;
use metrics::counter;
use serde_json::Value;
use telemetry_common::envelope::{IngressContext, TelemetryEnvelope};
use tracing::{debug, warn};

use crate::api::IngressError;
use crate::auth::{AuthDecision, DeviceAuthenticator};
use crate::limiter::{Admission, RateLimiter};
use crate::sinks::kafka::report_dropped;
use crate::sinks::TelemetrySink;

#[derive(Debug, PartialEq)]
pub enum Decoded {
    Body(Vec<u8>),
    /// The compressed body could not be inflated, the raw bytes are kept as is.
    Corrupt(Vec<u8>),
}

/// Inflates gzip bodies, refusing to expand beyond `max_bytes`.
pub fn decode_body(body: &[u8], gzip: bool, max_bytes: usize) -> Result<Decoded, IngressError> {
    if !gzip {
        return Ok(Decoded::Body(body.to_vec()));
    }

    let mut inflated = Vec::new();
    // One extra byte tells a body of exactly max_bytes apart from a larger one
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
    match GzDecoder::new(body).take(limit).read_to_end(&mut inflated) {
        Ok(_) if inflated.len() > max_bytes => Err(IngressError::PayloadTooLarge),
        Ok(_) => Ok(Decoded::Body(inflated)),
        Err(e) => {
            debug!("failed to inflate gzip body: {}", e);
            Ok(Decoded::Corrupt(body.to_vec()))
        }
    }
}

#[derive(Debug)]
pub enum Split {
    Envelopes(Vec<TelemetryEnvelope>),
    EmptyBatch,
}

/// Turns one publish into envelopes. Objects give one envelope, arrays one per element,
/// anything that is not JSON gives a single malformed envelope holding the raw bytes.
pub fn split(ctx: &IngressContext, payload: &[u8]) -> Split {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Array(elements)) if elements.is_empty() => Split::EmptyBatch,
        Ok(Value::Array(elements)) => {
            Split::Envelopes(TelemetryEnvelope::from_batch(ctx, &elements))
        }
        Ok(value) => Split::Envelopes(vec![TelemetryEnvelope::from_value(ctx, &value)]),
        Err(_) => Split::Envelopes(vec![TelemetryEnvelope::malformed(ctx, payload)]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: usize,
    pub rate_limited: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    sink: Arc<dyn TelemetrySink + Send + Sync>,
    limiter: RateLimiter,
    authenticator: Arc<dyn DeviceAuthenticator>,
}

impl Ingestor {
    pub fn new(
        sink: Arc<dyn TelemetrySink + Send + Sync>,
        limiter: RateLimiter,
        authenticator: Arc<dyn DeviceAuthenticator>,
    ) -> Self {
        Self {
            sink,
            limiter,
            authenticator,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn authenticate(
        &self,
        ctx: &IngressContext,
        credentials: Option<&str>,
    ) -> Result<(), IngressError> {
        match self
            .authenticator
            .authenticate(&ctx.device_id, credentials)
            .await
        {
            AuthDecision::Allow => Ok(()),
            AuthDecision::Deny => {
                counter!("telemetry_ingress_auth_denied_total", "protocol" => ctx.protocol.as_str())
                    .increment(1);
                Err(IngressError::Unauthorized)
            }
            AuthDecision::Unavailable => Err(IngressError::AuthUnavailable),
        }
    }

    /// Splits, admits and publishes one decoded publish.
    pub async fn ingest(
        &self,
        ctx: &IngressContext,
        payload: &[u8],
    ) -> Result<IngestSummary, IngressError> {
        counter!("telemetry_ingress_messages_total", "protocol" => ctx.protocol.as_str())
            .increment(1);

        match split(ctx, payload) {
            Split::Envelopes(envelopes) => self.publish(ctx, envelopes).await,
            Split::EmptyBatch => Err(IngressError::EmptyBatch),
        }
    }

    /// Forwards input that failed decoding before it could be split.
    pub async fn ingest_malformed(
        &self,
        ctx: &IngressContext,
        raw: &[u8],
    ) -> Result<IngestSummary, IngressError> {
        counter!("telemetry_ingress_messages_total", "protocol" => ctx.protocol.as_str())
            .increment(1);

        self.publish(ctx, vec![TelemetryEnvelope::malformed(ctx, raw)])
            .await
    }

    async fn publish(
        &self,
        ctx: &IngressContext,
        envelopes: Vec<TelemetryEnvelope>,
    ) -> Result<IngestSummary, IngressError> {
        let protocol = ctx.protocol.as_str();
        counter!("telemetry_ingress_envelopes_total", "protocol" => protocol)
            .increment(envelopes.len() as u64);

        let now = Instant::now();
        let total = envelopes.len();
        let admitted: Vec<TelemetryEnvelope> = envelopes
            .into_iter()
            .filter(|envelope| {
                self.limiter.admit(
                    &envelope.device_id,
                    envelope.device_type_id.as_deref(),
                    now,
                ) == Admission::Allow
            })
            .collect();
        let rate_limited = total - admitted.len();

        if rate_limited > 0 {
            counter!("telemetry_ingress_rate_limited_total", "protocol" => protocol)
                .increment(rate_limited as u64);
            debug!(
                device_id = %ctx.device_id,
                rate_limited, "dropped rate limited envelopes"
            );
        }
        if admitted.is_empty() {
            return Err(IngressError::RateLimited);
        }

        let accepted = admitted.len();
        if let Err(err) = self.sink.send_batch(admitted).await {
            if err == IngressError::BufferUnavailable {
                report_dropped("buffer_unavailable", accepted as u64);
            }
            warn!(device_id = %ctx.device_id, "failed to publish envelopes: {}", err);
            return Err(err);
        }

        counter!("telemetry_ingress_device_messages_total", "protocol" => protocol)
            .increment(accepted as u64);

        Ok(IngestSummary {
            accepted,
            rate_limited,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use serde_json::json;
    use telemetry_common::envelope::Protocol;

    use super::*;
    use crate::auth::AllowAll;
    use crate::sinks::memory::MemorySink;

    fn context() -> IngressContext {
        IngressContext {
            tenant_id: "tenant-a".to_owned(),
            device_id: "dev-1".to_owned(),
            device_type_id: None,
            protocol: Protocol::Http,
            received_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn ingestor(sink: MemorySink, limit: u32) -> Ingestor {
        let limiter = RateLimiter::new(
            limit,
            Duration::from_secs(60),
            HashMap::new(),
            Duration::from_secs(600),
        );
        Ingestor::new(Arc::new(sink), limiter, Arc::new(AllowAll {}))
    }

    #[test]
    fn splits_objects_and_arrays() {
        let ctx = context();

        match split(&ctx, br#"{"battery": 80}"#) {
            Split::Envelopes(envelopes) => {
                assert_eq!(envelopes.len(), 1);
                assert!(!envelopes[0].malformed);
            }
            Split::EmptyBatch => panic!("expected one envelope"),
        }

        match split(&ctx, br#"[{"battery": 80}, {"battery": 79}, 12]"#) {
            Split::Envelopes(envelopes) => {
                assert_eq!(envelopes.len(), 3);
                assert_eq!(envelopes[1].raw_payload, br#"{"battery":79}"#.to_vec());
                assert_eq!(envelopes[2].raw_payload, b"12".to_vec());
                assert!(envelopes.iter().all(|e| e.device_id == "dev-1"));
            }
            Split::EmptyBatch => panic!("expected three envelopes"),
        }

        assert!(matches!(split(&ctx, b"[]"), Split::EmptyBatch));
    }

    #[test]
    fn malformed_input_keeps_raw_bytes() {
        match split(&context(), b"{not json") {
            Split::Envelopes(envelopes) => {
                assert_eq!(envelopes.len(), 1);
                assert!(envelopes[0].malformed);
                assert_eq!(envelopes[0].raw_payload, b"{not json".to_vec());
            }
            Split::EmptyBatch => panic!("expected a malformed envelope"),
        }
    }

    #[test]
    fn decodes_gzip_bodies() {
        let body = br#"{"battery": 80}"#;
        assert_eq!(
            decode_body(&gzip(body), true, 1024).unwrap(),
            Decoded::Body(body.to_vec())
        );
        assert_eq!(
            decode_body(body, false, 1024).unwrap(),
            Decoded::Body(body.to_vec())
        );
        assert_eq!(
            decode_body(b"not gzip", true, 1024).unwrap(),
            Decoded::Corrupt(b"not gzip".to_vec())
        );
    }

    #[test]
    fn gzip_expansion_is_bounded() {
        let body = vec![b' '; 4096];
        assert_eq!(
            decode_body(&gzip(&body), true, 1024).unwrap_err(),
            IngressError::PayloadTooLarge
        );
        assert!(matches!(
            decode_body(&gzip(&body), true, 4096).unwrap(),
            Decoded::Body(_)
        ));
    }

    #[tokio::test]
    async fn publishes_admitted_envelopes() {
        let sink = MemorySink::default();
        let ingestor = ingestor(sink.clone(), 2);
        let payload = json!([{"battery": 1}, {"battery": 2}, {"battery": 3}]).to_string();

        let summary = ingestor.ingest(&context(), payload.as_bytes()).await.unwrap();
        assert_eq!(
            summary,
            IngestSummary {
                accepted: 2,
                rate_limited: 1
            }
        );
        assert_eq!(sink.len(), 2);
        assert_eq!(ingestor.limiter().rejected_total(), 1);

        // Everything is limited now
        assert_eq!(
            ingestor.ingest(&context(), payload.as_bytes()).await,
            Err(IngressError::RateLimited)
        );
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn batch_keeps_device_order_and_key() {
        let sink = MemorySink::default();
        let ingestor = ingestor(sink.clone(), 100);
        let payload = json!([{"seq": 1}, {"seq": 2}, {"seq": 3}, {"seq": 4}]).to_string();

        ingestor.ingest(&context(), payload.as_bytes()).await.unwrap();

        let published = sink.envelopes();
        let sequence: Vec<String> = published
            .iter()
            .map(|e| e.payload_str().unwrap().to_owned())
            .collect();
        assert_eq!(
            sequence,
            vec![r#"{"seq":1}"#, r#"{"seq":2}"#, r#"{"seq":3}"#, r#"{"seq":4}"#]
        );
        assert!(published.iter().all(|e| e.key() == "dev-1"));
    }

    #[tokio::test]
    async fn malformed_input_is_forwarded() {
        let sink = MemorySink::default();
        let ingestor = ingestor(sink.clone(), 10);

        ingestor.ingest(&context(), b"\x00\x01garbage").await.unwrap();
        let published = sink.envelopes();
        assert_eq!(published.len(), 1);
        assert!(published[0].malformed);

        // Undecodable bodies are forwarded even when the bytes happen to be JSON
        ingestor
            .ingest_malformed(&context(), br#"{"battery": 1}"#)
            .await
            .unwrap();
        let published = sink.envelopes();
        assert_eq!(published.len(), 2);
        assert!(published[1].malformed);
    }

    #[tokio::test]
    async fn empty_batches_are_refused() {
        let sink = MemorySink::default();
        let ingestor = ingestor(sink.clone(), 10);

        assert_eq!(
            ingestor.ingest(&context(), b"[]").await,
            Err(IngressError::EmptyBatch)
        );
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn unavailable_buffer_keeps_nothing() {
        let sink = MemorySink::default();
        sink.set_available(false);
        let ingestor = ingestor(sink.clone(), 10);

        assert_eq!(
            ingestor.ingest(&context(), br#"{"battery": 1}"#).await,
            Err(IngressError::BufferUnavailable)
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn buffer_outage_counts_each_envelope_once() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let sink = MemorySink::default();
                sink.set_available(false);
                let ingestor = ingestor(sink, 10);
                let payload = json!([{"battery": 1}, {"battery": 2}, {"battery": 3}]).to_string();

                assert_eq!(
                    ingestor.ingest(&context(), payload.as_bytes()).await,
                    Err(IngressError::BufferUnavailable)
                );
            });
        });

        let dropped: Vec<DebugValue> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == "telemetry_ingress_dropped_total")
            .map(|(_, _, _, value)| value)
            .collect();
        assert_eq!(dropped, vec![DebugValue::Counter(3)]);
    }
}
