use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Payload keys probed, in order, for a device-asserted timestamp.
pub const EVENT_TIME_KEYS: [&str; 5] = ["timestamp", "ts", "eventTime", "event_time", "time"];

/// Payload keys probed for the device type used in schema resolution.
pub const DEVICE_TYPE_KEYS: [&str; 2] = ["deviceType", "device_type"];

/// Epoch values at or above this are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Http => "http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mqtt" => Ok(Protocol::Mqtt),
            "http" => Ok(Protocol::Http),
            invalid => Err(format!("{invalid} is not a valid protocol")),
        }
    }
}

/// Position of an envelope in the durable buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Who published a message and when ingress received it.
#[derive(Clone, Debug)]
pub struct IngressContext {
    pub tenant_id: String,
    pub device_id: String,
    pub device_type_id: Option<String>,
    pub protocol: Protocol,
    pub received_at: DateTime<Utc>,
}

/// The canonical unit flowing from ingress to a terminal state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub envelope_id: Uuid,
    pub device_id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type_id: Option<String>,
    pub protocol: Protocol,
    pub received_at: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
    #[serde(with = "base64_payload")]
    pub raw_payload: Vec<u8>,
    #[serde(default)]
    pub malformed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_offset: Option<SourceOffset>,
    #[serde(default)]
    pub attempt_count: i32,
}

impl TelemetryEnvelope {
    /// Builds an envelope for one well-formed JSON element of a publish.
    pub fn from_value(ctx: &IngressContext, value: &Value) -> Self {
        let object = value.as_object();
        let event_time = object
            .and_then(extract_event_time)
            .unwrap_or(ctx.received_at);
        let device_type_id = ctx
            .device_type_id
            .clone()
            .or_else(|| object.and_then(extract_device_type));

        Self {
            envelope_id: Uuid::now_v7(),
            device_id: ctx.device_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            device_type_id,
            protocol: ctx.protocol,
            received_at: ctx.received_at,
            event_time,
            // Serializing a Value cannot fail, string keys only
            raw_payload: serde_json::to_vec(value).unwrap_or_default(),
            malformed: false,
            source_offset: None,
            attempt_count: 0,
        }
    }

    /// Builds one envelope per batch element. Elements are spaced one microsecond apart
    /// on `received_at`, so those without a device timestamp keep distinct storage keys.
    pub fn from_batch(ctx: &IngressContext, elements: &[Value]) -> Vec<Self> {
        elements
            .iter()
            .enumerate()
            .map(|(index, element)| {
                let offset = Duration::microseconds(i64::try_from(index).unwrap_or(i64::MAX));
                let element_ctx = IngressContext {
                    received_at: ctx.received_at + offset,
                    ..ctx.clone()
                };
                Self::from_value(&element_ctx, element)
            })
            .collect()
    }

    /// Builds an envelope carrying input that could not be parsed at all.
    pub fn malformed(ctx: &IngressContext, raw: &[u8]) -> Self {
        Self {
            envelope_id: Uuid::now_v7(),
            device_id: ctx.device_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            device_type_id: ctx.device_type_id.clone(),
            protocol: ctx.protocol,
            received_at: ctx.received_at,
            event_time: ctx.received_at,
            raw_payload: raw.to_vec(),
            malformed: true,
            source_offset: None,
            attempt_count: 0,
        }
    }

    /// Partition key in the durable buffer.
    pub fn key(&self) -> &str {
        &self.device_id
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.raw_payload).ok()
    }
}

pub fn extract_event_time(payload: &Map<String, Value>) -> Option<DateTime<Utc>> {
    EVENT_TIME_KEYS
        .iter()
        .filter_map(|key| payload.get(*key))
        .find_map(parse_timestamp)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let epoch = n.as_i64()?;
            if epoch >= EPOCH_MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(epoch).single()
            } else {
                Utc.timestamp_opt(epoch, 0).single()
            }
        }
        _ => None,
    }
}

pub fn extract_device_type(payload: &Map<String, Value>) -> Option<String> {
    DEVICE_TYPE_KEYS
        .iter()
        .filter_map(|key| payload.get(*key))
        .find_map(|value| value.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
