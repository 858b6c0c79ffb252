//! Idempotent persistence of accepted records into `telemetry_records`, a
//! table range-partitioned by day on `event_time`.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::envelope::TelemetryEnvelope;
use crate::retry::RetryPolicy;
use crate::validation::ValidatedRecord;
use crate::values::{FieldMap, FieldValue};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Retryable(String),
    #[error("storage rejected the write: {0}")]
    Permanent(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Retryable(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        if is_transient_sqlx_error(&error) {
            StorageError::Retryable(error.to_string())
        } else {
            StorageError::Permanent(error.to_string())
        }
    }
}

/// Connection-level or contention failures that a later attempt can clear.
pub fn is_transient_sqlx_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            // connection exceptions, serialization failure, deadlock, shutdown, too many connections
            code.starts_with("08") || matches!(code.as_ref(), "40001" | "40P01" | "57P01" | "53300")
        }),
        _ => false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredTelemetryRecord {
    pub device_id: String,
    pub event_time: DateTime<Utc>,
    pub tenant_id: String,
    pub envelope_id: Uuid,
    pub schema_id: Option<String>,
    pub schema_version: Option<i32>,
    pub received_at: DateTime<Utc>,
    pub battery: Option<f64>,
    pub signal_strength: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    /// Device fields without a fixed column, plus originals a column cannot restore exactly
    pub fields: FieldMap,
}

/// Integers up to 2^53 survive the trip through a double precision column.
const MAX_EXACT_INTEGER: u64 = 1 << 53;

/// Whether `payload_fields` can rebuild this value from its column alone.
fn column_restores(value: &FieldValue) -> bool {
    match value {
        FieldValue::Integer(i) => i.unsigned_abs() <= MAX_EXACT_INTEGER,
        FieldValue::Float(f) => f.fract() != 0.0,
        _ => false,
    }
}

impl StoredTelemetryRecord {
    pub fn from_validated(envelope: &TelemetryEnvelope, record: ValidatedRecord) -> Self {
        let mut fields = record.fields;
        let mut take = |name: &str| -> Option<f64> {
            let original = fields.get(name)?;
            let value = original.as_f64()?;
            if column_restores(original) {
                fields.remove(name);
            }
            Some(value)
        };
        let battery = take("battery");
        let signal_strength = take("signal_strength");
        let latitude = take("latitude");
        let longitude = take("longitude");
        let altitude = take("altitude");

        Self {
            device_id: envelope.device_id.clone(),
            event_time: envelope.event_time,
            tenant_id: envelope.tenant_id.clone(),
            envelope_id: envelope.envelope_id,
            schema_id: record.validation.schema_id,
            schema_version: record.validation.schema_version,
            received_at: envelope.received_at,
            battery,
            signal_strength,
            latitude,
            longitude,
            altitude,
            fields,
        }
    }

    /// The device-reported fields, fixed columns included.
    pub fn payload_fields(&self) -> FieldMap {
        let mut fields = self.fields.clone();
        let columns = [
            ("battery", self.battery),
            ("signal_strength", self.signal_strength),
            ("latitude", self.latitude),
            ("longitude", self.longitude),
            ("altitude", self.altitude),
        ];
        for (name, value) in columns {
            let Some(value) = value else { continue };
            if fields.contains_key(name) {
                continue;
            }
            let value = if value.fract() == 0.0 && value.abs() <= MAX_EXACT_INTEGER as f64 {
                FieldValue::Integer(value as i64)
            } else {
                FieldValue::Float(value)
            };
            fields.insert(name.to_owned(), value);
        }
        fields
    }
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Insert, or overwrite the row with the same `(device_id, event_time)`.
    async fn upsert(&self, record: &StoredTelemetryRecord) -> Result<WriteOutcome, StorageError>;
}

#[derive(Clone)]
pub struct PgTimeSeriesStore {
    pool: PgPool,
}

impl PgTimeSeriesStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        device_id: &str,
        event_time: DateTime<Utc>,
    ) -> Result<Option<StoredTelemetryRecord>, StorageError> {
        let row = sqlx::query(
            r#"
SELECT device_id, event_time, tenant_id, envelope_id, schema_id, schema_version, received_at,
       battery, signal_strength, latitude, longitude, altitude, fields
FROM telemetry_records
WHERE device_id = $1 AND event_time = $2
            "#,
        )
        .bind(device_id)
        .bind(event_time)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    pub async fn count_for_device(&self, device_id: &str) -> Result<i64, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_records WHERE device_id = $1")
                .bind(device_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Creates the daily partitions covering `[from, from + days)`. Existing
    /// partitions are left untouched.
    pub async fn ensure_partitions(&self, from: NaiveDate, days: u32) -> Result<usize, StorageError> {
        let mut created = 0;
        for day in from.iter_days().take(days as usize) {
            let Some(next) = day.succ_opt() else {
                break;
            };
            let name = format!("telemetry_records_p{}", day.format("%Y%m%d"));
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_class WHERE relname = $1)")
                    .bind(&name)
                    .fetch_one(&self.pool)
                    .await?;
            if exists {
                continue;
            }

            // Partition bounds come from NaiveDate formatting, never from input
            let statement = format!(
                "CREATE TABLE IF NOT EXISTS {name} PARTITION OF telemetry_records \
                 FOR VALUES FROM ('{day}') TO ('{next}')"
            );
            match sqlx::query(&statement).execute(&self.pool).await {
                Ok(_) => {
                    info!("created partition {}", name);
                    created += 1;
                }
                Err(error) => {
                    // Rows already in the default partition for that day block the split
                    warn!("could not create partition {}: {}", name, error);
                }
            }
        }
        Ok(created)
    }
}

fn record_from_row(row: &PgRow) -> Result<StoredTelemetryRecord, StorageError> {
    let fields: sqlx::types::Json<FieldMap> = row.try_get("fields")?;
    Ok(StoredTelemetryRecord {
        device_id: row.try_get("device_id")?,
        event_time: row.try_get("event_time")?,
        tenant_id: row.try_get("tenant_id")?,
        envelope_id: row.try_get("envelope_id")?,
        schema_id: row.try_get("schema_id")?,
        schema_version: row.try_get("schema_version")?,
        received_at: row.try_get("received_at")?,
        battery: row.try_get("battery")?,
        signal_strength: row.try_get("signal_strength")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        altitude: row.try_get("altitude")?,
        fields: fields.0,
    })
}

#[async_trait]
impl TimeSeriesStore for PgTimeSeriesStore {
    async fn upsert(&self, record: &StoredTelemetryRecord) -> Result<WriteOutcome, StorageError> {
        let inserted: bool = sqlx::query_scalar(
            r#"
INSERT INTO telemetry_records (
    device_id, event_time, tenant_id, envelope_id, schema_id, schema_version, received_at,
    battery, signal_strength, latitude, longitude, altitude, fields, ingested_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
ON CONFLICT (device_id, event_time) DO UPDATE SET
    tenant_id = EXCLUDED.tenant_id,
    envelope_id = EXCLUDED.envelope_id,
    schema_id = EXCLUDED.schema_id,
    schema_version = EXCLUDED.schema_version,
    received_at = EXCLUDED.received_at,
    battery = EXCLUDED.battery,
    signal_strength = EXCLUDED.signal_strength,
    latitude = EXCLUDED.latitude,
    longitude = EXCLUDED.longitude,
    altitude = EXCLUDED.altitude,
    fields = EXCLUDED.fields,
    ingested_at = NOW()
RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.device_id)
        .bind(record.event_time)
        .bind(&record.tenant_id)
        .bind(record.envelope_id)
        .bind(&record.schema_id)
        .bind(record.schema_version)
        .bind(record.received_at)
        .bind(record.battery)
        .bind(record.signal_strength)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.altitude)
        .bind(sqlx::types::Json(&record.fields))
        .fetch_one(&self.pool)
        .await?;

        Ok(if inserted {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Updated
        })
    }
}

/// Wraps a store with a per-call timeout and bounded retries of transient errors.
#[derive(Clone)]
pub struct TelemetryWriter {
    store: Arc<dyn TimeSeriesStore>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl TelemetryWriter {
    pub fn new(store: Arc<dyn TimeSeriesStore>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            call_timeout,
        }
    }

    pub async fn write(&self, record: &StoredTelemetryRecord) -> Result<WriteOutcome, StorageError> {
        let result = self
            .policy
            .run("time-series write", StorageError::is_retryable, move |_| async move {
                match tokio::time::timeout(self.call_timeout, self.store.upsert(record)).await {
                    Ok(result) => result,
                    Err(_) => Err(StorageError::Retryable(format!(
                        "write timed out after {:?}",
                        self.call_timeout
                    ))),
                }
            })
            .await;

        match result {
            Ok(outcome) => {
                let label = match outcome {
                    WriteOutcome::Inserted => "inserted",
                    WriteOutcome::Updated => "updated",
                };
                counter!("telemetry_writer_upserts_total", "outcome" => label).increment(1);
                Ok(outcome)
            }
            Err(exhausted) => {
                counter!("telemetry_writer_failures_total").increment(1);
                Err(match exhausted.error {
                    StorageError::Retryable(message) => StorageError::Retryable(format!(
                        "{message} (gave up after {} attempts)",
                        exhausted.attempts
                    )),
                    permanent => permanent,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::tests::context;
    use crate::memory::InMemoryTimeSeriesStore;
    use crate::validation::ValidationResult;
    use chrono::TimeZone;
    use serde_json::json;

    fn validated(payload: serde_json::Value) -> (TelemetryEnvelope, ValidatedRecord) {
        let envelope = TelemetryEnvelope::from_value(&context("dev-1"), &payload);
        let FieldValue::Map(fields) = FieldValue::from(payload) else {
            panic!("payload must be an object");
        };
        let record = ValidatedRecord {
            fields,
            validation: ValidationResult {
                is_valid: true,
                schema_id: Some("tracker".to_owned()),
                schema_version: Some(4),
                ..Default::default()
            },
        };
        (envelope, record)
    }

    fn fast_writer(store: Arc<InMemoryTimeSeriesStore>) -> TelemetryWriter {
        let policy = RetryPolicy::build(1, Duration::from_millis(1))
            .max_attempts(3)
            .provide();
        TelemetryWriter::new(store, policy, Duration::from_millis(200))
    }

    #[test]
    fn well_known_fields_become_columns() {
        let payload = json!({
            "battery": 87,
            "signal_strength": -71.5,
            "latitude": 48.85,
            "longitude": 2.35,
            "speed": 12.5,
            "altitude": "unknown"
        });
        let (envelope, record) = validated(payload.clone());
        let stored = StoredTelemetryRecord::from_validated(&envelope, record);

        assert_eq!(stored.battery, Some(87.0));
        assert_eq!(stored.signal_strength, Some(-71.5));
        assert_eq!(stored.latitude, Some(48.85));
        assert_eq!(stored.longitude, Some(2.35));
        // non-numeric well-known names stay in the open map
        assert_eq!(stored.altitude, None);
        assert_eq!(stored.fields.len(), 2);
        assert_eq!(stored.schema_version, Some(4));

        let FieldValue::Map(original) = FieldValue::from(payload) else {
            unreachable!()
        };
        assert_eq!(stored.payload_fields(), original);
    }

    #[test]
    fn ambiguous_numbers_keep_their_original_value() {
        let payload = json!({
            "battery": 87.0,
            "signal_strength": 9_007_199_254_740_993_i64,
            "latitude": 48.85,
            "longitude": 2
        });
        let (envelope, record) = validated(payload.clone());
        let stored = StoredTelemetryRecord::from_validated(&envelope, record);

        assert_eq!(stored.battery, Some(87.0));
        assert_eq!(stored.longitude, Some(2.0));
        assert_eq!(stored.fields["battery"], FieldValue::Float(87.0));
        assert_eq!(
            stored.fields["signal_strength"],
            FieldValue::Integer(9_007_199_254_740_993)
        );
        assert!(!stored.fields.contains_key("latitude"));
        assert!(!stored.fields.contains_key("longitude"));

        let FieldValue::Map(original) = FieldValue::from(payload) else {
            unreachable!()
        };
        assert_eq!(stored.payload_fields(), original);
    }

    #[tokio::test]
    async fn same_key_converges_to_latest_write() {
        let store = Arc::new(InMemoryTimeSeriesStore::default());
        let writer = fast_writer(store.clone());
        let event_time = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();

        let (mut envelope, record) = validated(json!({"speed": 10}));
        envelope.event_time = event_time;
        let first = StoredTelemetryRecord::from_validated(&envelope, record);
        let (mut envelope, record) = validated(json!({"speed": 20}));
        envelope.event_time = event_time;
        let second = StoredTelemetryRecord::from_validated(&envelope, record);

        assert_eq!(writer.write(&first).await, Ok(WriteOutcome::Inserted));
        assert_eq!(writer.write(&second).await, Ok(WriteOutcome::Updated));
        assert_eq!(writer.write(&second).await, Ok(WriteOutcome::Updated));

        let rows = store.rows_for("dev-1");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["speed"], FieldValue::Integer(20));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let store = Arc::new(InMemoryTimeSeriesStore::default());
        store.fail_next(2, StorageError::Retryable("connection reset".to_owned()));
        let writer = fast_writer(store.clone());
        let (envelope, record) = validated(json!({"speed": 10}));

        let stored = StoredTelemetryRecord::from_validated(&envelope, record);
        assert_eq!(writer.write(&stored).await, Ok(WriteOutcome::Inserted));
        assert_eq!(store.upsert_calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let store = Arc::new(InMemoryTimeSeriesStore::default());
        store.fail_next(5, StorageError::Retryable("connection reset".to_owned()));
        let writer = fast_writer(store.clone());
        let (envelope, record) = validated(json!({"speed": 10}));

        let stored = StoredTelemetryRecord::from_validated(&envelope, record);
        let error = writer.write(&stored).await.unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(store.upsert_calls(), 3);
        assert!(store.rows_for("dev-1").is_empty());
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let store = Arc::new(InMemoryTimeSeriesStore::default());
        store.fail_next(1, StorageError::Permanent("value out of range".to_owned()));
        let writer = fast_writer(store.clone());
        let (envelope, record) = validated(json!({"speed": 10}));

        let stored = StoredTelemetryRecord::from_validated(&envelope, record);
        let error = writer.write(&stored).await.unwrap_err();
        assert!(!error.is_retryable());
        assert_eq!(store.upsert_calls(), 1);
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let store = Arc::new(InMemoryTimeSeriesStore::default());
        store.set_latency(Duration::from_secs(5));
        let policy = RetryPolicy::build(1, Duration::from_millis(1))
            .max_attempts(2)
            .provide();
        let writer = TelemetryWriter::new(store.clone(), policy, Duration::from_millis(20));
        let (envelope, record) = validated(json!({"speed": 10}));

        let stored = StoredTelemetryRecord::from_validated(&envelope, record);
        let error = writer.write(&stored).await.unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(store.upsert_calls(), 2);
    }
}
