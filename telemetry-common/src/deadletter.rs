//! Dead letters: envelopes that could not reach the time-series store.
//!
//! Every reject is persisted with an acknowledged upsert keyed by
//! `envelope_id` before the source offset is stored, then copied to the
//! dead-letter topic on a best-effort basis.
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::envelope::{SourceOffset, TelemetryEnvelope};
use crate::kafka::{JsonProducer, KafkaSinkError};
use crate::retry::RetryPolicy;
use crate::schema::{LookupError, SchemaLookupClient};
use crate::timeseries::{is_transient_sqlx_error, WriteOutcome};
use crate::validation::{suggest_schemas, ErrorCategory, Rejection, SchemaSuggestion, ValidationResult};

pub const MAX_PAGE_SIZE: u32 = 500;
pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("invalid dead-letter row: {0}")]
    InvalidRow(String),
    #[error("dead-letter store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Registry(#[from] LookupError),
}

impl DeadLetterError {
    pub fn query(command: &str, error: sqlx::Error) -> Self {
        DeadLetterError::QueryError {
            command: command.to_owned(),
            error,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            DeadLetterError::QueryError { error, .. } => is_transient_sqlx_error(error),
            DeadLetterError::Unavailable(_) => true,
            DeadLetterError::InvalidRow(_) => false,
            DeadLetterError::Registry(error) => error.is_transient(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub envelope: TelemetryEnvelope,
    pub error_category: ErrorCategory,
    pub error_message: String,
    pub validation: ValidationResult,
    pub first_failed_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub reprocessed: bool,
    pub reprocessed_at: Option<DateTime<Utc>>,
}

impl DeadLetterRecord {
    pub fn new(envelope: &TelemetryEnvelope, rejection: &Rejection, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            envelope: envelope.clone(),
            error_category: rejection.category,
            error_message: rejection.message.clone(),
            validation: rejection.validation.clone(),
            first_failed_at: now,
            last_retry_at: None,
            reprocessed: false,
            reprocessed_at: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct DeadLetterFilter {
    pub device_id: Option<String>,
    pub category: Option<ErrorCategory>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub reprocessed: Option<bool>,
}

impl DeadLetterFilter {
    pub fn matches(&self, record: &DeadLetterRecord) -> bool {
        self.device_id
            .as_ref()
            .map_or(true, |device| &record.envelope.device_id == device)
            && self.category.map_or(true, |c| record.error_category == c)
            && self.from.map_or(true, |from| record.envelope.received_at >= from)
            && self.to.map_or(true, |to| record.envelope.received_at < to)
            && self.reprocessed.map_or(true, |r| record.reprocessed == r)
    }
}

/// 1-based page request, clamped to `MAX_PAGE_SIZE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Inserts the record, or converges on the existing one for the same
    /// `envelope_id`, bumping `attempt_count` and `last_retry_at`.
    async fn upsert(&self, record: &DeadLetterRecord) -> Result<DeadLetterRecord, DeadLetterError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DeadLetterError>;

    /// Ordered by `received_at DESC, id`.
    async fn list(
        &self,
        filter: &DeadLetterFilter,
        page: PageRequest,
    ) -> Result<Page<DeadLetterRecord>, DeadLetterError>;

    async fn mark_reprocessed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, DeadLetterError>;

    async fn record_retry_failure(
        &self,
        id: Uuid,
        rejection: &Rejection,
        at: DateTime<Utc>,
    ) -> Result<bool, DeadLetterError>;

    async fn delete(&self, ids: &[Uuid]) -> Result<u64, DeadLetterError>;

    /// Removes at most `limit` records first failed before `cutoff`.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, DeadLetterError>;
}

#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

const RECORD_COLUMNS: &str = r#"
id, envelope_id, device_id, tenant_id, device_type_id, protocol, received_at, event_time,
raw_payload, malformed, source_topic, source_partition, source_offset, attempt_count,
error_category, error_message, validation, first_failed_at, last_retry_at, reprocessed,
reprocessed_at
"#;

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    envelope_id: Uuid,
    device_id: String,
    tenant_id: String,
    device_type_id: Option<String>,
    protocol: String,
    received_at: DateTime<Utc>,
    event_time: DateTime<Utc>,
    raw_payload: Vec<u8>,
    malformed: bool,
    source_topic: Option<String>,
    source_partition: Option<i32>,
    source_offset: Option<i64>,
    attempt_count: i32,
    error_category: ErrorCategory,
    error_message: String,
    validation: sqlx::types::Json<ValidationResult>,
    first_failed_at: DateTime<Utc>,
    last_retry_at: Option<DateTime<Utc>>,
    reprocessed: bool,
    reprocessed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
    type Error = DeadLetterError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        let protocol = row.protocol.parse().map_err(DeadLetterError::InvalidRow)?;
        let source_offset = match (row.source_topic, row.source_partition, row.source_offset) {
            (Some(topic), Some(partition), Some(offset)) => Some(SourceOffset {
                topic,
                partition,
                offset,
            }),
            _ => None,
        };
        Ok(DeadLetterRecord {
            id: row.id,
            envelope: TelemetryEnvelope {
                envelope_id: row.envelope_id,
                device_id: row.device_id,
                tenant_id: row.tenant_id,
                device_type_id: row.device_type_id,
                protocol,
                received_at: row.received_at,
                event_time: row.event_time,
                raw_payload: row.raw_payload,
                malformed: row.malformed,
                source_offset,
                attempt_count: row.attempt_count,
            },
            error_category: row.error_category,
            error_message: row.error_message,
            validation: row.validation.0,
            first_failed_at: row.first_failed_at,
            last_retry_at: row.last_retry_at,
            reprocessed: row.reprocessed,
            reprocessed_at: row.reprocessed_at,
        })
    }
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a DeadLetterFilter) {
    builder.push(" WHERE TRUE");
    if let Some(device_id) = &filter.device_id {
        builder.push(" AND device_id = ").push_bind(device_id);
    }
    if let Some(category) = filter.category {
        builder.push(" AND error_category = ").push_bind(category);
    }
    if let Some(from) = filter.from {
        builder.push(" AND received_at >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        builder.push(" AND received_at < ").push_bind(to);
    }
    if let Some(reprocessed) = filter.reprocessed {
        builder.push(" AND reprocessed = ").push_bind(reprocessed);
    }
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn upsert(&self, record: &DeadLetterRecord) -> Result<DeadLetterRecord, DeadLetterError> {
        let envelope = &record.envelope;
        let offset = envelope.source_offset.as_ref();
        let query = format!(
            r#"
INSERT INTO dead_letters (
    id, envelope_id, device_id, tenant_id, device_type_id, protocol, received_at, event_time,
    raw_payload, malformed, source_topic, source_partition, source_offset, attempt_count,
    error_category, error_message, validation, first_failed_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
ON CONFLICT (envelope_id) DO UPDATE SET
    attempt_count = dead_letters.attempt_count + 1,
    last_retry_at = NOW(),
    error_category = EXCLUDED.error_category,
    error_message = EXCLUDED.error_message,
    validation = EXCLUDED.validation
RETURNING {RECORD_COLUMNS}
            "#
        );

        let row: DeadLetterRow = sqlx::query_as(&query)
            .bind(record.id)
            .bind(envelope.envelope_id)
            .bind(&envelope.device_id)
            .bind(&envelope.tenant_id)
            .bind(&envelope.device_type_id)
            .bind(envelope.protocol.as_str())
            .bind(envelope.received_at)
            .bind(envelope.event_time)
            .bind(&envelope.raw_payload)
            .bind(envelope.malformed)
            .bind(offset.map(|o| o.topic.as_str()))
            .bind(offset.map(|o| o.partition))
            .bind(offset.map(|o| o.offset))
            .bind(envelope.attempt_count)
            .bind(record.error_category)
            .bind(&record.error_message)
            .bind(sqlx::types::Json(&record.validation))
            .bind(record.first_failed_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DeadLetterError::query("INSERT", error))?;

        row.try_into()
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DeadLetterError> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM dead_letters WHERE id = $1");
        let row: Option<DeadLetterRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DeadLetterError::query("SELECT", error))?;

        row.map(DeadLetterRecord::try_from).transpose()
    }

    async fn list(
        &self,
        filter: &DeadLetterFilter,
        page: PageRequest,
    ) -> Result<Page<DeadLetterRecord>, DeadLetterError> {
        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM dead_letters");
        push_filters(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DeadLetterError::query("SELECT", error))?;

        let mut select = QueryBuilder::new(format!("SELECT {RECORD_COLUMNS} FROM dead_letters"));
        push_filters(&mut select, filter);
        select
            .push(" ORDER BY received_at DESC, id LIMIT ")
            .push_bind(i64::from(page.page_size))
            .push(" OFFSET ")
            .push_bind(page.offset());
        let rows: Vec<DeadLetterRow> = select
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| DeadLetterError::query("SELECT", error))?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(DeadLetterRecord::try_from)
                .collect::<Result<_, _>>()?,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn mark_reprocessed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, DeadLetterError> {
        let result = sqlx::query(
            "UPDATE dead_letters SET reprocessed = TRUE, reprocessed_at = $2 WHERE id = $1 AND NOT reprocessed",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|error| DeadLetterError::query("UPDATE", error))?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_retry_failure(
        &self,
        id: Uuid,
        rejection: &Rejection,
        at: DateTime<Utc>,
    ) -> Result<bool, DeadLetterError> {
        let result = sqlx::query(
            r#"
UPDATE dead_letters SET
    attempt_count = attempt_count + 1,
    last_retry_at = $2,
    error_category = $3,
    error_message = $4,
    validation = $5
WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(rejection.category)
        .bind(&rejection.message)
        .bind(sqlx::types::Json(&rejection.validation))
        .execute(&self.pool)
        .await
        .map_err(|error| DeadLetterError::query("UPDATE", error))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<u64, DeadLetterError> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|error| DeadLetterError::query("DELETE", error))?;

        Ok(result.rows_affected())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, DeadLetterError> {
        let result = sqlx::query(
            r#"
DELETE FROM dead_letters
WHERE id IN (
    SELECT id FROM dead_letters
    WHERE first_failed_at < $1
    ORDER BY first_failed_at
    LIMIT $2
)
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(|error| DeadLetterError::query("DELETE", error))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn publish(&self, record: &DeadLetterRecord) -> Result<(), KafkaSinkError>;
}

pub struct KafkaDeadLetterPublisher {
    producer: JsonProducer,
    topic: String,
}

impl KafkaDeadLetterPublisher {
    pub fn new(producer: JsonProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl DeadLetterPublisher for KafkaDeadLetterPublisher {
    async fn publish(&self, record: &DeadLetterRecord) -> Result<(), KafkaSinkError> {
        self.producer
            .send(&self.topic, &record.envelope.device_id, record)
            .await
    }
}

/// What happens to a dead letter once its envelope is stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReprocessPolicy {
    #[default]
    Mark,
    Delete,
}

impl FromStr for ReprocessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mark" => Ok(ReprocessPolicy::Mark),
            "delete" => Ok(ReprocessPolicy::Delete),
            invalid => Err(format!("{invalid} is not a valid reprocess policy")),
        }
    }
}

/// Runs a rebuilt envelope back through validation and storage.
#[async_trait]
pub trait Revalidate: Send + Sync {
    async fn revalidate(&self, envelope: &mut TelemetryEnvelope) -> Result<WriteOutcome, Rejection>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReprocessFailure {
    pub id: Uuid,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReprocessReport {
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<ReprocessFailure>,
    /// Stored, but the dead letter could not be marked or deleted. Reprocessing
    /// them again converges on the same row.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mark_pending: Vec<Uuid>,
}

enum Replayed {
    Applied,
    MarkPending,
}

pub struct DeadLetterRouter {
    store: Arc<dyn DeadLetterStore>,
    publisher: Arc<dyn DeadLetterPublisher>,
    policy: RetryPolicy,
}

impl DeadLetterRouter {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        publisher: Arc<dyn DeadLetterPublisher>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            publisher,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }

    /// Persists the reject, then copies it to the dead-letter topic. Only a
    /// persistence failure is an error.
    pub async fn reject(
        &self,
        envelope: &TelemetryEnvelope,
        rejection: &Rejection,
    ) -> Result<DeadLetterRecord, DeadLetterError> {
        let candidate = DeadLetterRecord::new(envelope, rejection, Utc::now());
        let store = &self.store;
        let candidate = &candidate;
        let record = self
            .policy
            .run("dead-letter write", DeadLetterError::is_transient, move |_| {
                store.upsert(candidate)
            })
            .await
            .map_err(|exhausted| {
                counter!("telemetry_dead_letter_write_failures_total").increment(1);
                error!(
                    "failed to persist dead letter for envelope {} after {} attempts: {}",
                    envelope.envelope_id, exhausted.attempts, exhausted.error
                );
                exhausted.error
            })?;

        counter!(
            "telemetry_dead_letters_total",
            "category" => record.error_category.as_str()
        )
        .increment(1);

        if let Err(e) = self.publisher.publish(&record).await {
            counter!("telemetry_dead_letter_publish_failures_total").increment(1);
            warn!("failed to publish dead letter {} to topic: {}", record.id, e);
        }
        Ok(record)
    }

    /// Replays stored dead letters through `pipeline`. Unknown and already
    /// reprocessed ids are reported as failures.
    pub async fn reprocess(
        &self,
        ids: &[Uuid],
        pipeline: &dyn Revalidate,
        policy: ReprocessPolicy,
    ) -> ReprocessReport {
        let mut report = ReprocessReport::default();
        for &id in ids {
            match self.reprocess_one(id, pipeline, policy).await {
                Ok(Replayed::Applied) => report.succeeded.push(id),
                Ok(Replayed::MarkPending) => {
                    report.succeeded.push(id);
                    report.mark_pending.push(id);
                }
                Err(reason) => report.failed.push(ReprocessFailure { id, reason }),
            }
        }
        info!(
            "reprocessed {} dead letters, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
        report
    }

    async fn reprocess_one(
        &self,
        id: Uuid,
        pipeline: &dyn Revalidate,
        policy: ReprocessPolicy,
    ) -> Result<Replayed, String> {
        let record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err("not found".to_owned()),
            Err(e) => return Err(e.to_string()),
        };
        if record.reprocessed {
            return Err("already reprocessed".to_owned());
        }

        let mut envelope = record.envelope;
        match pipeline.revalidate(&mut envelope).await {
            Ok(_) => {
                counter!("telemetry_dead_letters_reprocessed_total", "result" => "succeeded")
                    .increment(1);
                let store = &self.store;
                let applied = self
                    .policy
                    .run("dead-letter mark", DeadLetterError::is_transient, move |_| async move {
                        match policy {
                            ReprocessPolicy::Mark => store.mark_reprocessed(id, Utc::now()).await,
                            ReprocessPolicy::Delete => store.delete(&[id]).await.map(|n| n == 1),
                        }
                    })
                    .await;
                match applied {
                    Ok(_) => Ok(Replayed::Applied),
                    Err(exhausted) => {
                        counter!("telemetry_dead_letters_mark_pending_total").increment(1);
                        warn!(
                            "dead letter {} stored but not marked after {} attempts: {}",
                            id, exhausted.attempts, exhausted.error
                        );
                        Ok(Replayed::MarkPending)
                    }
                }
            }
            Err(rejection) => {
                counter!("telemetry_dead_letters_reprocessed_total", "result" => "failed")
                    .increment(1);
                if let Err(e) = self
                    .store
                    .record_retry_failure(id, &rejection, Utc::now())
                    .await
                {
                    warn!("failed to record retry failure for dead letter {}: {}", id, e);
                }
                Err(format!("{}: {}", rejection.category, rejection.message))
            }
        }
    }

    /// Schemas whose properties overlap the dead letter's payload keys.
    pub async fn suggestions(
        &self,
        id: Uuid,
        schemas: &SchemaLookupClient,
    ) -> Result<Option<Vec<SchemaSuggestion>>, DeadLetterError> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(None);
        };
        let payload: serde_json::Value = match serde_json::from_slice(&record.envelope.raw_payload) {
            Ok(payload) => payload,
            Err(_) => return Ok(Some(Vec::new())),
        };
        let Some(object) = payload.as_object() else {
            return Ok(Some(Vec::new()));
        };

        let candidates = schemas.list_candidates().await?;
        Ok(Some(suggest_schemas(
            object.keys().map(String::as_str),
            &candidates,
        )))
    }
}
