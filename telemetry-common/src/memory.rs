//! In-memory implementations of the pipeline's storage and publishing seams,
//! for tests and local runs without Postgres or Kafka.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::deadletter::{
    DeadLetterError, DeadLetterFilter, DeadLetterPublisher, DeadLetterRecord, DeadLetterStore,
    Page, PageRequest,
};
use crate::events::{OutcomeSink, ValidationOutcomeEvent};
use crate::kafka::KafkaSinkError;
use crate::schema::{LookupError, SchemaDefinition, SchemaLookup, SchemaRegistry};
use crate::timeseries::{StorageError, StoredTelemetryRecord, TimeSeriesStore, WriteOutcome};
use crate::validation::Rejection;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct InMemorySchemaRegistry {
    assignments: Mutex<HashMap<SchemaLookup, SchemaDefinition>>,
    catalog: Mutex<Vec<SchemaDefinition>>,
    available: AtomicBool,
    fetches: AtomicUsize,
}

impl Default for InMemorySchemaRegistry {
    fn default() -> Self {
        Self {
            assignments: Mutex::new(HashMap::new()),
            catalog: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            fetches: AtomicUsize::new(0),
        }
    }
}

impl InMemorySchemaRegistry {
    /// Assigns `schema` to the lookup and adds it to the catalog.
    pub fn assign(&self, lookup: SchemaLookup, schema: SchemaDefinition) {
        self.register(schema.clone());
        lock(&self.assignments).insert(lookup, schema);
    }

    /// Adds `schema` to the catalog without assigning it.
    pub fn register(&self, schema: SchemaDefinition) {
        let mut catalog = lock(&self.catalog);
        catalog.retain(|existing| existing.schema_id != schema.schema_id);
        catalog.push(schema);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), LookupError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LookupError::Unavailable("registry is down".to_owned()))
        }
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn fetch(&self, lookup: &SchemaLookup) -> Result<Option<SchemaDefinition>, LookupError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(lock(&self.assignments).get(lookup).cloned())
    }

    async fn list_schemas(&self) -> Result<Vec<SchemaDefinition>, LookupError> {
        self.check_available()?;
        Ok(lock(&self.catalog).clone())
    }
}

#[derive(Default)]
pub struct InMemoryTimeSeriesStore {
    rows: Mutex<BTreeMap<(String, DateTime<Utc>), StoredTelemetryRecord>>,
    failures: Mutex<Vec<StorageError>>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
}

impl InMemoryTimeSeriesStore {
    /// Makes the next `count` upserts fail with `error`.
    pub fn fail_next(&self, count: usize, error: StorageError) {
        lock(&self.failures).extend(std::iter::repeat(error).take(count));
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn upsert_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn rows_for(&self, device_id: &str) -> Vec<StoredTelemetryRecord> {
        lock(&self.rows)
            .values()
            .filter(|row| row.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TimeSeriesStore for InMemoryTimeSeriesStore {
    async fn upsert(&self, record: &StoredTelemetryRecord) -> Result<WriteOutcome, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = lock(&self.failures).pop() {
            return Err(error);
        }

        let key = (record.device_id.clone(), record.event_time);
        Ok(match lock(&self.rows).insert(key, record.clone()) {
            None => WriteOutcome::Inserted,
            Some(_) => WriteOutcome::Updated,
        })
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    records: Mutex<BTreeMap<Uuid, DeadLetterRecord>>,
    failures: AtomicUsize,
    mark_failures: AtomicUsize,
    calls: AtomicUsize,
}

impl InMemoryDeadLetterStore {
    /// Makes the next `count` upserts fail as unavailable.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` marks or deletes fail as unavailable.
    pub fn fail_next_marks(&self, count: usize) {
        self.mark_failures.store(count, Ordering::SeqCst);
    }

    fn mark_failing(&self) -> Result<(), DeadLetterError> {
        let failing = self
            .mark_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(DeadLetterError::Unavailable("store is down".to_owned()))
        } else {
            Ok(())
        }
    }

    pub fn upsert_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<DeadLetterRecord> {
        lock(&self.records).values().cloned().collect()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn upsert(&self, record: &DeadLetterRecord) -> Result<DeadLetterRecord, DeadLetterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeadLetterError::Unavailable("store is down".to_owned()));
        }

        let mut records = lock(&self.records);
        let existing = records
            .values_mut()
            .find(|existing| existing.envelope.envelope_id == record.envelope.envelope_id);
        if let Some(existing) = existing {
            existing.envelope.attempt_count += 1;
            existing.last_retry_at = Some(Utc::now());
            existing.error_category = record.error_category;
            existing.error_message = record.error_message.clone();
            existing.validation = record.validation.clone();
            return Ok(existing.clone());
        }
        records.insert(record.id, record.clone());
        Ok(record.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DeadLetterError> {
        Ok(lock(&self.records).get(&id).cloned())
    }

    async fn list(
        &self,
        filter: &DeadLetterFilter,
        page: PageRequest,
    ) -> Result<Page<DeadLetterRecord>, DeadLetterError> {
        let mut matching: Vec<DeadLetterRecord> = lock(&self.records)
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.envelope
                .received_at
                .cmp(&a.envelope.received_at)
                .then(a.id.cmp(&b.id))
        });

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.page_size as usize)
            .collect();
        Ok(Page {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn mark_reprocessed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, DeadLetterError> {
        self.mark_failing()?;
        Ok(match lock(&self.records).get_mut(&id) {
            Some(record) if !record.reprocessed => {
                record.reprocessed = true;
                record.reprocessed_at = Some(at);
                true
            }
            _ => false,
        })
    }

    async fn record_retry_failure(
        &self,
        id: Uuid,
        rejection: &Rejection,
        at: DateTime<Utc>,
    ) -> Result<bool, DeadLetterError> {
        Ok(match lock(&self.records).get_mut(&id) {
            Some(record) => {
                record.envelope.attempt_count += 1;
                record.last_retry_at = Some(at);
                record.error_category = rejection.category;
                record.error_message = rejection.message.clone();
                record.validation = rejection.validation.clone();
                true
            }
            None => false,
        })
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<u64, DeadLetterError> {
        self.mark_failing()?;
        let mut records = lock(&self.records);
        Ok(ids.iter().filter(|id| records.remove(*id).is_some()).count() as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, DeadLetterError> {
        let mut records = lock(&self.records);
        let mut expired: Vec<(DateTime<Utc>, Uuid)> = records
            .values()
            .filter(|record| record.first_failed_at < cutoff)
            .map(|record| (record.first_failed_at, record.id))
            .collect();
        expired.sort();
        expired.truncate(limit.max(0) as usize);
        for (_, id) in &expired {
            records.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

pub struct RecordingPublisher {
    published: Mutex<Vec<Uuid>>,
    available: AtomicBool,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl RecordingPublisher {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Uuid> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl DeadLetterPublisher for RecordingPublisher {
    async fn publish(&self, record: &DeadLetterRecord) -> Result<(), KafkaSinkError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(KafkaSinkError::Unavailable("topic is down".to_owned()));
        }
        lock(&self.published).push(record.id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingOutcomeSink {
    events: Mutex<Vec<ValidationOutcomeEvent>>,
}

impl RecordingOutcomeSink {
    pub fn events(&self) -> Vec<ValidationOutcomeEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl OutcomeSink for RecordingOutcomeSink {
    async fn emit(&self, event: ValidationOutcomeEvent) {
        lock(&self.events).push(event);
    }
}
