//! Schema lookup against the external registry, with a TTL cache that keeps
//! serving the last known good schema while the registry is unavailable.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SchemaClientConfig;
use crate::envelope::TelemetryEnvelope;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(alias = "schemaId")]
    pub schema_id: String,
    #[serde(alias = "schemaVersion")]
    pub version: i32,
    /// JSON Schema document
    pub definition: Value,
}

impl SchemaDefinition {
    /// Top-level property names declared by the definition.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.definition
            .get("properties")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|properties| properties.keys().map(String::as_str))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SchemaLookup {
    Device(String),
    DeviceType(String),
}

impl SchemaLookup {
    pub fn for_envelope(envelope: &TelemetryEnvelope) -> Self {
        match &envelope.device_type_id {
            Some(device_type) => SchemaLookup::DeviceType(device_type.clone()),
            None => SchemaLookup::Device(envelope.device_id.clone()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("schema registry unavailable: {0}")]
    Unavailable(String),
    #[error("schema registry returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl LookupError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LookupError::Unavailable(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Resolved {
    Found {
        schema: Arc<SchemaDefinition>,
        stale: bool,
    },
    NotFound,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ResolveOptions {
    /// Ignore cached NotFound answers, used when reprocessing dead letters
    pub bypass_negative_cache: bool,
}

#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// `Ok(None)` means the registry has no schema assigned.
    async fn fetch(&self, lookup: &SchemaLookup) -> Result<Option<SchemaDefinition>, LookupError>;

    /// Every registered schema, used to compute assignment suggestions.
    async fn list_schemas(&self) -> Result<Vec<SchemaDefinition>, LookupError>;
}

pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LookupError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| LookupError::InvalidResponse(format!("invalid registry url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(LookupError::InvalidResponse(format!(
                "registry url cannot be a base: {base_url}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("telemetry-schema-client")
            .build()
            .map_err(|e| LookupError::InvalidResponse(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    fn url_for(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get(&self, url: Url) -> Result<Option<reqwest::Response>, LookupError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LookupError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                Err(LookupError::Unavailable(format!("registry answered {status}")))
            }
            status => Err(LookupError::InvalidResponse(format!(
                "registry answered {status}"
            ))),
        }
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn fetch(&self, lookup: &SchemaLookup) -> Result<Option<SchemaDefinition>, LookupError> {
        let url = match lookup {
            SchemaLookup::Device(id) => self.url_for(&["devices", id, "schema"]),
            SchemaLookup::DeviceType(id) => self.url_for(&["device-types", id, "schema"]),
        };
        let Some(response) = self.get(url).await? else {
            return Ok(None);
        };
        let schema = response
            .json::<SchemaDefinition>()
            .await
            .map_err(|e| LookupError::InvalidResponse(e.to_string()))?;
        Ok(Some(schema))
    }

    async fn list_schemas(&self) -> Result<Vec<SchemaDefinition>, LookupError> {
        let Some(response) = self.get(self.url_for(&["schemas"])).await? else {
            return Ok(Vec::new());
        };
        response
            .json::<Vec<SchemaDefinition>>()
            .await
            .map_err(|e| LookupError::InvalidResponse(e.to_string()))
    }
}

#[derive(Clone)]
enum CachedValue {
    Found(Arc<SchemaDefinition>),
    NotFound,
}

#[derive(Clone)]
struct CacheEntry {
    value: CachedValue,
    fetched_at: Instant,
    /// Set on every hit; only entries used since their last fetch are refreshed.
    used: Arc<AtomicBool>,
}

const DEFAULT_CACHE_CAPACITY: u64 = 100_000;
const DEFAULT_CACHE_IDLE: Duration = Duration::from_secs(3600);

fn lookup_cache(capacity: u64, idle: Duration) -> moka::sync::Cache<SchemaLookup, CacheEntry> {
    moka::sync::Cache::builder()
        .max_capacity(capacity)
        .time_to_idle(idle)
        .build()
}

struct CatalogEntry {
    schemas: Arc<Vec<SchemaDefinition>>,
    fetched_at: Instant,
}

pub struct SchemaLookupClient {
    registry: Arc<dyn SchemaRegistry>,
    cache: moka::sync::Cache<SchemaLookup, CacheEntry>,
    catalog: RwLock<Option<CatalogEntry>>,
    ttl: Duration,
    negative_ttl: Duration,
    refresh_interval: Duration,
}

impl SchemaLookupClient {
    pub fn new(
        registry: Arc<dyn SchemaRegistry>,
        ttl: Duration,
        negative_ttl: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            registry,
            cache: lookup_cache(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_IDLE),
            catalog: RwLock::new(None),
            ttl,
            negative_ttl,
            refresh_interval,
        }
    }

    pub fn from_config(
        config: &SchemaClientConfig,
        registry: Arc<dyn SchemaRegistry>,
    ) -> Self {
        Self::new(
            registry,
            Duration::from_secs(config.schema_cache_ttl_secs),
            Duration::from_secs(config.schema_negative_ttl_secs),
            Duration::from_secs(config.schema_refresh_interval_secs),
        )
        .with_limits(
            config.schema_cache_capacity,
            Duration::from_secs(config.schema_cache_idle_secs),
        )
    }

    /// Bounds the lookup cache by entry count and drops lookups idle for `idle`.
    pub fn with_limits(mut self, capacity: u64, idle: Duration) -> Self {
        self.cache = lookup_cache(capacity, idle);
        self
    }

    pub fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    fn cached(&self, lookup: &SchemaLookup) -> Option<CacheEntry> {
        self.cache.get(lookup)
    }

    fn store(&self, lookup: SchemaLookup, value: CachedValue) {
        self.cache.insert(
            lookup,
            CacheEntry {
                value,
                fetched_at: Instant::now(),
                used: Arc::new(AtomicBool::new(false)),
            },
        );
    }

    pub async fn resolve(
        &self,
        lookup: &SchemaLookup,
        options: ResolveOptions,
    ) -> Result<Resolved, LookupError> {
        let cached = self.cached(lookup);
        if let Some(entry) = &cached {
            let age = entry.fetched_at.elapsed();
            match &entry.value {
                CachedValue::Found(schema) if age < self.ttl => {
                    entry.used.store(true, Ordering::Relaxed);
                    counter!("telemetry_schema_cache_hits_total").increment(1);
                    return Ok(Resolved::Found {
                        schema: schema.clone(),
                        stale: false,
                    });
                }
                CachedValue::NotFound
                    if age < self.negative_ttl && !options.bypass_negative_cache =>
                {
                    counter!("telemetry_schema_cache_hits_total").increment(1);
                    return Ok(Resolved::NotFound);
                }
                _ => {}
            }
        }
        counter!("telemetry_schema_cache_misses_total").increment(1);

        match self.registry.fetch(lookup).await {
            Ok(Some(schema)) => {
                let schema = Arc::new(schema);
                self.store(lookup.clone(), CachedValue::Found(schema.clone()));
                Ok(Resolved::Found {
                    schema,
                    stale: false,
                })
            }
            Ok(None) => {
                self.store(lookup.clone(), CachedValue::NotFound);
                Ok(Resolved::NotFound)
            }
            Err(error) if error.is_transient() => match cached.map(|entry| entry.value) {
                Some(CachedValue::Found(schema)) => {
                    warn!("serving stale schema for {:?}: {}", lookup, error);
                    counter!("telemetry_schema_stale_served_total").increment(1);
                    Ok(Resolved::Found {
                        schema,
                        stale: true,
                    })
                }
                _ => Err(error),
            },
            Err(error) => Err(error),
        }
    }

    /// Registered schemas, cached with the same TTL as lookups.
    pub async fn list_candidates(&self) -> Result<Arc<Vec<SchemaDefinition>>, LookupError> {
        let cached = {
            let catalog = self
                .catalog
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            catalog
                .as_ref()
                .map(|entry| (entry.schemas.clone(), entry.fetched_at.elapsed() < self.ttl))
        };
        if let Some((schemas, true)) = &cached {
            return Ok(schemas.clone());
        }

        match self.registry.list_schemas().await {
            Ok(schemas) => {
                let schemas = Arc::new(schemas);
                *self
                    .catalog
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(CatalogEntry {
                    schemas: schemas.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(schemas)
            }
            Err(error) if error.is_transient() => match cached {
                Some((schemas, _)) => Ok(schemas),
                None => Err(error),
            },
            Err(error) => Err(error),
        }
    }

    /// Re-fetches schemas that were used since their last fetch and expire before the
    /// next refresh tick, so hot devices rarely see a cache miss on the validation path.
    /// Expired negative entries are dropped.
    pub async fn refresh_expiring(&self) -> usize {
        let horizon = self.ttl.saturating_sub(self.refresh_interval);
        let mut expiring = Vec::new();
        for (lookup, entry) in self.cache.iter() {
            let age = entry.fetched_at.elapsed();
            match entry.value {
                CachedValue::Found(_)
                    if age >= horizon && entry.used.load(Ordering::Relaxed) =>
                {
                    expiring.push((*lookup).clone());
                }
                CachedValue::NotFound if age >= self.negative_ttl => {
                    self.cache.invalidate(lookup.as_ref());
                }
                _ => {}
            }
        }

        let mut refreshed = 0;
        for lookup in expiring {
            match self.registry.fetch(&lookup).await {
                Ok(Some(schema)) => {
                    self.store(lookup, CachedValue::Found(Arc::new(schema)));
                    refreshed += 1;
                }
                Ok(None) => {
                    self.store(lookup, CachedValue::NotFound);
                    refreshed += 1;
                }
                // Keep the last known good entry around for the stale fallback
                Err(error) => debug!("schema refresh failed for {:?}: {}", lookup, error),
            }
        }
        refreshed
    }

    pub async fn refresh_loop(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("schema refresh loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    let refreshed = self.refresh_expiring().await;
                    gauge!("telemetry_schema_cache_entries").set(self.cached_entries() as f64);
                    if refreshed > 0 {
                        debug!("refreshed {} cached schemas", refreshed);
                    }
                }
            }
        }
    }
}
