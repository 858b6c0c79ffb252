//! Per-envelope validation against the schema resolved for its device.
//!
//! An envelope moves through `Received -> SchemaResolved -> Valid | Invalid`.
//! Expected failures are `Rejection` values carrying a category and a
//! field-addressable `ValidationResult`; nothing here is an infrastructure error.
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use jsonschema::error::ValidationErrorKind as SchemaErrorKind;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::envelope::TelemetryEnvelope;
use crate::retry::RetryPolicy;
use crate::schema::{
    LookupError, ResolveOptions, Resolved, SchemaDefinition, SchemaLookup, SchemaLookupClient,
};
use crate::values::{FieldMap, FieldValue};

const MAX_SUGGESTIONS: usize = 3;
const MAX_ACTUAL_LEN: usize = 64;

/// Progress of one envelope through validation, reported in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationStage {
    Received,
    SchemaResolved,
    Valid,
    Invalid,
}

impl ValidationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStage::Received => "received",
            ValidationStage::SchemaResolved => "schema_resolved",
            ValidationStage::Valid => "valid",
            ValidationStage::Invalid => "invalid",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "error_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    SchemaValidation,
    ParsingError,
    StorageError,
    Timeout,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::SchemaValidation => "schema_validation",
            ErrorCategory::ParsingError => "parsing_error",
            ErrorCategory::StorageError => "storage_error",
            ErrorCategory::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schema_validation" => Ok(ErrorCategory::SchemaValidation),
            "parsing_error" => Ok(ErrorCategory::ParsingError),
            "storage_error" => Ok(ErrorCategory::StorageError),
            "timeout" => Ok(ErrorCategory::Timeout),
            invalid => Err(format!("{invalid} is not a valid error category")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorKind {
    MissingRequired,
    TypeMismatch,
    ConstraintViolation,
    NoSchemaAssigned,
    NotAnObject,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field_path: String,
    pub kind: FieldErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaSuggestion {
    pub candidate_schema_id: String,
    pub score: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub schema_id: Option<String>,
    pub schema_version: Option<i32>,
    #[serde(default)]
    pub stale_schema: bool,
    #[serde(default)]
    pub errors: Vec<FieldError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confidence_suggestions: Vec<SchemaSuggestion>,
}

impl ValidationResult {
    /// Short human-readable digest, used in outcome events and error messages.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{} {:?}", e.field_path, e.kind))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// An envelope that passed validation, with its parsed fields.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedRecord {
    pub fields: FieldMap,
    pub validation: ValidationResult,
}

/// Why an envelope cannot reach the time-series store.
#[derive(Clone, Debug, PartialEq)]
pub struct Rejection {
    pub category: ErrorCategory,
    pub message: String,
    pub validation: ValidationResult,
}

impl Rejection {
    pub fn parsing(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::ParsingError,
            message: message.into(),
            validation: ValidationResult::default(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Timeout,
            message: message.into(),
            validation: ValidationResult::default(),
        }
    }

    pub fn storage(message: impl Into<String>, validation: ValidationResult) -> Self {
        Self {
            category: ErrorCategory::StorageError,
            message: message.into(),
            validation,
        }
    }

    fn schema(validation: ValidationResult) -> Self {
        let message = match validation.errors.first() {
            Some(first) if validation.errors.len() == 1 => {
                format!("{} at {}", kind_label(first.kind), first.field_path)
            }
            Some(first) => format!(
                "{} at {} and {} more",
                kind_label(first.kind),
                first.field_path,
                validation.errors.len() - 1
            ),
            None => "payload failed schema validation".to_owned(),
        };
        Self {
            category: ErrorCategory::SchemaValidation,
            message,
            validation,
        }
    }
}

fn kind_label(kind: FieldErrorKind) -> &'static str {
    match kind {
        FieldErrorKind::MissingRequired => "missing required field",
        FieldErrorKind::TypeMismatch => "type mismatch",
        FieldErrorKind::ConstraintViolation => "constraint violated",
        FieldErrorKind::NoSchemaAssigned => "no schema assigned",
        FieldErrorKind::NotAnObject => "payload is not an object",
    }
}

pub struct Validator {
    schemas: Arc<SchemaLookupClient>,
    compiled: moka::sync::Cache<(String, i32), Arc<jsonschema::Validator>>,
    lookup_policy: RetryPolicy,
}

impl Validator {
    pub fn new(
        schemas: Arc<SchemaLookupClient>,
        lookup_policy: RetryPolicy,
        compiled_capacity: u64,
    ) -> Self {
        Self {
            schemas,
            compiled: moka::sync::Cache::new(compiled_capacity),
            lookup_policy,
        }
    }

    pub fn schemas(&self) -> &Arc<SchemaLookupClient> {
        &self.schemas
    }

    pub async fn validate(
        &self,
        envelope: &mut TelemetryEnvelope,
        options: ResolveOptions,
    ) -> Result<ValidatedRecord, Rejection> {
        let start = Instant::now();
        let result = self.run(envelope, options).await;
        histogram!("telemetry_validation_duration_seconds").record(start.elapsed().as_secs_f64());

        let (stage, outcome) = match &result {
            Ok(_) => (ValidationStage::Valid, "valid"),
            Err(rejection) => (ValidationStage::Invalid, rejection.category.as_str()),
        };
        debug!(
            envelope_id = %envelope.envelope_id,
            stage = stage.as_str(),
            "validation finished with {}",
            outcome
        );
        counter!("telemetry_validation_outcomes_total", "outcome" => outcome).increment(1);
        result
    }

    async fn run(
        &self,
        envelope: &mut TelemetryEnvelope,
        options: ResolveOptions,
    ) -> Result<ValidatedRecord, Rejection> {
        debug!(
            envelope_id = %envelope.envelope_id,
            stage = ValidationStage::Received.as_str(),
            "validating envelope"
        );
        if envelope.malformed {
            return Err(Rejection::parsing("payload is not well-formed JSON"));
        }
        let payload: Value = serde_json::from_slice(&envelope.raw_payload)
            .map_err(|e| Rejection::parsing(format!("payload is not well-formed JSON: {e}")))?;
        let payload_kind = json_kind(&payload);
        let Value::Object(object) = payload else {
            return Err(Rejection::schema(ValidationResult {
                errors: vec![FieldError {
                    field_path: "$".to_owned(),
                    kind: FieldErrorKind::NotAnObject,
                    expected: Some("object".to_owned()),
                    actual: Some(payload_kind.to_owned()),
                }],
                ..Default::default()
            }));
        };

        let lookup = SchemaLookup::for_envelope(envelope);
        let resolved = self.resolve_with_budget(envelope, &lookup, options).await?;
        debug!(
            envelope_id = %envelope.envelope_id,
            stage = ValidationStage::SchemaResolved.as_str(),
            "resolved {:?}",
            lookup
        );

        match resolved {
            Resolved::NotFound => Err(self.unassigned(&envelope.device_id, &object).await),
            Resolved::Found { schema, stale } => {
                let validation = self.check(&schema, stale, &object)?;
                if !validation.is_valid {
                    return Err(Rejection::schema(validation));
                }
                let fields = object
                    .into_iter()
                    .map(|(key, value)| (key, FieldValue::from(value)))
                    .collect();
                Ok(ValidatedRecord { fields, validation })
            }
        }
    }

    async fn resolve_with_budget(
        &self,
        envelope: &mut TelemetryEnvelope,
        lookup: &SchemaLookup,
        options: ResolveOptions,
    ) -> Result<Resolved, Rejection> {
        let schemas = &self.schemas;
        let mut retries = 0;
        let counter = &mut retries;
        let result = self
            .lookup_policy
            .run("schema lookup", LookupError::is_transient, move |attempt| {
                if attempt > 1 {
                    *counter += 1;
                }
                schemas.resolve(lookup, options)
            })
            .await;
        envelope.attempt_count += retries;

        result.map_err(|exhausted| {
            warn!(
                "schema lookup for device {} failed after {} attempts: {}",
                envelope.device_id, exhausted.attempts, exhausted.error
            );
            Rejection::timeout(format!(
                "schema lookup failed after {} attempts: {}",
                exhausted.attempts, exhausted.error
            ))
        })
    }

    async fn unassigned(&self, device_id: &str, object: &Map<String, Value>) -> Rejection {
        let mut errors = vec![FieldError {
            field_path: "$".to_owned(),
            kind: FieldErrorKind::NoSchemaAssigned,
            expected: None,
            actual: None,
        }];
        if object.is_empty() {
            errors.push(FieldError {
                field_path: "$".to_owned(),
                kind: FieldErrorKind::ConstraintViolation,
                expected: Some("at least one field".to_owned()),
                actual: Some("{}".to_owned()),
            });
        }

        let confidence_suggestions = match self.schemas.list_candidates().await {
            Ok(candidates) => suggest_schemas(object.keys().map(String::as_str), &candidates),
            Err(e) => {
                debug!("no schema suggestions for device {}: {}", device_id, e);
                Vec::new()
            }
        };

        Rejection::schema(ValidationResult {
            is_valid: false,
            errors,
            confidence_suggestions,
            ..Default::default()
        })
    }

    fn compiled(&self, schema: &SchemaDefinition) -> Result<Arc<jsonschema::Validator>, Rejection> {
        let key = (schema.schema_id.clone(), schema.version);
        if let Some(validator) = self.compiled.get(&key) {
            return Ok(validator);
        }
        let validator = jsonschema::Validator::new(&schema.definition).map_err(|e| {
            Rejection::schema(ValidationResult {
                schema_id: Some(schema.schema_id.clone()),
                schema_version: Some(schema.version),
                errors: vec![FieldError {
                    field_path: "$".to_owned(),
                    kind: FieldErrorKind::ConstraintViolation,
                    expected: Some("a compilable schema definition".to_owned()),
                    actual: Some(truncate(e.to_string())),
                }],
                ..Default::default()
            })
        })?;
        let validator = Arc::new(validator);
        self.compiled.insert(key, validator.clone());
        Ok(validator)
    }

    fn check(
        &self,
        schema: &SchemaDefinition,
        stale: bool,
        object: &Map<String, Value>,
    ) -> Result<ValidationResult, Rejection> {
        let validator = self.compiled(schema)?;
        let instance = Value::Object(object.clone());

        let mut errors: Vec<FieldError> = validator
            .iter_errors(&instance)
            .map(|error| {
                let pointer = error.instance_path.to_string();
                match &error.kind {
                    SchemaErrorKind::Required { property } => {
                        let property = property.as_str().map_or_else(|| property.to_string(), str::to_owned);
                        FieldError {
                            field_path: json_path(&format!("{pointer}/{}", escape_pointer(&property))),
                            kind: FieldErrorKind::MissingRequired,
                            expected: Some("present".to_owned()),
                            actual: Some("missing".to_owned()),
                        }
                    }
                    SchemaErrorKind::Type { .. } => FieldError {
                        field_path: json_path(&pointer),
                        kind: FieldErrorKind::TypeMismatch,
                        expected: schema_keyword(&schema.definition, &error.schema_path.to_string()),
                        actual: Some(json_kind(&error.instance).to_owned()),
                    },
                    _ => FieldError {
                        field_path: json_path(&pointer),
                        kind: FieldErrorKind::ConstraintViolation,
                        expected: Some(truncate(error.to_string())),
                        actual: Some(truncate(error.instance.to_string())),
                    },
                }
            })
            .collect();
        errors.sort_by(|a, b| (&a.field_path, a.kind).cmp(&(&b.field_path, b.kind)));

        Ok(ValidationResult {
            is_valid: errors.is_empty(),
            schema_id: Some(schema.schema_id.clone()),
            schema_version: Some(schema.version),
            stale_schema: stale,
            errors,
            confidence_suggestions: Vec::new(),
        })
    }
}

/// Ranks candidate schemas by the Jaccard overlap between the payload's
/// top-level keys and each schema's declared properties.
pub fn suggest_schemas<'a>(
    payload_keys: impl Iterator<Item = &'a str>,
    candidates: &[SchemaDefinition],
) -> Vec<SchemaSuggestion> {
    let payload_keys: BTreeSet<&str> = payload_keys.collect();
    if payload_keys.is_empty() {
        return Vec::new();
    }

    let mut suggestions: Vec<SchemaSuggestion> = candidates
        .iter()
        .filter_map(|candidate| {
            let properties: BTreeSet<&str> = candidate.property_names().collect();
            let shared = payload_keys.intersection(&properties).count();
            let union = payload_keys.union(&properties).count();
            (shared > 0).then(|| SchemaSuggestion {
                candidate_schema_id: candidate.schema_id.clone(),
                score: shared as f64 / union as f64,
            })
        })
        .collect();
    suggestions.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.candidate_schema_id.cmp(&b.candidate_schema_id))
    });
    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}

/// Converts a JSON pointer (`/position/lat`, `/readings/2`) into a
/// JSON-path-like string (`$.position.lat`, `$.readings[2]`).
pub fn json_path(pointer: &str) -> String {
    let mut path = String::from("$");
    for segment in pointer.split('/').skip(1) {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            path.push_str(&format!("[{segment}]"));
        } else if !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            path.push('.');
            path.push_str(&segment);
        } else {
            path.push_str(&format!("[{}]", Value::String(segment)));
        }
    }
    path
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn schema_keyword(definition: &Value, schema_pointer: &str) -> Option<String> {
    definition.pointer(schema_pointer).map(|value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_ACTUAL_LEN {
        let mut end = MAX_ACTUAL_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    }
    text
}
