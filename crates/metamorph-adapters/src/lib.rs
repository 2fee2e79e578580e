//! Source adapter contracts, the three source adapters and the normalizer.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metamorph_core::{EntityData, EntityType, Source};
use metamorph_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

mod normalizer;
mod sources;

pub use normalizer::{normalize_payload, normalize_record, NormalizedBatch};
pub use sources::{ProductAdapter, TransactionAdapter, UserAdapter};

pub const CRATE_NAME: &str = "metamorph-adapters";

/// Where an adapter reads its raw payload from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Http(String),
    /// Local JSON file, read instead of calling the network.
    File(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Http(url) => f.write_str(url),
            Endpoint::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("{source_kind} source unavailable: {reason}")]
    SourceUnavailable { source_kind: Source, reason: String },
    #[error("unexpected {source_kind} payload shape: {reason}")]
    PayloadShape { source_kind: Source, reason: String },
}

/// One raw record that could not be mapped to a canonical entity.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("malformed {entity_type} record{}: {reason}", .external_id.as_deref().map(|id| format!(" {id}")).unwrap_or_default())]
pub struct MalformedRecord {
    pub entity_type: EntityType,
    pub external_id: Option<String>,
    pub reason: String,
}

impl MalformedRecord {
    pub fn new(entity_type: EntityType, external_id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            entity_type,
            external_id,
            reason: reason.into(),
        }
    }
}

/// Source-native identifier plus the canonical field mapping of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub external_id: String,
    pub data: EntityData,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Provider name recorded as `metadata.source`.
    fn source_name(&self) -> &'static str;

    fn endpoint(&self) -> &Endpoint;

    /// One network call (or file read) returning the opaque payload.
    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<JsonValue, AdapterError> {
        fetch_endpoint(self.source(), self.endpoint(), http, ctx).await
    }

    fn extract_records(&self, payload: &JsonValue) -> Result<Vec<JsonValue>, AdapterError>;

    fn map_to_canonical(&self, record: &JsonValue) -> Result<CanonicalRecord, MalformedRecord>;
}

pub async fn fetch_endpoint(
    source: Source,
    endpoint: &Endpoint,
    http: &HttpFetcher,
    ctx: &AdapterContext,
) -> Result<JsonValue, AdapterError> {
    let fetched = match endpoint {
        Endpoint::Http(url) => http
            .fetch_json(ctx.run_id, source, url)
            .await
            .map_err(anyhow::Error::from),
        Endpoint::File(path) => load_json_payload(path).await,
    };
    fetched.map_err(|err| AdapterError::SourceUnavailable {
        source_kind: source,
        reason: format!("{err:#}"),
    })
}

pub async fn load_json_payload(path: impl AsRef<Path>) -> Result<JsonValue> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Static adapter selection by source.
pub fn adapter_for_source(source: Source, endpoint: Endpoint) -> Box<dyn SourceAdapter> {
    match source {
        Source::Product => Box::new(ProductAdapter::new(endpoint)),
        Source::User => Box::new(UserAdapter::new(endpoint)),
        Source::Transaction => Box::new(TransactionAdapter::new(endpoint)),
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)?.as_str().and_then(text_or_none)
}

/// Identifier that may arrive as a JSON number or string.
pub(crate) fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric field that may arrive as a JSON number or a numeric string.
/// `Some(Err(..))` means the field is present but unusable.
pub(crate) fn json_decimal(value: &JsonValue, path: &[&str]) -> Option<Result<f64, String>> {
    let raw = json_at(value, path)?;
    let parsed = match raw {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().trim_start_matches('$').parse::<f64>().ok(),
        _ => None,
    };
    Some(match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(format!("`{}` is not a number: {raw}", path.join("."))),
    })
}

pub(crate) fn first_of<T>(
    value: &JsonValue,
    paths: &[&[&str]],
    extract: impl Fn(&JsonValue, &[&str]) -> Option<T>,
) -> Option<T> {
    paths.iter().find_map(|path| extract(value, *path))
}

pub(crate) fn insert_opt(data: &mut EntityData, key: &str, value: Option<String>) {
    if let Some(value) = value {
        data.insert(key.to_string(), JsonValue::String(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_id_accepts_numbers_and_strings() {
        let record = json!({"id": 42, "uuid": " abc ", "empty": "", "obj": {}});
        assert_eq!(json_id(&record, &["id"]).as_deref(), Some("42"));
        assert_eq!(json_id(&record, &["uuid"]).as_deref(), Some("abc"));
        assert_eq!(json_id(&record, &["empty"]), None);
        assert_eq!(json_id(&record, &["obj"]), None);
        assert_eq!(json_id(&record, &["missing"]), None);
    }

    #[test]
    fn json_decimal_parses_strings_and_flags_garbage() {
        let record = json!({"a": 9.5, "b": "22.3", "c": "$4", "d": "n/a", "e": null});
        assert_eq!(json_decimal(&record, &["a"]), Some(Ok(9.5)));
        assert_eq!(json_decimal(&record, &["b"]), Some(Ok(22.3)));
        assert_eq!(json_decimal(&record, &["c"]), Some(Ok(4.0)));
        assert!(matches!(json_decimal(&record, &["d"]), Some(Err(_))));
        assert_eq!(json_decimal(&record, &["e"]), None);
    }

    #[test]
    fn malformed_record_message_names_the_record() {
        let err = MalformedRecord::new(EntityType::Transaction, Some("t-9".into()), "missing amount");
        assert_eq!(err.to_string(), "malformed transaction record t-9: missing amount");
        let anonymous = MalformedRecord::new(EntityType::User, None, "missing id");
        assert_eq!(anonymous.to_string(), "malformed user record: missing id");
    }

    #[tokio::test]
    async fn missing_fixture_file_is_source_unavailable() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        let ctx = AdapterContext {
            run_id: Uuid::nil(),
            requested_at: Utc::now(),
        };
        let err = fetch_endpoint(
            Source::User,
            &Endpoint::File(PathBuf::from("/definitely/not/here.json")),
            &http,
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::SourceUnavailable { source_kind: Source::User, .. }));
    }
}
