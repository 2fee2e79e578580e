//! Core domain model for the metamorph ingestion pipeline.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "metamorph-core";

/// Namespace for entity identities. Changing it re-keys every stored entity.
pub const ENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6d65_7461_6d6f_7270_6800_0000_0000_0001);

/// Canonical field mapping carried by a [`UnifiedEntity`].
pub type EntityData = JsonMap<String, JsonValue>;

/// One of the three independent upstream providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Product,
    User,
    Transaction,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Product, Source::User, Source::Transaction];

    pub fn entity_type(self) -> EntityType {
        match self {
            Source::Product => EntityType::Product,
            Source::User => EntityType::User,
            Source::Transaction => EntityType::Transaction,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.entity_type().as_str()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Product,
    User,
    Transaction,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::User => "user",
            EntityType::Transaction => "transaction",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity type `{0}`; expected product, user or transaction")]
pub struct ParseEntityTypeError(pub String);

impl FromStr for EntityType {
    type Err = ParseEntityTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "product" | "products" => Ok(EntityType::Product),
            "user" | "users" => Ok(EntityType::User),
            "transaction" | "transactions" => Ok(EntityType::Transaction),
            _ => Err(ParseEntityTypeError(s.to_string())),
        }
    }
}

/// Deterministic identity of a canonical entity.
///
/// Depends only on `(entity_type, external_id)`, so the normalizer and the
/// enrichment join derive the same id independently.
pub fn entity_id_for(entity_type: EntityType, external_id: &str) -> String {
    let name = format!("{}:{}", entity_type.as_str(), external_id.trim());
    Uuid::new_v5(&ENTITY_NAMESPACE, name.as_bytes()).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub source: String,
    pub processed_at: DateTime<Utc>,
}

/// Canonical, source-agnostic record. Serializes to the wire shape
/// `{entity_id, entity_type, timestamp, data, metadata: {source, processed_at}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedEntity {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub timestamp: DateTime<Utc>,
    pub data: EntityData,
    pub metadata: EntityMetadata,
}

impl UnifiedEntity {
    pub fn new(
        entity_type: EntityType,
        external_id: &str,
        data: EntityData,
        source: impl Into<String>,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id_for(entity_type, external_id),
            entity_type,
            timestamp: processed_at,
            data,
            metadata: EntityMetadata {
                source: source.into(),
                processed_at,
            },
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        self.data_str("external_id")
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(JsonValue::as_str)
    }

    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(JsonValue::as_f64)
    }

    /// True when both records carry the same canonical content, ignoring
    /// normalization timestamps.
    pub fn same_content(&self, other: &UnifiedEntity) -> bool {
        self.entity_id == other.entity_id
            && self.entity_type == other.entity_type
            && self.data == other.data
            && self.metadata.source == other.metadata.source
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub entity_id: String,
    pub external_id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub entity_id: String,
    pub external_id: String,
    pub title: String,
    pub category: Option<String>,
    pub price: f64,
}

/// Transaction joined against its user and product at enrichment time.
/// Keyed by the transaction's `entity_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTransaction {
    pub transaction_id: String,
    pub external_id: String,
    pub amount: Option<f64>,
    pub quantity: Option<f64>,
    pub status: Option<String>,
    pub occurred_at: Option<String>,
    pub eta: Option<String>,
    pub parcel_id: Option<String>,
    pub user: UserSnapshot,
    pub product: ProductSnapshot,
    pub line_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSpend {
    pub user_id: String,
    pub external_id: String,
    pub name: String,
    pub email: String,
    pub total_spent: f64,
    pub transaction_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPopularity {
    pub category: String,
    pub transaction_count: usize,
    pub average_transaction_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProductPopularity {
    pub product_categories: Vec<CategoryPopularity>,
    pub transaction_count: usize,
    pub average_transaction_value: f64,
}

/// Both insight views as of the last completed enrichment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InsightSnapshot {
    pub user_spend: Vec<UserSpend>,
    pub product_popularity: ProductPopularity,
}

/// Which figure is the source of truth for an enriched line total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AmountPolicy {
    /// Use the transaction's recorded amount, fall back to `price * quantity`.
    #[default]
    PreferRecorded,
    /// Use `price * quantity`, fall back to the recorded amount.
    PreferComputed,
}

impl AmountPolicy {
    pub fn line_total(self, recorded: Option<f64>, price: f64, quantity: Option<f64>) -> Option<f64> {
        let computed = quantity.map(|q| price * q);
        match self {
            AmountPolicy::PreferRecorded => recorded.or(computed),
            AmountPolicy::PreferComputed => computed.or(recorded),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown amount policy `{0}`; expected prefer_recorded or prefer_computed")]
pub struct ParseAmountPolicyError(pub String);

impl FromStr for AmountPolicy {
    type Err = ParseAmountPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prefer_recorded" | "recorded" => Ok(AmountPolicy::PreferRecorded),
            "prefer_computed" | "computed" => Ok(AmountPolicy::PreferComputed),
            _ => Err(ParseAmountPolicyError(s.to_string())),
        }
    }
}

/// Time source for timestamps and TTL comparisons.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
