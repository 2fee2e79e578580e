use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use metamorph_core::{EnrichedTransaction, EntityType, InsightSnapshot, UnifiedEntity};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// Incoming record matched the stored one; nothing was written.
    Unchanged,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity store backend failure: {0}")]
    Backend(String),
}

/// Persistence surface consumed by the pipeline: upsert by identity plus
/// filtered reads.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert_entity(&self, entity: UnifiedEntity) -> Result<UpsertOutcome, StoreError>;

    /// Entities of one type ordered by `entity_id`.
    async fn entities_of_type(&self, entity_type: EntityType) -> Result<Vec<UnifiedEntity>, StoreError>;

    async fn upsert_enriched(&self, record: EnrichedTransaction) -> Result<UpsertOutcome, StoreError>;

    /// Enriched transactions ordered by `transaction_id`.
    async fn enriched_transactions(&self) -> Result<Vec<EnrichedTransaction>, StoreError>;

    /// Drop enriched records whose transaction id is not in `keep`; returns
    /// how many were removed.
    async fn retain_enriched(&self, keep: &BTreeSet<String>) -> Result<usize, StoreError>;

    async fn replace_insights(&self, insights: InsightSnapshot) -> Result<(), StoreError>;

    async fn insights(&self) -> Result<Option<InsightSnapshot>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: RwLock<BTreeMap<String, UnifiedEntity>>,
    enriched: RwLock<BTreeMap<String, EnrichedTransaction>>,
    insights: RwLock<Option<InsightSnapshot>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn upsert_entity(&self, entity: UnifiedEntity) -> Result<UpsertOutcome, StoreError> {
        let mut entities = self.entities.write().await;
        let outcome = match entities.get(&entity.entity_id) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.same_content(&entity) => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Replaced,
        };
        entities.insert(entity.entity_id.clone(), entity);
        Ok(outcome)
    }

    async fn entities_of_type(&self, entity_type: EntityType) -> Result<Vec<UnifiedEntity>, StoreError> {
        let entities = self.entities.read().await;
        Ok(entities
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn upsert_enriched(&self, record: EnrichedTransaction) -> Result<UpsertOutcome, StoreError> {
        let mut enriched = self.enriched.write().await;
        let outcome = match enriched.get(&record.transaction_id) {
            None => UpsertOutcome::Inserted,
            Some(existing) if *existing == record => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Replaced,
        };
        enriched.insert(record.transaction_id.clone(), record);
        Ok(outcome)
    }

    async fn enriched_transactions(&self) -> Result<Vec<EnrichedTransaction>, StoreError> {
        Ok(self.enriched.read().await.values().cloned().collect())
    }

    async fn retain_enriched(&self, keep: &BTreeSet<String>) -> Result<usize, StoreError> {
        let mut enriched = self.enriched.write().await;
        let before = enriched.len();
        enriched.retain(|id, _| keep.contains(id));
        Ok(before - enriched.len())
    }

    async fn replace_insights(&self, insights: InsightSnapshot) -> Result<(), StoreError> {
        *self.insights.write().await = Some(insights);
        Ok(())
    }

    async fn insights(&self) -> Result<Option<InsightSnapshot>, StoreError> {
        Ok(self.insights.read().await.clone())
    }
}
