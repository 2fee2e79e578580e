use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use metamorph_core::UnifiedEntity;
use serde_json::Value as JsonValue;

use crate::{AdapterError, MalformedRecord, SourceAdapter};

/// Result of normalizing one source payload.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    /// One entity per distinct `entity_id`, ordered by id.
    pub entities: Vec<UnifiedEntity>,
    pub rejected: Vec<MalformedRecord>,
}

pub fn normalize_record(
    adapter: &dyn SourceAdapter,
    record: &JsonValue,
    processed_at: DateTime<Utc>,
) -> Result<UnifiedEntity, MalformedRecord> {
    let canonical = adapter.map_to_canonical(record)?;
    Ok(UnifiedEntity::new(
        adapter.source().entity_type(),
        &canonical.external_id,
        canonical.data,
        adapter.source_name(),
        processed_at,
    ))
}

/// Normalize every record in `payload`. Malformed records are collected, not
/// propagated; repeated external ids collapse to their last occurrence.
pub fn normalize_payload(
    adapter: &dyn SourceAdapter,
    payload: &JsonValue,
    processed_at: DateTime<Utc>,
) -> Result<NormalizedBatch, AdapterError> {
    let records = adapter.extract_records(payload)?;
    let mut by_id = BTreeMap::new();
    let mut rejected = Vec::new();
    for record in &records {
        match normalize_record(adapter, record, processed_at) {
            Ok(entity) => {
                by_id.insert(entity.entity_id.clone(), entity);
            }
            Err(malformed) => rejected.push(malformed),
        }
    }
    Ok(NormalizedBatch {
        entities: by_id.into_values().collect(),
        rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Endpoint, ProductAdapter};
    use chrono::{Duration, TimeZone};
    use metamorph_core::{entity_id_for, EntityType};
    use serde_json::json;
    use std::path::PathBuf;

    fn adapter() -> ProductAdapter {
        ProductAdapter::new(Endpoint::File(PathBuf::from("unused.json")))
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap() + Duration::minutes(minutes)
    }

    #[test]
    fn normalizing_twice_yields_same_entities() {
        let payload = json!([
            {"id": 1, "title": "Backpack", "price": 109.95, "category": "men's clothing"},
            {"id": 2, "title": "Tee", "price": "22.3"}
        ]);
        let first = normalize_payload(&adapter(), &payload, at(0)).unwrap();
        let second = normalize_payload(&adapter(), &payload, at(0)).unwrap();
        assert_eq!(first.entities, second.entities);

        let later = normalize_payload(&adapter(), &payload, at(30)).unwrap();
        let ids = |b: &NormalizedBatch| b.entities.iter().map(|e| e.entity_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&later));
        assert!(first
            .entities
            .iter()
            .zip(&later.entities)
            .all(|(a, b)| a.same_content(b)));
    }

    #[test]
    fn payload_order_does_not_change_identity() {
        let forward = json!([
            {"id": 1, "title": "A", "price": 1},
            {"id": 2, "title": "B", "price": 2}
        ]);
        let reversed = json!([
            {"id": 2, "title": "B", "price": 2},
            {"id": 1, "title": "A", "price": 1}
        ]);
        let a = normalize_payload(&adapter(), &forward, at(0)).unwrap();
        let b = normalize_payload(&adapter(), &reversed, at(0)).unwrap();
        assert_eq!(a.entities, b.entities);
        assert_eq!(a.entities[0].metadata.source, "FakeStoreAPI");
    }

    #[test]
    fn malformed_records_are_counted_and_batch_continues() {
        let payload = json!([
            {"id": 1, "title": "A", "price": 1},
            {"id": 2, "title": "B", "price": "n/a"},
            {"title": "C", "price": 3}
        ]);
        let batch = normalize_payload(&adapter(), &payload, at(0)).unwrap();
        assert_eq!(batch.entities.len(), 1);
        assert_eq!(batch.rejected.len(), 2);
        assert_eq!(batch.entities[0].entity_id, entity_id_for(EntityType::Product, "1"));
        assert_eq!(batch.rejected[1].reason, "missing id");
    }

    #[test]
    fn duplicate_external_ids_collapse_to_last_occurrence() {
        let payload = json!([
            {"id": 7, "title": "Old", "price": 1},
            {"id": "7", "title": "New", "price": 1}
        ]);
        let batch = normalize_payload(&adapter(), &payload, at(0)).unwrap();
        assert_eq!(batch.entities.len(), 1);
        assert_eq!(batch.entities[0].data_str("title"), Some("New"));
    }
}
