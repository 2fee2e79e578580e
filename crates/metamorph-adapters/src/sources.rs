use metamorph_core::{EntityData, EntityType, Source};
use metamorph_storage::{canonical_json, sha256_hex};
use serde_json::{json, Value as JsonValue};

use crate::{
    first_of, insert_opt, json_decimal, json_id, json_text, AdapterError, CanonicalRecord,
    Endpoint, MalformedRecord, SourceAdapter,
};

fn records_from_array(source: Source, value: Option<&JsonValue>, what: &str) -> Result<Vec<JsonValue>, AdapterError> {
    value
        .and_then(JsonValue::as_array)
        .cloned()
        .ok_or_else(|| AdapterError::PayloadShape {
            source_kind: source,
            reason: format!("expected {what}"),
        })
}

/// Non-negative number; absent stays `None`, garbage or negative is an error.
fn non_negative(
    record: &JsonValue,
    paths: &[&[&str]],
    field: &str,
) -> Result<Option<f64>, String> {
    match first_of(record, paths, json_decimal) {
        None => Ok(None),
        Some(Err(reason)) => Err(reason),
        Some(Ok(v)) if v < 0.0 => Err(format!("{field} is negative: {v}")),
        Some(Ok(v)) => Ok(Some(v)),
    }
}

/// FakeStore-style product listing: a JSON array of products.
#[derive(Debug, Clone)]
pub struct ProductAdapter {
    endpoint: Endpoint,
}

impl ProductAdapter {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for ProductAdapter {
    fn source(&self) -> Source {
        Source::Product
    }

    fn source_name(&self) -> &'static str {
        "FakeStoreAPI"
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn extract_records(&self, payload: &JsonValue) -> Result<Vec<JsonValue>, AdapterError> {
        records_from_array(Source::Product, Some(payload), "a JSON array of products")
    }

    fn map_to_canonical(&self, record: &JsonValue) -> Result<CanonicalRecord, MalformedRecord> {
        let external_id = json_id(record, &["id"]);
        let malformed =
            |reason: String| MalformedRecord::new(EntityType::Product, external_id.clone(), reason);

        let Some(id) = external_id.clone() else {
            return Err(malformed("missing id".into()));
        };
        let title = first_of(record, &[&["title"], &["name"]], json_text)
            .ok_or_else(|| malformed("missing title".into()))?;
        let price = non_negative(record, &[&["price"]], "price")
            .map_err(malformed)?
            .ok_or_else(|| malformed("missing price".into()))?;

        let mut data = EntityData::new();
        data.insert("external_id".into(), json!(id));
        data.insert("title".into(), json!(title));
        data.insert("price".into(), json!(price));
        insert_opt(&mut data, "category", json_text(record, &["category"]));
        insert_opt(&mut data, "description", json_text(record, &["description"]));
        insert_opt(
            &mut data,
            "image_url",
            first_of(record, &[&["image"], &["image_url"]], json_text),
        );

        Ok(CanonicalRecord {
            external_id: id,
            data,
        })
    }
}

/// RandomUser-style payload: `{"results": [...]}` with nested name/login/location.
#[derive(Debug, Clone)]
pub struct UserAdapter {
    endpoint: Endpoint,
}

impl UserAdapter {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for UserAdapter {
    fn source(&self) -> Source {
        Source::User
    }

    fn source_name(&self) -> &'static str {
        "RandomUserAPI"
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn extract_records(&self, payload: &JsonValue) -> Result<Vec<JsonValue>, AdapterError> {
        let results = if payload.is_array() {
            Some(payload)
        } else {
            payload.get("results")
        };
        records_from_array(Source::User, results, "a `results` array of users")
    }

    fn map_to_canonical(&self, record: &JsonValue) -> Result<CanonicalRecord, MalformedRecord> {
        let external_id = first_of(record, &[&["login", "uuid"], &["id"]], json_id);
        let malformed =
            |reason: &str| MalformedRecord::new(EntityType::User, external_id.clone(), reason);

        let Some(id) = external_id.clone() else {
            return Err(malformed("missing login.uuid"));
        };
        let name = match (
            json_text(record, &["name", "first"]),
            json_text(record, &["name", "last"]),
        ) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(only), None) | (None, Some(only)) => Some(only),
            (None, None) => json_text(record, &["name"]),
        }
        .ok_or_else(|| malformed("missing name"))?;
        let email = json_text(record, &["email"]).ok_or_else(|| malformed("missing email"))?;

        let mut data = EntityData::new();
        data.insert("external_id".into(), json!(id));
        data.insert("name".into(), json!(name));
        data.insert("email".into(), json!(email));
        insert_opt(&mut data, "phone", json_text(record, &["phone"]));
        insert_opt(&mut data, "country", json_text(record, &["location", "country"]));
        insert_opt(
            &mut data,
            "registered_date",
            json_text(record, &["registered", "date"]),
        );

        Ok(CanonicalRecord {
            external_id: id,
            data,
        })
    }
}

/// Order feed: a JSON array of transactions referencing users and products
/// by their source-native ids.
#[derive(Debug, Clone)]
pub struct TransactionAdapter {
    endpoint: Endpoint,
}

impl TransactionAdapter {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Key for records without a native id: hash of the record's canonical JSON.
    pub fn synthesized_key(record: &JsonValue) -> String {
        sha256_hex(canonical_json(record).as_bytes())
    }
}

#[async_trait::async_trait]
impl SourceAdapter for TransactionAdapter {
    fn source(&self) -> Source {
        Source::Transaction
    }

    fn source_name(&self) -> &'static str {
        "MockarooAPI"
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn extract_records(&self, payload: &JsonValue) -> Result<Vec<JsonValue>, AdapterError> {
        records_from_array(Source::Transaction, Some(payload), "a JSON array of transactions")
    }

    fn map_to_canonical(&self, record: &JsonValue) -> Result<CanonicalRecord, MalformedRecord> {
        if !record.is_object() {
            return Err(MalformedRecord::new(
                EntityType::Transaction,
                None,
                "record is not an object",
            ));
        }
        let id = first_of(record, &[&["id"], &["transaction_id"], &["order_id"]], json_id)
            .unwrap_or_else(|| Self::synthesized_key(record));
        let malformed =
            |reason: String| MalformedRecord::new(EntityType::Transaction, Some(id.clone()), reason);

        let user_external_id = first_of(
            record,
            &[&["user_external_id"], &["user_id"], &["user_uuid"]],
            json_id,
        )
        .ok_or_else(|| malformed("missing user reference".into()))?;
        let product_external_id = first_of(
            record,
            &[&["product_external_id"], &["product_id"]],
            json_id,
        )
        .ok_or_else(|| malformed("missing product reference".into()))?;
        let amount = non_negative(record, &[&["amount"], &["total"]], "amount").map_err(malformed)?;
        let quantity = non_negative(record, &[&["quantity"], &["qty"]], "quantity").map_err(malformed)?;
        if quantity == Some(0.0) {
            return Err(malformed("quantity is zero".into()));
        }
        if amount.is_none() && quantity.is_none() {
            return Err(malformed("missing amount and quantity".into()));
        }

        let mut data = EntityData::new();
        data.insert("external_id".into(), json!(id));
        data.insert("user_external_id".into(), json!(user_external_id));
        data.insert("product_external_id".into(), json!(product_external_id));
        if let Some(amount) = amount {
            data.insert("amount".into(), json!(amount));
        }
        if let Some(quantity) = quantity {
            data.insert("quantity".into(), json!(quantity));
        }
        insert_opt(&mut data, "status", json_text(record, &["status"]));
        insert_opt(
            &mut data,
            "occurred_at",
            first_of(record, &[&["created_at"], &["timestamp"], &["occurred_at"]], json_text),
        );
        insert_opt(&mut data, "eta", json_text(record, &["eta"]));
        insert_opt(&mut data, "parcel_id", json_id(record, &["parcel_id"]));

        Ok(CanonicalRecord {
            external_id: id,
            data,
        })
    }
}
