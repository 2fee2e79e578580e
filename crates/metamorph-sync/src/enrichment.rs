//! Join of transactions against users and products, and the insight views
//! derived from the joined set.

use std::collections::{BTreeMap, HashMap};

use metamorph_core::{
    entity_id_for, AmountPolicy, CategoryPopularity, EnrichedTransaction, EntityType,
    InsightSnapshot, ProductPopularity, ProductSnapshot, UnifiedEntity, UserSnapshot, UserSpend,
};
use serde::Serialize;

/// Category bucket for products that carry none.
pub const UNCATEGORIZED: &str = "uncategorized";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// The referenced user or product is not a known entity.
    JoinMissing {
        missing_user: bool,
        missing_product: bool,
    },
    /// Neither a recorded amount nor a quantity to price.
    MissingAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTransaction {
    pub transaction_id: String,
    pub external_id: Option<String>,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinOutcome {
    pub enriched: Vec<EnrichedTransaction>,
    pub skipped: Vec<SkippedTransaction>,
}

fn user_snapshot(entity: &UnifiedEntity) -> Option<UserSnapshot> {
    Some(UserSnapshot {
        entity_id: entity.entity_id.clone(),
        external_id: entity.external_id()?.to_string(),
        name: entity.data_str("name")?.to_string(),
        email: entity.data_str("email")?.to_string(),
    })
}

fn product_snapshot(entity: &UnifiedEntity) -> Option<ProductSnapshot> {
    Some(ProductSnapshot {
        entity_id: entity.entity_id.clone(),
        external_id: entity.external_id()?.to_string(),
        title: entity.data_str("title")?.to_string(),
        category: entity.data_str("category").map(str::to_string),
        price: entity.data_f64("price")?,
    })
}

/// Lookup of joinable entities by `entity_id`. Entities missing a field the
/// snapshot needs are left out and therefore never join.
fn index_by_id<T>(
    entities: &[UnifiedEntity],
    entity_type: EntityType,
    snapshot: impl Fn(&UnifiedEntity) -> Option<T>,
) -> HashMap<&str, T> {
    entities
        .iter()
        .filter(|e| e.entity_type == entity_type)
        .filter_map(|e| snapshot(e).map(|s| (e.entity_id.as_str(), s)))
        .collect()
}

/// Join every transaction against the current users and products.
///
/// Foreign keys are resolved by recomputing `entity_id` from the external ids
/// the transaction carries. Output is ordered by `transaction_id`.
pub fn join_transactions(
    transactions: &[UnifiedEntity],
    users: &[UnifiedEntity],
    products: &[UnifiedEntity],
    policy: AmountPolicy,
) -> JoinOutcome {
    let users = index_by_id(users, EntityType::User, user_snapshot);
    let products = index_by_id(products, EntityType::Product, product_snapshot);

    let mut ordered: Vec<&UnifiedEntity> = transactions
        .iter()
        .filter(|t| t.entity_type == EntityType::Transaction)
        .collect();
    ordered.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

    let mut outcome = JoinOutcome::default();
    for tx in ordered {
        let user = tx
            .data_str("user_external_id")
            .and_then(|id| users.get(entity_id_for(EntityType::User, id).as_str()));
        let product = tx
            .data_str("product_external_id")
            .and_then(|id| products.get(entity_id_for(EntityType::Product, id).as_str()));
        let skip = |reason| SkippedTransaction {
            transaction_id: tx.entity_id.clone(),
            external_id: tx.external_id().map(str::to_string),
            reason,
        };

        let (Some(user), Some(product)) = (user, product) else {
            outcome.skipped.push(skip(SkipReason::JoinMissing {
                missing_user: user.is_none(),
                missing_product: product.is_none(),
            }));
            continue;
        };

        let amount = tx.data_f64("amount");
        let quantity = tx.data_f64("quantity");
        let Some(line_total) = policy.line_total(amount, product.price, quantity) else {
            outcome.skipped.push(skip(SkipReason::MissingAmount));
            continue;
        };

        outcome.enriched.push(EnrichedTransaction {
            transaction_id: tx.entity_id.clone(),
            external_id: tx.external_id().unwrap_or_default().to_string(),
            amount,
            quantity,
            status: tx.data_str("status").map(str::to_string),
            occurred_at: tx.data_str("occurred_at").map(str::to_string),
            eta: tx.data_str("eta").map(str::to_string),
            parcel_id: tx.data_str("parcel_id").map(str::to_string),
            user: user.clone(),
            product: product.clone(),
            line_total,
        });
    }
    outcome
}

fn average(total: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// Recompute both insight views from the full enriched set.
pub fn compute_insights(enriched: &[EnrichedTransaction]) -> InsightSnapshot {
    let mut ordered: Vec<&EnrichedTransaction> = enriched.iter().collect();
    ordered.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));

    let mut spend: BTreeMap<&str, UserSpend> = BTreeMap::new();
    let mut categories: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
    let mut overall_total = 0.0;

    for tx in &ordered {
        let entry = spend.entry(tx.user.entity_id.as_str()).or_insert_with(|| UserSpend {
            user_id: tx.user.entity_id.clone(),
            external_id: tx.user.external_id.clone(),
            name: tx.user.name.clone(),
            email: tx.user.email.clone(),
            total_spent: 0.0,
            transaction_count: 0,
        });
        entry.total_spent += tx.line_total;
        entry.transaction_count += 1;

        let category = tx.product.category.as_deref().unwrap_or(UNCATEGORIZED);
        let bucket = categories.entry(category).or_insert((0, 0.0));
        bucket.0 += 1;
        bucket.1 += tx.line_total;
        overall_total += tx.line_total;
    }

    let mut user_spend: Vec<UserSpend> = spend.into_values().collect();
    user_spend.sort_by(|a, b| {
        b.total_spent
            .total_cmp(&a.total_spent)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    let mut product_categories: Vec<CategoryPopularity> = categories
        .into_iter()
        .map(|(category, (count, total))| CategoryPopularity {
            category: category.to_string(),
            transaction_count: count,
            average_transaction_value: average(total, count),
        })
        .collect();
    product_categories.sort_by(|a, b| {
        b.transaction_count
            .cmp(&a.transaction_count)
            .then_with(|| a.category.cmp(&b.category))
    });

    InsightSnapshot {
        user_spend,
        product_popularity: ProductPopularity {
            product_categories,
            transaction_count: ordered.len(),
            average_transaction_value: average(overall_total, ordered.len()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use metamorph_core::EntityData;
    use serde_json::{json, Value as JsonValue};

    fn entity(entity_type: EntityType, external_id: &str, fields: JsonValue) -> UnifiedEntity {
        let mut data = EntityData::new();
        data.insert("external_id".into(), json!(external_id));
        if let JsonValue::Object(map) = fields {
            data.extend(map);
        }
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        UnifiedEntity::new(entity_type, external_id, data, "test", at)
    }

    fn user(id: &str, name: &str) -> UnifiedEntity {
        entity(
            EntityType::User,
            id,
            json!({"name": name, "email": format!("{id}@example.com")}),
        )
    }

    fn product(id: &str, price: f64, category: Option<&str>) -> UnifiedEntity {
        let mut fields = json!({"title": format!("Product {id}"), "price": price});
        if let Some(category) = category {
            fields["category"] = json!(category);
        }
        entity(EntityType::Product, id, fields)
    }

    fn transaction(id: &str, user: &str, product: &str, fields: JsonValue) -> UnifiedEntity {
        let mut all = json!({"user_external_id": user, "product_external_id": product});
        if let (Some(target), JsonValue::Object(extra)) = (all.as_object_mut(), fields) {
            target.extend(extra);
        }
        entity(EntityType::Transaction, id, all)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn three_transactions_one_missing_product() {
        let users = vec![user("u1", "Ada"), user("u2", "Grace")];
        let products = vec![product("p1", 10.0, Some("lamps")), product("p2", 4.0, None)];
        let transactions = vec![
            transaction("t1", "u1", "p1", json!({"quantity": 2.0})),
            transaction("t2", "u2", "p2", json!({"amount": 7.5})),
            transaction("t3", "u1", "p404", json!({"amount": 1.0})),
        ];

        let outcome =
            join_transactions(&transactions, &users, &products, AmountPolicy::PreferRecorded);
        assert_eq!(outcome.enriched.len(), 2);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].external_id.as_deref(), Some("t3"));
        assert_eq!(
            outcome.skipped[0].reason,
            SkipReason::JoinMissing {
                missing_user: false,
                missing_product: true
            }
        );

        let t1 = outcome
            .enriched
            .iter()
            .find(|e| e.external_id == "t1")
            .unwrap();
        assert!(approx(t1.line_total, 20.0));
        assert_eq!(t1.user.name, "Ada");
        assert_eq!(t1.product.category.as_deref(), Some("lamps"));
    }

    #[test]
    fn shipping_fields_carry_through_when_present() {
        let users = vec![user("u1", "Ada")];
        let products = vec![product("p1", 5.0, None)];
        let transactions = vec![
            transaction(
                "t1",
                "u1",
                "p1",
                json!({"amount": 5.0, "eta": "2026-02-22", "parcel_id": "PX-1001"}),
            ),
            transaction("t2", "u1", "p1", json!({"amount": 5.0})),
        ];
        let outcome =
            join_transactions(&transactions, &users, &products, AmountPolicy::PreferRecorded);
        let by_external: BTreeMap<_, _> = outcome
            .enriched
            .iter()
            .map(|row| (row.external_id.as_str(), row))
            .collect();
        assert_eq!(by_external["t1"].eta.as_deref(), Some("2026-02-22"));
        assert_eq!(by_external["t1"].parcel_id.as_deref(), Some("PX-1001"));
        assert_eq!(by_external["t2"].eta, None);
        assert_eq!(by_external["t2"].parcel_id, None);
    }

    #[test]
    fn missing_user_skips_exactly_one() {
        let users = vec![user("u1", "Ada")];
        let products = vec![product("p1", 3.0, None)];
        let transactions = vec![
            transaction("t1", "ghost", "p1", json!({"amount": 3.0})),
            transaction("t2", "u1", "p1", json!({"amount": 3.0})),
        ];
        let outcome =
            join_transactions(&transactions, &users, &products, AmountPolicy::PreferRecorded);
        assert_eq!(outcome.enriched.len(), 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(
            outcome.skipped[0].reason,
            SkipReason::JoinMissing {
                missing_user: true,
                missing_product: false
            }
        );
    }

    #[test]
    fn amount_policy_selects_line_total_source() {
        let users = vec![user("u1", "Ada")];
        let products = vec![product("p1", 10.0, None)];
        let transactions = vec![transaction(
            "t1",
            "u1",
            "p1",
            json!({"amount": 25.0, "quantity": 2.0}),
        )];

        let recorded =
            join_transactions(&transactions, &users, &products, AmountPolicy::PreferRecorded);
        let computed =
            join_transactions(&transactions, &users, &products, AmountPolicy::PreferComputed);
        assert!(approx(recorded.enriched[0].line_total, 25.0));
        assert!(approx(computed.enriched[0].line_total, 20.0));
    }

    #[test]
    fn unpriceable_transaction_is_skipped_not_zeroed() {
        let users = vec![user("u1", "Ada")];
        let products = vec![product("p1", 10.0, None)];
        let transactions = vec![transaction("t1", "u1", "p1", json!({}))];
        let outcome =
            join_transactions(&transactions, &users, &products, AmountPolicy::PreferRecorded);
        assert!(outcome.enriched.is_empty());
        assert_eq!(outcome.skipped[0].reason, SkipReason::MissingAmount);
    }

    #[test]
    fn empty_inputs_produce_empty_insights() {
        let outcome = join_transactions(&[], &[], &[], AmountPolicy::default());
        assert_eq!(outcome, JoinOutcome::default());
        let insights = compute_insights(&outcome.enriched);
        assert!(insights.user_spend.is_empty());
        assert!(insights.product_popularity.product_categories.is_empty());
        assert_eq!(insights.product_popularity.transaction_count, 0);
        assert_eq!(insights.product_popularity.average_transaction_value, 0.0);
    }

    #[test]
    fn insights_group_sort_and_average() {
        let users = vec![user("u1", "Ada"), user("u2", "Grace")];
        let products = vec![
            product("p1", 10.0, Some("lamps")),
            product("p2", 4.0, None),
            product("p3", 100.0, Some("desks")),
        ];
        let transactions = vec![
            transaction("t1", "u1", "p1", json!({"quantity": 1.0})),
            transaction("t2", "u1", "p1", json!({"quantity": 2.0})),
            transaction("t3", "u2", "p3", json!({"quantity": 1.0})),
            transaction("t4", "u2", "p2", json!({"quantity": 1.0})),
        ];
        let outcome =
            join_transactions(&transactions, &users, &products, AmountPolicy::PreferRecorded);
        let insights = compute_insights(&outcome.enriched);

        let names: Vec<_> = insights.user_spend.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["Grace", "Ada"]);
        assert!(approx(insights.user_spend[0].total_spent, 104.0));
        assert_eq!(insights.user_spend[1].transaction_count, 2);

        let popularity = &insights.product_popularity;
        let categories: Vec<_> = popularity
            .product_categories
            .iter()
            .map(|c| (c.category.as_str(), c.transaction_count))
            .collect();
        assert_eq!(categories, [("lamps", 2), ("desks", 1), (UNCATEGORIZED, 1)]);
        assert!(approx(popularity.product_categories[0].average_transaction_value, 15.0));
        assert_eq!(popularity.transaction_count, 4);
        assert!(approx(popularity.average_transaction_value, 134.0 / 4.0));
    }

    #[test]
    fn insights_do_not_depend_on_input_order() {
        let users = vec![user("u1", "Ada")];
        let products = vec![product("p1", 0.1, None)];
        let transactions: Vec<_> = (0..5)
            .map(|i| transaction(&format!("t{i}"), "u1", "p1", json!({"quantity": 3.0})))
            .collect();
        let outcome =
            join_transactions(&transactions, &users, &products, AmountPolicy::PreferRecorded);
        let mut reversed = outcome.enriched.clone();
        reversed.reverse();
        assert_eq!(compute_insights(&outcome.enriched), compute_insights(&reversed));
    }
}
