use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metamorph_core::{Clock, Source};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::payload_hash;

/// Most recent raw payload for one source. At most one per source; a refresh
/// overwrites it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawCacheRecord {
    pub source: Source,
    pub payload: JsonValue,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
    pub content_hash: String,
}

impl RawCacheRecord {
    /// Age at `now`; a clock that moved backwards counts as zero age.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Cached payload was younger than the TTL; no fetch happened.
    Hit,
    Refreshed { payload_changed: bool },
    /// Fetch failed and the previous payload was served instead.
    Stale { reason: String },
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub record: RawCacheRecord,
    pub outcome: CacheOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("{source_kind} source unavailable and nothing cached: {reason}")]
    SourceUnavailable { source_kind: Source, reason: String },
}

type Slot = Arc<Mutex<Option<RawCacheRecord>>>;

/// Per-source TTL cache in front of the source adapters.
///
/// Each source has its own slot lock, held across the fetch, so two callers
/// refreshing the same source never fetch twice while different sources
/// refresh in parallel.
pub struct FreshnessCache {
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<Source, Slot>>,
}

impl fmt::Debug for FreshnessCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreshnessCache").finish_non_exhaustive()
    }
}

impl FreshnessCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, source: Source) -> Slot {
        let mut slots = self.slots.lock().await;
        slots.entry(source).or_default().clone()
    }

    pub async fn peek(&self, source: Source) -> Option<RawCacheRecord> {
        self.slot(source).await.lock().await.clone()
    }

    /// Return the cached record for `source` if it is younger than `ttl`,
    /// otherwise call `fetch_fn` and store its payload.
    ///
    /// A failed fetch falls back to the stale record when one exists; with
    /// nothing cached it fails with [`CacheError::SourceUnavailable`].
    pub async fn get_or_refresh<F, Fut, E>(
        &self,
        source: Source,
        ttl: Duration,
        fetch_fn: F,
    ) -> Result<CacheLookup, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JsonValue, E>>,
        E: fmt::Display,
    {
        let slot = self.slot(source).await;
        let mut cached = slot.lock().await;

        if let Some(record) = cached.as_ref() {
            let age = record.age_at(self.clock.now());
            if age < ttl {
                debug!(%source, age_secs = age.as_secs(), "raw payload cache hit");
                return Ok(CacheLookup {
                    record: record.clone(),
                    outcome: CacheOutcome::Hit,
                });
            }
        }

        match fetch_fn().await {
            Ok(payload) => {
                let content_hash = payload_hash(&payload);
                let payload_changed = cached
                    .as_ref()
                    .map_or(true, |previous| previous.content_hash != content_hash);
                let record = RawCacheRecord {
                    source,
                    payload,
                    fetched_at: self.clock.now(),
                    ttl,
                    content_hash,
                };
                *cached = Some(record.clone());
                Ok(CacheLookup {
                    record,
                    outcome: CacheOutcome::Refreshed { payload_changed },
                })
            }
            Err(err) => {
                let reason = err.to_string();
                match cached.as_ref() {
                    Some(stale) => {
                        warn!(%source, %reason, "source refresh failed; serving stale payload");
                        Ok(CacheLookup {
                            record: stale.clone(),
                            outcome: CacheOutcome::Stale { reason },
                        })
                    }
                    None => Err(CacheError::SourceUnavailable {
                        source_kind: source,
                        reason,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use metamorph_core::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
        ))
    }

    async fn ok_payload(calls: &AtomicUsize, payload: JsonValue) -> Result<JsonValue, String> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(payload)
    }

    #[tokio::test]
    async fn fresh_record_is_served_without_fetching() {
        let clock = clock();
        let cache = FreshnessCache::new(clock.clone());
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_refresh(Source::Product, TEN_MINUTES, || ok_payload(&calls, json!([1])))
            .await
            .unwrap();
        assert_eq!(first.outcome, CacheOutcome::Refreshed { payload_changed: true });

        clock.advance(ChronoDuration::minutes(1));
        let second = cache
            .get_or_refresh(Source::Product, TEN_MINUTES, || ok_payload(&calls, json!([2])))
            .await
            .unwrap();

        assert_eq!(second.outcome, CacheOutcome::Hit);
        assert_eq!(second.record, first.record);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn record_at_exactly_ttl_is_refreshed() {
        let clock = clock();
        let cache = FreshnessCache::new(clock.clone());
        let calls = AtomicUsize::new(0);

        cache
            .get_or_refresh(Source::User, TEN_MINUTES, || ok_payload(&calls, json!({"results": []})))
            .await
            .unwrap();
        clock.advance(ChronoDuration::minutes(10));
        let lookup = cache
            .get_or_refresh(Source::User, TEN_MINUTES, || ok_payload(&calls, json!({"results": []})))
            .await
            .unwrap();

        assert_eq!(lookup.outcome, CacheOutcome::Refreshed { payload_changed: false });
        assert_eq!(lookup.record.fetched_at, clock.now());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_serves_stale_record() {
        let clock = clock();
        let cache = FreshnessCache::new(clock.clone());
        let calls = AtomicUsize::new(0);

        let original = cache
            .get_or_refresh(Source::Transaction, TEN_MINUTES, || ok_payload(&calls, json!([{"id": 1}])))
            .await
            .unwrap();
        clock.advance(ChronoDuration::minutes(11));

        let lookup = cache
            .get_or_refresh(Source::Transaction, TEN_MINUTES, || async {
                Err::<JsonValue, _>("connection refused")
            })
            .await
            .unwrap();

        assert_eq!(
            lookup.outcome,
            CacheOutcome::Stale {
                reason: "connection refused".to_string()
            }
        );
        assert_eq!(lookup.record, original.record);
    }

    #[tokio::test]
    async fn failed_fetch_with_empty_cache_is_unavailable() {
        let cache = FreshnessCache::new(clock());
        let err = cache
            .get_or_refresh(Source::Product, TEN_MINUTES, || async {
                Err::<JsonValue, _>("dns failure")
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CacheError::SourceUnavailable {
                source_kind: Source::Product,
                reason: "dns failure".to_string()
            }
        );
        assert!(cache.peek(Source::Product).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_refreshes_of_one_source_fetch_once() {
        let cache = FreshnessCache::new(clock());
        let calls = AtomicUsize::new(0);

        let (a, b) = tokio::join!(
            cache.get_or_refresh(Source::Product, TEN_MINUTES, || ok_payload(&calls, json!([1]))),
            cache.get_or_refresh(Source::Product, TEN_MINUTES, || ok_payload(&calls, json!([1]))),
        );

        assert_eq!(a.unwrap().record.payload, json!([1]));
        assert_eq!(b.unwrap().record.payload, json!([1]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
