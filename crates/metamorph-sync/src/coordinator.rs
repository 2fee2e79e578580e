use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use metamorph_adapters::{
    adapter_for_source, normalize_payload, AdapterContext, MalformedRecord, SourceAdapter,
};
use metamorph_core::{
    Clock, EnrichedTransaction, EntityType, ProductPopularity, Source, SystemClock,
    UnifiedEntity, UserSpend,
};
use metamorph_storage::{
    CacheError, CacheLookup, CacheOutcome, EntityStore, FreshnessCache,
    HttpClientConfig, HttpFetcher, MemoryEntityStore, PayloadArchive, StoreError, UpsertOutcome,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::enrichment::{compute_insights, join_transactions, SkippedTransaction};
use crate::export::{export_snapshots, ExportSummary};
use crate::{PipelineConfig, SourceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Refresh,
    Enrich,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Refresh => f.write_str("refresh_all"),
            Operation::Enrich => f.write_str("enrich"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("{operation} is already running; retry later")]
    AlreadyRunning { operation: Operation },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    Unavailable { reason: String },
}

/// Cache state of one source after a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheReport {
    Hit,
    Refreshed { payload_changed: bool },
    Stale { reason: String },
    /// Nothing cached and the fetch failed.
    Missing,
}

impl From<CacheOutcome> for CacheReport {
    fn from(outcome: CacheOutcome) -> Self {
        match outcome {
            CacheOutcome::Hit => CacheReport::Hit,
            CacheOutcome::Refreshed { payload_changed } => CacheReport::Refreshed { payload_changed },
            CacheOutcome::Stale { reason } => CacheReport::Stale { reason },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRefreshReport {
    pub source: Source,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub cache: CacheReport,
    pub records_ingested: usize,
    pub records_rejected: usize,
    pub rejections: Vec<MalformedRecord>,
}

impl SourceRefreshReport {
    fn new(source: Source, status: SourceStatus, cache: CacheReport) -> Self {
        Self {
            source,
            status,
            cache,
            records_ingested: 0,
            records_rejected: 0,
            rejections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRefreshReport>,
    pub cancelled: bool,
}

impl RefreshSummary {
    pub fn source(&self, source: Source) -> Option<&SourceRefreshReport> {
        self.sources.iter().find(|r| r.source == source)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enriched_count: usize,
    pub skipped_count: usize,
    /// Enriched records that were already stored with identical values.
    pub unchanged_count: usize,
    pub pruned_count: usize,
    pub skipped: Vec<SkippedTransaction>,
    pub cancelled: bool,
}

/// One adapter plus the TTL its cached payload lives for.
#[derive(Clone)]
pub struct SourceBinding {
    pub adapter: Arc<dyn SourceAdapter>,
    pub ttl: Duration,
}

impl fmt::Debug for SourceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceBinding")
            .field("source", &self.adapter.source())
            .field("endpoint", self.adapter.endpoint())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Requests that in-flight operations stop at the next record boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    refresh: Arc<AtomicBool>,
    enrich: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.refresh.store(true, Ordering::SeqCst);
        self.enrich.store(true, Ordering::SeqCst);
    }
}

fn is_set(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}

/// Orchestrates the two pipeline operations over shared cache and store.
///
/// `refresh_all` and `enrich` are each guarded so a second concurrent call of
/// the same operation fails with [`CoordinatorError::AlreadyRunning`]; the two
/// operations may overlap each other.
pub struct PipelineCoordinator {
    config: PipelineConfig,
    sources: Vec<SourceBinding>,
    http: HttpFetcher,
    cache: FreshnessCache,
    store: Arc<dyn EntityStore>,
    archive: Option<PayloadArchive>,
    clock: Arc<dyn Clock>,
    refresh_gate: Mutex<()>,
    enrich_gate: Mutex<()>,
    cancel: CancelHandle,
}

impl fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("config", &self.config)
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl PipelineCoordinator {
    pub fn new(config: PipelineConfig, sources: Vec<SourceBinding>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Self {
            archive: config.artifacts_dir.clone().map(PayloadArchive::new),
            cache: FreshnessCache::new(clock.clone()),
            clock,
            http,
            store: Arc::new(MemoryEntityStore::new()),
            sources,
            config,
            refresh_gate: Mutex::new(()),
            enrich_gate: Mutex::new(()),
            cancel: CancelHandle::default(),
        })
    }

    /// Bind the registry's enabled sources to their adapters.
    pub fn from_registry(config: PipelineConfig, registry: &SourceRegistry) -> Result<Self> {
        let mut sources = Vec::new();
        for entry in registry.sources.iter().filter(|s| s.enabled) {
            let endpoint = entry
                .endpoint(&config.workspace_root)
                .with_context(|| format!("configuring {} source", entry.source))?;
            sources.push(SourceBinding {
                adapter: Arc::from(adapter_for_source(entry.source, endpoint)),
                ttl: entry
                    .ttl_secs
                    .map(Duration::from_secs)
                    .unwrap_or(config.default_ttl),
            });
        }
        Self::new(config, sources)
    }

    pub fn with_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the time source. Also resets the payload cache, which reads
    /// the same clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.cache = FreshnessCache::new(clock.clone());
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sources(&self) -> impl Iterator<Item = Source> + '_ {
        self.sources.iter().map(|b| b.adapter.source())
    }

    pub fn cache(&self) -> &FreshnessCache {
        &self.cache
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Fetch (cache-checked) every source concurrently, then normalize and
    /// upsert each payload. One failing source never stops the others.
    pub async fn refresh_all(&self) -> Result<RefreshSummary, CoordinatorError> {
        let _running = self
            .refresh_gate
            .try_lock()
            .map_err(|_| CoordinatorError::AlreadyRunning {
                operation: Operation::Refresh,
            })?;
        self.cancel.refresh.store(false, Ordering::SeqCst);

        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let span = info_span!("refresh_all", %run_id);
        async {
            let ctx = AdapterContext {
                run_id,
                requested_at: started_at,
            };
            let lookups = join_all(self.sources.iter().map(|binding| self.lookup(binding, &ctx))).await;

            let mut reports = Vec::with_capacity(lookups.len());
            for (binding, lookup) in self.sources.iter().zip(lookups) {
                reports.push(self.ingest(binding, lookup).await?);
            }

            let cancelled = is_set(&self.cancel.refresh);
            let summary = RefreshSummary {
                run_id,
                started_at,
                finished_at: self.clock.now(),
                sources: reports,
                cancelled,
            };
            info!(
                sources = summary.sources.len(),
                unavailable = summary
                    .sources
                    .iter()
                    .filter(|r| r.status != SourceStatus::Ok)
                    .count(),
                ingested = summary.sources.iter().map(|r| r.records_ingested).sum::<usize>(),
                rejected = summary.sources.iter().map(|r| r.records_rejected).sum::<usize>(),
                cancelled,
                "refresh completed"
            );
            Ok::<_, CoordinatorError>(summary)
        }
        .instrument(span)
        .await
    }

    async fn lookup(
        &self,
        binding: &SourceBinding,
        ctx: &AdapterContext,
    ) -> Result<CacheLookup, CacheError> {
        let adapter = binding.adapter.as_ref();
        let fetch_timeout = self.config.fetch_timeout;
        self.cache
            .get_or_refresh(adapter.source(), binding.ttl, || async move {
                let payload =
                    match tokio::time::timeout(fetch_timeout, adapter.fetch(&self.http, ctx)).await
                    {
                        Ok(Ok(payload)) => payload,
                        Ok(Err(err)) => return Err(err.to_string()),
                        Err(_) => {
                            return Err(format!(
                                "{} fetch timed out after {}s",
                                adapter.source(),
                                fetch_timeout.as_secs()
                            ))
                        }
                    };
                // A body of the wrong shape is a failed fetch and must not replace the cached record.
                if let Err(err) = adapter.extract_records(&payload) {
                    return Err(err.to_string());
                }
                Ok(payload)
            })
            .await
    }

    async fn ingest(
        &self,
        binding: &SourceBinding,
        lookup: Result<CacheLookup, CacheError>,
    ) -> Result<SourceRefreshReport, CoordinatorError> {
        let adapter = binding.adapter.as_ref();
        let source = adapter.source();
        let lookup = match lookup {
            Ok(lookup) => lookup,
            Err(err) => {
                warn!(%source, error = %err, "source unavailable");
                let reason = match err {
                    CacheError::SourceUnavailable { reason, .. } => reason,
                };
                return Ok(SourceRefreshReport::new(
                    source,
                    SourceStatus::Unavailable { reason },
                    CacheReport::Missing,
                ));
            }
        };

        if matches!(lookup.outcome, CacheOutcome::Refreshed { .. }) {
            self.archive_payload(source, &lookup).await;
        }

        let mut report = SourceRefreshReport::new(source, SourceStatus::Ok, lookup.outcome.into());
        if is_set(&self.cancel.refresh) {
            return Ok(report);
        }

        let batch = match normalize_payload(adapter, &lookup.record.payload, self.clock.now()) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(%source, error = %err, "payload could not be split into records");
                report.status = SourceStatus::Unavailable {
                    reason: err.to_string(),
                };
                return Ok(report);
            }
        };

        for rejected in &batch.rejected {
            warn!(%source, error = %rejected, "rejected malformed record");
        }
        report.records_rejected = batch.rejected.len();
        report.rejections = batch.rejected;

        for entity in batch.entities {
            if is_set(&self.cancel.refresh) {
                info!(%source, ingested = report.records_ingested, "refresh cancelled");
                break;
            }
            self.store.upsert_entity(entity).await?;
            report.records_ingested += 1;
        }
        Ok(report)
    }

    async fn archive_payload(&self, source: Source, lookup: &CacheLookup) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive
            .archive(source, lookup.record.fetched_at, &lookup.record.payload)
            .await
        {
            Ok(archived) => info!(
                %source,
                path = %archived.relative_path.display(),
                reused = archived.reused,
                "archived raw payload"
            ),
            Err(err) => warn!(%source, error = %format!("{err:#}"), "raw payload archive failed"),
        }
    }

    /// Join transactions against users and products, upsert the enriched
    /// records, prune ones that no longer join, and recompute insights.
    pub async fn enrich(&self) -> Result<EnrichSummary, CoordinatorError> {
        let _running = self
            .enrich_gate
            .try_lock()
            .map_err(|_| CoordinatorError::AlreadyRunning {
                operation: Operation::Enrich,
            })?;
        self.cancel.enrich.store(false, Ordering::SeqCst);

        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let span = info_span!("enrich", %run_id);
        async {
            let transactions = self.store.entities_of_type(EntityType::Transaction).await?;
            let users = self.store.entities_of_type(EntityType::User).await?;
            let products = self.store.entities_of_type(EntityType::Product).await?;
            let joined =
                join_transactions(&transactions, &users, &products, self.config.amount_policy);

            let mut enriched_count = 0;
            let mut unchanged_count = 0;
            let mut keep = BTreeSet::new();
            let mut cancelled = false;
            for record in joined.enriched {
                if is_set(&self.cancel.enrich) {
                    cancelled = true;
                    break;
                }
                keep.insert(record.transaction_id.clone());
                if self.store.upsert_enriched(record).await? == UpsertOutcome::Unchanged {
                    unchanged_count += 1;
                }
                enriched_count += 1;
            }
            cancelled |= is_set(&self.cancel.enrich);

            let mut pruned_count = 0;
            if !cancelled {
                pruned_count = self.store.retain_enriched(&keep).await?;
                let current = self.store.enriched_transactions().await?;
                self.store.replace_insights(compute_insights(&current)).await?;
            }

            let summary = EnrichSummary {
                run_id,
                started_at,
                finished_at: self.clock.now(),
                enriched_count,
                skipped_count: joined.skipped.len(),
                unchanged_count,
                pruned_count,
                skipped: joined.skipped,
                cancelled,
            };
            info!(
                enriched = summary.enriched_count,
                skipped = summary.skipped_count,
                unchanged = summary.unchanged_count,
                pruned = summary.pruned_count,
                cancelled,
                "enrichment completed"
            );
            Ok::<_, CoordinatorError>(summary)
        }
        .instrument(span)
        .await
    }

    /// `refresh_all` followed by `enrich`; what a scheduled tick runs.
    pub async fn run_cycle(&self) -> Result<(RefreshSummary, EnrichSummary), CoordinatorError> {
        let refresh = self.refresh_all().await?;
        let enrich = self.enrich().await?;
        Ok((refresh, enrich))
    }

    pub async fn query(&self, entity_type: EntityType) -> Result<Vec<UnifiedEntity>, CoordinatorError> {
        Ok(self.store.entities_of_type(entity_type).await?)
    }

    pub async fn enriched_transactions(&self) -> Result<Vec<EnrichedTransaction>, CoordinatorError> {
        Ok(self.store.enriched_transactions().await?)
    }

    /// Per-user spend as of the last completed enrichment; empty before one.
    pub async fn user_insights(&self) -> Result<Vec<UserSpend>, CoordinatorError> {
        Ok(self
            .store
            .insights()
            .await?
            .map(|s| s.user_spend)
            .unwrap_or_default())
    }

    pub async fn product_insights(&self) -> Result<ProductPopularity, CoordinatorError> {
        Ok(self
            .store
            .insights()
            .await?
            .map(|s| s.product_popularity)
            .unwrap_or_default())
    }

    /// Snapshot the enriched set and insights to parquet under the
    /// workspace's `reports/` directory.
    pub async fn export_reports(&self) -> Result<ExportSummary> {
        let enriched = self.store.enriched_transactions().await?;
        let insights = self.store.insights().await?.unwrap_or_default();
        let summary = export_snapshots(&self.config.workspace_root, Uuid::new_v4(), &enriched, &insights)?;
        info!(manifest = %summary.manifest_path, "exported parquet snapshots");
        Ok(summary)
    }
}
