//! Pipeline orchestration: configuration, source registry, the coordinator,
//! enrichment, parquet export and scheduled refresh.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use metamorph_adapters::Endpoint;
use metamorph_core::{AmountPolicy, ParseAmountPolicyError, Source};
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

mod coordinator;
pub mod enrichment;
pub mod export;

pub use coordinator::{
    CacheReport, CancelHandle, CoordinatorError, EnrichSummary, Operation, PipelineCoordinator,
    RefreshSummary, SourceBinding, SourceRefreshReport, SourceStatus,
};
pub use enrichment::{SkipReason, SkippedTransaction};
pub use export::{ExportSummary, ParquetManifest, ParquetManifestFile};

pub const CRATE_NAME: &str = "metamorph-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub source: Source,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    /// JSON file read instead of calling `url`; relative to the workspace root.
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl SourceEntry {
    pub fn endpoint(&self, workspace_root: &Path) -> Result<Endpoint> {
        match (&self.url, &self.fixture) {
            (Some(url), None) => Ok(Endpoint::Http(url.clone())),
            (None, Some(fixture)) => Ok(Endpoint::File(workspace_root.join(fixture))),
            (Some(_), Some(_)) => bail!("{} sets both `url` and `fixture`", self.source),
            (None, None) => bail!("{} needs a `url` or a `fixture`", self.source),
        }
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = BTreeSet::new();
        for entry in &registry.sources {
            if !seen.insert(entry.source) {
                bail!("source `{}` is registered more than once", entry.source);
            }
        }
        Ok(registry)
    }

    /// Load `sources.yaml` from the workspace root.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    /// Raw payload archive root; `None` disables archiving.
    pub artifacts_dir: Option<PathBuf>,
    pub default_ttl: Duration,
    pub http_timeout_secs: u64,
    /// Upper bound on one adapter fetch, retries included.
    pub fetch_timeout: Duration,
    pub user_agent: String,
    pub amount_policy: AmountPolicy,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub web_port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            artifacts_dir: None,
            default_ttl: Duration::from_secs(600),
            http_timeout_secs: 10,
            fetch_timeout: Duration::from_secs(30),
            user_agent: "metamorph/0.1".to_string(),
            amount_policy: AmountPolicy::default(),
            scheduler_enabled: false,
            refresh_cron: "0 */5 * * * *".to_string(),
            web_port: 8000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let amount_policy = match std::env::var("METAMORPH_AMOUNT_POLICY") {
            Ok(raw) => raw.parse().unwrap_or_else(|err: ParseAmountPolicyError| {
                warn!(%err, "ignoring METAMORPH_AMOUNT_POLICY");
                defaults.amount_policy
            }),
            Err(_) => defaults.amount_policy,
        };
        Self {
            workspace_root: std::env::var("METAMORPH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            artifacts_dir: std::env::var("METAMORPH_ARTIFACTS_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            default_ttl: env_parse("METAMORPH_DEFAULT_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            http_timeout_secs: env_parse("METAMORPH_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            fetch_timeout: env_parse("METAMORPH_FETCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            user_agent: std::env::var("METAMORPH_USER_AGENT").unwrap_or(defaults.user_agent),
            amount_policy,
            scheduler_enabled: std::env::var("METAMORPH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            refresh_cron: std::env::var("METAMORPH_REFRESH_CRON").unwrap_or(defaults.refresh_cron),
            web_port: env_parse("METAMORPH_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }
}

/// Coordinator for the environment's configuration and `sources.yaml`.
pub async fn coordinator_from_env() -> Result<PipelineCoordinator> {
    let config = PipelineConfig::from_env();
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    PipelineCoordinator::from_registry(config, &registry)
}

/// Cron job that runs a refresh followed by an enrichment on every tick.
/// Returns `None` when scheduling is disabled.
pub async fn build_scheduler(coordinator: Arc<PipelineCoordinator>) -> Result<Option<JobScheduler>> {
    if !coordinator.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = coordinator.config().refresh_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            match coordinator.run_cycle().await {
                Ok((refresh, enrich)) => info!(
                    refresh_run = %refresh.run_id,
                    enrich_run = %enrich.run_id,
                    enriched = enrich.enriched_count,
                    "scheduled cycle finished"
                ),
                Err(err @ CoordinatorError::AlreadyRunning { .. }) => {
                    warn!(error = %err, "scheduled cycle overlaps a running one; skipped")
                }
                Err(err) => error!(error = %err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_parses_fixture_and_url_entries() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source: product
    display_name: FakeStore products
    url: https://fakestoreapi.com/products
    ttl_secs: 60
  - source: user
    display_name: RandomUser people
    fixture: fixtures/users/sample/payload.json
  - source: transaction
    display_name: Orders
    enabled: false
    fixture: fixtures/transactions/sample/payload.json
"#,
        )
        .unwrap();

        let root = Path::new("/srv/metamorph");
        assert_eq!(registry.sources.len(), 3);
        assert_eq!(
            registry.sources[0].endpoint(root).unwrap(),
            Endpoint::Http("https://fakestoreapi.com/products".into())
        );
        assert_eq!(registry.sources[0].ttl_secs, Some(60));
        assert_eq!(
            registry.sources[1].endpoint(root).unwrap(),
            Endpoint::File(root.join("fixtures/users/sample/payload.json"))
        );
        assert!(registry.sources[1].enabled);
        assert!(!registry.sources[2].enabled);
    }

    #[test]
    fn registry_rejects_duplicates_and_ambiguous_endpoints() {
        let duplicate = SourceRegistry::from_yaml_str(
            r#"
sources:
  - {source: user, display_name: a, fixture: a.json}
  - {source: user, display_name: b, fixture: b.json}
"#,
        );
        assert!(duplicate.is_err());

        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - {source: product, display_name: both, url: "http://x", fixture: x.json}
  - {source: user, display_name: neither}
"#,
        )
        .unwrap();
        assert!(registry.sources[0].endpoint(Path::new(".")).is_err());
        assert!(registry.sources[1].endpoint(Path::new(".")).is_err());
    }

    #[test]
    fn unknown_source_kind_is_a_parse_error() {
        let err = SourceRegistry::from_yaml_str("sources:\n  - {source: orders, display_name: x}\n");
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn registry_loads_from_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sources.yaml"),
            "sources:\n  - {source: product, display_name: p, fixture: p.json}\n",
        )
        .unwrap();
        let registry = SourceRegistry::load(dir.path()).await.unwrap();
        assert_eq!(registry.sources[0].source, Source::Product);
        assert!(SourceRegistry::load(&dir.path().join("missing")).await.is_err());
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(600));
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
        assert_eq!(config.refresh_cron, "0 */5 * * * *");
        assert_eq!(config.amount_policy, AmountPolicy::PreferRecorded);
        assert!(config.artifacts_dir.is_none());
        assert!(!config.scheduler_enabled);
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let coordinator =
            Arc::new(PipelineCoordinator::new(PipelineConfig::default(), Vec::new()).unwrap());
        assert!(build_scheduler(coordinator).await.unwrap().is_none());
    }
}
