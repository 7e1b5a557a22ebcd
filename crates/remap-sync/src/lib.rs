//! Provider reconciliation runs: rotate snapshots, diff, namespace, geocode, reconcile, report.

pub mod delta;
pub mod embed;
pub mod geocode;
pub mod index;
pub mod prune;
pub mod reconcile;
pub mod reports;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use remap_adapters::{adapter_for_format, AdapterContext, AdapterError, AffiliateConfig, FeedFormat, FeedLocation};
use remap_core::{Coordinates, DeltaEntry, DeltaKind, DeltaSummary, EventRecord, MalformedRecord, ProviderTag, Snapshot};
use remap_storage::{
    ArtifactStore, CacheStats, GeocodeCache, GeocodeCacheConfig, Geocoder, HttpClientConfig, HttpFetcher,
    ResolveError, SnapshotStore, DEFAULT_MAX_ENTRIES, DEFAULT_TTL_DAYS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::delta::{compute_snapshot_delta, DeltaChange};
use crate::embed::{Embedder, EmbeddingServiceClient};
use crate::geocode::{resolve_missing_coordinates, OpenRouteGeocoder};
use crate::index::{QdrantConfig, QdrantIndex, SearchIndex};
use crate::prune::{PruneOptions, PruneReport};
use crate::reconcile::{FailedItem, ReconcileError, Reconciler, ReconcilerConfig};

pub const CRATE_NAME: &str = "remap-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub tag: ProviderTag,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub format: FeedFormat,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub feed_path: Option<PathBuf>,
    #[serde(default)]
    pub credits: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    /// Relative feed paths are resolved against `root`.
    pub fn location(&self, root: &Path) -> Result<FeedLocation> {
        match (&self.feed_url, &self.feed_path) {
            (Some(url), None) => Ok(FeedLocation::Url(url.clone())),
            (None, Some(path)) => Ok(FeedLocation::File(root.join(path))),
            (Some(_), Some(_)) => bail!("provider {} sets both feed_url and feed_path", self.id),
            (None, None) => bail!("provider {} has no feed_url or feed_path", self.id),
        }
    }
}

impl ProviderRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        let mut tags = BTreeMap::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                bail!("provider with empty id");
            }
            if !ids.insert(provider.id.as_str()) {
                bail!("duplicate provider id {}", provider.id);
            }
            if let Some(other) = tags.insert(provider.tag.as_str(), provider.id.as_str()) {
                bail!(
                    "providers {} and {} share namespace tag {}",
                    other,
                    provider.id,
                    provider.tag
                );
            }
            provider.location(Path::new("."))?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub providers_file: PathBuf,
    pub snapshots_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub geocode_cache_path: PathBuf,
    pub geocode_ttl_days: i64,
    pub geocode_max_entries: u64,
    pub qdrant_server: String,
    pub qdrant_api_key: Option<String>,
    pub collection_name: String,
    pub embedding_url: String,
    pub openroute_api_key: String,
    pub openroute_base_url: String,
    pub index_batch_size: usize,
    pub index_concurrency: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    /// Scheduled past-event pruning; disabled when unset.
    pub prune_cron: Option<String>,
    pub impact_base_url: String,
    pub impact_member_id: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    /// Defaults for a workspace rooted at `root`, without reading the environment.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            providers_file: root.join("providers.yaml"),
            snapshots_dir: root.join("snapshots"),
            artifacts_dir: root.join("artifacts"),
            reports_dir: root.join("reports"),
            geocode_cache_path: root.join("geocode_cache.sqlite"),
            workspace_root: root,
            geocode_ttl_days: DEFAULT_TTL_DAYS,
            geocode_max_entries: DEFAULT_MAX_ENTRIES,
            qdrant_server: "http://localhost:6333".to_string(),
            qdrant_api_key: None,
            collection_name: "events".to_string(),
            embedding_url: "http://localhost:8081/embed".to_string(),
            openroute_api_key: String::new(),
            openroute_base_url: "https://api.openrouteservice.org".to_string(),
            index_batch_size: reconcile::DEFAULT_BATCH_SIZE,
            index_concurrency: reconcile::DEFAULT_CONCURRENCY,
            http_timeout_secs: 20,
            user_agent: "remap-bot/0.1".to_string(),
            scheduler_enabled: false,
            sync_cron_1: "0 0 6 * * *".to_string(),
            sync_cron_2: "0 0 18 * * *".to_string(),
            prune_cron: None,
            impact_base_url: String::new(),
            impact_member_id: None,
        }
    }

    pub fn from_env() -> Self {
        let root = PathBuf::from(env_or("REMAP_WORKSPACE_ROOT", "."));
        let defaults = Self::rooted_at(&root);
        let path_or = |key: &str, default: PathBuf| std::env::var(key).map(PathBuf::from).unwrap_or(default);

        Self {
            providers_file: defaults.providers_file.clone(),
            snapshots_dir: path_or("REMAP_SNAPSHOTS_DIR", defaults.snapshots_dir.clone()),
            artifacts_dir: path_or("ARTIFACTS_DIR", defaults.artifacts_dir.clone()),
            reports_dir: path_or("REMAP_REPORTS_DIR", defaults.reports_dir.clone()),
            geocode_cache_path: path_or("REMAP_GEOCODE_CACHE_PATH", defaults.geocode_cache_path.clone()),
            geocode_ttl_days: env_parsed("REMAP_GEOCODE_TTL_DAYS", defaults.geocode_ttl_days),
            geocode_max_entries: env_parsed("REMAP_GEOCODE_MAX_ENTRIES", defaults.geocode_max_entries),
            qdrant_server: env_or("QDRANT_SERVER", &defaults.qdrant_server),
            qdrant_api_key: env_nonempty("QDRANT_API_KEY"),
            collection_name: env_or("COLLECTION_NAME", &defaults.collection_name),
            embedding_url: env_or("EMBEDDING_SERVICE_URL", &defaults.embedding_url),
            openroute_api_key: env_or("OPENROUTE_API_KEY", ""),
            openroute_base_url: env_or("OPENROUTE_BASE_URL", &defaults.openroute_base_url),
            index_batch_size: env_parsed("REMAP_INDEX_BATCH_SIZE", defaults.index_batch_size),
            index_concurrency: env_parsed("REMAP_INDEX_CONCURRENCY", defaults.index_concurrency),
            http_timeout_secs: env_parsed("REMAP_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            user_agent: env_or("REMAP_USER_AGENT", &defaults.user_agent),
            scheduler_enabled: std::env::var("REMAP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: env_or("SYNC_CRON_1", &defaults.sync_cron_1),
            sync_cron_2: env_or("SYNC_CRON_2", &defaults.sync_cron_2),
            prune_cron: env_nonempty("REMAP_PRUNE_CRON"),
            impact_base_url: env_or("IMPACT_BASE_URL", ""),
            impact_member_id: env_nonempty("IMPACT_MEMBER_ID"),
            workspace_root: root,
        }
    }

    fn cache_config(&self) -> GeocodeCacheConfig {
        GeocodeCacheConfig {
            ttl: TimeDelta::days(self.geocode_ttl_days.clamp(1, 36_500)),
            max_entries: self.geocode_max_entries.max(1),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Diff against the retained snapshot.
    Incremental,
    /// Diff against an empty snapshot: full reload.
    Initialize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    SnapshotRotated,
    Diffed,
    Namespaced,
    Geocoded,
    Reconciled,
    Summarized,
}

/// Forward-only stage bookkeeping for one provider run.
#[derive(Debug)]
struct StageTracker {
    current: RunStage,
    visited: Vec<RunStage>,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            current: RunStage::Idle,
            visited: vec![RunStage::Idle],
        }
    }

    fn advance(&mut self, next: RunStage) {
        debug_assert!(next > self.current, "stage {next:?} revisited after {:?}", self.current);
        if next <= self.current {
            return;
        }
        self.current = next;
        self.visited.push(next);
        debug!(stage = ?next, "stage reached");
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("provider {provider}: snapshot unavailable: {source}")]
    Fetch {
        provider: String,
        #[source]
        source: AdapterError,
    },
    #[error("provider {provider}: {source}")]
    IndexUnavailable {
        provider: String,
        #[source]
        source: ReconcileError,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderRunSummary {
    pub run_id: Uuid,
    pub provider: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<RunStage>,
    pub delta: DeltaSummary,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_unchanged: usize,
    pub deleted: usize,
    pub failed: Vec<FailedItem>,
    pub malformed: Vec<MalformedRecord>,
    pub points_count: Option<u64>,
    pub geocode_cache: CacheStats,
    pub raw_artifact: Option<String>,
    pub retained_snapshot: String,
    pub reports_dir: String,
}

impl ProviderRunSummary {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub providers: Vec<ProviderRunSummary>,
    pub failures: Vec<ProviderFailure>,
    pub reports_dir: String,
}

/// Namespaced delta between two local feed files, for inspection without touching any store.
#[derive(Debug, Clone, Serialize)]
pub struct DeltaPreview {
    pub provider: String,
    pub summary: DeltaSummary,
    pub entries: Vec<DeltaEntry>,
    pub malformed: Vec<MalformedRecord>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: ProviderRegistry,
    http: Arc<HttpFetcher>,
    artifact_store: ArtifactStore,
    snapshots: SnapshotStore,
    cache: GeocodeCache,
    geocoder: Arc<dyn Geocoder>,
    reconciler: Reconciler,
}

impl std::fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("workspace_root", &self.config.workspace_root)
            .field("providers", &self.registry.providers.len())
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl SyncPipeline {
    /// Wire the pipeline with the HTTP collaborators named in `config`.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let registry = ProviderRegistry::load(&config.providers_file).await?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let cache = GeocodeCache::open(&config.geocode_cache_path, config.cache_config()).await?;

        let index: Arc<dyn SearchIndex> = Arc::new(QdrantIndex::new(
            http.clone(),
            QdrantConfig {
                server: config.qdrant_server.clone(),
                api_key: config.qdrant_api_key.clone(),
                collection: config.collection_name.clone(),
            },
        ));
        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingServiceClient::new(http.clone(), &config.embedding_url));
        let geocoder: Arc<dyn Geocoder> = Arc::new(OpenRouteGeocoder::new(
            http.clone(),
            &config.openroute_base_url,
            &config.openroute_api_key,
        ));
        let reconciler = Reconciler::new(index, embedder, reconciler_config(&config));

        Ok(Self {
            artifact_store: ArtifactStore::new(config.artifacts_dir.clone()),
            snapshots: SnapshotStore::new(config.snapshots_dir.clone()),
            config,
            registry,
            http,
            cache,
            geocoder,
            reconciler,
        })
    }

    /// Replace the index, embedding and geocoding collaborators.
    pub fn with_collaborators(
        mut self,
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        self.reconciler = Reconciler::new(index, embedder, reconciler_config(&self.config));
        self.geocoder = geocoder;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub async fn resolve_coordinates(&self, address: &str) -> Result<Coordinates, ResolveError> {
        self.cache.resolve(address, self.geocoder.as_ref()).await
    }

    /// Run every enabled provider in turn. A failed provider does not stop the others.
    pub async fn run_all(&self, mode: RunMode) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut providers = Vec::new();
        let mut failures = Vec::new();

        for provider in self.registry.enabled() {
            match self.run_configured(provider, mode, run_id).await {
                Ok(summary) => providers.push(summary),
                Err(err) => {
                    warn!(provider = %provider.id, error = %err, "provider run failed");
                    failures.push(ProviderFailure {
                        provider: provider.id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let summary = SyncRunSummary {
            run_id,
            mode,
            started_at,
            finished_at: Utc::now(),
            providers,
            failures,
            reports_dir: reports_dir.display().to_string(),
        };
        reports::write_run_summary(&reports_dir, &summary).await?;
        info!(
            %run_id,
            providers = summary.providers.len(),
            failures = summary.failures.len(),
            "sync run complete"
        );
        Ok(summary)
    }

    pub async fn run_provider(&self, provider_id: &str, mode: RunMode) -> Result<ProviderRunSummary, SyncError> {
        let provider = self
            .registry
            .get(provider_id)
            .ok_or_else(|| anyhow!("unknown provider {provider_id}"))?;
        if !provider.enabled {
            warn!(provider = %provider.id, "running a provider that is disabled in the registry");
        }
        self.run_configured(provider, mode, Uuid::new_v4()).await
    }

    async fn run_configured(
        &self,
        provider: &ProviderConfig,
        mode: RunMode,
        run_id: Uuid,
    ) -> Result<ProviderRunSummary, SyncError> {
        let span = info_span!("provider_run", provider = %provider.id, %run_id, ?mode);
        self.run_stages(provider, mode, run_id).instrument(span).await
    }

    async fn run_stages(
        &self,
        provider: &ProviderConfig,
        mode: RunMode,
        run_id: Uuid,
    ) -> Result<ProviderRunSummary, SyncError> {
        let started_at = Utc::now();
        let mut stages = StageTracker::new();
        let fetch_failed = |source: AdapterError| SyncError::Fetch {
            provider: provider.id.clone(),
            source,
        };

        // Nothing below mutates any store until the new snapshot is in hand.
        let adapter = adapter_for_format(provider.format);
        let location = provider.location(&self.config.workspace_root)?;
        let raw = adapter
            .fetch(&self.http, Some(&self.artifact_store), run_id, &provider.id, &location)
            .await
            .map_err(fetch_failed)?;
        let parsed = adapter
            .parse(&raw, &self.adapter_context(provider))
            .map_err(fetch_failed)?;
        let new = Snapshot::new(&provider.id, raw.fetched_at, parsed.records);

        let old = match mode {
            RunMode::Initialize => Snapshot::empty(&provider.id),
            RunMode::Incremental => self
                .snapshots
                .load_retained(&provider.id)
                .await?
                .unwrap_or_else(|| Snapshot::empty(&provider.id)),
        };
        stages.advance(RunStage::SnapshotRotated);

        let delta = compute_snapshot_delta(&old, &new);
        stages.advance(RunStage::Diffed);

        // Collisions surface here, so counts are taken after namespacing.
        let delta = delta.namespaced(&provider.tag);
        let mut malformed = parsed.malformed;
        malformed.extend(delta.malformed.iter().cloned());
        let delta_summary = DeltaSummary::from_entries(delta.entries(), malformed.len());
        stages.advance(RunStage::Namespaced);
        info!(
            added = delta_summary.added,
            changed = delta_summary.changed,
            removed = delta_summary.removed,
            unchanged = delta_summary.unchanged,
            skipped = delta_summary.skipped,
            "delta computed"
        );

        let (changes, mut failed) =
            resolve_missing_coordinates(delta.changes.clone(), &self.cache, self.geocoder.as_ref()).await;
        stages.advance(RunStage::Geocoded);

        let reconciled = self
            .reconciler
            .reconcile(&changes)
            .await
            .map_err(|source| SyncError::IndexUnavailable {
                provider: provider.id.clone(),
                source,
            })?;
        stages.advance(RunStage::Reconciled);

        failed.extend(reconciled.failed.iter().cloned());
        failed.sort_by(|a, b| a.id.cmp(&b.id));
        let failed_ids: BTreeSet<&str> = failed.iter().map(|f| f.id.as_str()).collect();
        let retained = healed_snapshot(&old, &new, &changes, &failed_ids);
        let retained_path = self.snapshots.retain(&retained).await?;

        let reports_dir = self.config.reports_dir.join(run_id.to_string()).join(&provider.id);
        stages.advance(RunStage::Summarized);
        let summary = ProviderRunSummary {
            run_id,
            provider: provider.id.clone(),
            mode,
            started_at,
            finished_at: Utc::now(),
            stages: stages.visited,
            delta: delta_summary,
            inserted: reconciled.inserted,
            updated: reconciled.updated,
            skipped_unchanged: reconciled.skipped_unchanged,
            deleted: reconciled.deleted,
            failed,
            malformed,
            points_count: reconciled.points_count,
            geocode_cache: self.cache.stats(),
            raw_artifact: raw.archived.map(|a| a.relative_path.display().to_string()),
            retained_snapshot: retained_path.display().to_string(),
            reports_dir: reports_dir.display().to_string(),
        };
        reports::write_provider_reports(&reports_dir, &summary, &delta).await?;

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            skipped_unchanged = summary.skipped_unchanged,
            deleted = summary.deleted,
            failed = summary.failed.len(),
            points_count = summary.points_count,
            "provider run summarized"
        );
        Ok(summary)
    }

    /// Diff two local feed files with the provider's adapter and namespace.
    pub async fn preview_delta(&self, provider_id: &str, old: &Path, new: &Path) -> Result<DeltaPreview> {
        let provider = self
            .registry
            .get(provider_id)
            .ok_or_else(|| anyhow!("unknown provider {provider_id}"))?;
        let adapter = adapter_for_format(provider.format);
        let ctx = self.adapter_context(provider);

        let mut sides = Vec::with_capacity(2);
        for path in [old, new] {
            let raw = adapter
                .fetch(&self.http, None, Uuid::new_v4(), &provider.id, &FeedLocation::File(path.to_path_buf()))
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let parsed = adapter
                .parse(&raw, &ctx)
                .with_context(|| format!("parsing {}", path.display()))?;
            sides.push(parsed);
        }
        let new_side = sides.pop().unwrap_or_default();
        let old_side = sides.pop().unwrap_or_default();

        let delta = delta::compute_delta(&old_side.records, &new_side.records).namespaced(&provider.tag);
        let mut malformed = new_side.malformed;
        malformed.extend(delta.malformed.iter().cloned());
        Ok(DeltaPreview {
            provider: provider.id.clone(),
            summary: DeltaSummary::from_entries(delta.entries(), malformed.len()),
            entries: delta.entries().cloned().collect(),
            malformed,
        })
    }

    /// Delete indexed events that started before today (UTC). `dry_run` only counts them.
    pub async fn prune_past_events(&self, dry_run: bool) -> Result<PruneReport> {
        let options = PruneOptions {
            dry_run,
            ..PruneOptions::default()
        };
        prune::prune_past_events(self.reconciler.index().as_ref(), Utc::now().date_naive(), options)
            .await
            .context("pruning past events")
    }

    fn adapter_context(&self, provider: &ProviderConfig) -> AdapterContext {
        AdapterContext {
            provider: provider.id.clone(),
            credits: provider.credits.clone(),
            affiliate: AffiliateConfig {
                base_url: self.config.impact_base_url.clone(),
                member_id: self.config.impact_member_id.clone(),
            },
        }
    }
}

fn reconciler_config(config: &SyncConfig) -> ReconcilerConfig {
    ReconcilerConfig {
        batch_size: config.index_batch_size,
        concurrency: config.index_concurrency,
    }
}

/// Snapshot to retain after a run: the old state with every successfully applied change
/// folded in. Failed entries keep their previous state so the next diff yields them again.
fn healed_snapshot(old: &Snapshot, new: &Snapshot, applied: &[DeltaChange], failed: &BTreeSet<&str>) -> Snapshot {
    let mut records: BTreeMap<String, EventRecord> = old
        .records
        .iter()
        .filter(|r| !r.id.trim().is_empty())
        .map(|r| (r.id.trim().to_string(), r.clone()))
        .collect();

    for change in applied {
        if failed.contains(change.entry.id.as_str()) {
            continue;
        }
        match change.kind() {
            DeltaKind::Removed => {
                records.remove(&change.local_id);
            }
            DeltaKind::Added | DeltaKind::Changed | DeltaKind::Unchanged => {
                records.insert(
                    change.local_id.clone(),
                    EventRecord {
                        id: change.local_id.clone(),
                        ..change.record.clone()
                    },
                );
            }
        }
    }

    Snapshot::new(new.provider.clone(), new.fetched_at, records.into_values().collect())
}

/// Cron scheduler running [`SyncPipeline::run_all`] on both configured expressions.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&pipeline.config.sync_cron_1, &pipeline.config.sync_cron_2] {
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_all(RunMode::Incremental).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        providers = summary.providers.len(),
                        failures = summary.failures.len(),
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    if let Some(cron) = &pipeline.config.prune_cron {
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.prune_past_events(false).await {
                    Ok(report) => info!(
                        deleted = report.deleted,
                        past_events = report.past_events,
                        "scheduled prune finished"
                    ),
                    Err(err) => warn!(error = %format!("{err:#}"), "scheduled prune failed"),
                }
            })
        })
        .with_context(|| format!("creating prune job for cron {cron}"))?;
        sched.add(job).await.context("adding prune job")?;
    }
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env()).await?;
    pipeline.run_all(RunMode::Incremental).await
}
