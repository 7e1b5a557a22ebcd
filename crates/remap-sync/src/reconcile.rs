//! Index reconciler: converge the search index to a namespaced, coordinate-complete delta.
//!
//! Entries are split into partitions by point id, so concurrent partitions never touch the
//! same identifier. Inside a partition removals are applied first, then upserts, both in
//! bounded batches. A batch the index refuses is retried item by item to isolate the bad
//! entries; a batch for which every call failed transiently means the index is unreachable
//! and aborts the run.

use std::sync::Arc;

use remap_core::{point_id, DeltaKind};
use remap_storage::CollaboratorError;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::delta::DeltaChange;
use crate::embed::{Embedder, Embedding};
use crate::index::{IndexPoint, SearchIndex};

pub const DEFAULT_BATCH_SIZE: usize = 16;
pub const DEFAULT_CONCURRENCY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Geocode,
    Embed,
    Upsert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub id: String,
    pub stage: FailureStage,
    pub reason: String,
}

impl FailedItem {
    pub fn new(id: &str, stage: FailureStage, reason: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            stage,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped_unchanged: usize,
    pub failed: Vec<FailedItem>,
    pub points_count: Option<u64>,
}

impl ReconcileReport {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.id.as_str()).collect()
    }

    fn absorb(&mut self, outcome: PartitionOutcome) {
        self.inserted += outcome.inserted;
        self.updated += outcome.updated;
        self.deleted += outcome.deleted;
        self.failed.extend(outcome.failed);
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("search index unavailable: {0}")]
    IndexUnavailable(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Default)]
struct PartitionOutcome {
    inserted: usize,
    updated: usize,
    deleted: usize,
    failed: Vec<FailedItem>,
}

impl PartitionOutcome {
    fn applied(&mut self, kind: DeltaKind) {
        match kind {
            DeltaKind::Added => self.inserted += 1,
            DeltaKind::Changed => self.updated += 1,
            DeltaKind::Removed => self.deleted += 1,
            DeltaKind::Unchanged => {}
        }
    }
}

struct Inner {
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    config: ReconcilerConfig,
    collection_ready: OnceCell<()>,
}

#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(index: Arc<dyn SearchIndex>, embedder: Arc<dyn Embedder>, config: ReconcilerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                index,
                embedder,
                config: ReconcilerConfig {
                    batch_size: config.batch_size.max(1),
                    concurrency: config.concurrency.max(1),
                },
                collection_ready: OnceCell::new(),
            }),
        }
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.inner.index
    }

    /// Apply `changes` to the index. Item failures are reported, not raised.
    pub async fn reconcile(&self, changes: &[DeltaChange]) -> Result<ReconcileReport, ReconcileError> {
        let concurrency = self.inner.config.concurrency;
        let mut report = ReconcileReport::default();
        let mut partitions: Vec<Vec<DeltaChange>> = vec![Vec::new(); concurrency];

        for change in changes {
            if change.kind() == DeltaKind::Unchanged {
                report.skipped_unchanged += 1;
                continue;
            }
            let slot = (point_id(&change.entry.id).as_u128() % concurrency as u128) as usize;
            partitions[slot].push(change.clone());
        }

        let mut tasks = JoinSet::new();
        for partition in partitions.into_iter().filter(|p| !p.is_empty()) {
            let inner = self.inner.clone();
            tasks.spawn(async move { inner.apply_partition(partition).await });
        }

        let mut unavailable: Option<ReconcileError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.absorb(outcome),
                Ok(Err((outcome, err))) => {
                    report.absorb(outcome);
                    unavailable.get_or_insert(err);
                }
                Err(join_err) => {
                    unavailable.get_or_insert(ReconcileError::IndexUnavailable(format!(
                        "reconcile task aborted: {join_err}"
                    )));
                }
            }
        }
        if let Some(err) = unavailable {
            warn!(
                inserted = report.inserted,
                updated = report.updated,
                deleted = report.deleted,
                error = %err,
                "reconcile aborted; applied entries stay in place"
            );
            return Err(err);
        }

        report.points_count = match self.inner.index.count().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "index point count unavailable");
                None
            }
        };
        report.failed.sort_by(|a, b| a.id.cmp(&b.id));

        info!(
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            skipped_unchanged = report.skipped_unchanged,
            failed = report.failed.len(),
            points_count = report.points_count,
            "reconcile complete"
        );
        Ok(report)
    }
}

type PartitionResult = Result<PartitionOutcome, (PartitionOutcome, ReconcileError)>;

fn unreachable_batch(err: &CollaboratorError) -> ReconcileError {
    ReconcileError::IndexUnavailable(err.to_string())
}

impl Inner {
    async fn apply_partition(&self, partition: Vec<DeltaChange>) -> PartitionResult {
        let (removals, upserts): (Vec<_>, Vec<_>) = partition
            .into_iter()
            .partition(|c| c.kind() == DeltaKind::Removed);
        let mut outcome = PartitionOutcome::default();

        for batch in removals.chunks(self.config.batch_size) {
            if let Err(err) = self.delete_batch(batch, &mut outcome).await {
                return Err((outcome, err));
            }
        }
        for batch in upserts.chunks(self.config.batch_size) {
            if let Err(err) = self.upsert_batch(batch, &mut outcome).await {
                return Err((outcome, err));
            }
        }
        Ok(outcome)
    }

    async fn delete_batch(&self, batch: &[DeltaChange], outcome: &mut PartitionOutcome) -> Result<(), ReconcileError> {
        let ids: Vec<String> = batch.iter().map(|c| c.entry.id.clone()).collect();
        let err = match self.index.delete(&ids).await {
            Ok(()) => {
                outcome.deleted += batch.len();
                return Ok(());
            }
            Err(err) => err,
        };
        if batch.len() == 1 {
            if err.is_transient() {
                return Err(unreachable_batch(&err));
            }
            outcome.failed.push(FailedItem::new(&ids[0], FailureStage::Delete, err.to_string()));
            return Ok(());
        }

        debug!(size = batch.len(), error = %err, "delete batch failed; isolating items");
        let mut reached = false;
        let mut last_transient = err;
        for id in &ids {
            match self.index.delete(std::slice::from_ref(id)).await {
                Ok(()) => {
                    reached = true;
                    outcome.deleted += 1;
                }
                Err(err) => {
                    reached |= !err.is_transient();
                    warn!(%id, error = %err, "delete failed");
                    outcome.failed.push(FailedItem::new(id, FailureStage::Delete, err.to_string()));
                    if err.is_transient() {
                        last_transient = err;
                    }
                }
            }
        }
        if reached {
            Ok(())
        } else {
            Err(unreachable_batch(&last_transient))
        }
    }

    async fn embed(&self, batch: &[DeltaChange], outcome: &mut PartitionOutcome) -> Vec<(DeltaKind, IndexPoint)> {
        let texts: Vec<String> = batch.iter().map(|c| c.record.embedding_text()).collect();
        let embeddings: Vec<Option<Embedding>> = match self.embed_all(&texts).await {
            Ok(all) => all.into_iter().map(Some).collect(),
            Err(err) => {
                debug!(size = batch.len(), error = %err, "embedding batch failed; embedding items one by one");
                let mut each = Vec::with_capacity(texts.len());
                for (change, text) in batch.iter().zip(&texts) {
                    match self.embedder.embed(text).await {
                        Ok(embedding) => each.push(Some(embedding)),
                        Err(err) => {
                            warn!(id = %change.entry.id, error = %err, "embedding failed");
                            outcome
                                .failed
                                .push(FailedItem::new(&change.entry.id, FailureStage::Embed, err.to_string()));
                            each.push(None);
                        }
                    }
                }
                each
            }
        };

        batch
            .iter()
            .zip(embeddings)
            .filter_map(|(change, embedding)| {
                embedding.map(|e| (change.kind(), IndexPoint::from_record(&change.record, e)))
            })
            .collect()
    }

    async fn embed_all(&self, texts: &[String]) -> Result<Vec<Embedding>, CollaboratorError> {
        let embeddings = self.embedder.embed_batch(texts).await?;
        if embeddings.len() != texts.len() {
            return Err(CollaboratorError::Rejected(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }

    async fn ensure_collection(&self, dense_dimensions: usize) -> Result<(), CollaboratorError> {
        self.collection_ready
            .get_or_try_init(|| self.index.ensure_collection(dense_dimensions))
            .await
            .map(|_| ())
    }

    async fn upsert_batch(&self, batch: &[DeltaChange], outcome: &mut PartitionOutcome) -> Result<(), ReconcileError> {
        let points = self.embed(batch, outcome).await;
        let Some((_, first)) = points.first() else {
            return Ok(());
        };

        if let Err(err) = self.ensure_collection(first.dense.len()).await {
            if err.is_transient() {
                return Err(unreachable_batch(&err));
            }
            for (_, point) in &points {
                outcome
                    .failed
                    .push(FailedItem::new(&point.id, FailureStage::Upsert, err.to_string()));
            }
            return Ok(());
        }

        let all: Vec<IndexPoint> = points.iter().map(|(_, p)| p.clone()).collect();
        let err = match self.index.upsert(&all).await {
            Ok(()) => {
                for (kind, _) in &points {
                    outcome.applied(*kind);
                }
                return Ok(());
            }
            Err(err) => err,
        };
        if points.len() == 1 {
            if err.is_transient() {
                return Err(unreachable_batch(&err));
            }
            outcome
                .failed
                .push(FailedItem::new(&points[0].1.id, FailureStage::Upsert, err.to_string()));
            return Ok(());
        }

        debug!(size = points.len(), error = %err, "upsert batch failed; isolating items");
        let mut reached = false;
        let mut last_transient = err;
        for (kind, point) in &points {
            match self.index.upsert(std::slice::from_ref(point)).await {
                Ok(()) => {
                    reached = true;
                    outcome.applied(*kind);
                }
                Err(err) => {
                    reached |= !err.is_transient();
                    warn!(id = %point.id, error = %err, "upsert failed");
                    outcome
                        .failed
                        .push(FailedItem::new(&point.id, FailureStage::Upsert, err.to_string()));
                    if err.is_transient() {
                        last_transient = err;
                    }
                }
            }
        }
        if reached {
            Ok(())
        } else {
            Err(unreachable_batch(&last_transient))
        }
    }
}
