//! Removal of indexed events whose start date has already passed.
//!
//! Pruning touches only the index. Retained snapshots still list the event, so
//! an unchanged feed row stays skipped and a later removal deletes a point that
//! is already gone, which every index treats as a no-op.

use chrono::{NaiveDate, NaiveTime};
use remap_adapters::parse_feed_datetime;
use remap_storage::CollaboratorError;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::index::SearchIndex;

pub const DEFAULT_MAX_SCAN: usize = 50_000;
pub const DEFAULT_PAGE_SIZE: usize = 500;
pub const DEFAULT_DELETE_BATCH: usize = 50;
const SAMPLE_IDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneOptions {
    /// Count matches without deleting anything.
    pub dry_run: bool,
    /// Upper bound on points read from the collection.
    pub max_scan: usize,
    pub page_size: usize,
    pub delete_batch: usize,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            max_scan: DEFAULT_MAX_SCAN,
            page_size: DEFAULT_PAGE_SIZE,
            delete_batch: DEFAULT_DELETE_BATCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PruneReport {
    pub cutoff_date: NaiveDate,
    pub dry_run: bool,
    pub scanned: usize,
    pub past_events: usize,
    pub deleted: usize,
    /// Ids in delete batches the index refused.
    pub failed_deletes: usize,
    pub sample_ids: Vec<String>,
    /// Collection size after pruning, when the index answered.
    pub points_count: Option<u64>,
}

/// True when `start_date` parses and falls on a day before `cutoff`.
pub fn started_before(start_date: &str, cutoff: NaiveDate) -> bool {
    parse_feed_datetime(start_date, NaiveTime::MIN).is_some_and(|start| start.date() < cutoff)
}

/// Scan the collection and delete events starting before `cutoff`.
///
/// Events without a readable start date are kept. A refused delete batch is
/// logged and counted; the remaining batches still run.
pub async fn prune_past_events(
    index: &dyn SearchIndex,
    cutoff: NaiveDate,
    options: PruneOptions,
) -> Result<PruneReport, CollaboratorError> {
    let mut past = Vec::new();
    let mut scanned = 0;
    let mut offset = None;
    while scanned < options.max_scan {
        let limit = options.page_size.max(1).min(options.max_scan - scanned);
        let page = index.scroll(offset.take(), limit).await?;
        scanned += page.scanned;
        past.extend(
            page.events
                .into_iter()
                .filter(|event| event.start_date.as_deref().is_some_and(|s| started_before(s, cutoff)))
                .map(|event| event.id),
        );
        debug!(scanned, past_events = past.len(), "prune page scanned");
        match page.next_offset {
            Some(next) if page.scanned > 0 => offset = Some(next),
            _ => break,
        }
    }
    if offset.is_some() {
        warn!(max_scan = options.max_scan, "prune scan stopped at its limit");
    }

    let mut deleted = 0;
    let mut failed_deletes = 0;
    if !options.dry_run {
        for batch in past.chunks(options.delete_batch.max(1)) {
            match index.delete(batch).await {
                Ok(()) => deleted += batch.len(),
                Err(err) => {
                    warn!(error = %err, batch = batch.len(), "past-event delete batch failed");
                    failed_deletes += batch.len();
                }
            }
        }
    }

    let points_count = match index.count().await {
        Ok(count) => Some(count),
        Err(err) => {
            warn!(error = %err, "points count unavailable after prune");
            None
        }
    };
    let report = PruneReport {
        cutoff_date: cutoff,
        dry_run: options.dry_run,
        scanned,
        past_events: past.len(),
        deleted,
        failed_deletes,
        sample_ids: past.iter().take(SAMPLE_IDS).cloned().collect(),
        points_count,
    };
    info!(
        cutoff = %report.cutoff_date,
        dry_run = report.dry_run,
        scanned = report.scanned,
        past_events = report.past_events,
        deleted = report.deleted,
        failed_deletes = report.failed_deletes,
        "past events pruned"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::Embedding;
    use crate::index::{IndexPoint, MemoryIndex};
    use remap_core::EventRecord;

    fn dated(id: &str, start: Option<&str>) -> IndexPoint {
        let mut record = EventRecord::new(id, "t");
        record.start_date = start.and_then(|s| parse_feed_datetime(s, NaiveTime::MIN));
        IndexPoint::from_record(&record.sealed(), Embedding::default())
    }

    fn cutoff() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, 10).expect("date")
    }

    async fn seeded() -> MemoryIndex {
        let index = MemoryIndex::new();
        index
            .upsert(&[
                dated("TM_old", Some("2026-07-01T21:00:00")),
                dated("TM_yesterday", Some("2026-07-09T23:30:00")),
                dated("TM_today", Some("2026-07-10T00:00:00")),
                dated("TM_later", Some("2026-08-01T20:00:00")),
                dated("TM_undated", None),
            ])
            .await
            .expect("seed");
        index
    }

    #[test]
    fn only_days_before_the_cutoff_count_as_past() {
        assert!(started_before("2026-07-09T23:59:59", cutoff()));
        assert!(!started_before("2026-07-10T00:00:00", cutoff()));
        assert!(!started_before("not a date", cutoff()));
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let index = seeded().await;
        let report = prune_past_events(&index, cutoff(), PruneOptions::default())
            .await
            .expect("prune");

        assert!(report.dry_run);
        assert_eq!(report.scanned, 5);
        assert_eq!(report.past_events, 2);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.points_count, Some(5));
        assert_eq!(index.len(), 5);
    }

    #[tokio::test]
    async fn apply_deletes_past_events_across_pages_and_batches() {
        let index = seeded().await;
        let options = PruneOptions {
            dry_run: false,
            page_size: 2,
            delete_batch: 1,
            ..PruneOptions::default()
        };
        let report = prune_past_events(&index, cutoff(), options).await.expect("prune");

        assert_eq!(report.scanned, 5);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.points_count, Some(3));
        assert_eq!(index.ids(), vec!["TM_later", "TM_today", "TM_undated"]);
    }

    #[tokio::test]
    async fn refused_batches_are_counted_and_the_rest_still_run() {
        let index = seeded().await;
        index.reject_id("TM_old");
        let options = PruneOptions {
            dry_run: false,
            delete_batch: 1,
            ..PruneOptions::default()
        };
        let report = prune_past_events(&index, cutoff(), options).await.expect("prune");

        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed_deletes, 1);
        assert!(index.get("TM_old").is_some());
        assert!(index.get("TM_yesterday").is_none());
    }

    #[tokio::test]
    async fn scan_stops_at_max_scan() {
        let index = seeded().await;
        let options = PruneOptions {
            max_scan: 3,
            page_size: 2,
            ..PruneOptions::default()
        };
        let report = prune_past_events(&index, cutoff(), options).await.expect("prune");
        assert_eq!(report.scanned, 3);
    }

    #[tokio::test]
    async fn unavailable_index_fails_the_scan() {
        let index = seeded().await;
        index.set_unavailable(true);
        let err = prune_past_events(&index, cutoff(), PruneOptions::default())
            .await
            .expect_err("down");
        assert!(err.is_transient());
    }
}
