//! Watermark-based incremental loader.
//!
//! Moves feed rows dated after the source's watermark into the raw table,
//! exactly once per `(id, date)`. Re-running against an unchanged source is a
//! no-op and never moves the watermark.

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use boxoffice_shared::{Result, TableName};
use boxoffice_storage::Storage;

/// Summary of one loader run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub source_table: TableName,
    pub target_table: TableName,
    /// Watermark before the run.
    pub previous_watermark: DateTime<Utc>,
    /// Watermark after the run.
    pub watermark: DateTime<Utc>,
    /// Rows appended to the target.
    pub inserted: u64,
    /// Source rows skipped for an unparseable date.
    pub malformed_rows: u64,
}

impl LoadReport {
    /// Records processed by this run.
    pub fn records_processed(&self) -> u64 {
        self.inserted
    }

    /// Whether the watermark moved.
    pub fn advanced(&self) -> bool {
        self.watermark != self.previous_watermark
    }
}

/// Load new rows from `source` into `target`, stamping them with the current
/// wall-clock time.
pub async fn load_incremental(
    storage: &Storage,
    source: &TableName,
    target: &TableName,
) -> Result<LoadReport> {
    load_incremental_at(storage, source, target, Utc::now()).await
}

/// [`load_incremental`] with an explicit ingestion time.
#[instrument(skip_all, fields(source_table = %source, target_table = %target))]
pub async fn load_incremental_at(
    storage: &Storage,
    source: &TableName,
    target: &TableName,
    now: DateTime<Utc>,
) -> Result<LoadReport> {
    storage.ensure_raw_table(target).await?;

    let delta = storage.ingest_delta(source, target, now).await?;

    if delta.malformed_rows > 0 {
        warn!(
            malformed_rows = delta.malformed_rows,
            "skipped source rows with unparseable dates"
        );
    }

    if delta.inserted == 0 {
        info!(watermark = %delta.watermark, "no new revenue data to process");
    } else {
        info!(
            inserted = delta.inserted,
            previous_watermark = %delta.previous_watermark,
            watermark = %delta.watermark,
            "processed new revenue records"
        );
    }

    Ok(LoadReport {
        source_table: source.clone(),
        target_table: target.clone(),
        previous_watermark: delta.previous_watermark,
        watermark: delta.watermark,
        inserted: delta.inserted,
        malformed_rows: delta.malformed_rows,
    })
}

/// Number of source rows waiting for the next load.
pub async fn pending_rows(storage: &Storage, source: &TableName) -> Result<u64> {
    storage.count_pending_rows(source).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use boxoffice_shared::{SourceRevenueRow, watermark_floor};
    use chrono::TimeZone;

    use super::*;
    use crate::test_support::test_storage;

    fn tables() -> (TableName, TableName) {
        (
            "revenues_per_day".parse().unwrap(),
            "raw_revenues_per_day".parse().unwrap(),
        )
    }

    fn day_rows(days: std::ops::RangeInclusive<u32>) -> Vec<SourceRevenueRow> {
        days.flat_map(|d| {
            ["tt1", "tt2"].map(|id| SourceRevenueRow {
                id: id.into(),
                date: format!("2024-03-{d:02}"),
                title: format!("Movie {id}"),
                revenue: "$12,345".into(),
                theaters: "3,000".into(),
                distributor: "Studio".into(),
            })
        })
        .collect()
    }

    fn march(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    async fn assert_no_duplicates(storage: &Storage, target: &TableName) {
        let records = storage.list_raw_records(target).await.unwrap();
        let pairs: HashSet<_> = records.iter().map(|r| (r.id.clone(), r.date)).collect();
        assert_eq!(pairs.len(), records.len(), "duplicate (id, date) in target");
    }

    #[tokio::test]
    async fn loads_days_after_watermark_then_noops() {
        let storage = test_storage().await;
        let (src, tgt) = tables();
        storage.ensure_source_table(&src).await.unwrap();

        // Watermark at day 5.
        storage.insert_source_rows(&src, &day_rows(1..=5)).await.unwrap();
        let first = load_incremental_at(&storage, &src, &tgt, march(5, 12)).await.unwrap();
        assert_eq!(first.records_processed(), 10);
        assert_eq!(first.previous_watermark, watermark_floor());

        // Source advances to day 10.
        storage.insert_source_rows(&src, &day_rows(6..=10)).await.unwrap();
        assert_eq!(pending_rows(&storage, &src).await.unwrap(), 10);

        let second = load_incremental_at(&storage, &src, &tgt, march(11, 1)).await.unwrap();
        assert_eq!(second.records_processed(), 10);
        assert!(second.advanced());
        assert_eq!(second.watermark, march(11, 1));

        let days: HashSet<_> = storage
            .list_raw_records(&tgt)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.ingested_at == march(11, 1))
            .map(|r| r.date.format("%d").to_string())
            .collect();
        assert_eq!(
            days,
            HashSet::from(["06", "07", "08", "09", "10"].map(String::from))
        );

        // Immediate rerun: nothing new, watermark untouched.
        let third = load_incremental_at(&storage, &src, &tgt, march(11, 2)).await.unwrap();
        assert_eq!(third.records_processed(), 0);
        assert!(!third.advanced());
        let log = storage.ingestion_log("revenues_per_day").await.unwrap().unwrap();
        assert_eq!(log.last_ingested_at, march(11, 1));
        assert_eq!(log.record_count, 10);

        assert_no_duplicates(&storage, &tgt).await;
    }

    #[tokio::test]
    async fn republished_rows_never_duplicate() {
        let storage = test_storage().await;
        let (src, tgt) = tables();
        storage.ensure_source_table(&src).await.unwrap();

        storage.insert_source_rows(&src, &day_rows(1..=3)).await.unwrap();
        load_incremental_at(&storage, &src, &tgt, march(1, 0)).await.unwrap();

        // Upstream republishes the same rows alongside new ones.
        storage.insert_source_rows(&src, &day_rows(1..=6)).await.unwrap();
        let report = load_incremental_at(&storage, &src, &tgt, march(2, 0)).await.unwrap();
        assert_eq!(report.records_processed(), 6);

        storage.insert_source_rows(&src, &day_rows(2..=6)).await.unwrap();
        load_incremental_at(&storage, &src, &tgt, march(3, 0)).await.unwrap();

        assert_eq!(storage.list_raw_records(&tgt).await.unwrap().len(), 12);
        assert_no_duplicates(&storage, &tgt).await;
    }

    #[tokio::test]
    async fn invalid_source_is_an_error() {
        let storage = test_storage().await;
        let (_, tgt) = tables();
        let missing: TableName = "no_such_feed".parse().unwrap();
        assert!(load_incremental(&storage, &missing, &tgt).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_loads_do_not_double_count() {
        let storage = Arc::new(test_storage().await);
        let (src, tgt) = tables();
        storage.ensure_source_table(&src).await.unwrap();
        storage.ensure_raw_table(&tgt).await.unwrap();
        storage.insert_source_rows(&src, &day_rows(1..=10)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let storage = storage.clone();
            let (src, tgt) = (src.clone(), tgt.clone());
            handles.push(tokio::spawn(async move {
                load_incremental(&storage, &src, &tgt).await
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap().unwrap().records_processed();
        }
        assert_eq!(total, 20);
        assert_no_duplicates(&storage, &tgt).await;
    }
}
