//! Enrichment backlog, fetched metadata, and API usage accounting.

use boxoffice_shared::{ApiUsageLogEntry, BoxOfficeError, EnrichmentRecord, EntityToEnrich, Result};
use chrono::NaiveDate;
use libsql::{TransactionBehavior, params};

use crate::{Storage, get_opt_day, get_string, parse_day};

impl Storage {
    // -----------------------------------------------------------------------
    // Backlog
    // -----------------------------------------------------------------------

    /// Insert a candidate or move its `candidate_since` forward.
    /// Attempt history (`last_success_at`, `last_error_at`) is preserved.
    pub async fn upsert_candidate(&self, key: &str, candidate_since: NaiveDate) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO entities_to_enrich (key, candidate_since) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET
                   candidate_since = MAX(entities_to_enrich.candidate_since, excluded.candidate_since)",
                params![key, candidate_since.to_string()],
            )
            .await
            .map_err(BoxOfficeError::storage)?;
        Ok(())
    }

    /// Entities that were never attempted, or whose latest success and latest
    /// error both predate `stale_cutoff`. Most recent candidates first.
    pub async fn select_backlog(&self, stale_cutoff: NaiveDate) -> Result<Vec<EntityToEnrich>> {
        let cutoff = stale_cutoff.to_string();
        let mut rows = self
            .conn
            .query(
                "SELECT key, candidate_since, last_success_at, last_error_at
                 FROM entities_to_enrich
                 WHERE (last_success_at IS NULL AND last_error_at IS NULL)
                    OR (last_success_at < ?1 AND (last_error_at IS NULL OR last_error_at < ?1))
                    OR (last_success_at IS NULL AND last_error_at < ?1)
                 ORDER BY candidate_since DESC, key",
                params![cutoff.as_str()],
            )
            .await
            .map_err(BoxOfficeError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(BoxOfficeError::storage)? {
            results.push(row_to_entity(&row)?);
        }
        Ok(results)
    }

    /// Get one backlog entity by key.
    pub async fn get_entity(&self, key: &str) -> Result<Option<EntityToEnrich>> {
        let mut rows = self
            .conn
            .query(
                "SELECT key, candidate_since, last_success_at, last_error_at
                 FROM entities_to_enrich WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(BoxOfficeError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entity(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(BoxOfficeError::storage(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Per-entity outcomes (safe to call from concurrent workers)
    // -----------------------------------------------------------------------

    /// Upsert the fetched record and stamp the entity's `last_success_at`,
    /// atomically, on a dedicated connection.
    pub async fn record_success(&self, key: &str, record: &EnrichmentRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| BoxOfficeError::Storage(format!("failed to encode payload: {e}")))?;
        let day = record.updated_at.to_string();

        let conn = self.write_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(BoxOfficeError::storage)?;

        tx.execute(
            "INSERT INTO enrichment_records (entity_id, payload, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_id) DO UPDATE SET
               payload = excluded.payload,
               updated_at = excluded.updated_at",
            params![record.entity_id.as_str(), payload, day.as_str()],
        )
        .await
        .map_err(BoxOfficeError::storage)?;

        tx.execute(
            "UPDATE entities_to_enrich SET last_success_at = ?1 WHERE key = ?2",
            params![day.as_str(), key],
        )
        .await
        .map_err(BoxOfficeError::storage)?;

        tx.commit().await.map_err(BoxOfficeError::storage)?;
        Ok(())
    }

    /// Stamp the entity's `last_error_at`.
    pub async fn record_failure(&self, key: &str, day: NaiveDate) -> Result<()> {
        let conn = self.write_connection()?;
        conn.execute(
            "UPDATE entities_to_enrich SET last_error_at = ?1 WHERE key = ?2",
            params![day.to_string(), key],
        )
        .await
        .map_err(BoxOfficeError::storage)?;
        Ok(())
    }

    /// Get a stored enrichment record by external id.
    pub async fn get_enrichment_record(&self, entity_id: &str) -> Result<Option<EnrichmentRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_id, payload, updated_at FROM enrichment_records WHERE entity_id = ?1",
                params![entity_id],
            )
            .await
            .map_err(BoxOfficeError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let payload: String = get_string(&row, 1)?;
                Ok(Some(EnrichmentRecord {
                    entity_id: get_string(&row, 0)?,
                    payload: serde_json::from_str(&payload).map_err(|e| {
                        BoxOfficeError::Storage(format!("invalid stored payload: {e}"))
                    })?,
                    updated_at: parse_day(&get_string(&row, 2)?)?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(BoxOfficeError::storage(e)),
        }
    }

    /// Number of stored enrichment records.
    pub async fn count_enrichment_records(&self) -> Result<u64> {
        self.query_count("SELECT COUNT(*) FROM enrichment_records", params![])
            .await
    }

    // -----------------------------------------------------------------------
    // API usage
    // -----------------------------------------------------------------------

    /// Add `requests` to the day's counter in a single statement.
    pub async fn increment_api_usage(&self, day: NaiveDate, requests: u64) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO api_usage_log (date, request_count) VALUES (?1, ?2)
                 ON CONFLICT(date) DO UPDATE SET
                   request_count = api_usage_log.request_count + excluded.request_count",
                params![day.to_string(), requests as i64],
            )
            .await
            .map_err(BoxOfficeError::storage)?;
        Ok(())
    }

    /// Requests recorded for a day (0 if none).
    pub async fn api_usage(&self, day: NaiveDate) -> Result<u64> {
        self.query_count(
            "SELECT request_count FROM api_usage_log WHERE date = ?1",
            params![day.to_string()],
        )
        .await
    }

    /// The day's usage row, if any request was logged for it.
    pub async fn api_usage_entry(&self, day: NaiveDate) -> Result<Option<ApiUsageLogEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT date, request_count FROM api_usage_log WHERE date = ?1",
                params![day.to_string()],
            )
            .await
            .map_err(BoxOfficeError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(ApiUsageLogEntry {
                date: parse_day(&get_string(&row, 0)?)?,
                request_count: row.get::<i64>(1).map_err(BoxOfficeError::storage)?.max(0) as u64,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(BoxOfficeError::storage(e)),
        }
    }
}

fn row_to_entity(row: &libsql::Row) -> Result<EntityToEnrich> {
    Ok(EntityToEnrich {
        key: get_string(row, 0)?,
        candidate_since: parse_day(&get_string(row, 1)?)?,
        last_success_at: get_opt_day(row, 2)?,
        last_error_at: get_opt_day(row, 3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[tokio::test]
    async fn candidate_upsert_keeps_history() {
        let storage = test_storage().await;
        storage.upsert_candidate("up", day(1)).await.unwrap();
        storage.record_failure("up", day(2)).await.unwrap();

        storage.upsert_candidate("up", day(5)).await.unwrap();
        // An older sighting never moves candidate_since back.
        storage.upsert_candidate("up", day(3)).await.unwrap();

        let entity = storage.get_entity("up").await.unwrap().unwrap();
        assert_eq!(entity.candidate_since, day(5));
        assert_eq!(entity.last_error_at, Some(day(2)));
        assert_eq!(entity.last_success_at, None);
    }

    #[tokio::test]
    async fn backlog_selection_rule() {
        let storage = test_storage().await;
        let cutoff = day(10);

        // never fetched
        storage.upsert_candidate("fresh", day(3)).await.unwrap();
        // success long ago, no error
        storage.upsert_candidate("old_ok", day(4)).await.unwrap();
        storage
            .record_success(
                "old_ok",
                &EnrichmentRecord {
                    entity_id: "tt1".into(),
                    payload: serde_json::json!({"Title": "Old"}),
                    updated_at: day(1),
                },
            )
            .await
            .unwrap();
        // error long ago, no success
        storage.upsert_candidate("old_err", day(5)).await.unwrap();
        storage.record_failure("old_err", day(2)).await.unwrap();
        // recent error
        storage.upsert_candidate("recent_err", day(6)).await.unwrap();
        storage.record_failure("recent_err", day(11)).await.unwrap();
        // recent success
        storage.upsert_candidate("recent_ok", day(7)).await.unwrap();
        storage
            .record_success(
                "recent_ok",
                &EnrichmentRecord {
                    entity_id: "tt2".into(),
                    payload: serde_json::json!({}),
                    updated_at: day(12),
                },
            )
            .await
            .unwrap();
        // old success but recent error
        storage.upsert_candidate("mixed", day(8)).await.unwrap();
        storage
            .record_success(
                "mixed",
                &EnrichmentRecord {
                    entity_id: "tt3".into(),
                    payload: serde_json::json!({}),
                    updated_at: day(1),
                },
            )
            .await
            .unwrap();
        storage.record_failure("mixed", day(10)).await.unwrap();

        let backlog = storage.select_backlog(cutoff).await.unwrap();
        let keys: Vec<&str> = backlog.iter().map(|e| e.key.as_str()).collect();
        // Ordered by candidate_since descending.
        assert_eq!(keys, vec!["old_err", "old_ok", "fresh"]);
    }

    #[tokio::test]
    async fn success_upserts_record_by_entity_id() {
        let storage = test_storage().await;
        storage.upsert_candidate("up", day(1)).await.unwrap();

        for (d, plot) in [(2, "first"), (3, "second")] {
            storage
                .record_success(
                    "up",
                    &EnrichmentRecord {
                        entity_id: "tt1049413".into(),
                        payload: serde_json::json!({"Plot": plot}),
                        updated_at: day(d),
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(storage.count_enrichment_records().await.unwrap(), 1);
        let record = storage
            .get_enrichment_record("tt1049413")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.payload["Plot"], "second");
        assert_eq!(record.updated_at, day(3));

        let entity = storage.get_entity("up").await.unwrap().unwrap();
        assert_eq!(entity.last_success_at, Some(day(3)));
    }

    #[tokio::test]
    async fn api_usage_accumulates_per_day() {
        let storage = test_storage().await;
        assert_eq!(storage.api_usage(day(1)).await.unwrap(), 0);

        storage.increment_api_usage(day(1), 25).await.unwrap();
        storage.increment_api_usage(day(1), 5).await.unwrap();
        storage.increment_api_usage(day(2), 1).await.unwrap();

        assert_eq!(storage.api_usage(day(1)).await.unwrap(), 30);
        assert_eq!(storage.api_usage(day(2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn api_usage_entry_reads_back_the_row() {
        let storage = test_storage().await;
        assert_eq!(storage.api_usage_entry(day(4)).await.unwrap(), None);

        storage.increment_api_usage(day(4), 12).await.unwrap();
        storage.increment_api_usage(day(4), 3).await.unwrap();

        assert_eq!(
            storage.api_usage_entry(day(4)).await.unwrap(),
            Some(ApiUsageLogEntry {
                date: day(4),
                request_count: 15,
            })
        );
    }
}
