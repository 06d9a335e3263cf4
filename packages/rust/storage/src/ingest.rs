//! Raw feed tables, watermarks, and the transactional delta insert.

use boxoffice_shared::{
    BoxOfficeError, IngestionLogEntry, RawRevenueRecord, Result, SourceRevenueRow, TableName,
    watermark_floor,
};
use chrono::{DateTime, Utc};
use libsql::{Connection, TransactionBehavior, params};
use tracing::debug;

use crate::{Storage, format_ts, get_string, parse_day, parse_ts};

/// SQL expression yielding the row's `date` as `YYYY-MM-DD`, or NULL when the
/// text is not a calendar date. Bare numbers would otherwise be read as
/// Julian day numbers by `date()`, and `date()` rolls impossible days such as
/// `2024-02-30` into the next month, so the result must round-trip.
const SOURCE_DAY_EXPR: &str = "CASE WHEN src.date GLOB '[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]*' \
     AND date(src.date) = substr(src.date, 1, 10) \
     THEN date(src.date) END";

/// Result of one transactional delta insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Watermark read at the start of the transaction.
    pub previous_watermark: DateTime<Utc>,
    /// Watermark after commit (unchanged when nothing was inserted).
    pub watermark: DateTime<Utc>,
    /// Rows appended to the target.
    pub inserted: u64,
    /// Source rows excluded because their date could not be parsed.
    pub malformed_rows: u64,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Table setup
    // -----------------------------------------------------------------------

    /// Create a feed-side source table if it does not exist.
    pub async fn ensure_source_table(&self, table: &TableName) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id          TEXT,
                    date        TEXT,
                    title       TEXT,
                    revenue     TEXT,
                    theaters    TEXT,
                    distributor TEXT
                );"
            ))
            .await
            .map_err(BoxOfficeError::storage)?;
        Ok(())
    }

    /// Create a raw target table (unique on `(id, date)`) if it does not exist.
    pub async fn ensure_raw_table(&self, table: &TableName) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id          TEXT NOT NULL,
                    date        TEXT NOT NULL,
                    title       TEXT,
                    revenue     TEXT,
                    theaters    TEXT,
                    distributor TEXT,
                    ingested_at TEXT NOT NULL,
                    UNIQUE(id, date)
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_date ON {table}(date);"
            ))
            .await
            .map_err(BoxOfficeError::storage)?;
        Ok(())
    }

    /// Append rows to a source table in one transaction. Returns rows written.
    pub async fn insert_source_rows(
        &self,
        table: &TableName,
        rows: &[SourceRevenueRow],
    ) -> Result<u64> {
        let conn = self.write_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(BoxOfficeError::storage)?;

        let sql = format!(
            "INSERT INTO {table} (id, date, title, revenue, theaters, distributor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        );
        let mut written = 0;
        for row in rows {
            written += tx
                .execute(
                    &sql,
                    params![
                        row.id.as_str(),
                        row.date.as_str(),
                        row.title.as_str(),
                        row.revenue.as_str(),
                        row.theaters.as_str(),
                        row.distributor.as_str(),
                    ],
                )
                .await
                .map_err(BoxOfficeError::storage)?;
        }

        tx.commit().await.map_err(BoxOfficeError::storage)?;
        Ok(written)
    }

    // -----------------------------------------------------------------------
    // Watermarks
    // -----------------------------------------------------------------------

    /// Get the ingestion log entry for a source table.
    pub async fn ingestion_log(&self, source_table: &str) -> Result<Option<IngestionLogEntry>> {
        read_ingestion_log(&self.conn, source_table).await
    }

    /// Count source rows with a valid date later than the current watermark.
    pub async fn count_pending_rows(&self, source: &TableName) -> Result<u64> {
        let watermark = self
            .ingestion_log(source.as_str())
            .await?
            .map(|entry| entry.last_ingested_at)
            .unwrap_or_else(watermark_floor);

        self.query_count(
            &format!(
                "SELECT COUNT(*) FROM {source} src
                 WHERE ({SOURCE_DAY_EXPR}) > date(?1)"
            ),
            params![format_ts(watermark)],
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Delta insert
    // -----------------------------------------------------------------------

    /// Move rows dated after the watermark from `source` into `target`,
    /// skipping `(id, date)` pairs already present, and advance the watermark
    /// to `ingested_at` when anything was inserted.
    ///
    /// The watermark read, the insert, and the watermark write share one
    /// `IMMEDIATE` transaction, so concurrent loaders for the same source
    /// serialize on the database write lock.
    pub async fn ingest_delta(
        &self,
        source: &TableName,
        target: &TableName,
        ingested_at: DateTime<Utc>,
    ) -> Result<DeltaOutcome> {
        let conn = self.write_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(BoxOfficeError::storage)?;

        let previous_watermark = read_ingestion_log(&tx, source.as_str())
            .await?
            .map(|entry| entry.last_ingested_at)
            .unwrap_or_else(watermark_floor);

        let malformed_rows = {
            let mut rows = tx
                .query(
                    &format!("SELECT COUNT(*) FROM {source} src WHERE ({SOURCE_DAY_EXPR}) IS NULL"),
                    params![],
                )
                .await
                .map_err(BoxOfficeError::storage)?;
            match rows.next().await.map_err(BoxOfficeError::storage)? {
                Some(row) => row.get::<i64>(0).unwrap_or(0).max(0) as u64,
                None => 0,
            }
        };

        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO {target} (id, date, title, revenue, theaters, distributor, ingested_at)
                     SELECT d.id, d.day, d.title, d.revenue, d.theaters, d.distributor, ?2
                     FROM (
                         SELECT src.id, ({SOURCE_DAY_EXPR}) AS day,
                                src.title, src.revenue, src.theaters, src.distributor
                         FROM {source} src
                     ) d
                     WHERE d.id IS NOT NULL
                       AND d.day IS NOT NULL
                       AND d.day > date(?1)
                       AND NOT EXISTS (
                           SELECT 1 FROM {target} tgt
                           WHERE tgt.id = d.id AND tgt.date = d.day
                       )
                     ON CONFLICT(id, date) DO NOTHING"
                ),
                params![format_ts(previous_watermark), format_ts(ingested_at)],
            )
            .await
            .map_err(BoxOfficeError::storage)?;

        if inserted == 0 {
            tx.rollback().await.map_err(BoxOfficeError::storage)?;
            debug!(%source, %target, malformed_rows, "no new rows, watermark unchanged");
            return Ok(DeltaOutcome {
                previous_watermark,
                watermark: previous_watermark,
                inserted: 0,
                malformed_rows,
            });
        }

        // MAX keeps the watermark monotonic if the wall clock stepped back.
        tx.execute(
            "INSERT INTO raw_ingestion_log (source_table, last_ingested_at, record_count)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(source_table) DO UPDATE SET
               last_ingested_at = MAX(raw_ingestion_log.last_ingested_at, excluded.last_ingested_at),
               record_count = excluded.record_count",
            params![source.as_str(), format_ts(ingested_at), inserted as i64],
        )
        .await
        .map_err(BoxOfficeError::storage)?;

        let watermark = read_ingestion_log(&tx, source.as_str())
            .await?
            .map(|entry| entry.last_ingested_at)
            .unwrap_or(ingested_at);

        tx.commit().await.map_err(BoxOfficeError::storage)?;

        Ok(DeltaOutcome {
            previous_watermark,
            watermark,
            inserted,
            malformed_rows,
        })
    }

    // -----------------------------------------------------------------------
    // Raw table reads
    // -----------------------------------------------------------------------

    /// List all rows of a raw table, ordered by `(date, id)`.
    pub async fn list_raw_records(&self, target: &TableName) -> Result<Vec<RawRevenueRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT id, date, title, revenue, theaters, distributor, ingested_at
                     FROM {target} ORDER BY date, id"
                ),
                params![],
            )
            .await
            .map_err(BoxOfficeError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(BoxOfficeError::storage)? {
            results.push(RawRevenueRecord {
                id: get_string(&row, 0)?,
                date: parse_day(&get_string(&row, 1)?)?,
                title: row.get::<String>(2).unwrap_or_default(),
                revenue: row.get::<String>(3).unwrap_or_default(),
                theaters: row.get::<String>(4).unwrap_or_default(),
                distributor: row.get::<String>(5).unwrap_or_default(),
                ingested_at: parse_ts(&get_string(&row, 6)?)?,
            });
        }
        Ok(results)
    }

    /// Latest date seen per raw title. Returns `Vec<(title, latest_date)>`.
    pub async fn latest_date_by_title(
        &self,
        target: &TableName,
    ) -> Result<Vec<(String, chrono::NaiveDate)>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT title, MAX(date) FROM {target}
                     WHERE title IS NOT NULL AND TRIM(title) != ''
                     GROUP BY title"
                ),
                params![],
            )
            .await
            .map_err(BoxOfficeError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(BoxOfficeError::storage)? {
            results.push((get_string(&row, 0)?, parse_day(&get_string(&row, 1)?)?));
        }
        Ok(results)
    }
}

async fn read_ingestion_log(
    conn: &Connection,
    source_table: &str,
) -> Result<Option<IngestionLogEntry>> {
    let mut rows = conn
        .query(
            "SELECT source_table, last_ingested_at, record_count
             FROM raw_ingestion_log WHERE source_table = ?1",
            params![source_table],
        )
        .await
        .map_err(BoxOfficeError::storage)?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(IngestionLogEntry {
            source_table: get_string(&row, 0)?,
            last_ingested_at: parse_ts(&get_string(&row, 1)?)?,
            record_count: row.get::<i64>(2).unwrap_or(0).max(0) as u64,
        })),
        Ok(None) => Ok(None),
        Err(e) => Err(BoxOfficeError::storage(e)),
    }
}
