//! libSQL storage layer: the ingestion log store.
//!
//! The [`Storage`] struct wraps an embedded libSQL database holding the
//! ingestion watermarks, raw feed tables, the enrichment backlog, fetched
//! metadata, and the daily API usage counter.
//!
//! **Access rules:**
//! - Loader and enrichment runs: read-write via [`Storage::open`]
//! - Status reporting: read-only via [`Storage::open_readonly`]
//!
//! Writes issued by concurrent enrichment workers each run on their own
//! connection so that one worker's transaction never absorbs another's
//! statements.

mod enrich;
mod ingest;
mod migrations;

use std::path::Path;
use std::time::Duration;

use boxoffice_shared::{BoxOfficeError, Result, StoreConfig};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::{debug, warn};

pub use ingest::DeltaOutcome;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Timestamp layout stored in TEXT columns; sorts lexicographically.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database in read-write mode, retrying the connection
    /// with exponential backoff, then apply pending migrations.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| BoxOfficeError::io(parent, e))?;
            }
        }

        let (db, conn) = connect_with_retry(config).await?;
        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database in read-only mode.
    pub async fn open_readonly(config: &StoreConfig) -> Result<Self> {
        let (db, conn) = connect_with_retry(config).await?;
        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        BoxOfficeError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(BoxOfficeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// A fresh connection for a self-contained unit of write work.
    fn write_connection(&self) -> Result<Connection> {
        self.check_writable()?;
        let conn = self.db.connect().map_err(BoxOfficeError::storage)?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(BoxOfficeError::storage)?;
        Ok(conn)
    }

    /// Run a single-value `COUNT(*)`-style query.
    async fn query_count(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<u64> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(BoxOfficeError::storage)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(BoxOfficeError::storage(e)),
        }
    }
}

/// Open the database and prove the connection usable, retrying with backoff.
async fn connect_with_retry(config: &StoreConfig) -> Result<(Database, Connection)> {
    let attempts = config.max_retries.max(1);
    let mut delay = config.retry_delay;
    let mut attempt = 1;

    loop {
        match try_connect(&config.path).await {
            Ok(pair) => {
                debug!(path = %config.path.display(), attempt, "store connected");
                return Ok(pair);
            }
            Err(e) if attempt < attempts => {
                warn!(
                    path = %config.path.display(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "store connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                return Err(BoxOfficeError::StoreUnavailable {
                    attempts,
                    message: e.to_string(),
                });
            }
        }
    }
}

async fn try_connect(path: &Path) -> std::result::Result<(Database, Connection), libsql::Error> {
    let db = libsql::Builder::new_local(path).build().await?;
    let conn = db.connect()?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.query("SELECT 1", params![]).await?;
    Ok((db, conn))
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| BoxOfficeError::Storage(format!("invalid timestamp '{s}': {e}")))
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    s.parse::<NaiveDate>()
        .map_err(|e| BoxOfficeError::Storage(format!("invalid date '{s}': {e}")))
}

fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(BoxOfficeError::storage)
}

fn get_opt_day(row: &libsql::Row, idx: i32) -> Result<Option<NaiveDate>> {
    match row.get::<String>(idx).ok() {
        Some(s) => parse_day(&s).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("bo_test_{}.db", Uuid::now_v7()));
        Storage::open(&StoreConfig::at(tmp)).await.expect("open test db")
    }
}
