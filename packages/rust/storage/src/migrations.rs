//! SQL migration definitions for the boxoffice database.
//!
//! Migrations are applied in order on database open. Raw feed tables are not
//! listed here: their names are configurable, so the loader creates them on
//! demand (see [`crate::Storage::ensure_raw_table`]).

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: raw_ingestion_log, entities_to_enrich, enrichment_records, api_usage_log",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Watermark per source table
CREATE TABLE IF NOT EXISTS raw_ingestion_log (
    source_table     TEXT PRIMARY KEY,
    last_ingested_at TEXT NOT NULL,
    record_count     INTEGER NOT NULL DEFAULT 0
);

-- Catalog entities awaiting metadata
CREATE TABLE IF NOT EXISTS entities_to_enrich (
    key             TEXT PRIMARY KEY,
    candidate_since TEXT NOT NULL,
    last_success_at TEXT,
    last_error_at   TEXT
);

CREATE INDEX IF NOT EXISTS idx_entities_candidate_since ON entities_to_enrich(candidate_since);

-- Fetched metadata keyed by external catalog id
CREATE TABLE IF NOT EXISTS enrichment_records (
    entity_id  TEXT PRIMARY KEY,
    payload    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Daily metadata API request counter
CREATE TABLE IF NOT EXISTS api_usage_log (
    date          TEXT PRIMARY KEY,
    request_count INTEGER NOT NULL DEFAULT 0
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
