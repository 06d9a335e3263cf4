//! Core domain types for the revenue feed and catalog enrichment.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BoxOfficeError;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Watermark used when a source has never been ingested.
pub fn watermark_floor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Normalize a title into an enrichment key: trimmed, single-spaced, lowercase.
pub fn normalize_title(title: &str) -> String {
    WHITESPACE_RE
        .replace_all(title.trim(), " ")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// TableName
// ---------------------------------------------------------------------------

/// A table name safe to interpolate into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for TableName {
    type Err = BoxOfficeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if IDENT_RE.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(BoxOfficeError::validation(format!("invalid table name `{s}`")))
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Last watermark processed for one source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionLogEntry {
    pub source_table: String,
    /// Monotonically non-decreasing per source.
    pub last_ingested_at: DateTime<Utc>,
    /// Rows inserted by the run that last advanced the watermark.
    pub record_count: u64,
}

/// A row of the daily revenue feed as published upstream.
///
/// All fields are text; `date` may be malformed and is validated on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRevenueRow {
    pub id: String,
    pub date: String,
    pub title: String,
    pub revenue: String,
    pub theaters: String,
    pub distributor: String,
}

/// A revenue row after it has been appended to the raw table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRevenueRecord {
    pub id: String,
    pub date: NaiveDate,
    pub title: String,
    pub revenue: String,
    pub theaters: String,
    pub distributor: String,
    pub ingested_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// A catalog entity that may need metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityToEnrich {
    /// Natural identifier (normalized title).
    pub key: String,
    /// Most recent day the entity appeared in the feed.
    pub candidate_since: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<NaiveDate>,
}

impl EntityToEnrich {
    /// A never-attempted candidate.
    pub fn new(key: impl Into<String>, candidate_since: NaiveDate) -> Self {
        Self {
            key: key.into(),
            candidate_since,
            last_success_at: None,
            last_error_at: None,
        }
    }
}

/// Metadata stored for one external catalog id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub updated_at: NaiveDate,
}

/// API requests made on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUsageLogEntry {
    pub date: NaiveDate,
    pub request_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_validation() {
        assert!("raw_revenues_per_day".parse::<TableName>().is_ok());
        assert!("_tmp1".parse::<TableName>().is_ok());
        assert!("1table".parse::<TableName>().is_err());
        assert!("main.revenues".parse::<TableName>().is_err());
        assert!("x; DROP TABLE y".parse::<TableName>().is_err());
        assert!("".parse::<TableName>().is_err());
    }

    #[test]
    fn normalize_title_collapses_whitespace() {
        assert_eq!(normalize_title("  The  Dark\tKnight "), "the dark knight");
        assert_eq!(normalize_title("Up"), "up");
    }

    #[test]
    fn floor_is_1900() {
        assert_eq!(watermark_floor().to_rfc3339(), "1900-01-01T00:00:00+00:00");
    }

    #[test]
    fn entity_serialization_skips_empty_dates() {
        let entity = EntityToEnrich::new(
            "up",
            NaiveDate::from_ymd_opt(2024, 5, 1).expect("valid date"),
        );
        let json = serde_json::to_string(&entity).expect("serialize");
        assert!(!json.contains("last_success_at"));
        let parsed: EntityToEnrich = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, entity);
    }
}
