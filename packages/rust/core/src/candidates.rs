//! Derive enrichment candidates from the raw revenue table.
//!
//! Every distinct normalized title becomes one candidate keyed by that title,
//! with its latest feed date as `candidate_since`.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{info, instrument};

use boxoffice_shared::{Result, TableName, normalize_title};
use boxoffice_storage::Storage;

/// Upsert one candidate per normalized title in `raw_table`.
/// Returns the number of candidates written.
#[instrument(skip_all, fields(raw_table = %raw_table))]
pub async fn refresh_candidates(storage: &Storage, raw_table: &TableName) -> Result<usize> {
    let mut latest: BTreeMap<String, NaiveDate> = BTreeMap::new();
    for (title, date) in storage.latest_date_by_title(raw_table).await? {
        let key = normalize_title(&title);
        if key.is_empty() {
            continue;
        }
        latest
            .entry(key)
            .and_modify(|seen| *seen = (*seen).max(date))
            .or_insert(date);
    }

    for (key, since) in &latest {
        storage.upsert_candidate(key, *since).await?;
    }

    info!(candidates = latest.len(), "refreshed enrichment candidates");
    Ok(latest.len())
}
