//! Backlog selection: which entities are due for an enrichment attempt.

use chrono::{Days, NaiveDate};
use tracing::{debug, instrument};

use boxoffice_shared::{EntityToEnrich, Result};
use boxoffice_storage::Storage;

/// Cutoff before which past attempts count as stale.
pub fn stale_cutoff(today: NaiveDate, stale_after_days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(stale_after_days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Entities never fetched, or whose last success and last error both predate
/// `stale_cutoff`. Ordered by most recent `candidate_since` first, so the
/// most newsworthy entities are dispatched first.
#[instrument(skip(storage))]
pub async fn select_backlog(
    storage: &Storage,
    stale_cutoff: NaiveDate,
) -> Result<Vec<EntityToEnrich>> {
    let backlog = storage.select_backlog(stale_cutoff).await?;
    debug!(entities = backlog.len(), "selected enrichment backlog");
    Ok(backlog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    #[test]
    fn cutoff_is_window_before_today() {
        assert_eq!(stale_cutoff(day(15), 7), day(8));
        assert_eq!(stale_cutoff(day(15), 0), day(15));
        assert_eq!(stale_cutoff(NaiveDate::MIN, 7), NaiveDate::MIN);
    }

    #[tokio::test]
    async fn failed_entity_returns_after_window() {
        let storage = test_storage().await;
        storage.upsert_candidate("heat", day(1)).await.unwrap();
        storage.record_failure("heat", day(2)).await.unwrap();

        // Next day: still inside the window.
        let backlog = select_backlog(&storage, stale_cutoff(day(3), 7)).await.unwrap();
        assert!(backlog.is_empty());

        // A week and a day later: eligible again.
        let backlog = select_backlog(&storage, stale_cutoff(day(10), 7)).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].key, "heat");
    }

    #[tokio::test]
    async fn newest_candidates_first() {
        let storage = test_storage().await;
        for (key, d) in [("a", 3), ("b", 9), ("c", 5)] {
            storage.upsert_candidate(key, day(d)).await.unwrap();
        }
        let keys: Vec<_> = select_backlog(&storage, day(1))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
    }
}
