//! Bounded-concurrency enrichment scheduler.
//!
//! Drives the backlog through a [`MetadataSource`] with at most
//! `concurrency` requests in flight, records each entity's outcome, and stops
//! dispatching the moment the API reports its quota as spent. Requests already
//! in flight are allowed to finish and their outcomes are still recorded.

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use boxoffice_metadata::{MetadataSource, Outcome};
use boxoffice_shared::{BoxOfficeError, EnrichConfig, EnrichmentRecord, EntityToEnrich, Result};
use boxoffice_storage::Storage;

use crate::backlog::{select_backlog, stale_cutoff};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Terminal state of one entity in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Metadata stored and `last_success_at` set.
    Succeeded,
    /// `last_error_at` set; retried once the staleness window passes.
    Failed,
    /// Left untouched because the quota ran out. Eligible on the next run.
    Skipped,
}

/// Summary of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    /// Entities handed to a worker.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Entities left unmarked because dispatch stopped on quota, including
    /// those never dispatched.
    pub quota_skipped: usize,
    /// Requests that actually reached the API.
    pub total_requests: u64,
    /// Whether the run stopped early on quota exhaustion.
    pub quota_exhausted: bool,
}

impl EnrichmentReport {
    /// `(successes, requests made)`.
    pub fn counts(&self) -> (usize, u64) {
        (self.succeeded, self.total_requests)
    }

    fn tally(&mut self, attempt: &Attempt) {
        self.attempted += 1;
        if attempt.requested {
            self.total_requests += 1;
        }
        match attempt.state {
            EntityState::Succeeded => self.succeeded += 1,
            EntityState::Failed => self.failed += 1,
            EntityState::Skipped => {
                self.quota_skipped += 1;
                if attempt.requested {
                    self.quota_exhausted = true;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for enrichment runs.
pub trait EnrichmentProgress: Send + Sync {
    /// Called once with the backlog size before dispatch starts.
    fn started(&self, total: usize);
    /// Called as each entity reaches a terminal state.
    fn completed(&self, key: &str, state: EntityState);
    /// Called once when the API reports its quota spent.
    fn quota_exhausted(&self);
}

/// No-op enrichment progress.
pub struct SilentProgress;

impl EnrichmentProgress for SilentProgress {
    fn started(&self, _total: usize) {}
    fn completed(&self, _key: &str, _state: EntityState) {}
    fn quota_exhausted(&self) {}
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Key reported to progress for a worker that panicked.
pub const PANICKED_WORKER_KEY: &str = "<panicked worker>";

/// Result of one worker.
#[derive(Debug)]
struct Attempt {
    key: String,
    state: EntityState,
    /// Whether the worker called the API.
    requested: bool,
    /// Store failure while recording the outcome.
    error: Option<BoxOfficeError>,
}

/// Runs metadata fetches for a backlog under a fixed concurrency ceiling.
pub struct EnrichmentScheduler {
    storage: Arc<Storage>,
    source: Arc<dyn MetadataSource>,
    concurrency: usize,
}

impl EnrichmentScheduler {
    pub fn new(
        storage: Arc<Storage>,
        source: Arc<dyn MetadataSource>,
        config: &EnrichConfig,
    ) -> Self {
        Self {
            storage,
            source,
            concurrency: config.concurrency.max(1),
        }
    }

    /// Override the concurrency ceiling (minimum 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Process `backlog` in order, at most `concurrency` requests at a time.
    ///
    /// Quota exhaustion is not an error: the run returns normally with
    /// partial counts and `quota_exhausted` set. A store failure while
    /// recording an outcome stops dispatch and is returned once in-flight
    /// workers have drained. The day's API usage is incremented by the
    /// requests made in either case.
    #[instrument(skip_all, fields(entities = backlog.len(), concurrency = self.concurrency, today = %today))]
    pub async fn run(
        &self,
        backlog: Vec<EntityToEnrich>,
        today: NaiveDate,
        progress: &dyn EnrichmentProgress,
    ) -> Result<EnrichmentReport> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let cancel = CancellationToken::new();
        let mut tasks: JoinSet<Attempt> = JoinSet::new();
        let mut report = EnrichmentReport::default();
        let mut first_error: Option<BoxOfficeError> = None;

        progress.started(backlog.len());
        info!("starting enrichment run");

        let mut queue = backlog.into_iter();
        while let Some(entity) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit.filter(|_| !cancel.is_cancelled()) else {
                report.quota_skipped += 1 + queue.len();
                debug!(undispatched = 1 + queue.len(), "dispatch stopped");
                break;
            };

            let storage = self.storage.clone();
            let source = self.source.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let attempt = attempt_entity(&storage, source.as_ref(), entity.key, today, &cancel).await;
                drop(permit);
                attempt
            });

            while let Some(joined) = tasks.try_join_next() {
                absorb(joined, &mut report, &mut first_error, progress);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            absorb(joined, &mut report, &mut first_error, progress);
        }

        if report.total_requests > 0 {
            if let Err(e) = self
                .storage
                .increment_api_usage(today, report.total_requests)
                .await
            {
                error!(error = %e, requests = report.total_requests, "failed to record API usage");
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            quota_skipped = report.quota_skipped,
            total_requests = report.total_requests,
            quota_exhausted = report.quota_exhausted,
            "enrichment run finished"
        );
        Ok(report)
    }
}

/// Fold one joined worker into the report.
fn absorb(
    joined: std::result::Result<Attempt, JoinError>,
    report: &mut EnrichmentReport,
    first_error: &mut Option<BoxOfficeError>,
    progress: &dyn EnrichmentProgress,
) {
    let mut attempt = match joined {
        Ok(attempt) => attempt,
        Err(e) => {
            // The request may have gone out before the panic. The key went
            // down with the task, so progress gets a placeholder.
            error!(error = %e, "enrichment worker panicked");
            report.attempted += 1;
            report.failed += 1;
            report.total_requests += 1;
            progress.completed(PANICKED_WORKER_KEY, EntityState::Failed);
            return;
        }
    };

    if let Some(e) = attempt.error.take() {
        first_error.get_or_insert(e);
    }
    let first_quota = attempt.state == EntityState::Skipped
        && attempt.requested
        && !report.quota_exhausted;

    report.tally(&attempt);
    progress.completed(&attempt.key, attempt.state);
    if first_quota {
        progress.quota_exhausted();
    }
}

/// Fetch one entity and record its outcome.
async fn attempt_entity(
    storage: &Storage,
    source: &dyn MetadataSource,
    key: String,
    today: NaiveDate,
    cancel: &CancellationToken,
) -> Attempt {
    if cancel.is_cancelled() {
        return Attempt {
            key,
            state: EntityState::Skipped,
            requested: false,
            error: None,
        };
    }

    let outcome = source.fetch(&key).await;
    let recorded = match outcome {
        Outcome::Success(payload) => {
            let record = EnrichmentRecord {
                entity_id: payload.external_id,
                payload: payload.document,
                updated_at: today,
            };
            storage
                .record_success(&key, &record)
                .await
                .map(|()| EntityState::Succeeded)
        }
        Outcome::QuotaExceeded => {
            warn!(entity = %key, "quota exhausted, stopping dispatch");
            cancel.cancel();
            Ok(EntityState::Skipped)
        }
        Outcome::NotFound | Outcome::TransientError(_) | Outcome::UnexpectedError(_) => storage
            .record_failure(&key, today)
            .await
            .map(|()| EntityState::Failed),
    };

    match recorded {
        Ok(state) => Attempt {
            key,
            state,
            requested: true,
            error: None,
        },
        Err(e) => {
            error!(entity = %key, error = %e, "failed to record enrichment outcome");
            cancel.cancel();
            Attempt {
                key,
                state: EntityState::Failed,
                requested: true,
                error: Some(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Select the backlog as of `today` and run the scheduler over it.
#[instrument(skip_all, fields(today = %today, stale_after_days = config.stale_after_days))]
pub async fn enrich_backlog(
    storage: Arc<Storage>,
    source: Arc<dyn MetadataSource>,
    config: &EnrichConfig,
    today: NaiveDate,
    progress: &dyn EnrichmentProgress,
) -> Result<EnrichmentReport> {
    let cutoff = stale_cutoff(today, config.stale_after_days);
    let backlog = select_backlog(&storage, cutoff).await?;
    if backlog.is_empty() {
        info!("enrichment backlog is empty");
        return Ok(EnrichmentReport::default());
    }

    EnrichmentScheduler::new(storage, source, config)
        .run(backlog, today, progress)
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
