//! Capture scheduling
//!
//! One process, two periodic tasks: a capture poll every few seconds
//! and a retention sweep a few times a day. The poll finds due pages,
//! claims or creates their jobs, and drives captures concurrently up to
//! the browser-pool size. Every page is handled behind a per-page
//! in-flight guard, and every failure is caught at the page boundary —
//! the poll loop itself never dies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::browser_pool::BrowserPool;
use crate::capture::{ordered_widths, CaptureOutcome, CapturePipeline, ProgressSink};
use crate::config::Config;
use crate::db::{Db, FailureState};
use crate::models::{PageContext, ViewportTag};
use crate::retention::RetentionSweep;
use crate::storage::ScreenshotStore;
use crate::WorkerError;

/// Longest backoff between automatic retries.
const MAX_RETRY_DELAY_MINUTES: i64 = 24 * 60;

/// Initial delay before the first retention sweep after startup.
const RETENTION_STARTUP_DELAY: Duration = Duration::from_secs(60);

/// A page the poll decided to capture now.
#[derive(Debug, Clone, Copy)]
pub struct DuePage {
    pub page_id: i64,
    /// Set when a user-triggered pending job is being claimed.
    pub pending_job_id: Option<i64>,
}

/// Whether a page with this failure history may be auto-retried at
/// `now`. Backoff doubles per consecutive failure, capped at one day;
/// past the failure cap only a user-triggered pending job runs the page
/// again.
pub fn retry_allowed(failure: &FailureState, config: &Config, now: DateTime<Utc>) -> bool {
    let k = failure.consecutive;
    if k == 0 {
        return true;
    }
    if k >= config.max_consecutive_failures {
        return false;
    }
    let Some(last_failure) = failure.last_failure_at else {
        return true;
    };
    let exponent = (k - 1).clamp(0, 20) as u32;
    let delay_minutes = config
        .base_retry_delay_minutes
        .saturating_mul(1i64 << exponent)
        .min(MAX_RETRY_DELAY_MINUTES);
    now - last_failure >= chrono::Duration::minutes(delay_minutes)
}

/// Due pages in dispatch order: pending jobs first (newest pending
/// first), then interval-due pages oldest capture first. Pages in
/// flight in this process are excluded.
pub async fn select_due_pages(
    db: &Db,
    config: &Config,
    active_jobs: &DashSet<i64>,
    now: DateTime<Utc>,
) -> Result<Vec<DuePage>, WorkerError> {
    let mut due = Vec::new();
    let mut seen: HashSet<i64> = HashSet::new();

    for job in db.pending_jobs().await? {
        if active_jobs.contains(&job.page_id) || !seen.insert(job.page_id) {
            continue;
        }
        due.push(DuePage {
            page_id: job.page_id,
            pending_job_id: Some(job.id),
        });
    }

    for page in db.active_pages().await? {
        if active_jobs.contains(&page.id) || seen.contains(&page.id) {
            continue;
        }
        // A non-terminal job from another claim means the page is
        // already being handled somewhere.
        if db.has_nonterminal_job(page.id).await? {
            continue;
        }

        let ctx = db.page_context(page.id).await?;
        let interval_minutes = ctx.effective_interval_minutes(config);
        let due_by_time = match page.last_screenshot_at {
            None => true,
            Some(last) => now - last >= chrono::Duration::minutes(interval_minutes),
        };
        if !due_by_time {
            continue;
        }

        let failure = db.failure_state(page.id).await?;
        if !retry_allowed(&failure, config, now) {
            continue;
        }

        seen.insert(page.id);
        due.push(DuePage {
            page_id: page.id,
            pending_job_id: None,
        });
    }

    Ok(due)
}

#[derive(Clone)]
pub struct Scheduler {
    db: Db,
    pool: Arc<BrowserPool>,
    pipeline: Arc<CapturePipeline>,
    config: Config,
    active_jobs: Arc<DashSet<i64>>,
}

impl Scheduler {
    pub fn new(
        db: Db,
        pool: Arc<BrowserPool>,
        pipeline: Arc<CapturePipeline>,
        config: Config,
    ) -> Self {
        Self {
            db,
            pool,
            pipeline,
            config,
            active_jobs: Arc::new(DashSet::new()),
        }
    }

    /// The in-flight page set, shared with the retention sweep so it
    /// never deletes under a running capture.
    pub fn active_jobs(&self) -> Arc<DashSet<i64>> {
        self.active_jobs.clone()
    }

    /// Capture poll loop. Runs until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        // Jobs orphaned by a previous crash fail before anything else.
        if let Err(e) = self
            .db
            .reset_stale_jobs(self.config.stale_job_timeout_minutes, Utc::now())
            .await
        {
            error!("startup stale-job reset failed: {e}");
        }

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "scheduler started, polling every {:?}",
            self.config.poll_interval
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = shutdown.changed() => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }

    /// Retention loop: first sweep a minute after startup, then on the
    /// configured cadence.
    pub async fn run_retention(&self, store: ScreenshotStore, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = sleep(RETENTION_STARTUP_DELAY) => {}
            _ = shutdown.changed() => return,
        }

        let sweep = RetentionSweep::new(self.db.clone(), store);
        let mut ticker = interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweep.run(&self.active_jobs).await {
                        Ok(report) => debug!(
                            "retention: {} pages, {} deleted",
                            report.pages_processed, report.screenshots_deleted
                        ),
                        Err(e) => error!("retention sweep failed: {e}"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One poll: reset stale jobs, find due pages, kick off a worker
    /// task per page. Concurrency is bounded by the browser pool.
    pub async fn poll_once(&self) {
        let now = Utc::now();
        if let Err(e) = self
            .db
            .reset_stale_jobs(self.config.stale_job_timeout_minutes, now)
            .await
        {
            error!("stale-job reset failed: {e}");
        }

        let due = match self.due_pages(now).await {
            Ok(due) => due,
            Err(e) => {
                error!("due-page selection failed: {e}");
                return;
            }
        };

        for item in due {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.process_page(item).await;
            });
        }
    }

    /// Due pages in dispatch order. See [`select_due_pages`].
    pub async fn due_pages(&self, now: DateTime<Utc>) -> Result<Vec<DuePage>, WorkerError> {
        select_due_pages(&self.db, &self.config, &self.active_jobs, now).await
    }

    /// Per-page worker. The `active_jobs` insert is the per-page mutex:
    /// two workers never run the same page at once.
    pub async fn process_page(&self, due: DuePage) {
        if !self.active_jobs.insert(due.page_id) {
            return;
        }
        let result = self.capture_one(due).await;
        self.active_jobs.remove(&due.page_id);

        if let Err(e) = result {
            error!("page {} capture errored: {e}", due.page_id);
        }
    }

    async fn capture_one(&self, due: DuePage) -> Result<(), WorkerError> {
        let now = Utc::now();
        let ctx = self.db.page_context(due.page_id).await?;
        let widths = ordered_widths(&ctx.effective_viewports(&self.config));
        let total = widths.len() as i64;

        let job_id = match due.pending_job_id {
            Some(job_id) => {
                // A pending job is only claimable while its page is
                // active.
                if !ctx.page.is_active {
                    debug!("pending job {job_id} left alone: page inactive");
                    return Ok(());
                }
                if !self.db.claim_pending_job(job_id, total, now).await? {
                    debug!("pending job {job_id} already claimed");
                    return Ok(());
                }
                job_id
            }
            None => match self.db.create_capturing_job(due.page_id, total, now).await? {
                Some(job_id) => job_id,
                None => {
                    debug!("page {} already has a non-terminal job", due.page_id);
                    return Ok(());
                }
            },
        };

        match self.drive_capture(job_id, &ctx).await {
            Ok(outcome) if outcome.succeeded() => {
                self.persist_outcome(&ctx, &outcome).await?;
                self.db.complete_job(job_id, Utc::now()).await?;
                metrics::counter!("pagewatch_jobs_completed", 1);
                info!(
                    "page {} captured: {}/{} viewports",
                    ctx.page.id,
                    outcome.captures.len(),
                    outcome.viewports_total
                );
            }
            Ok(outcome) => {
                // Instruction bookkeeping still applies: their failures
                // are real even when every viewport fell over.
                self.persist_instruction_outcomes(&outcome).await?;
                self.db
                    .fail_job(job_id, "all viewports failed", Utc::now())
                    .await?;
                metrics::counter!("pagewatch_jobs_failed", 1);
                warn!("page {} failed: no viewport succeeded", ctx.page.id);
            }
            Err(e) => {
                self.db.fail_job(job_id, &e.to_string(), Utc::now()).await?;
                metrics::counter!("pagewatch_jobs_failed", 1);
                warn!("page {} failed: {e}", ctx.page.id);
            }
        }

        Ok(())
    }

    async fn drive_capture(
        &self,
        job_id: i64,
        ctx: &PageContext,
    ) -> Result<CaptureOutcome, WorkerError> {
        let handle = self.pool.acquire().await?;
        let progress = JobProgress {
            db: self.db.clone(),
            job_id,
        };
        let result = self
            .pipeline
            .capture_page(handle.browser(), ctx, &progress)
            .await;
        self.pool.release(handle).await;
        result
    }

    /// Instruction-row stats, test-row stats and the page's capture
    /// timestamp. Partial success still counts as a capture.
    async fn persist_outcome(
        &self,
        ctx: &PageContext,
        outcome: &CaptureOutcome,
    ) -> Result<(), WorkerError> {
        self.persist_instruction_outcomes(outcome).await?;

        let now = Utc::now();
        for capture in &outcome.captures {
            for test in &capture.test_outcomes {
                if test.passed {
                    self.db.record_test_success(test.test_id, now).await?;
                } else {
                    self.db
                        .record_test_failure(test.test_id, &test.message, now)
                        .await?;
                }
            }
        }

        self.db.set_page_last_screenshot(ctx.page.id, now).await?;
        Ok(())
    }

    async fn persist_instruction_outcomes(
        &self,
        outcome: &CaptureOutcome,
    ) -> Result<(), WorkerError> {
        let now = Utc::now();
        for instruction in &outcome.instruction_outcomes {
            match &instruction.error {
                None => {
                    self.db
                        .record_instruction_success(instruction.instruction_id, now)
                        .await?
                }
                Some(error) => {
                    self.db
                        .record_instruction_failure(instruction.instruction_id, error, now)
                        .await?
                }
            }
        }
        Ok(())
    }
}

/// Progress sink that mirrors pipeline progress into the job row.
struct JobProgress {
    db: Db,
    job_id: i64,
}

#[async_trait]
impl ProgressSink for JobProgress {
    async fn on_progress(&self, viewport: ViewportTag, completed: u32, _total: u32) {
        if let Err(e) = self
            .db
            .update_job_progress(self.job_id, viewport, completed as i64)
            .await
        {
            warn!("progress update failed for job {}: {e}", self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(consecutive: i64, minutes_ago: i64) -> FailureState {
        FailureState {
            consecutive,
            last_failure_at: Some(Utc::now() - chrono::Duration::minutes(minutes_ago)),
        }
    }

    #[test]
    fn no_failures_always_retryable() {
        let config = Config::default();
        let state = FailureState {
            consecutive: 0,
            last_failure_at: None,
        };
        assert!(retry_allowed(&state, &config, Utc::now()));
    }

    #[test]
    fn backoff_doubles_per_failure() {
        let config = Config::default();
        let now = Utc::now();

        // k=1: 5 min delay.
        assert!(!retry_allowed(&failure(1, 4), &config, now));
        assert!(retry_allowed(&failure(1, 6), &config, now));

        // k=2: 10 min delay.
        assert!(!retry_allowed(&failure(2, 9), &config, now));
        assert!(retry_allowed(&failure(2, 11), &config, now));

        // k=3: 20 min delay.
        assert!(!retry_allowed(&failure(3, 19), &config, now));
        assert!(retry_allowed(&failure(3, 21), &config, now));
    }

    #[test]
    fn backoff_caps_at_one_day() {
        let mut config = Config::default();
        config.max_consecutive_failures = 50;
        let now = Utc::now();
        // 2^20 × 5 min would be years; the cap makes a day enough.
        assert!(retry_allowed(&failure(21, 24 * 60 + 1), &config, now));
        assert!(!retry_allowed(&failure(21, 23 * 60), &config, now));
    }

    #[test]
    fn failure_cap_stops_auto_retry() {
        let config = Config::default();
        let now = Utc::now();
        assert!(!retry_allowed(&failure(5, 100_000), &config, now));
        assert!(!retry_allowed(&failure(9, 100_000), &config, now));
    }
}
