//! Persistence layer
//!
//! All SQL lives here. Job status transitions are single-row updates
//! guarded by the expected current status, so the database stays the
//! source of truth for cross-process coordination.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::models::{
    CaptureJob, Instruction, JobStatus, Page, PageContext, PageTest, Screenshot, Site,
    UserSettings, ViewportTag,
};
use crate::WorkerError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_settings (
    user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    capture_interval_minutes INTEGER NOT NULL DEFAULT 1440,
    viewport_widths TEXT NOT NULL DEFAULT '[1920,768,375]',
    retention_enabled INTEGER NOT NULL DEFAULT 0,
    max_screenshots_per_page INTEGER,
    max_age_days INTEGER,
    keep_per_day INTEGER NOT NULL DEFAULT 4,
    keep_per_week INTEGER NOT NULL DEFAULT 2,
    keep_per_month INTEGER NOT NULL DEFAULT 1,
    keep_per_year INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS sites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    domain TEXT NOT NULL,
    name TEXT NOT NULL,
    capture_interval_minutes INTEGER,
    viewport_widths TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id INTEGER NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    name TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_screenshot_at TEXT,
    capture_interval_minutes INTEGER,
    viewport_widths TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS screenshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id INTEGER NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    viewport TEXT NOT NULL,
    viewport_width INTEGER NOT NULL,
    file_path TEXT,
    thumbnail_path TEXT,
    file_size INTEGER NOT NULL DEFAULT 0,
    image_width INTEGER NOT NULL DEFAULT 0,
    image_height INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_screenshots_page_created
    ON screenshots(page_id, created_at DESC);

CREATE TABLE IF NOT EXISTS instructions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id INTEGER NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    prompt TEXT NOT NULL DEFAULT '',
    script TEXT NOT NULL DEFAULT '',
    script_type TEXT NOT NULL DEFAULT 'eval',
    execution_order INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_error TEXT,
    last_error_at TEXT,
    last_success_at TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id INTEGER NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    prompt TEXT NOT NULL DEFAULT '',
    script TEXT NOT NULL DEFAULT '',
    script_type TEXT NOT NULL DEFAULT 'eval',
    viewports TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_error TEXT,
    last_error_at TEXT,
    last_success_at TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS capture_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id INTEGER NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pending',
    current_viewport TEXT,
    viewports_completed INTEGER NOT NULL DEFAULT 0,
    viewports_total INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_capture_jobs_page
    ON capture_jobs(page_id, id DESC);

CREATE TABLE IF NOT EXISTS screenshot_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    screenshot_id INTEGER NOT NULL REFERENCES screenshots(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    source_url TEXT,
    line_number INTEGER,
    request_url TEXT,
    failure_text TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS test_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    test_id INTEGER NOT NULL REFERENCES tests(id) ON DELETE CASCADE,
    screenshot_id INTEGER NOT NULL REFERENCES screenshots(id) ON DELETE CASCADE,
    passed INTEGER NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#;

/// Consecutive-failure picture for one page, used by retry backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureState {
    /// Failed jobs since the last job in any other state.
    pub consecutive: i64,
    /// Completion time of the most recent failed job in that run.
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self, WorkerError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| WorkerError::Configuration(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create every table the worker touches. Schema migrations beyond
    /// this are owned by the public API's deployment.
    pub async fn ensure_schema(&self) -> Result<(), WorkerError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- page and policy loading ---

    pub async fn active_pages(&self) -> Result<Vec<Page>, WorkerError> {
        let pages = sqlx::query_as::<_, Page>(
            "SELECT * FROM pages WHERE is_active = 1 ORDER BY last_screenshot_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(pages)
    }

    pub async fn page(&self, page_id: i64) -> Result<Page, WorkerError> {
        let page = sqlx::query_as::<_, Page>("SELECT * FROM pages WHERE id = ?")
            .bind(page_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(page)
    }

    pub async fn page_context(&self, page_id: i64) -> Result<PageContext, WorkerError> {
        let page = self.page(page_id).await?;
        let site = sqlx::query_as::<_, Site>("SELECT * FROM sites WHERE id = ?")
            .bind(page.site_id)
            .fetch_one(&self.pool)
            .await?;
        let settings =
            sqlx::query_as::<_, UserSettings>("SELECT * FROM user_settings WHERE user_id = ?")
                .bind(site.user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(PageContext {
            page,
            site,
            settings,
        })
    }

    // --- capture jobs ---

    /// Pending jobs for active pages, newest first. User-triggered work
    /// jumps the schedule queue.
    pub async fn pending_jobs(&self) -> Result<Vec<CaptureJob>, WorkerError> {
        let jobs = sqlx::query_as::<_, CaptureJob>(
            "SELECT j.* FROM capture_jobs j \
             JOIN pages p ON p.id = j.page_id \
             WHERE j.status = 'pending' AND p.is_active = 1 \
             ORDER BY j.id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn has_nonterminal_job(&self, page_id: i64) -> Result<bool, WorkerError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM capture_jobs \
             WHERE page_id = ? AND status IN ('pending', 'capturing')",
        )
        .bind(page_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 > 0)
    }

    /// pending → capturing. Returns false when another worker got there
    /// first or the job is no longer pending.
    pub async fn claim_pending_job(
        &self,
        job_id: i64,
        viewports_total: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, WorkerError> {
        let result = sqlx::query(
            "UPDATE capture_jobs \
             SET status = 'capturing', started_at = ?, viewports_total = ?, \
                 viewports_completed = 0, error_message = NULL \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(viewports_total)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Create a job directly in `capturing` for a scheduled run. The
    /// NOT EXISTS guard keeps at most one non-terminal job per page.
    pub async fn create_capturing_job(
        &self,
        page_id: i64,
        viewports_total: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, WorkerError> {
        let result = sqlx::query(
            "INSERT INTO capture_jobs \
                 (page_id, status, viewports_completed, viewports_total, started_at, created_at) \
             SELECT ?, 'capturing', 0, ?, ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM capture_jobs \
                               WHERE page_id = ? AND status IN ('pending', 'capturing'))",
        )
        .bind(page_id)
        .bind(viewports_total)
        .bind(now)
        .bind(now)
        .bind(page_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(Some(result.last_insert_rowid()))
        } else {
            Ok(None)
        }
    }

    pub async fn update_job_progress(
        &self,
        job_id: i64,
        current_viewport: ViewportTag,
        completed: i64,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            "UPDATE capture_jobs SET current_viewport = ?, viewports_completed = ? \
             WHERE id = ? AND status = 'capturing'",
        )
        .bind(current_viewport.as_str())
        .bind(completed)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// capturing → completed. Every viewport has been processed by now,
    /// so the progress counter lands at the total and never regresses.
    pub async fn complete_job(&self, job_id: i64, now: DateTime<Utc>) -> Result<(), WorkerError> {
        sqlx::query(
            "UPDATE capture_jobs \
             SET status = 'completed', viewports_completed = viewports_total, \
                 current_viewport = NULL, completed_at = ? \
             WHERE id = ? AND status = 'capturing'",
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_job(
        &self,
        job_id: i64,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            "UPDATE capture_jobs \
             SET status = 'failed', error_message = ?, current_viewport = NULL, completed_at = ? \
             WHERE id = ? AND status IN ('pending', 'capturing')",
        )
        .bind(message)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Force-fail `capturing` jobs whose worker evidently died.
    pub async fn reset_stale_jobs(
        &self,
        timeout_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, WorkerError> {
        let cutoff = now - chrono::Duration::minutes(timeout_minutes);
        let result = sqlx::query(
            "UPDATE capture_jobs \
             SET status = 'failed', \
                 error_message = 'Job timed out (worker restarted or crashed)', \
                 completed_at = ? \
             WHERE status = 'capturing' AND started_at < ?",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Failed jobs since the last job in any non-failed state, plus when
    /// the latest of them completed. Both `pending` and `capturing` break
    /// the chain.
    pub async fn failure_state(&self, page_id: i64) -> Result<FailureState, WorkerError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM capture_jobs \
             WHERE page_id = ? AND status = 'failed' \
               AND id > COALESCE((SELECT MAX(id) FROM capture_jobs \
                                  WHERE page_id = ? AND status != 'failed'), 0)",
        )
        .bind(page_id)
        .bind(page_id)
        .fetch_one(&self.pool)
        .await?;

        let last_failure_at: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "SELECT completed_at FROM capture_jobs \
             WHERE page_id = ? AND status = 'failed' \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(FailureState {
            consecutive: count.0,
            last_failure_at: last_failure_at.and_then(|row| row.0),
        })
    }

    pub async fn job(&self, job_id: i64) -> Result<CaptureJob, WorkerError> {
        let job = sqlx::query_as::<_, CaptureJob>("SELECT * FROM capture_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(job)
    }

    // --- instructions & tests ---

    pub async fn active_instructions(&self, page_id: i64) -> Result<Vec<Instruction>, WorkerError> {
        let rows = sqlx::query_as::<_, Instruction>(
            "SELECT * FROM instructions \
             WHERE page_id = ? AND is_active = 1 AND script != '' \
             ORDER BY execution_order ASC, id ASC",
        )
        .bind(page_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn active_tests(&self, page_id: i64) -> Result<Vec<PageTest>, WorkerError> {
        let rows = sqlx::query_as::<_, PageTest>(
            "SELECT * FROM tests \
             WHERE page_id = ? AND is_active = 1 AND script != '' \
             ORDER BY id ASC",
        )
        .bind(page_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn record_instruction_success(
        &self,
        instruction_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            "UPDATE instructions SET last_success_at = ?, last_error = NULL WHERE id = ?",
        )
        .bind(now)
        .bind(instruction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_instruction_failure(
        &self,
        instruction_id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            "UPDATE instructions \
             SET last_error = ?, last_error_at = ?, error_count = error_count + 1 \
             WHERE id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(instruction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_test_success(
        &self,
        test_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        sqlx::query("UPDATE tests SET last_success_at = ?, last_error = NULL WHERE id = ?")
            .bind(now)
            .bind(test_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_test_failure(
        &self,
        test_id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            "UPDATE tests \
             SET last_error = ?, last_error_at = ?, error_count = error_count + 1 \
             WHERE id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(test_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- screenshots and children ---

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_screenshot(
        &self,
        page_id: i64,
        viewport: ViewportTag,
        viewport_width: i64,
        file_path: &str,
        thumbnail_path: &str,
        file_size: i64,
        image_width: i64,
        image_height: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, WorkerError> {
        let result = sqlx::query(
            "INSERT INTO screenshots \
                 (page_id, viewport, viewport_width, file_path, thumbnail_path, \
                  file_size, image_width, image_height, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(page_id)
        .bind(viewport.as_str())
        .bind(viewport_width)
        .bind(file_path)
        .bind(thumbnail_path)
        .bind(file_size)
        .bind(image_width)
        .bind(image_height)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_screenshot_error(
        &self,
        screenshot_id: i64,
        kind: &str,
        message: &str,
        source_url: Option<&str>,
        line_number: Option<i64>,
        request_url: Option<&str>,
        failure_text: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            "INSERT INTO screenshot_errors \
                 (screenshot_id, kind, message, source_url, line_number, \
                  request_url, failure_text, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(screenshot_id)
        .bind(kind)
        .bind(message)
        .bind(source_url)
        .bind(line_number)
        .bind(request_url)
        .bind(failure_text)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_test_result(
        &self,
        test_id: i64,
        screenshot_id: i64,
        passed: bool,
        message: &str,
        execution_time_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            "INSERT INTO test_results \
                 (test_id, screenshot_id, passed, message, execution_time_ms, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(test_id)
        .bind(screenshot_id)
        .bind(passed)
        .bind(message)
        .bind(execution_time_ms)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_page_last_screenshot(
        &self,
        page_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        sqlx::query("UPDATE pages SET last_screenshot_at = ? WHERE id = ?")
            .bind(now)
            .bind(page_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn screenshot(&self, id: i64) -> Result<Screenshot, WorkerError> {
        let row = sqlx::query_as::<_, Screenshot>("SELECT * FROM screenshots WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    // --- retention ---

    pub async fn retention_users(&self) -> Result<Vec<UserSettings>, WorkerError> {
        let rows = sqlx::query_as::<_, UserSettings>(
            "SELECT * FROM user_settings WHERE retention_enabled = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn pages_for_user(&self, user_id: i64) -> Result<Vec<Page>, WorkerError> {
        let rows = sqlx::query_as::<_, Page>(
            "SELECT p.* FROM pages p JOIN sites s ON s.id = p.site_id WHERE s.user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Newest-first history for one page, the planner's input ordering.
    pub async fn screenshots_for_page(&self, page_id: i64) -> Result<Vec<Screenshot>, WorkerError> {
        let rows = sqlx::query_as::<_, Screenshot>(
            "SELECT * FROM screenshots WHERE page_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(page_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_screenshots(&self, ids: &[i64]) -> Result<u64, WorkerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM screenshots WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // --- status helpers ---

    pub async fn job_status(&self, job_id: i64) -> Result<JobStatus, WorkerError> {
        let row: (JobStatus,) = sqlx::query_as("SELECT status FROM capture_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
