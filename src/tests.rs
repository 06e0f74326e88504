#[cfg(test)]
mod integration_tests {
    use crate::compare::CompareEngine;
    use crate::config::Config;
    use crate::db::Db;
    use crate::models::{JobStatus, ViewportTag};
    use crate::retention::RetentionSweep;
    use crate::scheduler::select_due_pages;
    use crate::storage::ScreenshotStore;
    use chrono::{DateTime, Duration, Utc};
    use dashmap::DashSet;
    use image::RgbaImage;
    use std::io::Cursor;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.ensure_schema().await.unwrap();
        db
    }

    async fn seed_user(db: &Db, retention_enabled: bool) -> i64 {
        let result = sqlx::query("INSERT INTO users (email, created_at) VALUES (?, ?)")
            .bind(format!("user-{}@example.test", uuid::Uuid::new_v4()))
            .bind(Utc::now())
            .execute(db.pool())
            .await
            .unwrap();
        let user_id = result.last_insert_rowid();
        sqlx::query(
            "INSERT INTO user_settings \
                 (user_id, capture_interval_minutes, viewport_widths, retention_enabled, \
                  keep_per_day, keep_per_week, keep_per_month, keep_per_year) \
             VALUES (?, 1440, '[1920,768,375]', ?, 4, 2, 1, 1)",
        )
        .bind(user_id)
        .bind(retention_enabled)
        .execute(db.pool())
        .await
        .unwrap();
        user_id
    }

    async fn seed_site(db: &Db, user_id: i64) -> i64 {
        sqlx::query(
            "INSERT INTO sites (user_id, domain, name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind("example.test")
        .bind("Example")
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn seed_page(
        db: &Db,
        site_id: i64,
        is_active: bool,
        last_screenshot_at: Option<DateTime<Utc>>,
    ) -> i64 {
        sqlx::query(
            "INSERT INTO pages (site_id, url, name, is_active, last_screenshot_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(site_id)
        .bind("https://example.test/")
        .bind("Home")
        .bind(is_active)
        .bind(last_screenshot_at)
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn seed_job(
        db: &Db,
        page_id: i64,
        status: &str,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> i64 {
        sqlx::query(
            "INSERT INTO capture_jobs \
                 (page_id, status, viewports_completed, viewports_total, started_at, \
                  completed_at, created_at) \
             VALUES (?, ?, 0, 2, ?, ?, ?)",
        )
        .bind(page_id)
        .bind(status)
        .bind(started_at)
        .bind(completed_at)
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn seed_screenshot(
        db: &Db,
        page_id: i64,
        file_path: &str,
        thumb_path: &str,
        created_at: DateTime<Utc>,
    ) -> i64 {
        db.insert_screenshot(
            page_id,
            ViewportTag::Desktop,
            1920,
            file_path,
            thumb_path,
            1000,
            1920,
            4000,
            created_at,
        )
        .await
        .unwrap()
    }

    fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, image::Rgba(color));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    // --- schema & cascades ---

    #[tokio::test]
    async fn site_delete_cascades_to_children() {
        let db = test_db().await;
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;
        let shot = seed_screenshot(&db, page, "p/a.png", "p/a_thumb.png", Utc::now()).await;
        db.insert_screenshot_error(shot, "js", "boom", None, Some(1), None, None, Utc::now())
            .await
            .unwrap();
        seed_job(&db, page, "completed", Some(Utc::now()), Some(Utc::now())).await;

        sqlx::query("DELETE FROM sites WHERE id = ?")
            .bind(site)
            .execute(db.pool())
            .await
            .unwrap();

        for table in ["pages", "screenshots", "screenshot_errors", "capture_jobs"] {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db.pool())
                .await
                .unwrap();
            assert_eq!(count.0, 0, "{table} should be empty after cascade");
        }
    }

    // --- job lifecycle ---

    #[tokio::test]
    async fn pending_job_claim_and_completion() {
        let db = test_db().await;
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;
        let job = seed_job(&db, page, "pending", None, None).await;

        assert!(db.claim_pending_job(job, 2, Utc::now()).await.unwrap());
        assert_eq!(db.job_status(job).await.unwrap(), JobStatus::Capturing);
        // A second claim must lose.
        assert!(!db.claim_pending_job(job, 2, Utc::now()).await.unwrap());

        db.update_job_progress(job, ViewportTag::Desktop, 1)
            .await
            .unwrap();
        db.complete_job(job, Utc::now()).await.unwrap();

        let row = db.job(job).await.unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.viewports_completed, 2);
        assert_eq!(row.viewports_total, 2);
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn at_most_one_nonterminal_job_per_page() {
        let db = test_db().await;
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        let first = db
            .create_capturing_job(page, 2, Utc::now())
            .await
            .unwrap();
        assert!(first.is_some());
        let second = db
            .create_capturing_job(page, 2, Utc::now())
            .await
            .unwrap();
        assert!(second.is_none(), "guard must refuse a second live job");

        db.complete_job(first.unwrap(), Utc::now()).await.unwrap();
        let third = db.create_capturing_job(page, 2, Utc::now()).await.unwrap();
        assert!(third.is_some(), "terminal job frees the page");
    }

    // --- stale-job reset ---

    #[tokio::test]
    async fn stale_capturing_jobs_forced_failed() {
        let db = test_db().await;
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        let stale = seed_job(
            &db,
            page,
            "capturing",
            Some(Utc::now() - Duration::minutes(15)),
            None,
        )
        .await;
        let other_page = seed_page(&db, site, true, None).await;
        let fresh = seed_job(
            &db,
            other_page,
            "capturing",
            Some(Utc::now() - Duration::minutes(2)),
            None,
        )
        .await;

        let reset = db.reset_stale_jobs(10, Utc::now()).await.unwrap();
        assert_eq!(reset, 1);

        let row = db.job(stale).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(
            row.error_message.as_deref(),
            Some("Job timed out (worker restarted or crashed)")
        );
        assert!(row.completed_at.is_some());

        assert_eq!(db.job_status(fresh).await.unwrap(), JobStatus::Capturing);
    }

    // --- consecutive failures ---

    #[tokio::test]
    async fn failure_chain_broken_by_any_non_failed_job() {
        let db = test_db().await;
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        let t = Utc::now();
        seed_job(&db, page, "failed", Some(t), Some(t)).await;
        seed_job(&db, page, "failed", Some(t), Some(t)).await;
        assert_eq!(db.failure_state(page).await.unwrap().consecutive, 2);

        seed_job(&db, page, "completed", Some(t), Some(t)).await;
        seed_job(&db, page, "failed", Some(t), Some(t)).await;
        assert_eq!(db.failure_state(page).await.unwrap().consecutive, 1);

        // Pending breaks the chain too.
        seed_job(&db, page, "pending", None, None).await;
        assert_eq!(db.failure_state(page).await.unwrap().consecutive, 0);
    }

    // --- due-page selection ---

    #[tokio::test]
    async fn pending_jobs_dispatch_before_interval_due_pages() {
        let db = test_db().await;
        let config = Config::default();
        let active = DashSet::new();
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;

        let never_captured = seed_page(&db, site, true, None).await;
        let with_pending = seed_page(&db, site, true, Some(Utc::now())).await;
        let job = seed_job(&db, with_pending, "pending", None, None).await;

        let due = select_due_pages(&db, &config, &active, Utc::now())
            .await
            .unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].page_id, with_pending);
        assert_eq!(due[0].pending_job_id, Some(job));
        assert_eq!(due[1].page_id, never_captured);
        assert_eq!(due[1].pending_job_id, None);
    }

    #[tokio::test]
    async fn inactive_page_never_scheduled_even_with_pending_job() {
        let db = test_db().await;
        let config = Config::default();
        let active = DashSet::new();
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;

        let inactive = seed_page(&db, site, false, None).await;
        seed_job(&db, inactive, "pending", None, None).await;

        let due = select_due_pages(&db, &config, &active, Utc::now())
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn interval_gates_scheduling() {
        let db = test_db().await;
        let config = Config::default();
        let active = DashSet::new();
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;

        // Captured 30 minutes ago with a 60-minute page override.
        let page = seed_page(&db, site, true, Some(Utc::now() - Duration::minutes(30))).await;
        sqlx::query("UPDATE pages SET capture_interval_minutes = 60 WHERE id = ?")
            .bind(page)
            .execute(db.pool())
            .await
            .unwrap();

        let due = select_due_pages(&db, &config, &active, Utc::now())
            .await
            .unwrap();
        assert!(due.is_empty());

        sqlx::query("UPDATE pages SET capture_interval_minutes = 15 WHERE id = ?")
            .bind(page)
            .execute(db.pool())
            .await
            .unwrap();
        let due = select_due_pages(&db, &config, &active, Utc::now())
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn failed_page_waits_out_backoff() {
        let db = test_db().await;
        let config = Config::default();
        let active = DashSet::new();
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        // One failure two minutes ago: base delay of five minutes still
        // running.
        let t = Utc::now() - Duration::minutes(2);
        seed_job(&db, page, "failed", Some(t), Some(t)).await;
        let due = select_due_pages(&db, &config, &active, Utc::now())
            .await
            .unwrap();
        assert!(due.is_empty());

        // Same failure six minutes ago: cooldown over.
        sqlx::query("UPDATE capture_jobs SET completed_at = ?")
            .bind(Utc::now() - Duration::minutes(6))
            .execute(db.pool())
            .await
            .unwrap();
        let due = select_due_pages(&db, &config, &active, Utc::now())
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn failure_cap_blocks_auto_retry_but_not_pending() {
        let db = test_db().await;
        let config = Config::default();
        let active = DashSet::new();
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        let long_ago = Utc::now() - Duration::days(3);
        for _ in 0..5 {
            seed_job(&db, page, "failed", Some(long_ago), Some(long_ago)).await;
        }

        let due = select_due_pages(&db, &config, &active, Utc::now())
            .await
            .unwrap();
        assert!(due.is_empty(), "five failures end auto-retry");

        // A user-triggered pending job bypasses the cap.
        let job = seed_job(&db, page, "pending", None, None).await;
        let due = select_due_pages(&db, &config, &active, Utc::now())
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].pending_job_id, Some(job));
    }

    #[tokio::test]
    async fn in_flight_pages_excluded() {
        let db = test_db().await;
        let config = Config::default();
        let active = DashSet::new();
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        active.insert(page);
        let due = select_due_pages(&db, &config, &active, Utc::now())
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    // --- retention sweep ---

    #[tokio::test]
    async fn retention_sweep_deletes_files_and_rows_once() {
        let db = test_db().await;
        let dir = tempfile::tempdir().unwrap();
        let store = ScreenshotStore::new(dir.path());
        store.init().await.unwrap();

        let user = seed_user(&db, true).await;
        sqlx::query("UPDATE user_settings SET max_screenshots_per_page = 2 WHERE user_id = ?")
            .bind(user)
            .execute(db.pool())
            .await
            .unwrap();
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        for i in 0..4i64 {
            let rel = format!("{page}/2026/01/shot_{i}.png");
            let thumb = format!("{page}/2026/01/shot_{i}_thumb.png");
            let path = store.absolute(&rel);
            tokio::fs::create_dir_all(path.parent().unwrap())
                .await
                .unwrap();
            tokio::fs::write(&path, png_bytes(10, 10, [9, 9, 9, 255]))
                .await
                .unwrap();
            tokio::fs::write(store.absolute(&thumb), b"thumb").await.unwrap();
            seed_screenshot(&db, page, &rel, &thumb, Utc::now() - Duration::hours(i)).await;
        }

        let sweep = RetentionSweep::new(db.clone(), store.clone());
        let active = DashSet::new();
        let report = sweep.run(&active).await.unwrap();
        assert_eq!(report.screenshots_deleted, 2);
        assert_eq!(report.pages_processed, 1);

        let remaining = db.screenshots_for_page(page).await.unwrap();
        assert_eq!(remaining.len(), 2);
        // The two newest survive; their files still exist.
        for screenshot in &remaining {
            assert!(store.absolute(screenshot.file_path.as_ref().unwrap()).exists());
        }

        // Second sweep with no new screenshots deletes nothing.
        let report = sweep.run(&active).await.unwrap();
        assert_eq!(report.screenshots_deleted, 0);
    }

    #[tokio::test]
    async fn retention_skips_in_flight_pages() {
        let db = test_db().await;
        let dir = tempfile::tempdir().unwrap();
        let store = ScreenshotStore::new(dir.path());
        store.init().await.unwrap();

        let user = seed_user(&db, true).await;
        sqlx::query("UPDATE user_settings SET max_screenshots_per_page = 1 WHERE user_id = ?")
            .bind(user)
            .execute(db.pool())
            .await
            .unwrap();
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;
        seed_screenshot(&db, page, "a.png", "a_thumb.png", Utc::now()).await;
        seed_screenshot(
            &db,
            page,
            "b.png",
            "b_thumb.png",
            Utc::now() - Duration::hours(1),
        )
        .await;

        let active = DashSet::new();
        active.insert(page);
        let sweep = RetentionSweep::new(db.clone(), store);
        let report = sweep.run(&active).await.unwrap();
        assert_eq!(report.pages_processed, 0);
        assert_eq!(db.screenshots_for_page(page).await.unwrap().len(), 2);
    }

    // --- comparison engine ---

    #[tokio::test]
    async fn compare_reconciles_to_minimum_dimensions() {
        let db = test_db().await;
        let dir = tempfile::tempdir().unwrap();
        let store = ScreenshotStore::new(dir.path());
        store.init().await.unwrap();

        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        // Same content, different page heights (tall vs short capture).
        tokio::fs::write(
            store.absolute("tall.png"),
            png_bytes(100, 50, [180, 180, 180, 255]),
        )
        .await
        .unwrap();
        tokio::fs::write(
            store.absolute("short.png"),
            png_bytes(100, 42, [180, 180, 180, 255]),
        )
        .await
        .unwrap();

        let older = seed_screenshot(
            &db,
            page,
            "tall.png",
            "tall_thumb.png",
            Utc::now() - Duration::minutes(10),
        )
        .await;
        let newer = seed_screenshot(&db, page, "short.png", "short_thumb.png", Utc::now()).await;

        let engine = CompareEngine::new(db.clone(), store);
        let comparison = engine.compare(newer, older, false).await.unwrap();

        assert_eq!(comparison.stats.width, 100);
        assert_eq!(comparison.stats.height, 42);
        assert_eq!(comparison.stats.total_pixels, 100 * 42);
        // Before/after by created_at regardless of argument order.
        assert_eq!(comparison.stats.screenshot_1, older);
        assert_eq!(comparison.stats.screenshot_2, newer);
        assert!(comparison.diff_png.is_none());
    }

    #[tokio::test]
    async fn compare_screenshot_with_itself_is_zero() {
        let db = test_db().await;
        let dir = tempfile::tempdir().unwrap();
        let store = ScreenshotStore::new(dir.path());
        store.init().await.unwrap();

        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        tokio::fs::write(
            store.absolute("same.png"),
            png_bytes(64, 64, [10, 120, 230, 255]),
        )
        .await
        .unwrap();
        let shot = seed_screenshot(&db, page, "same.png", "same_thumb.png", Utc::now()).await;

        let engine = CompareEngine::new(db.clone(), store);
        let comparison = engine.compare(shot, shot, true).await.unwrap();
        assert_eq!(comparison.stats.diff_pixels, 0);
        assert_eq!(comparison.stats.diff_percentage, 0.0);
        assert!(comparison.diff_png.is_some());
    }

    #[tokio::test]
    async fn compare_missing_file_is_not_found() {
        let db = test_db().await;
        let dir = tempfile::tempdir().unwrap();
        let store = ScreenshotStore::new(dir.path());
        store.init().await.unwrap();

        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;
        let shot = seed_screenshot(&db, page, "gone.png", "gone_thumb.png", Utc::now()).await;

        let engine = CompareEngine::new(db.clone(), store);
        let err = engine.compare(shot, shot, false).await.unwrap_err();
        assert!(matches!(err, crate::WorkerError::NotFound(_)));
    }

    // --- effective policy resolution through the database ---

    #[tokio::test]
    async fn page_context_resolves_overrides() {
        let db = test_db().await;
        let config = Config::default();
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        let ctx = db.page_context(page).await.unwrap();
        // No page/site override: user settings win over hardcoded.
        assert_eq!(ctx.effective_interval_minutes(&config), 1440);
        assert_eq!(ctx.effective_viewports(&config), vec![1920, 768, 375]);

        sqlx::query("UPDATE sites SET viewport_widths = '[1440]' WHERE id = ?")
            .bind(site)
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE pages SET capture_interval_minutes = 30 WHERE id = ?")
            .bind(page)
            .execute(db.pool())
            .await
            .unwrap();

        let ctx = db.page_context(page).await.unwrap();
        assert_eq!(ctx.effective_interval_minutes(&config), 30);
        assert_eq!(ctx.effective_viewports(&config), vec![1440]);
    }

    #[tokio::test]
    async fn instruction_bookkeeping_round_trip() {
        let db = test_db().await;
        let user = seed_user(&db, false).await;
        let site = seed_site(&db, user).await;
        let page = seed_page(&db, site, true, None).await;

        sqlx::query(
            "INSERT INTO instructions (page_id, name, script, script_type, execution_order, created_at) \
             VALUES (?, 'dismiss modal', 'document.title', 'eval', 0, ?)",
        )
        .bind(page)
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap();

        let instructions = db.active_instructions(page).await.unwrap();
        assert_eq!(instructions.len(), 1);
        let id = instructions[0].id;

        db.record_instruction_failure(id, "selector vanished", Utc::now())
            .await
            .unwrap();
        db.record_instruction_failure(id, "selector vanished again", Utc::now())
            .await
            .unwrap();
        let row = &db.active_instructions(page).await.unwrap()[0];
        assert_eq!(row.error_count, 2);
        assert_eq!(row.last_error.as_deref(), Some("selector vanished again"));
        assert!(row.last_error_at.is_some());

        db.record_instruction_success(id, Utc::now()).await.unwrap();
        let row = &db.active_instructions(page).await.unwrap()[0];
        assert_eq!(row.error_count, 2, "success never resets the counter");
        assert!(row.last_error.is_none());
        assert!(row.last_success_at.is_some());
    }
}
