//! Grandfather-father-son retention
//!
//! Reduces a page's screenshot history to a bounded, time-distributed
//! subset. The planner is a pure function of (history, settings, now) so
//! the same sweep input always produces the same keep-set; the sweep
//! applies a plan per page, files first, rows second.

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashSet;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::models::{RetentionSettings, Screenshot};
use crate::storage::ScreenshotStore;
use crate::WorkerError;

/// GFS tier a screenshot falls into by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    Day,
    Week,
    Month,
    Year,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    pub keep: Vec<i64>,
    pub delete: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub pages_processed: u64,
    pub screenshots_deleted: u64,
}

/// Decide which of a page's screenshots survive.
///
/// `screenshots` must be ordered newest-first (the query ordering).
/// Stages: hard count cap, max age, then GFS bucketing with per-bucket
/// even sampling — index `floor(i·size/L)` over the bucket in ascending
/// time order, so retained captures spread across the bucket instead of
/// clustering at one end.
pub fn plan_deletions(
    screenshots: &[Screenshot],
    settings: &RetentionSettings,
    now: DateTime<Utc>,
) -> RetentionPlan {
    let mut plan = RetentionPlan::default();
    if screenshots.is_empty() {
        return plan;
    }

    let mut survivors: Vec<&Screenshot> = Vec::with_capacity(screenshots.len());

    // Stage 1: hard cap. The newest N stay, the tail goes.
    match settings.max_screenshots_per_page {
        Some(cap) if cap >= 0 && screenshots.len() as i64 > cap => {
            let cap = cap as usize;
            survivors.extend(&screenshots[..cap]);
            plan.delete.extend(screenshots[cap..].iter().map(|s| s.id));
        }
        _ => survivors.extend(screenshots),
    }

    // Stage 2: max age.
    if let Some(max_age_days) = settings.max_age_days {
        let cutoff = now - chrono::Duration::days(max_age_days);
        let (kept, expired): (Vec<_>, Vec<_>) =
            survivors.into_iter().partition(|s| s.created_at >= cutoff);
        plan.delete.extend(expired.iter().map(|s| s.id));
        survivors = kept;
    }

    // Stage 3: bucket assignment. Exactly one bucket per screenshot.
    let mut buckets: BTreeMap<(Tier, String), Vec<&Screenshot>> = BTreeMap::new();
    for screenshot in survivors {
        let key = bucket_key(screenshot.created_at, now);
        buckets.entry(key).or_default().push(screenshot);
    }

    // Stage 4: per-bucket even sampling.
    for ((tier, _), mut bucket) in buckets {
        bucket.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let limit = tier_limit(tier, settings).max(0) as usize;
        let size = bucket.len();

        if size <= limit {
            plan.keep.extend(bucket.iter().map(|s| s.id));
            continue;
        }

        let mut keep_indices: Vec<usize> = (0..limit).map(|i| i * size / limit).collect();
        keep_indices.dedup();
        for (index, screenshot) in bucket.iter().enumerate() {
            if keep_indices.contains(&index) {
                plan.keep.push(screenshot.id);
            } else {
                plan.delete.push(screenshot.id);
            }
        }
    }

    plan
}

fn tier_limit(tier: Tier, settings: &RetentionSettings) -> i64 {
    match tier {
        Tier::Day => settings.keep_per_day,
        Tier::Week => settings.keep_per_week,
        Tier::Month => settings.keep_per_month,
        Tier::Year => settings.keep_per_year,
    }
}

/// Bucket key by age in whole days from `now`: ≤7 day-keyed, ≤30
/// ISO-week-keyed, ≤365 month-keyed, older year-keyed.
fn bucket_key(created_at: DateTime<Utc>, now: DateTime<Utc>) -> (Tier, String) {
    let age_days = (now - created_at).num_days();
    if age_days <= 7 {
        (Tier::Day, created_at.format("%Y-%m-%d").to_string())
    } else if age_days <= 30 {
        let week = created_at.iso_week();
        (Tier::Week, format!("{}-W{:02}", week.year(), week.week()))
    } else if age_days <= 365 {
        (Tier::Month, created_at.format("%Y-%m").to_string())
    } else {
        (Tier::Year, format!("{}", created_at.year()))
    }
}

/// Applies retention for every user that opted in.
pub struct RetentionSweep {
    db: Db,
    store: ScreenshotStore,
}

impl RetentionSweep {
    pub fn new(db: Db, store: ScreenshotStore) -> Self {
        Self { db, store }
    }

    /// One sweep over all retention-enabled users. Pages currently being
    /// captured are skipped; they are picked up next sweep. The id
    /// snapshot taken while planning is the only thing deleted, so
    /// screenshots created mid-sweep are never touched.
    pub async fn run(&self, in_flight: &DashSet<i64>) -> Result<RetentionReport, WorkerError> {
        let now = Utc::now();
        let mut report = RetentionReport::default();

        for settings in self.db.retention_users().await? {
            let retention = settings.retention();
            for page in self.db.pages_for_user(settings.user_id).await? {
                if in_flight.contains(&page.id) {
                    debug!("retention skipping in-flight page {}", page.id);
                    continue;
                }

                let screenshots = self.db.screenshots_for_page(page.id).await?;
                let plan = plan_deletions(&screenshots, &retention, now);
                report.pages_processed += 1;

                if plan.delete.is_empty() {
                    continue;
                }

                for screenshot in screenshots
                    .iter()
                    .filter(|s| plan.delete.contains(&s.id))
                {
                    if let Some(path) = &screenshot.file_path {
                        if let Err(e) = self.store.delete(path).await {
                            warn!("retention could not delete {path}: {e}");
                        }
                    }
                    if let Some(path) = &screenshot.thumbnail_path {
                        if let Err(e) = self.store.delete(path).await {
                            warn!("retention could not delete {path}: {e}");
                        }
                    }
                }

                let deleted = self.db.delete_screenshots(&plan.delete).await?;
                report.screenshots_deleted += deleted;
            }
        }

        info!(
            "retention sweep done: {} pages, {} screenshots deleted",
            report.pages_processed, report.screenshots_deleted
        );
        Ok(report)
    }
}
