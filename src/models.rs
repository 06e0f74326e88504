//! Typed records for every persisted entity
//!
//! Rows come out of the database as these structs; JSON-typed columns
//! (viewport width lists) are parsed here, at the boundary, and nowhere
//! else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::config::{Config, TagDimensions};

/// Categorical viewport label derived from capture width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ViewportTag {
    Mobile,
    Tablet,
    Desktop,
}

impl ViewportTag {
    /// Width ≤ 480 is mobile, ≤ 1024 tablet, anything wider desktop.
    pub fn from_width(width: u32) -> Self {
        if width <= 480 {
            ViewportTag::Mobile
        } else if width <= 1024 {
            ViewportTag::Tablet
        } else {
            ViewportTag::Desktop
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewportTag::Mobile => "mobile",
            ViewportTag::Tablet => "tablet",
            ViewportTag::Desktop => "desktop",
        }
    }

    /// Height used when capturing at this tag.
    pub fn height(&self, dims: &TagDimensions) -> u32 {
        match self {
            ViewportTag::Mobile => dims.mobile.1,
            ViewportTag::Tablet => dims.tablet.1,
            ViewportTag::Desktop => dims.desktop.1,
        }
    }

    /// Full dimensions for a capture requested by named tag.
    pub fn dimensions(&self, dims: &TagDimensions) -> (u32, u32) {
        match self {
            ViewportTag::Mobile => dims.mobile,
            ViewportTag::Tablet => dims.tablet,
            ViewportTag::Desktop => dims.desktop,
        }
    }
}

impl std::fmt::Display for ViewportTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ViewportTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile" => Ok(ViewportTag::Mobile),
            "tablet" => Ok(ViewportTag::Tablet),
            "desktop" => Ok(ViewportTag::Desktop),
            other => Err(format!("unknown viewport tag: {other}")),
        }
    }
}

/// Capture job status machine: pending → capturing → {completed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Capturing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// How an instruction/test script is interpreted at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    Eval,
    Actions,
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserSettings {
    pub user_id: i64,
    pub capture_interval_minutes: i64,
    pub viewport_widths: String,
    pub retention_enabled: bool,
    pub max_screenshots_per_page: Option<i64>,
    pub max_age_days: Option<i64>,
    pub keep_per_day: i64,
    pub keep_per_week: i64,
    pub keep_per_month: i64,
    pub keep_per_year: i64,
}

impl UserSettings {
    pub fn widths(&self) -> Option<Vec<u32>> {
        parse_width_list(Some(&self.viewport_widths))
    }

    pub fn retention(&self) -> RetentionSettings {
        RetentionSettings {
            max_screenshots_per_page: self.max_screenshots_per_page,
            max_age_days: self.max_age_days,
            keep_per_day: self.keep_per_day,
            keep_per_week: self.keep_per_week,
            keep_per_month: self.keep_per_month,
            keep_per_year: self.keep_per_year,
        }
    }
}

/// The subset of user settings the retention planner consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionSettings {
    pub max_screenshots_per_page: Option<i64>,
    pub max_age_days: Option<i64>,
    pub keep_per_day: i64,
    pub keep_per_week: i64,
    pub keep_per_month: i64,
    pub keep_per_year: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Site {
    pub id: i64,
    pub user_id: i64,
    pub domain: String,
    pub name: String,
    pub capture_interval_minutes: Option<i64>,
    pub viewport_widths: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Page {
    pub id: i64,
    pub site_id: i64,
    pub url: String,
    pub name: String,
    pub is_active: bool,
    pub last_screenshot_at: Option<DateTime<Utc>>,
    pub capture_interval_minutes: Option<i64>,
    pub viewport_widths: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A page joined with the rows its capture policy resolves through.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub page: Page,
    pub site: Site,
    pub settings: Option<UserSettings>,
}

impl PageContext {
    /// First non-null of page → site → user settings → hardcoded default.
    pub fn effective_interval_minutes(&self, config: &Config) -> i64 {
        self.page
            .capture_interval_minutes
            .or(self.site.capture_interval_minutes)
            .or(self.settings.as_ref().map(|s| s.capture_interval_minutes))
            .unwrap_or(config.default_interval_minutes)
    }

    /// Resolved viewport width list, same chain as the interval.
    pub fn effective_viewports(&self, config: &Config) -> Vec<u32> {
        parse_width_list(self.page.viewport_widths.as_deref())
            .or_else(|| parse_width_list(self.site.viewport_widths.as_deref()))
            .or_else(|| self.settings.as_ref().and_then(|s| s.widths()))
            .unwrap_or_else(|| config.default_viewports.clone())
    }
}

fn parse_width_list(raw: Option<&str>) -> Option<Vec<u32>> {
    let raw = raw?;
    match serde_json::from_str::<Vec<u32>>(raw) {
        Ok(widths) if !widths.is_empty() => Some(widths),
        _ => None,
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Screenshot {
    pub id: i64,
    pub page_id: i64,
    pub viewport: ViewportTag,
    pub viewport_width: i64,
    pub file_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub file_size: i64,
    pub image_width: i64,
    pub image_height: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Instruction {
    pub id: i64,
    pub page_id: i64,
    pub name: String,
    pub prompt: String,
    pub script: String,
    pub script_type: ScriptType,
    pub execution_order: i64,
    pub is_active: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub error_count: i64,
    pub created_at: DateTime<Utc>,
}

/// A user-authored assertion script, optionally limited to a viewport set.
#[derive(Debug, Clone, FromRow)]
pub struct PageTest {
    pub id: i64,
    pub page_id: i64,
    pub name: String,
    pub prompt: String,
    pub script: String,
    pub script_type: ScriptType,
    pub viewports: Option<String>,
    pub is_active: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub error_count: i64,
    pub created_at: DateTime<Utc>,
}

impl PageTest {
    /// Whether this test runs for a capture at `tag`. A null filter means
    /// every viewport.
    pub fn applies_to(&self, tag: ViewportTag) -> bool {
        match &self.viewports {
            None => true,
            Some(raw) => match serde_json::from_str::<Vec<ViewportTag>>(raw) {
                Ok(tags) => tags.is_empty() || tags.contains(&tag),
                Err(_) => true,
            },
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CaptureJob {
    pub id: i64,
    pub page_id: i64,
    pub status: JobStatus,
    pub current_viewport: Option<String>,
    pub viewports_completed: i64,
    pub viewports_total: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// JS exception / console error or a failed network request observed
/// while a screenshot's page was live.
#[derive(Debug, Clone, FromRow)]
pub struct ScreenshotErrorRecord {
    pub id: i64,
    pub screenshot_id: i64,
    pub kind: String,
    pub message: String,
    pub source_url: Option<String>,
    pub line_number: Option<i64>,
    pub request_url: Option<String>,
    pub failure_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TestResult {
    pub id: i64,
    pub test_id: i64,
    pub screenshot_id: i64,
    pub passed: bool,
    pub message: String,
    pub execution_time_ms: i64,
    pub created_at: DateTime<Utc>,
}
