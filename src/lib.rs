//! # Pagewatch
//!
//! A capture worker that periodically takes full-page screenshots of
//! configured web pages at multiple device viewports, stores the images
//! on disk and their metadata in SQLite, retains history under a
//! grandfather-father-son policy, and pixel-diffs any two captures of a
//! page.
//!
//! One worker process runs:
//! - a fixed pool of headless Chrome instances,
//! - a scheduler that polls for due pages and drives capture jobs with
//!   progress tracking, stale-job recovery and exponential-backoff
//!   retry,
//! - a retention sweep reducing each page's history to a bounded,
//!   time-distributed subset,
//! - an internal HTTP surface for health, LLM-backed script generation,
//!   ad-hoc script dry-runs, screenshot comparison and page discovery.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pagewatch::{BrowserPool, CapturePipeline, Config, Db, Scheduler, ScreenshotStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env();
//!     config.validate()?;
//!
//!     let db = Db::connect(&config.database_url).await?;
//!     db.ensure_schema().await?;
//!     let store = ScreenshotStore::new(&config.screenshots_root);
//!     store.init().await?;
//!
//!     let pool = Arc::new(BrowserPool::new(config.clone()).await?);
//!     let pipeline = Arc::new(CapturePipeline::new(db.clone(), store.clone(), config.clone()));
//!     let scheduler = Scheduler::new(db, pool, pipeline, config);
//!
//!     let (_tx, rx) = tokio::sync::watch::channel(false);
//!     scheduler.run(rx).await;
//!     Ok(())
//! }
//! ```

/// Worker configuration and Chrome launch arguments
pub mod config;

/// Error types shared across the worker
pub mod error;

/// Typed records for persisted entities
pub mod models;

/// SQLite persistence layer
pub mod db;

/// On-disk screenshot store
pub mod storage;

/// Browser pool management for concurrent Chrome instances
pub mod browser_pool;

/// Page preparation: viewport, navigation, network idle
pub mod preparator;

/// Cookie-consent dismissal tables and procedure
pub mod consent;

/// Action DSL schema, validation and execution
pub mod dsl;

/// Per-viewport capture pipeline
pub mod capture;

/// Capture scheduling, retry backoff, stale-job recovery
pub mod scheduler;

/// Grandfather-father-son retention
pub mod retention;

/// Screenshot comparison and pixel diffing
pub mod compare;

/// External collaborator clients (LLM generation, discovery)
pub mod generator;

/// Worker HTTP surface
pub mod server;

#[cfg(test)]
mod tests;

pub use browser_pool::{BrowserHandle, BrowserPool, PoolStats};
pub use capture::{CaptureOutcome, CapturePipeline, NoProgress, ProgressSink};
pub use compare::{CompareEngine, DiffOptions, DiffStats};
pub use config::Config;
pub use db::Db;
pub use error::WorkerError;
pub use models::{
    CaptureJob, Instruction, JobStatus, Page, PageContext, PageTest, RetentionSettings,
    Screenshot, ScriptType, Site, UserSettings, ViewportTag,
};
pub use retention::{plan_deletions, RetentionReport, RetentionSweep};
pub use scheduler::Scheduler;
pub use server::AppState;
pub use storage::ScreenshotStore;
