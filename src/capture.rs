//! Capture pipeline
//!
//! Drives one page through all of its viewports: prepare, run
//! instructions, autoscroll so lazy content loads, measure, resize to
//! the real page size, screenshot, thumbnail, then run the page's tests
//! against the fresh capture. A failing viewport is skipped; the capture
//! as a whole succeeds when at least one viewport produced a screenshot.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::{EventConsoleApiCalled, EventExceptionThrown};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, Page};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::Db;
use crate::dsl;
use crate::models::{Instruction, PageContext, PageTest, ScriptType, ViewportTag};
use crate::preparator::{self, ViewportSpec};
use crate::storage::{ScreenshotStore, StoredScreenshot};
use crate::WorkerError;

const AUTOSCROLL_STEP_PX: u32 = 400;
const AUTOSCROLL_TICK: Duration = Duration::from_millis(100);
const AUTOSCROLL_CEILING: Duration = Duration::from_secs(30);
const INSTRUCTION_PAUSE: Duration = Duration::from_millis(500);

/// Receives job progress before each viewport is captured.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, viewport: ViewportTag, completed: u32, total: u32);
}

/// Sink for ad-hoc captures nobody is tracking.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn on_progress(&self, _viewport: ViewportTag, _completed: u32, _total: u32) {}
}

#[derive(Debug, Clone)]
pub struct InstructionOutcome {
    pub instruction_id: i64,
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub test_id: i64,
    pub passed: bool,
    pub message: String,
    pub execution_time_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageErrorKind {
    Js,
    Network,
}

impl PageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageErrorKind::Js => "js",
            PageErrorKind::Network => "network",
        }
    }
}

/// One JS or network error observed while a viewport's page was live.
#[derive(Debug, Clone)]
pub struct CapturedPageError {
    pub kind: PageErrorKind,
    pub message: String,
    pub source_url: Option<String>,
    pub line_number: Option<i64>,
    pub request_url: Option<String>,
    pub failure_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ViewportCapture {
    pub screenshot_id: i64,
    pub viewport: ViewportTag,
    pub viewport_width: u32,
    pub stored: StoredScreenshot,
    pub page_errors: usize,
    pub test_outcomes: Vec<TestOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureOutcome {
    pub captures: Vec<ViewportCapture>,
    /// Aggregated across viewports but reported for the first only, so
    /// callers never see the same instruction twice.
    pub instruction_outcomes: Vec<InstructionOutcome>,
    pub viewports_total: u32,
}

impl CaptureOutcome {
    pub fn succeeded(&self) -> bool {
        !self.captures.is_empty()
    }
}

/// Descending, deduplicated capture order: desktop first, so screenshots
/// created by one job group stably in history views.
pub fn ordered_widths(widths: &[u32]) -> Vec<u32> {
    let mut widths = widths.to_vec();
    widths.sort_unstable_by(|a, b| b.cmp(a));
    widths.dedup();
    widths
}

pub struct CapturePipeline {
    db: Db,
    store: ScreenshotStore,
    config: Config,
}

impl CapturePipeline {
    pub fn new(db: Db, store: ScreenshotStore, config: Config) -> Self {
        Self { db, store, config }
    }

    /// Capture every effective viewport of `ctx` on `browser`.
    ///
    /// Screenshot rows, screenshot-error rows and test-result rows are
    /// persisted here, where the screenshot id is at hand; job and
    /// instruction-row bookkeeping belongs to the scheduler.
    pub async fn capture_page(
        &self,
        browser: &Browser,
        ctx: &PageContext,
        progress: &dyn ProgressSink,
    ) -> Result<CaptureOutcome, WorkerError> {
        let widths = ordered_widths(&ctx.effective_viewports(&self.config));
        let instructions = self.db.active_instructions(ctx.page.id).await?;
        let tests = self.db.active_tests(ctx.page.id).await?;

        let mut outcome = CaptureOutcome {
            viewports_total: widths.len() as u32,
            ..Default::default()
        };

        for (index, &width) in widths.iter().enumerate() {
            let tag = ViewportTag::from_width(width);
            progress
                .on_progress(tag, index as u32, outcome.viewports_total)
                .await;

            match self
                .capture_viewport(browser, ctx, width, tag, &instructions, &tests)
                .await
            {
                Ok((capture, instruction_outcomes)) => {
                    if index == 0 {
                        outcome.instruction_outcomes = instruction_outcomes;
                    }
                    metrics::counter!("pagewatch_screenshots_captured", 1);
                    outcome.captures.push(capture);
                }
                Err(e) => {
                    metrics::counter!("pagewatch_viewport_failures", 1);
                    warn!(
                        "viewport {width} ({tag}) failed for page {}: {e}",
                        ctx.page.id
                    );
                }
            }
        }

        Ok(outcome)
    }

    async fn capture_viewport(
        &self,
        browser: &Browser,
        ctx: &PageContext,
        width: u32,
        tag: ViewportTag,
        instructions: &[Instruction],
        tests: &[PageTest],
    ) -> Result<(ViewportCapture, Vec<InstructionOutcome>), WorkerError> {
        let page = browser.new_page("about:blank").await?;
        let result = self
            .capture_on_page(&page, ctx, width, tag, instructions, tests)
            .await;
        let _ = page.close().await;
        result
    }

    async fn capture_on_page(
        &self,
        page: &Page,
        ctx: &PageContext,
        width: u32,
        tag: ViewportTag,
        instructions: &[Instruction],
        tests: &[PageTest],
    ) -> Result<(ViewportCapture, Vec<InstructionOutcome>), WorkerError> {
        // Error listeners go up before navigation so load-time failures
        // are seen too.
        let collector = PageErrorCollector::subscribe(page).await?;

        let viewport = ViewportSpec::Literal {
            width,
            height: tag.height(&self.config.tag_dimensions),
        };
        preparator::prepare(
            page,
            &ctx.page.url,
            viewport,
            self.config.capture_timeout,
            &self.config.tag_dimensions,
        )
        .await?;

        let instruction_outcomes = self.run_instructions(page, instructions).await;

        if let Err(e) = autoscroll(page).await {
            debug!("autoscroll failed for page {}: {e}", ctx.page.id);
        }

        let (page_width, page_height) = measure_page(page).await?;
        let final_width = page_width.min(width);
        preparator::set_viewport(page, final_width, page_height).await?;
        sleep(Duration::from_millis(500)).await;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        let png = timeout(self.config.capture_timeout, page.screenshot(params))
            .await
            .map_err(|_| WorkerError::Timeout(self.config.capture_timeout))?
            .map_err(|e| WorkerError::CaptureFailed(e.to_string()))?;

        let now = Utc::now();
        let stored = self
            .store
            .write_screenshot(ctx.page.id, tag, now, &png)
            .await?;

        let screenshot_id = self
            .db
            .insert_screenshot(
                ctx.page.id,
                tag,
                width as i64,
                &stored.file_path,
                &stored.thumbnail_path,
                stored.file_size,
                stored.image_width,
                stored.image_height,
                now,
            )
            .await?;

        let page_errors = collector.finish().await;
        for error in &page_errors {
            self.db
                .insert_screenshot_error(
                    screenshot_id,
                    error.kind.as_str(),
                    &error.message,
                    error.source_url.as_deref(),
                    error.line_number,
                    error.request_url.as_deref(),
                    error.failure_text.as_deref(),
                    now,
                )
                .await?;
        }

        let test_outcomes = self
            .run_tests(page, tests, tag, screenshot_id)
            .await?;

        Ok((
            ViewportCapture {
                screenshot_id,
                viewport: tag,
                viewport_width: width,
                stored,
                page_errors: page_errors.len(),
                test_outcomes,
            },
            instruction_outcomes,
        ))
    }

    /// Run instructions in order. A failure is recorded and the rest
    /// still run; nothing here aborts the capture.
    async fn run_instructions(
        &self,
        page: &Page,
        instructions: &[Instruction],
    ) -> Vec<InstructionOutcome> {
        let mut outcomes = Vec::with_capacity(instructions.len());
        for instruction in instructions {
            let result = self
                .run_script(page, &instruction.script, instruction.script_type)
                .await;
            sleep(INSTRUCTION_PAUSE).await;
            match result {
                Ok(()) => outcomes.push(InstructionOutcome {
                    instruction_id: instruction.id,
                    name: instruction.name.clone(),
                    success: true,
                    error: None,
                }),
                Err(message) => {
                    debug!("instruction '{}' failed: {message}", instruction.name);
                    outcomes.push(InstructionOutcome {
                        instruction_id: instruction.id,
                        name: instruction.name.clone(),
                        success: false,
                        error: Some(message),
                    });
                }
            }
        }
        outcomes
    }

    /// Run the tests that apply at this viewport; every outcome becomes
    /// a test-result row on the fresh screenshot. A test never runs
    /// twice for one screenshot.
    async fn run_tests(
        &self,
        page: &Page,
        tests: &[PageTest],
        tag: ViewportTag,
        screenshot_id: i64,
    ) -> Result<Vec<TestOutcome>, WorkerError> {
        let mut outcomes = Vec::new();
        for test in tests.iter().filter(|t| t.applies_to(tag)) {
            let started = Instant::now();
            let (passed, message) = self
                .run_test_script(page, &test.script, test.script_type)
                .await;
            let execution_time_ms = started.elapsed().as_millis() as i64;

            self.db
                .insert_test_result(
                    test.id,
                    screenshot_id,
                    passed,
                    &message,
                    execution_time_ms,
                    Utc::now(),
                )
                .await?;

            outcomes.push(TestOutcome {
                test_id: test.id,
                passed,
                message,
                execution_time_ms,
            });
        }
        Ok(outcomes)
    }

    pub async fn run_script(
        &self,
        page: &Page,
        script: &str,
        script_type: ScriptType,
    ) -> Result<(), String> {
        match script_type {
            ScriptType::Eval => {
                timeout(self.config.capture_timeout, page.evaluate(script))
                    .await
                    .map_err(|_| "script timed out".to_string())?
                    .map_err(|e| e.to_string())?;
                Ok(())
            }
            ScriptType::Actions => {
                let sequence = dsl::parse_sequence(script).map_err(|e| e.to_string())?;
                let outcomes =
                    dsl::execute_sequence(page, &sequence, self.config.capture_timeout)
                        .await
                        .map_err(|e| e.to_string())?;
                match outcomes.iter().find(|o| !o.passed) {
                    Some(failed) => Err(format!(
                        "step {} ({}): {}",
                        failed.index, failed.action, failed.message
                    )),
                    None => Ok(()),
                }
            }
        }
    }

    /// Evaluate a test script; an assertion exception is a failed
    /// result with the error as message, never a capture failure.
    pub async fn run_test_script(
        &self,
        page: &Page,
        script: &str,
        script_type: ScriptType,
    ) -> (bool, String) {
        match script_type {
            ScriptType::Eval => {
                let evaluated =
                    timeout(self.config.capture_timeout, page.evaluate(script)).await;
                match evaluated {
                    Err(_) => (false, "test timed out".to_string()),
                    Ok(Err(e)) => (false, e.to_string()),
                    Ok(Ok(result)) => match result.into_value::<dsl::EvalVerdict>() {
                        Ok(verdict) => (
                            verdict.passed,
                            verdict.message.unwrap_or_else(|| {
                                if verdict.passed { "passed" } else { "failed" }.to_string()
                            }),
                        ),
                        Err(e) => (
                            false,
                            format!("test must return {{ passed, message }}: {e}"),
                        ),
                    },
                }
            }
            ScriptType::Actions => {
                let sequence = match dsl::parse_sequence(script) {
                    Ok(sequence) => sequence,
                    Err(e) => return (false, e.to_string()),
                };
                match dsl::execute_sequence(page, &sequence, self.config.capture_timeout).await
                {
                    Err(e) => (false, e.to_string()),
                    Ok(outcomes) => match outcomes.iter().find(|o| !o.passed) {
                        Some(failed) => (false, failed.message.clone()),
                        None => (true, format!("all {} steps passed", outcomes.len())),
                    },
                }
            }
        }
    }
}

/// Scroll to the bottom in small steps so lazy-loaded content mounts,
/// then return to the top for a stable capture.
pub async fn autoscroll(page: &Page) -> Result<(), WorkerError> {
    let script = format!(
        "(() => {{ window.scrollBy(0, {AUTOSCROLL_STEP_PX}); \
         const height = Math.max(document.body.scrollHeight, \
             document.documentElement.scrollHeight); \
         return window.scrollY + window.innerHeight >= height; }})()"
    );

    let deadline = Instant::now() + AUTOSCROLL_CEILING;
    loop {
        let at_bottom = page
            .evaluate(script.as_str())
            .await?
            .into_value::<bool>()
            .unwrap_or(true);
        if at_bottom || Instant::now() >= deadline {
            break;
        }
        sleep(AUTOSCROLL_TICK).await;
    }

    sleep(Duration::from_secs(2)).await;
    page.evaluate("window.scrollTo(0, 0)").await?;
    sleep(Duration::from_millis(500)).await;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PageDimensions {
    width: u32,
    height: u32,
}

/// Full page extent: the maximum of scroll/client/offset dimensions over
/// body and document element.
pub async fn measure_page(page: &Page) -> Result<(u32, u32), WorkerError> {
    let dims: PageDimensions = page
        .evaluate(
            "(() => { const b = document.body, d = document.documentElement; \
             return { \
                 width: Math.max(b.scrollWidth, b.clientWidth, b.offsetWidth, \
                                 d.scrollWidth, d.clientWidth, d.offsetWidth), \
                 height: Math.max(b.scrollHeight, b.clientHeight, b.offsetHeight, \
                                  d.scrollHeight, d.clientHeight, d.offsetHeight) \
             }; })()",
        )
        .await?
        .into_value()
        .map_err(|e| WorkerError::CaptureFailed(format!("page measurement failed: {e}")))?;
    Ok((dims.width.max(1), dims.height.max(1)))
}

/// Collects JS exceptions, error-level console output and failed network
/// requests for the lifetime of one viewport's page.
struct PageErrorCollector {
    errors: Arc<Mutex<Vec<CapturedPageError>>>,
    task: tokio::task::JoinHandle<()>,
}

impl PageErrorCollector {
    async fn subscribe(page: &Page) -> Result<Self, WorkerError> {
        let errors: Arc<Mutex<Vec<CapturedPageError>>> = Arc::new(Mutex::new(Vec::new()));

        let mut exceptions = page.event_listener::<EventExceptionThrown>().await?;
        let mut console = page.event_listener::<EventConsoleApiCalled>().await?;
        let mut requests = page.event_listener::<EventRequestWillBeSent>().await?;
        let mut failures = page.event_listener::<EventLoadingFailed>().await?;

        let sink = errors.clone();
        let task = tokio::spawn(async move {
            let mut request_urls: HashMap<String, String> = HashMap::new();
            loop {
                tokio::select! {
                    event = exceptions.next() => match event {
                        Some(event) => {
                            let details = &event.exception_details;
                            let message = details
                                .exception
                                .as_ref()
                                .and_then(|e| e.description.clone())
                                .unwrap_or_else(|| details.text.clone());
                            sink.lock().await.push(CapturedPageError {
                                kind: PageErrorKind::Js,
                                message,
                                source_url: details.url.clone(),
                                line_number: Some(details.line_number),
                                request_url: None,
                                failure_text: None,
                            });
                        }
                        None => break,
                    },
                    event = console.next() => match event {
                        Some(event) => {
                            if format!("{:?}", event.r#type).eq_ignore_ascii_case("error") {
                                let message = event
                                    .args
                                    .iter()
                                    .filter_map(|arg| {
                                        arg.value
                                            .as_ref()
                                            .map(|v| v.to_string())
                                            .or_else(|| arg.description.clone())
                                    })
                                    .collect::<Vec<_>>()
                                    .join(" ");
                                sink.lock().await.push(CapturedPageError {
                                    kind: PageErrorKind::Js,
                                    message,
                                    source_url: None,
                                    line_number: None,
                                    request_url: None,
                                    failure_text: None,
                                });
                            }
                        }
                        None => break,
                    },
                    event = requests.next() => match event {
                        Some(event) => {
                            request_urls.insert(
                                event.request_id.inner().clone(),
                                event.request.url.clone(),
                            );
                        }
                        None => break,
                    },
                    event = failures.next() => match event {
                        Some(event) => {
                            if !event.canceled.unwrap_or(false) {
                                let url = request_urls
                                    .get(event.request_id.inner())
                                    .cloned();
                                sink.lock().await.push(CapturedPageError {
                                    kind: PageErrorKind::Network,
                                    message: format!(
                                        "request failed: {}",
                                        event.error_text
                                    ),
                                    source_url: None,
                                    line_number: None,
                                    request_url: url,
                                    failure_text: Some(event.error_text.clone()),
                                });
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(Self { errors, task })
    }

    /// Stop listening and return everything observed.
    async fn finish(self) -> Vec<CapturedPageError> {
        self.task.abort();
        let mut guard = self.errors.lock().await;
        std::mem::take(&mut *guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_ordered_descending_and_deduped() {
        assert_eq!(ordered_widths(&[375, 1920, 768]), vec![1920, 768, 375]);
        assert_eq!(ordered_widths(&[768, 768, 375]), vec![768, 375]);
        assert_eq!(ordered_widths(&[]), Vec::<u32>::new());
    }

    #[test]
    fn error_kind_labels() {
        assert_eq!(PageErrorKind::Js.as_str(), "js");
        assert_eq!(PageErrorKind::Network.as_str(), "network");
    }

    #[test]
    fn empty_outcome_is_a_failed_capture() {
        let outcome = CaptureOutcome::default();
        assert!(!outcome.succeeded());
    }

    #[test]
    fn page_dimensions_deserialize() {
        let dims: PageDimensions =
            serde_json::from_str(r#"{"width": 1280, "height": 5000}"#).unwrap();
        assert_eq!(dims.width, 1280);
        assert_eq!(dims.height, 5000);
    }
}
