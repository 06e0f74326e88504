//! Worker HTTP surface
//!
//! Internal endpoints for the public API: health with pool stats,
//! LLM-backed script/test generation (validated against a live prepared
//! page before anything is returned), ad-hoc script dry-runs, screenshot
//! comparison, and page-discovery delegation. Every response is a
//! `{success, …}` / `{success: false, error}` envelope. No
//! authentication: this service is an in-cluster collaborator.

use axum::extract::State;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::browser_pool::{BrowserHandle, BrowserPool};
use crate::capture::CapturePipeline;
use crate::compare::CompareEngine;
use crate::config::Config;
use crate::db::Db;
use crate::dsl;
use crate::generator::{GenerationKind, GenerationRequest, ScriptGenerator};
use crate::models::ScriptType;
use crate::preparator::{self, ViewportSpec};
use crate::WorkerError;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub pool: Arc<BrowserPool>,
    pub config: Config,
    pub generator: Arc<ScriptGenerator>,
    pub pipeline: Arc<CapturePipeline>,
    pub compare: Arc<CompareEngine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate-script", post(generate_script))
        .route("/generate-test", post(generate_test))
        .route("/generate-action-script", post(generate_action_script))
        .route("/generate-action-test", post(generate_action_test))
        .route("/test-script", post(test_script))
        .route("/compare-screenshots", post(compare_screenshots))
        .route("/discover-pages", post(discover_pages))
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), WorkerError> {
    let addr = state.config.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("worker HTTP surface listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

fn error_status(error: &WorkerError) -> StatusCode {
    match error {
        WorkerError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkerError::InvalidUrl(_)
        | WorkerError::ValidationFailed(_)
        | WorkerError::Configuration(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: WorkerError) -> Response {
    (
        error_status(&error),
        Json(json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}

fn require_http_url(raw: &str) -> Result<(), WorkerError> {
    match url::Url::parse(raw) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(WorkerError::InvalidUrl(raw.to_string())),
    }
}

// --- health ---

async fn health(State(state): State<AppState>) -> Response {
    let pool_status = state.pool.stats().await;
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "pool_status": pool_status,
    }))
    .into_response()
}

// --- script generation ---

#[derive(Debug, Deserialize)]
struct GenerateBody {
    page_url: String,
    prompt: String,
    #[serde(default)]
    viewport: Option<ViewportSpec>,
    #[serde(default)]
    session_id: Option<String>,
}

async fn generate_script(State(state): State<AppState>, Json(body): Json<GenerateBody>) -> Response {
    generate(state, body, ScriptType::Eval, GenerationKind::Instruction).await
}

async fn generate_test(State(state): State<AppState>, Json(body): Json<GenerateBody>) -> Response {
    generate(state, body, ScriptType::Eval, GenerationKind::Test).await
}

async fn generate_action_script(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Response {
    generate(state, body, ScriptType::Actions, GenerationKind::Instruction).await
}

async fn generate_action_test(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Response {
    generate(state, body, ScriptType::Actions, GenerationKind::Test).await
}

/// Shared generation flow: prepare the target page so the collaborator
/// (and eval trial-runs) can see real DOM state, request the script,
/// then validate before returning anything.
async fn generate(
    state: AppState,
    body: GenerateBody,
    script_type: ScriptType,
    kind: GenerationKind,
) -> Response {
    if let Err(e) = require_http_url(&body.page_url) {
        return error_response(e);
    }

    let handle = match state.pool.acquire().await {
        Ok(handle) => handle,
        Err(e) => return error_response(e),
    };
    let result = generate_on_browser(&state, &handle, &body, script_type, kind).await;
    state.pool.release(handle).await;

    match result {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn generate_on_browser(
    state: &AppState,
    handle: &BrowserHandle,
    body: &GenerateBody,
    script_type: ScriptType,
    kind: GenerationKind,
) -> Result<Response, WorkerError> {
    let page = handle.browser().new_page("about:blank").await?;
    let result = async {
        preparator::prepare(
            &page,
            &body.page_url,
            body.viewport.unwrap_or_default(),
            state.config.generation_timeout,
            &state.config.tag_dimensions,
        )
        .await?;

        let generated = state
            .generator
            .generate(&GenerationRequest {
                page_url: body.page_url.clone(),
                prompt: body.prompt.clone(),
                viewport: body.viewport,
                script_type,
                kind,
                session_id: body.session_id.clone(),
            })
            .await?;

        let is_test = kind == GenerationKind::Test;
        match generated.script_type {
            ScriptType::Actions => {
                let report = dsl::validate(&generated.script, is_test);
                if !report.valid {
                    return Ok((
                        StatusCode::BAD_REQUEST,
                        Json(json!({
                            "success": false,
                            "error": report.errors.join("; "),
                            "validation_result": report,
                        })),
                    )
                        .into_response());
                }
                let mut response = json!({
                    "success": true,
                    "script": generated.script,
                    "script_type": "actions",
                    "explanation": generated.explanation,
                });
                if !report.warnings.is_empty() {
                    response["warning"] = json!(report.warnings.join("; "));
                }
                if is_test {
                    response["validation_result"] = json!(report);
                }
                Ok(Json(response).into_response())
            }
            ScriptType::Eval => {
                let static_errors = dsl::validate_eval(&generated.script);
                if !static_errors.is_empty() {
                    return Err(WorkerError::ValidationFailed(static_errors.join("; ")));
                }
                // Trial evaluation against the prepared page. Side
                // effects are tolerated; a throw is fatal.
                if let Err(e) = page.evaluate(generated.script.as_str()).await {
                    return Err(WorkerError::ValidationFailed(format!(
                        "script failed trial evaluation: {e}"
                    )));
                }
                let mut response = json!({
                    "success": true,
                    "script": generated.script,
                    "script_type": "eval",
                    "explanation": generated.explanation,
                });
                if is_test {
                    response["validation_result"] =
                        json!({ "valid": true, "errors": [], "warnings": [] });
                }
                Ok(Json(response).into_response())
            }
        }
    }
    .await;
    let _ = page.close().await;
    result
}

// --- ad-hoc script execution ---

#[derive(Debug, Deserialize)]
struct TestScriptBody {
    page_url: String,
    script: String,
    #[serde(default)]
    viewport: Option<ViewportSpec>,
}

/// Looks like an actions document rather than a JS expression.
fn smells_like_actions(script: &str) -> bool {
    serde_json::from_str::<Value>(script)
        .map(|doc| doc.get("steps").is_some())
        .unwrap_or(false)
}

async fn test_script(State(state): State<AppState>, Json(body): Json<TestScriptBody>) -> Response {
    if let Err(e) = require_http_url(&body.page_url) {
        return error_response(e);
    }

    let handle = match state.pool.acquire().await {
        Ok(handle) => handle,
        Err(e) => return error_response(e),
    };
    let result = dry_run(&state, &handle, &body).await;
    state.pool.release(handle).await;

    match result {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn dry_run(
    state: &AppState,
    handle: &BrowserHandle,
    body: &TestScriptBody,
) -> Result<Response, WorkerError> {
    let page = handle.browser().new_page("about:blank").await?;
    let result = async {
        preparator::prepare(
            &page,
            &body.page_url,
            body.viewport.unwrap_or_default(),
            state.config.generation_timeout,
            &state.config.tag_dimensions,
        )
        .await?;

        let script_type = if smells_like_actions(&body.script) {
            ScriptType::Actions
        } else {
            ScriptType::Eval
        };

        // Runtime failure is a result, not an HTTP error: the caller
        // asked "what happens when this runs".
        let response = match state.pipeline.run_script(&page, &body.script, script_type).await {
            Ok(()) => json!({ "success": true, "message": "script executed successfully" }),
            Err(message) => json!({ "success": false, "error": message }),
        };
        Ok(Json(response).into_response())
    }
    .await;
    let _ = page.close().await;
    result
}

// --- comparison ---

#[derive(Debug, Deserialize)]
struct CompareBody {
    screenshot_1: i64,
    screenshot_2: i64,
    #[serde(default)]
    include_image: bool,
}

async fn compare_screenshots(
    State(state): State<AppState>,
    Json(body): Json<CompareBody>,
) -> Response {
    match state
        .compare
        .compare(body.screenshot_1, body.screenshot_2, body.include_image)
        .await
    {
        Ok(comparison) => match comparison.diff_png {
            Some(png) => {
                let stats = &comparison.stats;
                let headers = [
                    (header::CONTENT_TYPE, "image/png".to_string()),
                    (
                        HeaderName::from_static("x-diff-pixels"),
                        stats.diff_pixels.to_string(),
                    ),
                    (
                        HeaderName::from_static("x-diff-percentage"),
                        stats.diff_percentage.to_string(),
                    ),
                    (
                        HeaderName::from_static("x-total-pixels"),
                        stats.total_pixels.to_string(),
                    ),
                    (HeaderName::from_static("x-width"), stats.width.to_string()),
                    (HeaderName::from_static("x-height"), stats.height.to_string()),
                ];
                (headers, png).into_response()
            }
            None => Json(json!({ "success": true, "stats": comparison.stats })).into_response(),
        },
        Err(e) => error_response(e),
    }
}

// --- page discovery ---

#[derive(Debug, Deserialize)]
struct DiscoverBody {
    domain: String,
    #[serde(default)]
    max_pages: Option<u32>,
}

async fn discover_pages(State(state): State<AppState>, Json(body): Json<DiscoverBody>) -> Response {
    match state
        .generator
        .discover_pages(&body.domain, body.max_pages)
        .await
    {
        Ok(discovered) => Json(json!({
            "success": true,
            "pages": discovered.pages,
            "total_found": discovered.total_found,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}
