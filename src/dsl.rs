//! Action DSL: schema, structural validation, and execution
//!
//! Instruction and test scripts come in two flavours: free-form `eval`
//! expressions and `actions` documents — a JSON `{"steps": [...]}`
//! sequence where every step carries an `action` discriminant.
//! Validation is pure and structural (it never touches a browser);
//! execution is a separate concern that runs a validated sequence
//! against a live page. Runtime errors do not make a sequence invalid.

use chromiumoxide::Page;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};

use crate::WorkerError;

/// Known actions and the fields each requires. `scrollTo` is special:
/// it needs `selector` or `y`, checked separately.
pub const KNOWN_ACTIONS: &[(&str, &[&str])] = &[
    ("waitForSelector", &["selector"]),
    ("click", &["selector"]),
    ("type", &["selector", "text"]),
    ("select", &["selector", "value"]),
    ("waitForNavigation", &[]),
    ("sleep", &["ms"]),
    ("scrollTo", &[]),
    ("assertSelector", &["selector"]),
    ("assertText", &["selector", "text"]),
    ("assertUrl", &["pattern"]),
    ("assertTitle", &["pattern"]),
    ("assert", &["expression"]),
];

/// Pseudo-classes some generators emit that no real browser supports.
const FORBIDDEN_SELECTOR_SYNTAX: &[&str] = &[":text", ":contains"];

/// Calls an eval script may not make: scripts must be synchronous and
/// side-effect-bounded.
const FORBIDDEN_EVAL_TOKENS: &[&str] = &["setTimeout", "fetch(", "alert(", "confirm(", "prompt("];

// --- typed schema ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSequence {
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Step {
    #[serde(rename_all = "camelCase")]
    WaitForSelector {
        selector: String,
        timeout: Option<u64>,
        visible: Option<bool>,
        label: Option<String>,
    },
    Click {
        selector: String,
        timeout: Option<u64>,
        label: Option<String>,
    },
    Type {
        selector: String,
        text: String,
        delay: Option<u64>,
        label: Option<String>,
    },
    Select {
        selector: String,
        value: String,
        label: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WaitForNavigation {
        wait_until: Option<String>,
        timeout: Option<u64>,
        label: Option<String>,
    },
    Sleep {
        ms: u64,
        label: Option<String>,
    },
    ScrollTo {
        selector: Option<String>,
        y: Option<f64>,
        label: Option<String>,
    },
    AssertSelector {
        selector: String,
        visible: Option<bool>,
        count: Option<u64>,
        message: Option<String>,
        label: Option<String>,
    },
    AssertText {
        selector: String,
        text: String,
        contains: Option<bool>,
        message: Option<String>,
        label: Option<String>,
    },
    AssertUrl {
        pattern: String,
        message: Option<String>,
        label: Option<String>,
    },
    AssertTitle {
        pattern: String,
        message: Option<String>,
        label: Option<String>,
    },
    Assert {
        expression: String,
        message: Option<String>,
        label: Option<String>,
    },
}

impl Step {
    pub fn action_name(&self) -> &'static str {
        match self {
            Step::WaitForSelector { .. } => "waitForSelector",
            Step::Click { .. } => "click",
            Step::Type { .. } => "type",
            Step::Select { .. } => "select",
            Step::WaitForNavigation { .. } => "waitForNavigation",
            Step::Sleep { .. } => "sleep",
            Step::ScrollTo { .. } => "scrollTo",
            Step::AssertSelector { .. } => "assertSelector",
            Step::AssertText { .. } => "assertText",
            Step::AssertUrl { .. } => "assertUrl",
            Step::AssertTitle { .. } => "assertTitle",
            Step::Assert { .. } => "assert",
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Step::WaitForSelector { label, .. }
            | Step::Click { label, .. }
            | Step::Type { label, .. }
            | Step::Select { label, .. }
            | Step::WaitForNavigation { label, .. }
            | Step::Sleep { label, .. }
            | Step::ScrollTo { label, .. }
            | Step::AssertSelector { label, .. }
            | Step::AssertText { label, .. }
            | Step::AssertUrl { label, .. }
            | Step::AssertTitle { label, .. }
            | Step::Assert { label, .. } => label.as_deref(),
        }
    }
}

// --- validation ---

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub action: Option<String>,
    pub valid: bool,
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub total_steps: usize,
    pub valid_steps: usize,
    pub steps: Vec<StepReport>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn failure(error: String) -> Self {
        Self {
            valid: false,
            total_steps: 0,
            valid_steps: 0,
            steps: Vec::new(),
            errors: vec![error],
            warnings: Vec::new(),
        }
    }
}

fn known_action_names() -> String {
    KNOWN_ACTIONS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Structurally validate an `actions` document. Pure: works from the
/// raw JSON so every step is reported even when earlier ones are
/// broken. `expect_assertions` is set for test sequences, where a
/// script asserting nothing is almost certainly a mistake (warning,
/// not an error).
pub fn validate(raw: &str, expect_assertions: bool) -> ValidationReport {
    let doc: Value = match serde_json::from_str(raw) {
        Ok(doc) => doc,
        Err(e) => return ValidationReport::failure(format!("Invalid JSON: {e}")),
    };

    let steps = match doc.get("steps").and_then(Value::as_array) {
        Some(steps) => steps,
        None => {
            return ValidationReport::failure(
                "Document must be an object with a \"steps\" array".to_string(),
            )
        }
    };

    let mut report = ValidationReport {
        valid: true,
        total_steps: steps.len(),
        valid_steps: 0,
        steps: Vec::with_capacity(steps.len()),
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    if steps.is_empty() {
        report.warnings.push("Sequence contains no steps".to_string());
    }

    let mut has_assertion = false;

    for (index, step) in steps.iter().enumerate() {
        let mut problems = Vec::new();
        let action = step
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_string);

        match action.as_deref() {
            None => {
                problems.push("Missing \"action\" field".to_string());
            }
            Some(name) => {
                match KNOWN_ACTIONS.iter().find(|(known, _)| *known == name) {
                    None => {
                        problems.push(format!(
                            "Unknown action type \"{name}\". Known actions: {}",
                            known_action_names()
                        ));
                    }
                    Some((_, required)) => {
                        if name.starts_with("assert") {
                            has_assertion = true;
                        }
                        for field in *required {
                            if step.get(*field).map_or(true, Value::is_null) {
                                problems.push(format!(
                                    "\"{name}\" requires field \"{field}\""
                                ));
                            }
                        }
                        if name == "scrollTo"
                            && step.get("selector").map_or(true, Value::is_null)
                            && step.get("y").map_or(true, Value::is_null)
                        {
                            problems.push(
                                "\"scrollTo\" requires \"selector\" or \"y\"".to_string(),
                            );
                        }
                    }
                }
                if let Some(selector) = step.get("selector").and_then(Value::as_str) {
                    for forbidden in FORBIDDEN_SELECTOR_SYNTAX {
                        if selector.contains(forbidden) {
                            problems.push(format!(
                                "Selector \"{selector}\" uses unsupported pseudo-class \
                                 \"{forbidden}\""
                            ));
                        }
                    }
                }
            }
        }

        let valid = problems.is_empty();
        if valid {
            report.valid_steps += 1;
        } else {
            report.valid = false;
            for problem in &problems {
                report.errors.push(format!("Step {index}: {problem}"));
            }
        }
        report.steps.push(StepReport {
            index,
            action,
            valid,
            problems,
        });
    }

    if expect_assertions && !has_assertion && !steps.is_empty() {
        report
            .warnings
            .push("Test sequence contains no assert* actions".to_string());
    }

    report
}

/// Guardrails for free-form eval scripts. Parseability is only provable
/// by a trial evaluation against a live page; this catches the
/// statically forbidden calls.
pub fn validate_eval(script: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if script.trim().is_empty() {
        errors.push("Script is empty".to_string());
        return errors;
    }
    for token in FORBIDDEN_EVAL_TOKENS {
        if script.contains(token) {
            errors.push(format!("Eval scripts may not use {}", token.trim_end_matches('(')));
        }
    }
    errors
}

/// Parse a document that already passed [`validate`].
pub fn parse_sequence(raw: &str) -> Result<ActionSequence, WorkerError> {
    serde_json::from_str(raw).map_err(|e| WorkerError::ValidationFailed(e.to_string()))
}

// --- execution ---

/// Verdict an eval-mode test expression must produce.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalVerdict {
    pub passed: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub action: String,
    pub label: Option<String>,
    pub passed: bool,
    pub message: String,
    pub duration_ms: i64,
}

/// Execute a sequence step by step. A failing step stops the sequence;
/// its outcome (and everything before it) is returned. `Err` is
/// reserved for the browser connection itself breaking down.
pub async fn execute_sequence(
    page: &Page,
    sequence: &ActionSequence,
    default_timeout: Duration,
) -> Result<Vec<StepOutcome>, WorkerError> {
    let mut outcomes = Vec::with_capacity(sequence.steps.len());

    for (index, step) in sequence.steps.iter().enumerate() {
        let started = Instant::now();
        let result = execute_step(page, step, default_timeout).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(message) => outcomes.push(StepOutcome {
                index,
                action: step.action_name().to_string(),
                label: step.label().map(str::to_string),
                passed: true,
                message,
                duration_ms,
            }),
            Err(message) => {
                outcomes.push(StepOutcome {
                    index,
                    action: step.action_name().to_string(),
                    label: step.label().map(str::to_string),
                    passed: false,
                    message,
                    duration_ms,
                });
                break;
            }
        }
    }

    Ok(outcomes)
}

async fn execute_step(
    page: &Page,
    step: &Step,
    default_timeout: Duration,
) -> Result<String, String> {
    match step {
        Step::WaitForSelector {
            selector,
            timeout: step_timeout,
            visible,
            ..
        } => {
            let limit = step_timeout
                .map(Duration::from_millis)
                .unwrap_or(default_timeout);
            wait_for_selector(page, selector, visible.unwrap_or(false), limit).await?;
            Ok(format!("selector {selector} appeared"))
        }
        Step::Click {
            selector,
            timeout: step_timeout,
            ..
        } => {
            let limit = step_timeout
                .map(Duration::from_millis)
                .unwrap_or(default_timeout);
            wait_for_selector(page, selector, false, limit).await?;
            let element = page
                .find_element(selector.as_str())
                .await
                .map_err(|e| format!("click failed for {selector}: {e}"))?;
            element
                .click()
                .await
                .map_err(|e| format!("click failed for {selector}: {e}"))?;
            Ok(format!("clicked {selector}"))
        }
        Step::Type {
            selector,
            text,
            delay,
            ..
        } => {
            let element = page
                .find_element(selector.as_str())
                .await
                .map_err(|e| format!("type failed for {selector}: {e}"))?;
            element
                .click()
                .await
                .map_err(|e| format!("focus failed for {selector}: {e}"))?;
            match delay {
                Some(ms) if *ms > 0 => {
                    for ch in text.chars() {
                        element
                            .type_str(ch.to_string())
                            .await
                            .map_err(|e| format!("type failed for {selector}: {e}"))?;
                        sleep(Duration::from_millis(*ms)).await;
                    }
                }
                _ => {
                    element
                        .type_str(text.as_str())
                        .await
                        .map_err(|e| format!("type failed for {selector}: {e}"))?;
                }
            }
            Ok(format!("typed into {selector}"))
        }
        Step::Select {
            selector, value, ..
        } => {
            let script = format!(
                r#"(() => {{
    const el = document.querySelector({sel});
    if (!el) return false;
    el.value = {val};
    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return true;
}})()"#,
                sel = js_string(selector),
                val = js_string(value),
            );
            let found = eval_bool(page, &script).await?;
            if found {
                Ok(format!("selected {value} in {selector}"))
            } else {
                Err(format!("select failed: no element matches {selector}"))
            }
        }
        Step::WaitForNavigation {
            timeout: step_timeout,
            ..
        } => {
            let limit = step_timeout
                .map(Duration::from_millis)
                .unwrap_or(default_timeout);
            timeout(limit, page.wait_for_navigation())
                .await
                .map_err(|_| format!("navigation did not complete within {limit:?}"))?
                .map_err(|e| format!("waitForNavigation failed: {e}"))?;
            Ok("navigation completed".to_string())
        }
        Step::Sleep { ms, .. } => {
            sleep(Duration::from_millis(*ms)).await;
            Ok(format!("slept {ms} ms"))
        }
        Step::ScrollTo { selector, y, .. } => {
            if let Some(selector) = selector {
                let script = format!(
                    r#"(() => {{
    const el = document.querySelector({sel});
    if (!el) return false;
    el.scrollIntoView({{ block: 'center' }});
    return true;
}})()"#,
                    sel = js_string(selector),
                );
                let found = eval_bool(page, &script).await?;
                if found {
                    Ok(format!("scrolled to {selector}"))
                } else {
                    Err(format!("scrollTo failed: no element matches {selector}"))
                }
            } else if let Some(y) = y {
                page.evaluate(format!("window.scrollTo(0, {y})"))
                    .await
                    .map_err(|e| format!("scrollTo failed: {e}"))?;
                Ok(format!("scrolled to y={y}"))
            } else {
                Err("scrollTo has neither selector nor y".to_string())
            }
        }
        Step::AssertSelector {
            selector,
            visible,
            count,
            message,
            ..
        } => {
            let script = format!(
                r#"(() => {{
    const all = document.querySelectorAll({sel});
    const isVisible = (el) => {{
        const rect = el.getBoundingClientRect();
        const style = window.getComputedStyle(el);
        return rect.width > 0 && rect.height > 0 &&
            style.visibility !== 'hidden' && style.display !== 'none';
    }};
    const matched = {want_visible} ? [...all].filter(isVisible) : [...all];
    return matched.length;
}})()"#,
                sel = js_string(selector),
                want_visible = visible.unwrap_or(false),
            );
            let found = eval_i64(page, &script).await?;
            let passed = match count {
                Some(expected) => found == *expected as i64,
                None => found > 0,
            };
            if passed {
                Ok(format!("{found} element(s) match {selector}"))
            } else {
                Err(fail_message(
                    message,
                    format!(
                        "expected {} matching {selector}, found {found}",
                        count.map_or("at least 1".to_string(), |c| c.to_string())
                    ),
                ))
            }
        }
        Step::AssertText {
            selector,
            text,
            contains,
            message,
            ..
        } => {
            let script = format!(
                r#"(() => {{
    const el = document.querySelector({sel});
    return el ? (el.innerText || el.textContent || '') : null;
}})()"#,
                sel = js_string(selector),
            );
            let actual: Option<String> = page
                .evaluate(script)
                .await
                .map_err(|e| format!("assertText evaluation failed: {e}"))?
                .into_value()
                .map_err(|e| format!("assertText returned no value: {e}"))?;
            match actual {
                None => Err(fail_message(
                    message,
                    format!("no element matches {selector}"),
                )),
                Some(actual) => {
                    let actual = actual.trim();
                    let passed = if contains.unwrap_or(false) {
                        actual.contains(text.as_str())
                    } else {
                        actual == text
                    };
                    if passed {
                        Ok(format!("text of {selector} matches"))
                    } else {
                        Err(fail_message(
                            message,
                            format!("expected \"{text}\", got \"{actual}\""),
                        ))
                    }
                }
            }
        }
        Step::AssertUrl {
            pattern, message, ..
        } => {
            let script = format!(
                "new RegExp({}).test(window.location.href)",
                js_string(pattern)
            );
            if eval_bool(page, &script).await? {
                Ok("url matches".to_string())
            } else {
                Err(fail_message(
                    message,
                    format!("current URL does not match /{pattern}/"),
                ))
            }
        }
        Step::AssertTitle {
            pattern, message, ..
        } => {
            let script = format!("new RegExp({}).test(document.title)", js_string(pattern));
            if eval_bool(page, &script).await? {
                Ok("title matches".to_string())
            } else {
                Err(fail_message(
                    message,
                    format!("document title does not match /{pattern}/"),
                ))
            }
        }
        Step::Assert {
            expression,
            message,
            ..
        } => {
            let verdict: EvalVerdict = page
                .evaluate(expression.as_str())
                .await
                .map_err(|e| format!("assert expression failed: {e}"))?
                .into_value()
                .map_err(|e| {
                    format!("assert expression must return {{ passed, message }}: {e}")
                })?;
            if verdict.passed {
                Ok(verdict.message.unwrap_or_else(|| "assertion passed".to_string()))
            } else {
                Err(fail_message(
                    message,
                    verdict
                        .message
                        .unwrap_or_else(|| "assertion failed".to_string()),
                ))
            }
        }
    }
}

async fn wait_for_selector(
    page: &Page,
    selector: &str,
    require_visible: bool,
    limit: Duration,
) -> Result<(), String> {
    let script = format!(
        r#"(() => {{
    const el = document.querySelector({sel});
    if (!el) return false;
    if (!{require_visible}) return true;
    const rect = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    return rect.width > 0 && rect.height > 0 &&
        style.visibility !== 'hidden' && style.display !== 'none';
}})()"#,
        sel = js_string(selector),
    );
    let deadline = Instant::now() + limit;
    loop {
        if eval_bool(page, &script).await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(format!("selector {selector} did not appear within {limit:?}"));
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn eval_bool(page: &Page, script: &str) -> Result<bool, String> {
    page.evaluate(script)
        .await
        .map_err(|e| format!("evaluation failed: {e}"))?
        .into_value::<bool>()
        .map_err(|e| format!("evaluation returned no boolean: {e}"))
}

async fn eval_i64(page: &Page, script: &str) -> Result<i64, String> {
    page.evaluate(script)
        .await
        .map_err(|e| format!("evaluation failed: {e}"))?
        .into_value::<i64>()
        .map_err(|e| format!("evaluation returned no number: {e}"))
}

fn fail_message(custom: &Option<String>, default: String) -> String {
    custom.clone().unwrap_or(default)
}

/// Embed a string into generated JS without injection.
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_sequence_passes() {
        let raw = r##"{
            "steps": [
                {"action": "waitForSelector", "selector": "#login", "timeout": 5000},
                {"action": "type", "selector": "#user", "text": "alice"},
                {"action": "click", "selector": "#submit"},
                {"action": "assertUrl", "pattern": "dashboard"}
            ]
        }"##;
        let report = validate(raw, false);
        assert!(report.valid);
        assert_eq!(report.total_steps, 4);
        assert_eq!(report.valid_steps, 4);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn unknown_action_rejected_with_hint() {
        let raw = r##"{"steps":[{"action":"teleport","selector":"#x"}]}"##;
        let report = validate(raw, false);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("Unknown action type"));
        assert!(report.errors[0].contains("waitForSelector"));
        assert!(report.errors[0].contains("assertTitle"));
    }

    #[test]
    fn missing_required_field_reported_per_step() {
        let raw = r##"{"steps":[
            {"action": "click"},
            {"action": "type", "selector": "#a"},
            {"action": "sleep", "ms": 100}
        ]}"##;
        let report = validate(raw, false);
        assert!(!report.valid);
        assert_eq!(report.valid_steps, 1);
        assert!(report.errors.iter().any(|e| e.contains("Step 0")));
        assert!(report.errors.iter().any(|e| e.contains("\"text\"")));
        assert!(report.steps[2].valid);
    }

    #[test]
    fn forbidden_selector_pseudo_classes() {
        let raw = r#"{"steps":[{"action":"click","selector":"button:contains('Go')"}]}"#;
        let report = validate(raw, false);
        assert!(!report.valid);
        assert!(report.errors[0].contains(":contains"));

        let raw = r#"{"steps":[{"action":"click","selector":"a:text('Home')"}]}"#;
        assert!(!validate(raw, false).valid);
    }

    #[test]
    fn test_without_assertions_warns_but_validates() {
        let raw = r##"{"steps":[{"action":"click","selector":"#ok"}]}"##;
        let report = validate(raw, true);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("no assert"));
    }

    #[test]
    fn scroll_to_needs_selector_or_y() {
        let raw = r#"{"steps":[{"action":"scrollTo"}]}"#;
        assert!(!validate(raw, false).valid);

        let raw = r#"{"steps":[{"action":"scrollTo","y":400}]}"#;
        assert!(validate(raw, false).valid);

        let raw = r##"{"steps":[{"action":"scrollTo","selector":"#footer"}]}"##;
        assert!(validate(raw, false).valid);
    }

    #[test]
    fn not_json_is_a_single_error() {
        let report = validate("not json at all", false);
        assert!(!report.valid);
        assert!(report.errors[0].contains("Invalid JSON"));
    }

    #[test]
    fn document_without_steps_rejected() {
        let report = validate(r#"{"actions": []}"#, false);
        assert!(!report.valid);
        assert!(report.errors[0].contains("steps"));
    }

    #[test]
    fn validated_sequence_parses_to_typed_steps() {
        let raw = r##"{
            "steps": [
                {"action": "waitForSelector", "selector": "#a", "visible": true},
                {"action": "assertText", "selector": "h1", "text": "Welcome", "contains": true}
            ],
            "explanation": "landing page check"
        }"##;
        assert!(validate(raw, true).valid);
        let sequence = parse_sequence(raw).unwrap();
        assert_eq!(sequence.steps.len(), 2);
        assert_eq!(sequence.steps[0].action_name(), "waitForSelector");
        assert_eq!(sequence.explanation.as_deref(), Some("landing page check"));
    }

    #[test]
    fn validation_is_deterministic() {
        let raw = r#"{"steps":[{"action":"assert","expression":"({passed:true,message:'ok'})"}]}"#;
        let a = validate(raw, true);
        let b = validate(raw, true);
        assert_eq!(a.valid, b.valid);
        assert_eq!(a.errors, b.errors);
        assert_eq!(a.warnings, b.warnings);
    }

    #[test]
    fn eval_guardrails() {
        assert!(validate_eval("document.title").is_empty());
        assert!(!validate_eval("fetch('/api')").is_empty());
        assert!(!validate_eval("setTimeout(() => {}, 100)").is_empty());
        assert!(!validate_eval("alert('hi')").is_empty());
        assert!(!validate_eval("").is_empty());
    }
}
