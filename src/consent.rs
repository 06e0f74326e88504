//! Cookie-consent dismissal
//!
//! A best-effort, four-stage procedure: walk consent-platform iframes,
//! match accept phrases in the main document, click known platform
//! selectors, and finally hide leftover overlays with CSS. Every stage
//! is isolated so one failure never blocks the next, and nothing here is
//! ever fatal to a capture.

use chromiumoxide::cdp::browser_protocol::page::{
    CreateIsolatedWorldParams, FrameTree, GetFrameTreeParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// How an accept phrase is matched against button text.
///
/// Short ambiguous words are `Exact` (word-boundary) so "accept" never
/// fires on "unacceptable" and "ok" never fires on "cookie".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    Substring,
}

/// Accept phrases, most specific first, across EN/DE/FR/ES/IT.
pub const ACCEPT_PHRASES: &[(&str, MatchMode)] = &[
    ("accept all cookies", MatchMode::Substring),
    ("accept all & close", MatchMode::Substring),
    ("accept all", MatchMode::Substring),
    ("allow all cookies", MatchMode::Substring),
    ("allow all", MatchMode::Substring),
    ("agree to all", MatchMode::Substring),
    ("i accept", MatchMode::Substring),
    ("i agree", MatchMode::Substring),
    ("got it", MatchMode::Substring),
    ("alle cookies akzeptieren", MatchMode::Substring),
    ("alle akzeptieren", MatchMode::Substring),
    ("alles akzeptieren", MatchMode::Substring),
    ("einverstanden", MatchMode::Substring),
    ("zustimmen", MatchMode::Substring),
    ("tout accepter", MatchMode::Substring),
    ("accepter tout", MatchMode::Substring),
    ("accepter les cookies", MatchMode::Substring),
    ("j'accepte", MatchMode::Substring),
    ("aceptar todo", MatchMode::Substring),
    ("aceptar todas", MatchMode::Substring),
    ("aceptar cookies", MatchMode::Substring),
    ("accetta tutti", MatchMode::Substring),
    ("accetta tutto", MatchMode::Substring),
    ("accetto", MatchMode::Substring),
    ("consent", MatchMode::Exact),
    ("accept", MatchMode::Exact),
    ("agree", MatchMode::Exact),
    ("accepter", MatchMode::Exact),
    ("akzeptieren", MatchMode::Exact),
    ("aceptar", MatchMode::Exact),
    ("accetta", MatchMode::Exact),
    ("ok", MatchMode::Exact),
    ("okay", MatchMode::Exact),
];

/// Platform-specific accept buttons, tried before generic patterns.
pub const CONSENT_SELECTORS: &[&str] = &[
    // OneTrust
    "#onetrust-accept-btn-handler",
    ".onetrust-close-btn-handler",
    // Cookiebot
    "#CybotCookiebotDialogBodyLevelButtonLevelOptinAllowAll",
    "#CybotCookiebotDialogBodyButtonAccept",
    // Osano
    ".osano-cm-accept-all",
    ".osano-cm-button--type_accept",
    // CookieYes
    ".cky-btn-accept",
    "[data-cky-tag='accept-button']",
    // Complianz
    ".cmplz-accept",
    // Borlabs
    "[data-cookie-accept-all]",
    "a[data-cookie-accept-all]",
    // Quantcast
    ".qc-cmp2-summary-buttons button[mode='primary']",
    // Didomi
    "#didomi-notice-agree-button",
    // TrustArc
    "#truste-consent-button",
    // Sourcepoint
    "button.sp_choice_type_11",
    ".message-button.sp_choice_type_ACCEPT_ALL",
    // Usercentrics
    "[data-testid='uc-accept-all-button']",
    // Generic class/ID patterns
    "#acceptAllCookies",
    "#acceptCookies",
    ".accept-cookies",
    ".cookie-accept",
    ".js-accept-cookies",
    "button[class*='cookie'][class*='accept']",
];

/// Overlay containers force-hidden as the last resort.
pub const OVERLAY_HIDE_SELECTORS: &[&str] = &[
    "#onetrust-consent-sdk",
    "#CybotCookiebotDialog",
    "#CybotCookiebotDialogBodyUnderlay",
    ".osano-cm-window",
    ".cky-consent-container",
    ".cky-overlay",
    ".cmplz-cookiebanner",
    "#BorlabsCookieBox",
    ".qc-cmp2-container",
    "#didomi-host",
    ".truste_box_overlay",
    ".truste_overlay",
    "#usercentrics-root",
    "[class*='cookie-banner']",
    "[class*='cookieBanner']",
    "[class*='cookie-consent']",
    "[class*='cookieConsent']",
    "[id*='cookie-banner']",
    "[id*='cookieBanner']",
];

/// URL fragments marking a frame as consent-platform hosted.
pub const FRAME_URL_HINTS: &[&str] = &[
    "cmp.",
    "consent",
    "sourcepoint",
    "privacy",
    "gdpr",
    "cookie",
];

const FRAME_EVAL_CEILING: Duration = Duration::from_secs(3);

pub fn frame_url_is_consent(url: &str) -> bool {
    let lower = url.to_lowercase();
    FRAME_URL_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Click handler for consent-platform iframes: platform selectors
/// first, then visible buttons whose text or title matches an accept
/// phrase. Returns true when a click landed.
pub fn frame_click_script() -> String {
    build_click_script(true)
}

/// Click handler for the main document: phrase matching over clickable
/// elements runs before the platform selector list. Returns true when a
/// click landed.
pub fn document_click_script() -> String {
    build_click_script(false)
}

const SELECTOR_PASS_JS: &str = r#"    for (const selector of selectors) {
        let el;
        try { el = document.querySelector(selector); } catch (e) { continue; }
        if (visible(el)) { el.click(); return true; }
    }"#;

const PHRASE_PASS_JS: &str = r#"    const candidates = document.querySelectorAll(
        'button, a, [role=button], input[type=button], input[type=submit], .btn, [class*=button]'
    );
    for (const phrase of phrases) {
        for (const el of candidates) {
            if (!visible(el)) continue;
            const text = el.innerText || el.value || '';
            const label = el.getAttribute('aria-label') || el.getAttribute('title') || '';
            if (matches(text, phrase) || matches(label, phrase)) {
                el.click();
                return true;
            }
        }
    }"#;

fn build_click_script(selectors_first: bool) -> String {
    let phrases = serde_json::to_string(
        &ACCEPT_PHRASES
            .iter()
            .map(|(text, mode)| {
                serde_json::json!({ "text": text, "exact": *mode == MatchMode::Exact })
            })
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".to_string());
    let selectors = serde_json::to_string(CONSENT_SELECTORS).unwrap_or_else(|_| "[]".to_string());

    let (first_pass, second_pass) = if selectors_first {
        (SELECTOR_PASS_JS, PHRASE_PASS_JS)
    } else {
        (PHRASE_PASS_JS, SELECTOR_PASS_JS)
    };

    format!(
        r#"(() => {{
    const phrases = {phrases};
    const selectors = {selectors};
    const visible = (el) => {{
        if (!el) return false;
        const rect = el.getBoundingClientRect();
        const style = window.getComputedStyle(el);
        return rect.width > 0 && rect.height > 0 &&
            style.visibility !== 'hidden' && style.display !== 'none';
    }};
    const escapeRe = (s) => s.replace(/[.*+?^${{}}()|[\]\\]/g, '\\$&');
    const matches = (text, phrase) => {{
        if (!text) return false;
        const haystack = text.trim().toLowerCase();
        if (phrase.exact) {{
            return new RegExp('\\b' + escapeRe(phrase.text) + '\\b').test(haystack);
        }}
        return haystack.includes(phrase.text);
    }};

{first_pass}

{second_pass}
    return false;
}})()"#
    )
}

/// JS hiding known overlay containers and restoring body scroll.
pub fn hide_script() -> String {
    let selectors =
        serde_json::to_string(OVERLAY_HIDE_SELECTORS).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"(() => {{
    const selectors = {selectors};
    let hidden = 0;
    for (const selector of selectors) {{
        let found;
        try {{ found = document.querySelectorAll(selector); }} catch (e) {{ continue; }}
        for (const el of found) {{
            el.style.setProperty('display', 'none', 'important');
            hidden++;
        }}
    }}
    if (window.getComputedStyle(document.body).overflow === 'hidden') {{
        document.body.style.overflow = 'auto';
    }}
    return hidden;
}})()"#
    )
}

/// Run the whole dismissal procedure once. Returns whether any click
/// landed; informational only.
pub async fn dismiss(page: &Page) -> bool {
    let mut clicked = false;

    match walk_consent_frames(page).await {
        Ok(frame_clicked) => clicked |= frame_clicked,
        Err(e) => debug!("consent iframe walk failed: {e}"),
    }

    match evaluate_bool(page, &document_click_script()).await {
        Ok(doc_clicked) => clicked |= doc_clicked,
        Err(e) => debug!("consent document click failed: {e}"),
    }

    if let Err(e) = page.evaluate(hide_script()).await {
        debug!("consent overlay hide failed: {e}");
    }

    clicked
}

async fn evaluate_bool(page: &Page, script: &str) -> Result<bool, crate::WorkerError> {
    let result = page.evaluate(script).await?;
    Ok(result.into_value::<bool>().unwrap_or(false))
}

/// Evaluate the click script inside every consent-hinted child frame,
/// each in its own isolated world with a 3 s ceiling.
async fn walk_consent_frames(page: &Page) -> Result<bool, crate::WorkerError> {
    let tree = page.execute(GetFrameTreeParams::default()).await?;
    let mut frames = Vec::new();
    collect_child_frames(&tree.frame_tree, &mut frames);

    let mut clicked = false;
    for (frame_id, url) in frames {
        if !frame_url_is_consent(&url) {
            continue;
        }
        let attempt = async {
            let world = page
                .execute(
                    CreateIsolatedWorldParams::builder()
                        .frame_id(frame_id)
                        .world_name("pagewatch-consent")
                        .build()
                        .map_err(crate::WorkerError::BrowserError)?,
                )
                .await?;
            let eval = page
                .execute(
                    EvaluateParams::builder()
                        .expression(frame_click_script())
                        .context_id(world.execution_context_id.clone())
                        .return_by_value(true)
                        .build()
                        .map_err(crate::WorkerError::BrowserError)?,
                )
                .await?;
            let value = eval
                .result
                .result
                .value
                .as_ref()
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok::<bool, crate::WorkerError>(value)
        };
        match timeout(FRAME_EVAL_CEILING, attempt).await {
            Ok(Ok(true)) => {
                debug!("consent click landed in frame {url}");
                clicked = true;
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => debug!("consent frame eval failed for {url}: {e}"),
            Err(_) => debug!("consent frame eval timed out for {url}"),
        }
    }
    Ok(clicked)
}

fn collect_child_frames(
    tree: &FrameTree,
    out: &mut Vec<(chromiumoxide::cdp::browser_protocol::page::FrameId, String)>,
) {
    if let Some(children) = &tree.child_frames {
        for child in children {
            out.push((child.frame.id.clone(), child.frame.url.clone()));
            collect_child_frames(child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_phrases_precede_general() {
        let position = |needle: &str| {
            ACCEPT_PHRASES
                .iter()
                .position(|(text, _)| *text == needle)
                .unwrap()
        };
        assert!(position("accept all cookies") < position("accept"));
        assert!(position("alle cookies akzeptieren") < position("akzeptieren"));
        assert!(position("tout accepter") < position("accepter"));
        assert!(position("aceptar todo") < position("aceptar"));
        assert!(position("accetta tutti") < position("accetta"));
    }

    #[test]
    fn ambiguous_words_are_exact() {
        for word in ["ok", "okay", "agree", "accept", "accepter", "accetta", "aceptar"] {
            let (_, mode) = ACCEPT_PHRASES
                .iter()
                .find(|(text, _)| *text == word)
                .unwrap();
            assert_eq!(*mode, MatchMode::Exact, "{word} must be exact-matched");
        }
    }

    #[test]
    fn frame_hints_match_platform_urls() {
        assert!(frame_url_is_consent("https://cmp.example.com/loader"));
        assert!(frame_url_is_consent("https://sdk.privacy-center.org/x"));
        assert!(frame_url_is_consent("https://cdn.sourcepoint.net/msg"));
        assert!(frame_url_is_consent("https://example.com/gdpr-frame"));
        assert!(!frame_url_is_consent("https://example.com/main"));
    }

    #[test]
    fn click_scripts_embed_tables() {
        for script in [frame_click_script(), document_click_script()] {
            assert!(script.contains("accept all cookies"));
            assert!(script.contains("#onetrust-accept-btn-handler"));
            // Exact phrases flow through as word-boundary regexes.
            assert!(script.contains("\"exact\":true"));
        }
    }

    #[test]
    fn frame_script_tries_selectors_first() {
        let script = frame_click_script();
        let selector_loop = script.find("for (const selector of selectors)").unwrap();
        let phrase_loop = script.find("for (const phrase of phrases)").unwrap();
        assert!(selector_loop < phrase_loop);
    }

    #[test]
    fn document_script_tries_phrases_first() {
        let script = document_click_script();
        let selector_loop = script.find("for (const selector of selectors)").unwrap();
        let phrase_loop = script.find("for (const phrase of phrases)").unwrap();
        assert!(phrase_loop < selector_loop);
    }

    #[test]
    fn hide_script_clears_body_overflow() {
        let script = hide_script();
        assert!(script.contains("overflow"));
        assert!(script.contains("#didomi-host"));
    }
}
