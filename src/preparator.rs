//! Page preparation
//!
//! Brings a browser page into the canonical pre-capture state: viewport
//! applied, URL loaded to network-idle, initial render settled, consent
//! overlays dismissed. Every capture and every ad-hoc validation runs
//! through this same pipeline so inspection sees what capture sees.

use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::Page;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::debug;

use crate::config::TagDimensions;
use crate::consent;
use crate::models::ViewportTag;
use crate::WorkerError;

/// Network-idle settling: this many consecutive windows with at most
/// [`IDLE_MAX_INFLIGHT`] in-flight requests.
const IDLE_WINDOW: Duration = Duration::from_millis(500);
const IDLE_WINDOWS_REQUIRED: u32 = 2;
const IDLE_MAX_INFLIGHT: i64 = 2;

/// A viewport requested by named tag or by explicit dimensions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ViewportSpec {
    Tag(ViewportTag),
    Literal { width: u32, height: u32 },
}

impl ViewportSpec {
    pub fn dimensions(&self, dims: &TagDimensions) -> (u32, u32) {
        match self {
            ViewportSpec::Tag(tag) => tag.dimensions(dims),
            ViewportSpec::Literal { width, height } => (*width, *height),
        }
    }
}

impl Default for ViewportSpec {
    fn default() -> Self {
        ViewportSpec::Tag(ViewportTag::Desktop)
    }
}

pub async fn set_viewport(page: &Page, width: u32, height: u32) -> Result<(), WorkerError> {
    let params = SetDeviceMetricsOverrideParams::builder()
        .width(width as i64)
        .height(height as i64)
        .device_scale_factor(1.0)
        .mobile(width <= 480)
        .build()
        .map_err(WorkerError::BrowserError)?;
    page.execute(params).await?;
    Ok(())
}

/// Prepare `page` for inspection or capture. Returns whether consent
/// dismissal clicked anything (informational).
pub async fn prepare(
    page: &Page,
    url: &str,
    viewport: ViewportSpec,
    op_timeout: Duration,
    dims: &TagDimensions,
) -> Result<bool, WorkerError> {
    let (width, height) = viewport.dimensions(dims);
    set_viewport(page, width, height).await?;

    navigate_network_idle(page, url, op_timeout).await?;

    // Initial render settle.
    sleep(Duration::from_secs(1)).await;

    let mut clicked = consent::dismiss(page).await;
    // Some dialogs mount late; give them a beat and try once more.
    sleep(Duration::from_secs(1)).await;
    clicked |= consent::dismiss(page).await;
    sleep(Duration::from_millis(500)).await;

    Ok(clicked)
}

/// Navigate and wait until the network settles: two consecutive 500 ms
/// windows with ≤2 in-flight requests, bounded by `op_timeout` overall.
/// Navigation failure is fatal; failure to settle is not.
pub async fn navigate_network_idle(
    page: &Page,
    url: &str,
    op_timeout: Duration,
) -> Result<(), WorkerError> {
    let inflight = Arc::new(AtomicI64::new(0));
    let counter = spawn_inflight_counter(page, inflight.clone()).await?;

    let started = Instant::now();
    let result = async {
        timeout(op_timeout, page.goto(url))
            .await
            .map_err(|_| WorkerError::Timeout(op_timeout))?
            .map_err(|e| WorkerError::NavigationFailed(e.to_string()))?;
        timeout(op_timeout.saturating_sub(started.elapsed()), page.wait_for_navigation())
            .await
            .map_err(|_| WorkerError::Timeout(op_timeout))?
            .map_err(|e| WorkerError::NavigationFailed(e.to_string()))?;
        Ok::<(), WorkerError>(())
    }
    .await;

    if let Err(e) = result {
        counter.abort();
        return Err(e);
    }

    let mut quiet_windows = 0;
    while quiet_windows < IDLE_WINDOWS_REQUIRED {
        if started.elapsed() >= op_timeout {
            debug!("network did not settle for {url} within {op_timeout:?}, continuing");
            break;
        }
        sleep(IDLE_WINDOW).await;
        if inflight.load(Ordering::Relaxed) <= IDLE_MAX_INFLIGHT {
            quiet_windows += 1;
        } else {
            quiet_windows = 0;
        }
    }

    counter.abort();
    Ok(())
}

/// Track in-flight request count from CDP network events. Subscriptions
/// are set up before navigation so nothing is missed.
async fn spawn_inflight_counter(
    page: &Page,
    inflight: Arc<AtomicI64>,
) -> Result<tokio::task::JoinHandle<()>, WorkerError> {
    let mut started = page.event_listener::<EventRequestWillBeSent>().await?;
    let mut finished = page.event_listener::<EventLoadingFinished>().await?;
    let mut failed = page.event_listener::<EventLoadingFailed>().await?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                event = started.next() => match event {
                    Some(_) => { inflight.fetch_add(1, Ordering::Relaxed); }
                    None => break,
                },
                event = finished.next() => match event {
                    Some(_) => { inflight.fetch_sub(1, Ordering::Relaxed); }
                    None => break,
                },
                event = failed.next() => match event {
                    Some(_) => { inflight.fetch_sub(1, Ordering::Relaxed); }
                    None => break,
                },
            }
        }
    }))
}
