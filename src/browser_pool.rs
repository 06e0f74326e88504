//! Browser pool management for concurrent Chrome instances
//!
//! A fixed set of headless browsers shared by every capture. Acquisition
//! is FIFO through a waiter queue; a browser whose CDP handler task has
//! ended is treated as disconnected and replaced in the background.

use chromiumoxide::browser::Browser;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};

use crate::config::{browser_config, Config};
use crate::WorkerError;

/// One pooled Chrome instance.
///
/// The handler task drains the CDP event stream; its termination is the
/// signal that the browser process disconnected.
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Browser,
    handler: tokio::task::JoinHandle<()>,
}

impl BrowserInstance {
    pub fn is_connected(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn close(mut self) {
        let _ = self.browser.close().await;
        self.handler.abort();
    }
}

/// A checked-out browser. Return it with [`BrowserPool::release`]; the
/// pool decides whether it goes back to the available set or gets
/// replaced.
pub struct BrowserHandle {
    instance: BrowserInstance,
}

impl BrowserHandle {
    pub fn browser(&self) -> &Browser {
        &self.instance.browser
    }

    pub fn instance_id(&self) -> usize {
        self.instance.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub waiting: usize,
}

struct PoolState {
    available: VecDeque<BrowserInstance>,
    waiters: VecDeque<oneshot::Sender<BrowserInstance>>,
    in_use: usize,
    live: usize,
    shutting_down: bool,
}

pub struct BrowserPool {
    state: Arc<Mutex<PoolState>>,
    config: Config,
    next_id: Arc<AtomicUsize>,
}

impl Clone for BrowserPool {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            config: self.config.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl BrowserPool {
    /// Launch the full pool. Failure of any launch is fatal: a worker
    /// that cannot run browsers has nothing to do.
    pub async fn new(config: Config) -> Result<Self, WorkerError> {
        let pool = Self {
            state: Arc::new(Mutex::new(PoolState {
                available: VecDeque::new(),
                waiters: VecDeque::new(),
                in_use: 0,
                live: 0,
                shutting_down: false,
            })),
            config: config.clone(),
            next_id: Arc::new(AtomicUsize::new(0)),
        };

        for i in 0..config.pool_size {
            // Stagger launches so concurrent Chrome startups don't race
            // on profile creation.
            if i > 0 {
                sleep(Duration::from_millis(500)).await;
            }
            let instance = pool.launch_instance().await.map_err(|e| {
                error!("failed to launch browser {i}: {e}");
                e
            })?;
            {
                let mut state = pool.state.lock().await;
                state.available.push_back(instance);
                state.live += 1;
            }
            info!("browser instance {i} launched");
        }

        info!("browser pool initialized with {} instances", config.pool_size);
        Ok(pool)
    }

    async fn launch_instance(&self) -> Result<BrowserInstance, WorkerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (browser, mut handler) = Browser::launch(browser_config(&self.config, id)?)
            .await
            .map_err(|e| WorkerError::BrowserLaunchFailed(e.to_string()))?;

        // Drain CDP events until the stream ends (browser gone) or
        // errors out.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("browser handler error: {e}");
                    break;
                }
            }
        });

        Ok(BrowserInstance {
            id,
            browser,
            handler: handler_task,
        })
    }

    /// Check a browser out, waiting FIFO behind earlier callers when none
    /// is free. Waiters give up after the configured acquire timeout.
    pub async fn acquire(&self) -> Result<BrowserHandle, WorkerError> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return Err(WorkerError::PoolClosed);
            }

            while let Some(instance) = state.available.pop_front() {
                if instance.is_connected() {
                    state.in_use += 1;
                    return Ok(BrowserHandle { instance });
                }
                warn!(
                    "browser instance {} disconnected, replacing",
                    instance.id
                );
                state.live -= 1;
                tokio::spawn(instance.close());
                self.spawn_replacement();
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        match timeout(self.config.acquire_timeout, rx).await {
            Ok(Ok(instance)) => Ok(BrowserHandle { instance }),
            Ok(Err(_)) => Err(WorkerError::PoolClosed),
            Err(_) => Err(WorkerError::AcquireTimeout(self.config.acquire_timeout)),
        }
    }

    /// Return a browser. A disconnected one is closed and replaced in the
    /// background; a healthy one goes to the first waiter, else back to
    /// the available set.
    pub async fn release(&self, handle: BrowserHandle) {
        let instance = handle.instance;
        let mut state = self.state.lock().await;
        state.in_use = state.in_use.saturating_sub(1);

        if state.shutting_down {
            state.live -= 1;
            tokio::spawn(instance.close());
            return;
        }

        if !instance.is_connected() {
            warn!("browser instance {} died while in use", instance.id);
            metrics::counter!("pagewatch_browser_respawns", 1);
            state.live -= 1;
            tokio::spawn(instance.close());
            self.spawn_replacement();
            return;
        }

        Self::hand_off(&mut state, instance);
    }

    /// Give an instance to the oldest live waiter, falling back to the
    /// available set. A waiter that timed out has dropped its receiver;
    /// its send fails and the instance moves on to the next waiter.
    fn hand_off(state: &mut PoolState, mut instance: BrowserInstance) {
        loop {
            match state.waiters.pop_front() {
                Some(tx) => {
                    state.in_use += 1;
                    match tx.send(instance) {
                        Ok(()) => return,
                        Err(returned) => {
                            state.in_use -= 1;
                            instance = returned;
                        }
                    }
                }
                None => {
                    state.available.push_back(instance);
                    return;
                }
            }
        }
    }

    fn spawn_replacement(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            match pool.launch_instance().await {
                Ok(instance) => {
                    let mut state = pool.state.lock().await;
                    if state.shutting_down {
                        drop(state);
                        instance.close().await;
                        return;
                    }
                    info!("replacement browser instance {} ready", instance.id);
                    state.live += 1;
                    Self::hand_off(&mut state, instance);
                }
                Err(e) => {
                    error!("failed to launch replacement browser: {e}");
                }
            }
        });
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            total: state.live,
            available: state.available.len(),
            in_use: state.in_use,
            waiting: state.waiters.len(),
        }
    }

    /// Fail all waiters and close every idle browser. Checked-out
    /// browsers are closed as they come back through `release`.
    pub async fn shutdown(&self) {
        info!("shutting down browser pool");
        let instances: Vec<BrowserInstance> = {
            let mut state = self.state.lock().await;
            state.shutting_down = true;
            state.waiters.clear();
            let drained: Vec<_> = state.available.drain(..).collect();
            state.live -= drained.len();
            drained
        };
        for instance in instances {
            instance.close().await;
        }
        info!("browser pool shutdown complete");
    }
}
