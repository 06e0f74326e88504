use clap::Parser;
use pagewatch::{
    AppState, BrowserPool, CapturePipeline, CompareEngine, Config, Db, Scheduler, ScreenshotStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pagewatch")]
#[command(about = "Scheduled full-page screenshot capture worker")]
#[command(version)]
struct Cli {
    #[arg(long, help = "Browser pool size")]
    pool_size: Option<usize>,

    #[arg(long, help = "Database connection string")]
    database_url: Option<String>,

    #[arg(long, help = "Listen address for the worker HTTP surface")]
    listen: Option<String>,

    #[arg(long, help = "Root directory for screenshot files")]
    screenshots_root: Option<PathBuf>,

    #[arg(long, help = "Chrome executable path")]
    chrome_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let default_filter = if verbose { "pagewatch=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    setup_logging(args.verbose);

    info!("starting pagewatch v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env();
    if let Some(pool_size) = args.pool_size {
        config.pool_size = pool_size;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(root) = args.screenshots_root {
        config.screenshots_root = root;
    }
    if let Some(chrome_path) = args.chrome_path {
        config.chrome_path = Some(chrome_path);
    }
    config.validate()?;

    let db = Db::connect(&config.database_url).await?;
    db.ensure_schema().await?;
    info!("database ready at {}", config.database_url);

    let store = ScreenshotStore::new(&config.screenshots_root);
    store.init().await?;

    // The one startup-fatal condition: a worker without browsers has
    // nothing to do.
    let pool = Arc::new(BrowserPool::new(config.clone()).await?);

    let pipeline = Arc::new(CapturePipeline::new(
        db.clone(),
        store.clone(),
        config.clone(),
    ));
    let scheduler = Scheduler::new(db.clone(), pool.clone(), pipeline.clone(), config.clone());

    let state = AppState {
        db: db.clone(),
        pool: pool.clone(),
        config: config.clone(),
        generator: Arc::new(pagewatch::generator::ScriptGenerator::new(&config)),
        pipeline,
        compare: Arc::new(CompareEngine::new(db, store.clone())),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let capture_loop = {
        let scheduler = scheduler.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(rx).await })
    };
    let retention_loop = {
        let scheduler = scheduler.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run_retention(store, rx).await })
    };
    let http = tokio::spawn(pagewatch::server::serve(state, shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Periodic tasks first, then fail waiters and close browsers.
    // In-flight captures that lose their browser become stale jobs and
    // are reset on next startup.
    let _ = capture_loop.await;
    let _ = retention_loop.await;
    pool.shutdown().await;
    if let Ok(Err(e)) = http.await {
        error!("HTTP surface error during shutdown: {e}");
    }

    info!("pagewatch stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("failed to install SIGINT handler: {e}");
            return;
        }
    };
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
