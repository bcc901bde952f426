//! trawler-worker - drains the scrape queue and serves the task wire.

mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trawler::config::Settings;
use trawler::crawl::CrawlCoordinator;
use trawler::queue;
use trawler::scrape::{BrowserClient, BrowserScraper};
use trawler::store::{RedisStateStore, StateStore};
use trawler::worker::{JobHandler, ProcSampler, ResourceMonitor, Worker};

#[derive(Parser)]
#[command(name = "trawler-worker", about = "Scrape worker: queue drain + task endpoint")]
struct Cli {
    /// Verbose logging (overridden by RUST_LOG).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker loops and the HTTP surface (default).
    Run {
        /// Concurrent poll loops in this process.
        #[arg(long, default_value_t = 1)]
        loops: usize,
        /// Listen address for /tasks/process and /health.
        #[arg(long, default_value = "0.0.0.0:3002")]
        listen: String,
    },
    /// Remove terminal jobs older than 24 hours, then exit.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "trawler=debug,trawler_worker=debug"
    } else {
        "trawler=info,trawler_worker=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(Settings::from_env());

    match cli.command {
        Some(Commands::Sweep) => sweep(&settings).await,
        Some(Commands::Run { loops, listen }) => run(settings, loops, &listen).await,
        None => run(settings, 1, "0.0.0.0:3002").await,
    }
}

async fn sweep(settings: &Settings) -> anyhow::Result<()> {
    let store = RedisStateStore::connect(settings)
        .await
        .context("state store connection")?;
    let cutoff = chrono::Utc::now() - chrono::Duration::hours(24);
    let removed = store.clean_terminal_jobs_before(cutoff).await?;
    info!(removed, "terminal job sweep finished");
    Ok(())
}

async fn run(settings: Arc<Settings>, loops: usize, listen: &str) -> anyhow::Result<()> {
    let store: Arc<dyn StateStore> = Arc::new(
        RedisStateStore::connect(&settings)
            .await
            .context("state store connection")?,
    );
    let queue = queue::from_settings(&settings, store.clone())
        .await
        .context("queue provider")?;
    let pipeline = Arc::new(BrowserScraper::new(BrowserClient::new(&settings)));
    let coordinator = Arc::new(CrawlCoordinator::new(store.clone(), queue.clone()));
    let handler = Arc::new(JobHandler::new(
        store.clone(),
        queue.clone(),
        pipeline,
        coordinator,
        settings.clone(),
    ));
    let monitor = Arc::new(ResourceMonitor::new(
        Arc::new(ProcSampler::new()),
        settings.worker.max_cpu,
        settings.worker.max_ram,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::with_capacity(loops);
    for _ in 0..loops.max(1) {
        let worker = Worker::new(
            handler.clone(),
            queue.clone(),
            monitor.clone(),
            settings.worker.clone(),
            shutdown_rx.clone(),
        );
        workers.push(tokio::spawn(worker.run()));
    }

    let state = server::AppState {
        handler: handler.clone(),
        queue: queue.clone(),
    };
    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(listen, loops, "worker up");

    let server_shutdown = shutdown_tx.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let mut rx = server_shutdown;
        let _ = rx.changed().await;
    });
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!(error = %e, "http server terminated");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    let grace = settings.worker.shutdown_grace + Duration::from_secs(5);
    for worker in workers {
        if tokio::time::timeout(grace, worker).await.is_err() {
            tracing::warn!("worker loop did not stop within the grace period");
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
    info!("worker shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => return ctrl_c.await.unwrap_or(()),
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
