mod archive;
mod config;
mod credentials;
mod event;
mod git;
mod health;
mod http;
mod metrics;
mod pipeline;
mod storage;
mod target;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::pipeline::Uploader;
use crate::storage::S3ObjectStore;

const DEFAULT_CONFIG_PATH: &str = "/etc/git-motel/config.yaml";

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "git-motel",
    about = "Publish archives uploaded to object storage as force-pushed git branches"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process one notification payload and print the JSON report.
    Handle {
        /// File holding the payload, or `-` for stdin.
        #[arg(short, long, default_value = "-")]
        event: String,

        /// Stop before pushing, whatever the payload's `dryRun` says.
        #[arg(long)]
        dry_run: bool,

        /// Skip the remaining records after the first failure.
        #[arg(long)]
        fail_fast: bool,
    },
    /// Receive notification payloads over HTTP.
    Serve {
        /// Overrides `http_listen` from the configuration file.
        #[arg(long)]
        listen: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub uploader: Arc<Uploader>,
    pub metrics: MetricsRegistry,
}

async fn build_state(config: Config) -> Result<AppState> {
    let config = Arc::new(config);

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("failed to create work dir: {}", config.work_dir.display()))?;

    let client = storage::build_s3_client(&config.s3).await?;
    let metrics = MetricsRegistry::new();
    let uploader = Uploader::new(
        Arc::new(S3ObjectStore::new(client)),
        Arc::clone(&config),
        metrics.clone(),
    );

    Ok(AppState {
        config,
        uploader: Arc::new(uploader),
        metrics,
    })
}

// ---------------------------------------------------------------------------
// One-shot handler
// ---------------------------------------------------------------------------

async fn read_payload(source: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if source == "-" {
        tokio::io::stdin()
            .read_to_end(&mut buf)
            .await
            .context("failed to read payload from stdin")?;
    } else {
        buf = tokio::fs::read(source)
            .await
            .with_context(|| format!("failed to read payload file: {source}"))?;
    }
    Ok(buf)
}

/// Returns whether every record succeeded.
async fn run_handle(state: AppState, source: &str, force_dry_run: bool) -> Result<bool> {
    let payload = read_payload(source).await?;
    let mut invocation = event::parse_invocation(&payload)?;
    invocation.dry_run |= force_dry_run;

    let report = state.uploader.handle_invocation(&invocation).await;

    let json = serde_json::to_string_pretty(&report).context("failed to serialise report")?;
    println!("{json}");

    Ok(report.is_success())
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, listen: &str) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state));

    let listen_addr: std::net::SocketAddr = listen.parse().context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    // Logs go to stderr; stdout carries the `handle` report.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    // ---- Config ----
    let is_default_path = cli.config.as_os_str() == DEFAULT_CONFIG_PATH;
    let mut config = config::load_config_or_default(&cli.config, is_default_path)?;

    tracing::info!(config_path = %cli.config.display(), "starting git-motel");

    match cli.command {
        Command::Handle {
            event,
            dry_run,
            fail_fast,
        } => {
            config.fail_fast |= fail_fast;
            let state = build_state(config).await?;
            if !run_handle(state, &event, dry_run).await? {
                std::process::exit(1);
            }
        }
        Command::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.http_listen.clone());
            let state = build_state(config).await?;
            run_http_server(state, &listen).await?;
            tracing::info!("git-motel shut down cleanly");
        }
    }

    Ok(())
}
