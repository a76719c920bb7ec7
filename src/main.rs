mod config;
mod dedup;
mod error;
mod normalize;
mod pipeline;
mod platform;
mod sink;
mod source;
mod supervisor;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dedup::DedupStore;
use crate::normalize::Normalizer;
use crate::pipeline::Pipeline;
use crate::sink::JsonLinesSink;
use crate::source::command::CommandSource;
use crate::source::SessionRequest;
use crate::supervisor::Supervisor;

const DEFAULT_CONFIG_PATH: &str = "chatrelay.toml";
const DEFAULT_LOG_FILTER: &str = "info,chatrelay=debug";

#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(author, version, about = "Relay live chat as deduplicated, normalized JSON lines")]
struct Cli {
    /// Channel or live video URL
    url: String,

    /// Config file (defaults to ./chatrelay.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after emitting this many messages
    #[arg(short = 'n', long)]
    max_messages: Option<u64>,

    /// Message category to request; repeat for several
    #[arg(long = "category")]
    categories: Vec<String>,

    /// Seconds without a message before the session is reopened
    #[arg(long)]
    inactivity_timeout: Option<f64>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let explicit = cli.config.is_some();
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    info!("Loading configuration from: {}", path.display());
    let mut config = Config::load_or_default(&path, explicit)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if !cli.categories.is_empty() {
        config.source.categories = cli.categories.clone();
    }
    if let Some(timeout) = cli.inactivity_timeout {
        config.source.inactivity_timeout_secs = timeout;
    }
    config.validate().context("Invalid command line override")?;

    Ok(config)
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Diagnostics go to stderr; stdout carries only chat records.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!("Configuration loaded successfully");
    info!("  Channel: {}", cli.url);
    info!("  Categories: {:?}", config.source.categories);
    info!("  Fetcher: {} {:?}", config.source.command, config.source.args);
    info!("  Inactivity timeout: {:?}", config.source.inactivity_timeout());
    info!("  Dedup ttl: {}s", config.dedup.ttl_secs);
    if let Some(max) = cli.max_messages {
        info!("  Max messages: {}", max);
    }

    let request = SessionRequest {
        url: cli.url.clone(),
        categories: config.source.categories.clone(),
        inactivity_timeout: config.source.inactivity_timeout(),
    };
    let supervisor = Supervisor::new(
        CommandSource::new(&config.source),
        request,
        config.source.reconnect_policy(),
    );
    let sink = JsonLinesSink::new(tokio::io::stdout(), config.sink.write_timeout());

    let mut pipeline = Pipeline::new(
        supervisor,
        DedupStore::new(config.dedup.ttl()),
        Normalizer::new(&config.normalizer),
        sink,
    )
    .with_max_messages(cli.max_messages)
    .with_message_types(config.normalizer.message_types.clone());

    info!("Relay is starting...");
    match pipeline.run(shutdown_signal()).await {
        Ok(summary) => {
            info!(
                "Relay stopped ({:?}): {} sessions, {} received, {} emitted, {} duplicates, {} malformed, {} filtered",
                pipeline.state(),
                summary.sessions,
                summary.received,
                summary.emitted,
                summary.duplicates,
                summary.malformed,
                summary.filtered
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let code = e.exit_code();
            error!("Relay failed: {:#}", anyhow::Error::new(e));
            Ok(ExitCode::from(code))
        }
    }
}
