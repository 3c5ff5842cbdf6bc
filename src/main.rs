use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use tallyd::config::Config;
use tallyd::daemon::{self, output::Output, Daemon};
use tallyd::export::health::HealthMetrics;

/// Value metric aggregation daemon.
#[derive(Parser)]
#[command(name = "tallyd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Defaults to the config file's log_level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("tallyd {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    // Logs go to stderr; stdout may carry the output stream.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        metrics = cfg.metrics.len(),
        "starting tallyd",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let ctx = CancellationToken::new();

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        signal_ctx.cancel();
    });

    let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    let daemon = Daemon::new(&cfg, Arc::clone(&health))?;

    if cfg.health.enabled {
        health.start(daemon.registry(), daemon.clock()).await?;
    }

    let input = daemon::open_input(&cfg.input.path).await?;
    let output = Output::open(&cfg.output.path).await?;

    let result = daemon.run(input, output, ctx).await;

    health.stop();
    tracing::info!("tallyd stopped");

    result
}
