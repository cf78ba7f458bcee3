//! Thin entry point: select a config file and verbosity, build the
//! `Runtime`, run the worker pool until a termination signal.
//! No sub-command tree — cluster administration is an explicit Non-goal.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use reposrv::pool::Pool;
use reposrv::{Config, Runtime};

#[derive(Parser)]
#[command(name = "reposrv")]
#[command(about = "chunked file-repository backend over a pub/sub message bus")]
#[command(version)]
struct Cli {
    /// Configuration file path; compiled-in defaults are used if omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config(&cli)?;
    info!(workers = config.workers.count, "starting");

    let runtime = Runtime::connect(config).await?;
    let pool = Pool::start(runtime).await?;

    let dying = CancellationToken::new();
    wait_for_shutdown_signal(dying.clone()).await;
    pool.run_until_shutdown(dying).await;

    info!("drained, exiting");
    Ok(())
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("reposrv={level}"))
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    match &cli.config {
        Some(path) => Ok(Config::from_file(path)?),
        None => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Wait for SIGINT, SIGTERM, or SIGQUIT and cancel `dying`.
async fn wait_for_shutdown_signal(dying: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigquit = signal(SignalKind::quit()).expect("install SIGQUIT handler");
        tokio::select! {
            _ = sigint.recv() => info!(signal = "SIGINT", "shutdown requested"),
            _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown requested"),
            _ = sigquit.recv() => info!(signal = "SIGQUIT", "shutdown requested"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!(signal = "ctrl_c", "shutdown requested");
    }
    dying.cancel();
}
