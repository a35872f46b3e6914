//! covend - workflow orchestration daemon.
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use covend::{Daemon, DaemonPaths};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Workspace-local workflow orchestration daemon.
#[derive(Parser)]
#[command(name = "covend")]
#[command(about = "Drives grimoire workflows against workspace tasks")]
#[command(version)]
struct Cli {
    /// Workspace root (must be a git repository).
    #[arg(default_value = ".")]
    workspace: PathBuf,

    /// Override the agent binary.
    #[arg(long, env = "COVEN_AGENT_BIN")]
    agent_bin: Option<PathBuf>,

    /// Log to stderr instead of .coven/covend.log.
    #[arg(long)]
    log_stderr: bool,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_stderr {
        fmt().with_env_filter(filter).init();
        return;
    }
    let paths = DaemonPaths::new(&cli.workspace);
    let _ = std::fs::create_dir_all(&paths.state_dir);
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_path)
    {
        Ok(file) => fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init(),
        Err(_) => fmt().with_env_filter(filter).init(),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(cli.workspace.clone(), cli.agent_bin.clone()).await {
            Ok(daemon) => {
                // Signals cancel the root token; run() drains and exits.
                let token = daemon.shutdown_token();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("received SIGINT");
                        token.cancel();
                    }
                });

                if let Err(e) = daemon.run().await {
                    error!("daemon error: {}", e);
                    std::process::exit(1);
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                eprintln!("covend: {e}");
                std::process::exit(1);
            }
        }
    });
}
