//! Intercom: service registry, message broker and task orchestrator

use clap::{Parser, Subcommand};
use intercom_core::{BindMode, IntercomConfig};
use intercom_gateway::start_gateway;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "intercom",
    about = "Intercom: registry, broker and orchestrator for cooperating services"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway with registry, broker and orchestrator
    Serve {
        /// TOML config file (defaults apply when missing)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Overrides gateway.port
        #[arg(short, long)]
        port: Option<u16>,
        /// Overrides gateway.bind (lan or loopback)
        #[arg(short, long)]
        bind: Option<String>,
        /// Overrides orchestrator.snapshot_path
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Also write daily-rotated logs here
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Print the effective config as TOML
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve {
        config: None,
        port: None,
        bind: None,
        snapshot: None,
        log_dir: None,
    }) {
        Commands::Serve {
            config,
            port,
            bind,
            snapshot,
            log_dir,
        } => {
            let _guard = init_tracing(log_dir.as_deref());

            let mut config = load_config(config.as_deref());
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(bind) = bind {
                config.gateway.bind = BindMode::from_arg(&bind);
            }
            if snapshot.is_some() {
                config.orchestrator.snapshot_path = snapshot;
            }

            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, shutting down");
                }
                trigger.cancel();
            });

            start_gateway(config, shutdown).await?;
        }

        Commands::Config { config } => {
            print!("{}", load_config(config.as_deref()).to_toml()?);
        }

        Commands::Version => {
            println!("intercom v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> IntercomConfig {
    match path {
        Some(path) => IntercomConfig::load(path),
        None => IntercomConfig::default(),
    }
}

/// Console logging, plus a daily-rolling file when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "intercom.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intercom=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}
