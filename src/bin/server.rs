//! kvpipe server binary

use clap::{Parser, Subcommand};
use kvpipe::{Config, Server};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvpipe-server")]
#[command(about = "kvpipe cache-aside key-value service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API, apply worker and health prober
    Serve {
        /// TOML config file (defaults to ./kvpipe.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Node ID used in logs
        #[arg(long)]
        id: Option<String>,

        /// Accept writes without applying them; they stay in the journal
        /// until the server restarts with workers
        #[arg(long)]
        no_worker: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            id,
            no_worker,
        } => {
            // file and environment first, CLI flags have priority
            let mut config = Config::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.http.bind_addr = bind;
            }
            if let Some(id) = id {
                config.node_id = id;
            }
            if no_worker {
                config.worker.enabled = false;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.as_str().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            Server::new(config).serve().await?;
        }
    }

    Ok(())
}
