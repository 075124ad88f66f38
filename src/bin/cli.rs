//! CLI for a running kvpipe server

use clap::{Parser, Subcommand};
use kvpipe::client::{ApiResponse, KvClient};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "kvpipe")]
#[command(about = "kvpipe key-value service CLI")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(long, default_value = "http://localhost:8000")]
    server: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "5")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a key
    Get {
        /// Key
        key: String,
    },

    /// Queue a write
    Put {
        /// Key
        key: String,

        /// Value
        value: String,
    },

    /// Queue a delete
    Delete {
        /// Key
        key: String,
    },

    /// Overall dependency health
    Health,

    /// Readiness verdict with per-component detail
    Ready,

    /// Cache occupancy
    Stats,
}

fn print(response: &ApiResponse) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&response.body)?);
    if !response.is_success() {
        anyhow::bail!("server answered {}", response.status);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = KvClient::new(&cli.server, Duration::from_secs(cli.timeout))?;

    let response = match cli.command {
        Commands::Get { key } => {
            let response = client.get(&key).await?;
            if response.is_success() {
                if let Some(value) = response.body["data"]["value"].as_str() {
                    println!("{}", value);
                    return Ok(());
                }
            }
            response
        }
        Commands::Put { key, value } => client.put(&key, &value).await?,
        Commands::Delete { key } => client.delete(&key).await?,
        Commands::Health => client.health().await?,
        Commands::Ready => client.ready().await?,
        Commands::Stats => client.cache_stats().await?,
    };

    print(&response)
}
