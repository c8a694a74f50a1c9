mod config;
mod daemon_client;
mod error;
mod metadata;
mod orchestrator;
mod rpc;
mod store;
mod store_backends;
mod uploads;
mod web_server;

#[cfg(test)]
mod testing;

use crate::config::AppConfig;
use crate::daemon_client::DaemonClient;
use crate::orchestrator::{IndexOrchestrator, MatchLimits};
use crate::rpc::transport::HttpTransport;
use crate::store::MetadataStore;
use crate::store_backends::{memory::MemoryMetadataStore, sqlite::SqliteMetadataStore};
use crate::uploads::{UploadRules, UploadStorage};
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "isk-gateway", about = "HTTP gateway in front of an isk-daemon similarity index")]
struct Cli {
    /// Directory holding default.toml and the optional RUN_MODE/local layers
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway (default)
    Serve,
    /// Check the daemon and print the image count
    Health,
    /// Create the configured database on the daemon
    Init,
    /// Empty the daemon database and the metadata store
    Reset,
    /// List the daemon's XML-RPC methods
    Methods,
}

fn build_orchestrator(config: &AppConfig) -> Result<IndexOrchestrator> {
    let transport = HttpTransport::new(config.daemon_endpoint()?, config.daemon_timeout())?;
    let daemon = DaemonClient::new(Arc::new(transport), config.daemon_db_id);

    let store: Arc<dyn MetadataStore> = match config.metadata_engine.as_str() {
        "sqlite" => Arc::new(SqliteMetadataStore::open(&config.sqlite_path)?),
        "memory" => Arc::new(MemoryMetadataStore::new()),
        other => bail!("unknown metadata_engine '{}', expected sqlite or memory", other),
    };

    Ok(IndexOrchestrator::new(
        daemon,
        store,
        UploadStorage::from_config(config),
        UploadRules::from_config(config),
        MatchLimits {
            default_count: config.default_match_count,
            max_count: config.max_match_count,
        },
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_dir(&cli.config_dir)?;

    env_logger::Builder::new()
        .filter_level(config.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    let orchestrator = build_orchestrator(&config)?;
    info!(
        "Using isk-daemon at {} (database {})",
        config.daemon_endpoint()?,
        config.daemon_db_id
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!("Starting isk-gateway");
            if let Err(e) = web_server::start_web_server(Arc::new(config), Arc::new(orchestrator)).await {
                log::error!("Web server error: {}", e);
            }
            info!("isk-gateway finished");
        }
        Command::Health => print_json(&orchestrator.health().await?)?,
        Command::Init => print_json(&orchestrator.init().await?)?,
        Command::Reset => print_json(&orchestrator.reset().await?)?,
        Command::Methods => print_json(&orchestrator.remote_methods().await?)?,
    }

    Ok(())
}
