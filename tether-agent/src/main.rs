//! tether agent — entry point.
//!
//! ```text
//! tether-agent                        Connect using tether-agent.toml
//! tether-agent --address host:port    Override the server address
//! tether-agent --config <path>        Load a custom config TOML
//! tether-agent --gen-config           Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_agent::config::AgentConfig;
use tether_agent::service::AgentService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-agent", about = "tether remote-administration agent")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tether-agent.toml")]
    config: PathBuf,

    /// Server address (`host:port`); overrides the config file.
    #[arg(short, long)]
    address: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&AgentConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = AgentConfig::load(&cli.config)?;
    if let Some(address) = cli.address {
        config.network.server_address = address;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone())),
        )
        .init();

    info!(
        address = %config.network.server_address,
        "starting tether agent"
    );

    let service = AgentService::new(config);
    service.run().await;
    Ok(())
}
