use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stoatcord_channels::{Bridge, DiscordChannel, StoatChannel};
use stoatcord_core::{Direction, RelayLimits};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::BridgeConfig;

#[derive(Parser)]
#[command(name = "stoatcord")]
#[command(version)]
#[command(about = "Relay messages between paired Discord and Stoat channels")]
struct Cli {
    /// Path to a TOML config file (defaults to environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until Ctrl+C
    Start,

    /// Show the resolved configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug {
        "info,stoatcord=debug,stoatcord_core=debug,stoatcord_channels=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Ok(path) = dotenv {
        debug!("Loaded environment from {}", path.display());
    }

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
    }
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = BridgeConfig::load(config_path)?;
    println!("{:#?}", cfg);
    for (i, pair) in cfg.pair_table()?.pairs().iter().enumerate() {
        println!("Pair {}: Discord {} <-> Stoat {}", i + 1, pair.discord_id, pair.stoat_id);
    }
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = BridgeConfig::load(config_path)?;
    let pairs = Arc::new(cfg.pair_table()?);

    info!("Bridge starting with {} channel pair(s)...", pairs.len());
    for (i, pair) in pairs.pairs().iter().enumerate() {
        info!("  Pair {}: Discord {} <-> Stoat {}", i + 1, pair.discord_id, pair.stoat_id);
    }

    let discord = DiscordChannel::new(cfg.discord.token.clone(), cfg.discord.channel_ids.clone())
        .with_webhook_name(cfg.discord.webhook_name.clone());
    let stoat = StoatChannel::new(
        cfg.stoat.token.clone(),
        cfg.stoat.channel_ids.clone(),
        cfg.stoat.endpoints(),
    );

    let mut bridge = Bridge::new(pairs, cfg.relay.buffer_size)
        .with_limits(
            Direction::DiscordToStoat,
            RelayLimits::from(cfg.relay.discord_to_stoat),
        )
        .with_limits(
            Direction::StoatToDiscord,
            RelayLimits::from(cfg.relay.stoat_to_discord),
        );
    bridge.register(Box::new(discord));
    bridge.register(Box::new(stoat));

    let cancel = CancellationToken::new();
    let running = bridge.start(cancel.clone()).await?;

    println!("Bridge is running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    let stats = running
        .shutdown(Duration::from_secs(cfg.relay.shutdown_grace_secs))
        .await;
    info!(
        "Relayed {} message(s), dropped {}, failed {}",
        stats.forwarded, stats.dropped, stats.failed
    );

    info!("Bridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_start() {
        let cli = Cli::parse_from(["stoatcord"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from(["stoatcord", "config", "--config", "bridge.toml", "-d"]);
        assert!(matches!(cli.command, Some(Commands::Config)));
        assert_eq!(cli.config, Some(PathBuf::from("bridge.toml")));
        assert!(cli.debug);
    }
}
