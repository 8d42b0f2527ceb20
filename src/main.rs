//! CLI entry point for the P2P chat node.
//!
//! Runs a node until Ctrl-C, or manages its configuration file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use p2p_chat_node::{
    utils::{NodeConfig, DEFAULT_CONFIG_FILE},
    App,
};
use std::path::PathBuf;
use tokio::signal;

/// P2P chat node - peer-to-peer text messaging over TCP
#[derive(Parser)]
#[command(name = "p2p-node")]
#[command(about = "A peer-to-peer chat node with framed TCP sessions")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for the peer list
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Run {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Peers to dial on startup (host:port)
        #[arg(long = "connect", value_name = "HOST:PORT")]
        connect: Vec<String>,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = NodeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    match cli.command {
        Commands::Run { port, connect } => run_node(config, port, connect).await,
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

async fn run_node(mut config: NodeConfig, port: Option<u16>, connect: Vec<String>) -> Result<()> {
    config.network.bootstrap_peers.extend(connect);
    config.validate()?;

    let mut app = App::new(config)?;
    let mut events = app
        .take_events()
        .context("Event channel already taken")?;

    info!("Starting P2P chat node");
    info!("Peer ID: {}", app.local_peer().id);
    let local_addr = app.start(port).await?;
    println!("Listening on {local_addr} as {}", app.local_peer().id);

    let shutdown_signal = signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            result = &mut shutdown_signal => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Some(event) => app.handle_event(&event),
                None => break,
            },
        }
    }

    let stats = app.stats();
    app.shutdown()?;
    info!(
        "Node stopped ({} known peers, {} were connected)",
        stats.known_peers, stats.connected_peers
    );
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &NodeConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            NodeConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = match file {
                Some(path) => NodeConfig::from_file(path)?,
                None => config.clone(),
            };
            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "p2p-node",
            "-vv",
            "run",
            "--port",
            "9000",
            "--connect",
            "localhost:8080",
            "--connect",
            "10.0.0.2:8081",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run { port, connect } => {
                assert_eq!(port, Some(9000));
                assert_eq!(connect, vec!["localhost:8080", "10.0.0.2:8081"]);
            }
            Commands::Config { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parses_config_generate() {
        let cli = Cli::try_parse_from(["p2p-node", "config", "generate", "-o", "node.toml"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigCommands::Generate { output: Some(_) }
            }
        ));
    }
}
