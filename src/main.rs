//! serialbus - RFCOMM serial port sessions on a message bus
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use serialbus::cli::{Cli, Commands};
use serialbus::config::ConfigManager;
use serialbus::error::SerialBusResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> SerialBusResult<()> {
    let cli = Cli::parse();

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("serialbus=warn"),
        1 => EnvFilter::new("serialbus=info"),
        _ => EnvFilter::new("serialbus=debug"),
    };

    // stdout carries the daemon protocol, so logs go to stderr
    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }

    debug!("Using config at {}", config_manager.path().display());

    match cli.command {
        Commands::Serve(args) => serialbus::cli::commands::serve(args, &config).await,
        Commands::Interface(args) => serialbus::cli::commands::interface(args).await,
        Commands::Config(args) => {
            serialbus::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
