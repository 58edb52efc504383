// bluelink — command-line host for the link subsystem
//
// Reads JSON requests on stdin and answers with JSON records on stdout,
// against a real adapter or the in-memory loopback radio.

mod btle;
mod config;
mod session;

use anyhow::Result;
use bluelink_core::{Dispatcher, LoopbackRadio, RadioBridge, Request, Response};
use clap::{Parser, Subcommand};
use colored::*;
use config::Backend;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bluelink")]
#[command(about = "Bluetooth proximity scanning and link management", long_about = None)]
#[command(version)]
struct Cli {
    /// Radio backend (overrides the config file)
    #[arg(long, value_enum, global = true)]
    backend: Option<Backend>,

    /// Scan window in seconds (overrides the config file)
    #[arg(long, global = true)]
    scan_window: Option<u64>,

    /// Pause between flood rounds in milliseconds (overrides the config file)
    #[arg(long, global = true)]
    flood_pause: Option<u64>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON requests from stdin until EOF (default)
    Session,
    /// Run one full scan window and print what was found
    Scan,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let overrides = cli.overrides();
    match cli.command {
        Some(Commands::Config { action }) => cmd_config(action),
        Some(Commands::Scan) => {
            let dispatcher = build_dispatcher(&overrides).await?;
            cmd_scan(&dispatcher).await
        }
        Some(Commands::Session) | None => {
            let dispatcher = build_dispatcher(&overrides).await?;
            session::run(&dispatcher).await
        }
    }
}

struct Overrides {
    backend: Option<Backend>,
    scan_window: Option<u64>,
    flood_pause: Option<u64>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            backend: self.backend,
            scan_window: self.scan_window,
            flood_pause: self.flood_pause,
        }
    }
}

async fn build_dispatcher(overrides: &Overrides) -> Result<Dispatcher> {
    let config = config::Config::load()?;

    let mut link = config.link.clone();
    if let Some(secs) = overrides.scan_window {
        link = link.with_scan_window(secs);
    }
    if let Some(ms) = overrides.flood_pause {
        link = link.with_flood_pause(ms);
    }
    link.validate()?;

    let backend = overrides.backend.unwrap_or(config.backend);
    let bridge: Arc<dyn RadioBridge> = match backend {
        Backend::Btle => Arc::new(btle::BtleRadio::first_adapter().await?),
        Backend::Loopback => Arc::new(LoopbackRadio::new()),
    };
    tracing::info!("Radio backend: {}", backend);

    Ok(Dispatcher::new(bridge, link))
}

async fn cmd_scan(dispatcher: &Dispatcher) -> Result<()> {
    let started = dispatcher.handle(Request::Scan).await;
    if let Response::Error { error } = started {
        anyhow::bail!("Scan failed: {}", error);
    }

    let window = dispatcher.config().scan_window();
    eprintln!(
        "{} Scanning for {}s...",
        "•".bright_cyan(),
        window.as_secs()
    );
    tokio::time::sleep(window).await;

    let harvested = dispatcher.handle(Request::Scan).await;
    println!("{}", serde_json::to_string_pretty(&harvested)?);
    dispatcher.shutdown().await;
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
