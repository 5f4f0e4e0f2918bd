//! Resilient MQTT device agent - main entry point

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tetherd::app::App;
use tetherd::config::Settings;
use tetherd::logging::{init_default_logging_with_level, parse_level};
use tracing::{error, info};

/// Resilient MQTT agent for long-running devices
#[derive(Parser)]
#[command(name = "tetherd")]
#[command(about = "Resilient MQTT agent for long-running devices")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging_with_level(cli.log_level.as_deref().map(parse_level));

    info!("Starting tetherd v{}", env!("CARGO_PKG_VERSION"));

    let settings = match load_configuration(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(settings).await,
        Commands::Config { show } => handle_config_command(settings, show),
    };

    if let Err(e) = result {
        error!("Command failed: {e}");
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<Settings, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(Settings::load_from_file(path)?)
        }
        None => {
            // Try default locations
            let default_paths = vec!["tetherd.toml", "config/tetherd.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(Settings::load_from_file(&path)?);
                }
            }

            error!(
                "No configuration file found. Please provide one with -c/--config or create tetherd.toml"
            );
            process::exit(1);
        }
    }
}

async fn run_agent(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    info!("Agent starting with device ID: {}", settings.mqtt.device_id);

    let app = App::new(settings).await?;
    app.run().await?;

    Ok(())
}

fn handle_config_command(settings: Settings, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&settings)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
