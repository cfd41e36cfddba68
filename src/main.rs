pub mod analytics;
pub mod cluster;
pub mod config;
pub mod data;
pub mod elevation;
pub mod interaction;
pub mod popup;
pub mod projection;
pub mod report;
pub mod server;
pub mod style;
pub mod types;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the interactive ward map
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Write a CSV summary of every ward
    Report {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long, value_name = "FILE", default_value = "ward_report.csv")]
        output: PathBuf,
    },
    /// Print the map style the client would receive
    Layers {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        pretty: bool,
    },
}

fn load_config(path: &Path) -> anyhow::Result<config::AppConfig> {
    let mut app_config = config::AppConfig::load_from_file(path)?;
    app_config.apply_env()?;
    Ok(app_config)
}

/// Style JSON for the datasets that actually load. Loading runs off the runtime threads.
async fn render_layers(app_config: config::AppConfig, pretty: bool) -> anyhow::Result<String> {
    let progress = data::LoadProgress::for_config(&app_config);
    let (catalog, app_config) = tokio::task::spawn_blocking(move || {
        let catalog = data::load_catalog(&app_config, &progress);
        (catalog, app_config)
    })
    .await?;
    let style = style::build_style(&app_config, &catalog.availability());
    let json = if pretty {
        serde_json::to_string_pretty(&style)?
    } else {
        serde_json::to_string(&style)?
    };
    Ok(json)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { config } => {
            tracing::info!("Serving map with config: {:?}", config);
            let app_config = load_config(config)?;
            server::start_server(app_config).await?;
        }
        Commands::Report { config, output } => {
            let app_config = load_config(config)?;
            let progress = data::LoadProgress::for_config(&app_config);
            let catalog = tokio::task::spawn_blocking(move || data::load_catalog(&app_config, &progress)).await?;
            report::generate_report(&catalog, output)?;
        }
        Commands::Layers { config, pretty } => {
            let app_config = load_config(config)?;
            println!("{}", render_layers(app_config, *pretty).await?);
        }
    }

    Ok(())
}
