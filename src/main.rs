use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use futureproof::config::{AppConfig, CliOverrides};
use futureproof::telemetry;

mod cmd;

#[derive(Parser)]
#[command(name = "futureproof")]
#[command(version, about = "Repository analysis service with live progress over WebSocket")]
pub struct Cli {
    /// Path to a TOML config file (defaults to ./futureproof.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// SQLite database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS for a local frontend)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database schema and exit
    InitDb {
        /// SQLite database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Validate the effective configuration and print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::resolve(cli.config.as_deref())?;

    match &cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            config.apply_cli(&CliOverrides {
                host: host.clone(),
                port: *port,
                db_path: db_path.clone(),
                dev: *dev,
            });
            let _guard = telemetry::init(&config.log)?;
            cmd::cmd_serve(config).await?;
        }
        Commands::InitDb { db_path } => {
            config.apply_cli(&CliOverrides {
                db_path: db_path.clone(),
                ..Default::default()
            });
            let _guard = telemetry::init(&config.log)?;
            cmd::cmd_init_db(&config)?;
        }
        Commands::CheckConfig => {
            cmd::cmd_check_config(&config, cli.config.as_deref())?;
        }
    }

    Ok(())
}
