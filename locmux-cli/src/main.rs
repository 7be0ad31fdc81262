//! locmux CLI - command-line harness for the location multiplexer.
//!
//! The CLI is organized into:
//! - `Cli` / `Commands`: argument parsing (clap)
//! - `run`: the simulated provider session
//! - `CliError`: centralized error handling with user-friendly messages
//!
//! Settings are loaded from `~/.locmux/config.ini` on startup; CLI
//! arguments override config file values when specified.

mod error;
mod run;

use clap::{Parser, Subcommand};
use error::CliError;
use locmux::config::Config;
use run::RunOptions;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "locmux")]
#[command(version = locmux::VERSION)]
#[command(about = "Location provider multiplexer harness", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the configuration file with defaults
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Config,

    /// Run a simulated provider session until ctrl-c
    Run {
        /// Provider name to front (overrides the config file)
        #[arg(long)]
        provider: Option<String>,

        /// Interval between synthetic fixes, in milliseconds
        #[arg(long, default_value_t = 1_000)]
        fix_interval_ms: u64,

        /// Interval the demo client requests, in milliseconds
        #[arg(long, default_value_t = 2_000)]
        request_interval_ms: u64,

        /// Stop after this many fixes (0 runs until ctrl-c)
        #[arg(long, default_value_t = 0)]
        count: u64,

        /// Give the demo client coarse permission only
        #[arg(long)]
        coarse: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config_path = cli.config.unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Init { force } => {
            if config_path.exists() && !force {
                return Err(CliError::Usage(format!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                )));
            }
            Config::default().save(&config_path)?;
            println!("wrote {}", config_path.display());
            Ok(())
        }

        Commands::Config => {
            let config = Config::load(&config_path)?;
            println!("provider = {}", config.provider);
            println!("coarse_accuracy_m = {}", config.coarse_accuracy_m);
            println!(
                "background_throttle_interval_ms = {}",
                config.background_throttle_interval_ms
            );
            println!("event_log_capacity = {}", config.event_log_capacity);
            Ok(())
        }

        Commands::Run {
            provider,
            fix_interval_ms,
            request_interval_ms,
            count,
            coarse,
        } => {
            let _guard = locmux::logging::init_logging(std::path::Path::new("logs"))?;
            let mut config = Config::load(&config_path)?;
            if let Some(provider) = provider {
                config.provider = provider;
            }
            run::run(
                config,
                RunOptions {
                    fix_interval_ms,
                    request_interval_ms,
                    count,
                    coarse,
                },
            )
            .await
        }
    }
}
