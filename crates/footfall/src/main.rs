//! Footfall launcher
//!
//! One binary for the operational tasks:
//! - **run-etl**: incremental load from the source database into DuckDB
//! - **init-db**: (re)create the normalized traffic view
//! - **serve**: the read-only analytics API
//! - **config**: print the resolved configuration

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::ExitCode;

use footfall_config::Settings;
use footfall_logging::{init_logging, LogConfig};

mod cli;

#[derive(Parser, Debug)]
#[command(name = "footfall", version, about = "People-counting ETL and analytics API")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ETL once for every configured table
    RunEtl {
        /// Concurrent table pipelines (default: ETL_MAX_WORKERS)
        #[arg(long)]
        max_workers: Option<usize>,

        /// Clear the query service cache after a run with changes (default)
        #[arg(long, overrides_with = "no_clear_cache")]
        clear_cache: bool,

        /// Leave the query service cache alone
        #[arg(long, overrides_with = "clear_cache")]
        no_clear_cache: bool,

        /// Query service host to notify (default: API_HOST)
        #[arg(long)]
        api_host: Option<String>,

        /// Query service port to notify (default: API_PORT)
        #[arg(long)]
        api_port: Option<u16>,
    },

    /// Create missing base tables and (re)create v_traffic_normalized
    InitDb,

    /// Start the analytics API
    Serve {
        /// Bind address (default: API_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (default: API_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Accepted for compatibility; restart the process to pick up changes
        #[arg(long)]
        reload: bool,
    },

    /// Show the resolved configuration (secrets redacted)
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn app_name(command: &Commands) -> &'static str {
    match command {
        Commands::RunEtl { .. } => "etl",
        Commands::InitDb => "init-db",
        Commands::Serve { .. } => "api",
        Commands::Config { .. } => "config",
    }
}

/// Ok(false) means the command ran but did not fully succeed.
fn run_command(command: Commands, settings: Settings) -> Result<bool> {
    match command {
        Commands::RunEtl {
            max_workers,
            clear_cache: _,
            no_clear_cache,
            api_host,
            api_port,
        } => cli::run_etl::run(
            settings,
            cli::run_etl::RunEtlArgs {
                max_workers,
                clear_cache: !no_clear_cache,
                api_host,
                api_port,
            },
        ),
        Commands::InitDb => cli::init_db::run(&settings).map(|()| true),
        Commands::Serve { host, port, reload } => {
            cli::serve::run(settings, cli::serve::ServeArgs { host, port, reload }).map(|()| true)
        }
        Commands::Config { json } => cli::config::run(&settings, json).map(|()| true),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{}", cli::error::HelpfulError::config_invalid(&err));
            return ExitCode::from(2);
        }
    };

    let app = app_name(&cli.command);
    if let Err(err) = init_logging(LogConfig {
        app_name: app,
        verbose: cli.verbose,
        log_dir: settings.log_dir.clone(),
    }) {
        eprintln!("Warning: logging not initialized: {:#}", err);
    }

    match run_command(cli.command, settings) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            tracing::error!("{} failed: {:#}", app, err);
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn clear_cache_flags_override_each_other() {
        let cli = Cli::try_parse_from(["footfall", "run-etl", "--clear-cache", "--no-clear-cache"])
            .unwrap();
        match cli.command {
            Commands::RunEtl { no_clear_cache, .. } => assert!(no_clear_cache),
            other => panic!("unexpected {:?}", other),
        }

        let cli = Cli::try_parse_from(["footfall", "run-etl", "--no-clear-cache", "--clear-cache"])
            .unwrap();
        match cli.command {
            Commands::RunEtl { no_clear_cache, .. } => assert!(!no_clear_cache),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn serve_options_parse() {
        let cli =
            Cli::try_parse_from(["footfall", "-v", "serve", "--port", "9000", "--reload"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Serve { host, port, reload } => {
                assert_eq!(host, None);
                assert_eq!(port, Some(9000));
                assert!(reload);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
