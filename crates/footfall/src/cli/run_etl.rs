//! `footfall run-etl`

use anyhow::{Context, Result};
use std::sync::Arc;

use footfall_config::Settings;
use footfall_etl::{Orchestrator, RunOptions};

use crate::cli::error::HelpfulError;

#[derive(Debug, Clone)]
pub struct RunEtlArgs {
    pub max_workers: Option<usize>,
    pub clear_cache: bool,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
}

impl RunEtlArgs {
    fn options(&self, settings: &Settings) -> RunOptions {
        let defaults = RunOptions::from_settings(settings);
        RunOptions {
            max_workers: self.max_workers.unwrap_or(defaults.max_workers).max(1),
            clear_cache: self.clear_cache,
            api_host: self.api_host.clone().unwrap_or(defaults.api_host),
            api_port: self.api_port.unwrap_or(defaults.api_port),
        }
    }
}

/// Returns whether every table succeeded. The summary goes to stdout.
pub fn run(settings: Settings, args: RunEtlArgs) -> Result<bool> {
    if let Err(err) = settings.source() {
        return Err(HelpfulError::config_invalid(&err).into());
    }
    let options = args.options(&settings);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let orchestrator = Orchestrator::new(Arc::new(settings));
    let summary = rt
        .block_on(orchestrator.run(&options))
        .context("ETL run aborted")?;

    println!("{}", summary);
    Ok(summary.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings() -> Settings {
        let vars: HashMap<&str, &str> = [
            ("ETL_MAX_WORKERS", "6"),
            ("API_HOST", "10.0.0.5"),
            ("API_PORT", "9100"),
            ("TABLE_CONFIG_PATH", "/nonexistent/tables.yaml"),
        ]
        .into_iter()
        .collect();
        Settings::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
    }

    #[test]
    fn options_fall_back_to_settings() {
        let args = RunEtlArgs {
            max_workers: None,
            clear_cache: true,
            api_host: None,
            api_port: None,
        };
        let options = args.options(&settings());
        assert_eq!(options.max_workers, 6);
        assert_eq!(options.api_host, "10.0.0.5");
        assert_eq!(options.api_port, 9100);
        assert!(options.clear_cache);
    }

    #[test]
    fn flags_override_settings() {
        let args = RunEtlArgs {
            max_workers: Some(0),
            clear_cache: false,
            api_host: Some("localhost".into()),
            api_port: Some(8001),
        };
        let options = args.options(&settings());
        assert_eq!(options.max_workers, 1);
        assert_eq!(options.api_host, "localhost");
        assert_eq!(options.api_port, 8001);
        assert!(!options.clear_cache);
    }
}
