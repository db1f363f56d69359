//! Operator-facing failures: what broke, why, and what to try next.

use std::fmt;
use std::path::Path;

use footfall_config::ConfigError;

#[derive(Debug)]
pub struct HelpfulError {
    what: String,
    cause: String,
    hints: Vec<String>,
}

impl HelpfulError {
    fn new(what: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            what: what.into(),
            cause: cause.to_string(),
            hints: Vec::new(),
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    pub fn config_invalid(err: &ConfigError) -> Self {
        let error = Self::new("Configuration is invalid", err);
        match err {
            ConfigError::SourceMissing => error
                .hint("set SQLSERVER_SERVER, SQLSERVER_DATABASE, SQLSERVER_UID and SQLSERVER_PWD")
                .hint("or read a SQLite replica: SOURCE_DB_URL=sqlite:replica.db"),
            ConfigError::TableFileRead { path, .. } | ConfigError::TableFileParse { path, .. } => {
                error
                    .hint(format!("fix the YAML in {}", path.display()))
                    .hint("or unset TABLE_CONFIG_PATH to load the built-in tables")
            }
            ConfigError::Invalid(_) => error.hint("footfall config   # show resolved values"),
        }
    }

    pub fn store_unavailable(db_path: &Path, cause: impl fmt::Display) -> Self {
        let dir = db_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        Self::new(
            format!("Analytical store {} cannot be opened", db_path.display()),
            cause,
        )
        .hint("another `footfall run-etl` may still be running")
        .hint(format!("{} must be writable", dir.display()))
    }

    pub fn bind_failed(addr: &str, cause: impl fmt::Display) -> Self {
        Self::new(format!("Cannot listen on {}", addr), cause)
            .hint("choose a free port: footfall serve --port 8080")
            .hint("or set API_HOST / API_PORT")
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.what)?;
        writeln!(f, "  caused by: {}", self.cause)?;
        for hint in &self.hints {
            writeln!(f, "  hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for HelpfulError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendering_lists_cause_and_hints() {
        let text = HelpfulError::bind_failed("0.0.0.0:8000", "address in use").to_string();
        assert!(text.starts_with("error: Cannot listen on 0.0.0.0:8000\n"));
        assert!(text.contains("caused by: address in use"));
        assert_eq!(text.matches("hint:").count(), 2);
    }

    #[test]
    fn missing_source_mentions_both_backends() {
        let text = HelpfulError::config_invalid(&ConfigError::SourceMissing).to_string();
        assert!(text.contains("SQLSERVER_SERVER"));
        assert!(text.contains("SOURCE_DB_URL"));
    }

    #[test]
    fn store_hint_names_the_data_dir() {
        let text =
            HelpfulError::store_unavailable(Path::new("/srv/footfall/analytics.duckdb"), "locked")
                .to_string();
        assert!(text.contains("/srv/footfall must be writable"));
    }
}
