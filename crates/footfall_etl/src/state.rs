//! High-water marks per destination table, persisted as a JSON object.

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use footfall_config::timestamp::{format_timestamp, parse_timestamp};

use crate::error::{EtlError, Result};

/// `dest_table -> "YYYY-MM-DD HH:MM:SS[.ffffff]"`
pub type StateMap = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    default_timestamp: String,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, default_timestamp: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            default_timestamp: default_timestamp.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file. A missing file is an empty map; an unreadable
    /// one is logged and treated as empty.
    pub fn load(&self) -> StateMap {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}; starting fresh", self.path.display());
                return StateMap::new();
            }
            Err(e) => {
                warn!(
                    "Cannot read state file {}: {}; starting fresh",
                    self.path.display(),
                    e
                );
                return StateMap::new();
            }
        };

        match serde_json::from_str::<StateMap>(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "State file {} is not a JSON object of strings: {}; starting fresh",
                    self.path.display(),
                    e
                );
                StateMap::new()
            }
        }
    }

    /// Write the whole map: temp file, fsync, rename over the target.
    pub fn save(&self, state: &StateMap) -> Result<()> {
        let write_err = |what: &str, e: std::io::Error| EtlError::StateWrite {
            message: format!("{} {}: {}", what, self.path.display(), e),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_err("cannot create parent of", e))?;
        }

        let payload = serde_json::to_vec_pretty(state).map_err(|e| EtlError::StateWrite {
            message: format!("cannot serialize state: {}", e),
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut file =
                File::create(&temp_path).map_err(|e| write_err("cannot create temp for", e))?;
            file.write_all(&payload)
                .map_err(|e| write_err("cannot write temp for", e))?;
            file.sync_all()
                .map_err(|e| write_err("cannot sync temp for", e))?;
        }
        fs::rename(&temp_path, &self.path).map_err(|e| write_err("cannot replace", e))?;

        debug!("Saved ETL state to {}", self.path.display());
        Ok(())
    }

    /// The stored mark for `dest_table`, or the configured default.
    pub fn get_last(&self, state: &StateMap, dest_table: &str) -> String {
        state
            .get(dest_table)
            .cloned()
            .unwrap_or_else(|| self.default_timestamp.clone())
    }

    /// The stored mark parsed; falls back to the default when unparseable.
    pub fn get_last_parsed(&self, state: &StateMap, dest_table: &str) -> Result<NaiveDateTime> {
        let raw = self.get_last(state, dest_table);
        if let Some(ts) = parse_timestamp(&raw) {
            return Ok(ts);
        }
        warn!(
            "Stored high-water mark '{}' for '{}' is not a timestamp; using default",
            raw, dest_table
        );
        parse_timestamp(&self.default_timestamp).ok_or_else(|| {
            EtlError::Config(format!(
                "ETL_DEFAULT_TIMESTAMP '{}' is not a timestamp",
                self.default_timestamp
            ))
        })
    }

    /// Record `new_ts` for `dest_table`. `None` leaves the entry untouched.
    pub fn update(state: &mut StateMap, dest_table: &str, new_ts: Option<NaiveDateTime>) -> bool {
        match new_ts {
            Some(ts) => {
                let formatted = format_timestamp(&ts);
                debug!("High-water mark for '{}' -> {}", dest_table, formatted);
                state.insert(dest_table.to_string(), formatted);
                true
            }
            None => {
                warn!(
                    "No valid timestamp to record for '{}'; high-water mark unchanged",
                    dest_table
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    const DEFAULT: &str = "1900-01-01 00:00:00";

    #[test]
    fn missing_file_loads_empty() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path().join("etl_state.json"), DEFAULT);
        assert!(store.load().is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("etl_state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(StateStore::new(&path, DEFAULT).load().is_empty());
    }

    #[test]
    fn save_then_load_roundtrips_and_creates_parent() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path().join("nested").join("etl_state.json"), DEFAULT);

        let mut state = StateMap::new();
        state.insert("fact_traffic".into(), "2024-01-10 11:00:00".into());
        state.insert("fact_errors".into(), "2024-01-09 08:30:00".into());
        store.save(&state).unwrap();

        assert_eq!(store.load(), state);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn get_last_falls_back_to_default() {
        let store = StateStore::new("unused.json", DEFAULT);
        let mut state = StateMap::new();
        assert_eq!(store.get_last(&state, "fact_traffic"), DEFAULT);

        state.insert("fact_traffic".into(), "garbage".into());
        let parsed = store.get_last_parsed(&state, "fact_traffic").unwrap();
        assert_eq!(
            parsed,
            NaiveDate::from_ymd_opt(1900, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn update_ignores_missing_timestamp() {
        let mut state = StateMap::new();
        assert!(!StateStore::update(&mut state, "fact_traffic", None));
        assert!(state.is_empty());

        let ts = NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(11, 0, 0)
            .unwrap();
        assert!(StateStore::update(&mut state, "fact_traffic", Some(ts)));
        assert_eq!(state["fact_traffic"], "2024-01-10 11:00:00");
    }
}
