//! Engine configuration.
//!
//! `EngineConfig::default()` reads `OPQUEUE_*` environment variables and falls
//! back to built-in values; a JSON file may override any subset of fields.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::continual::{DEFAULT_PAGE_SIZE, DEFAULT_POLL_INTERVAL};
use crate::app::{App, ContinualExecutor};

pub const OPERATIONS_SNAPSHOT: &str = "operations.json";
pub const ORCHESTRATORS_SNAPSHOT: &str = "orchestrators.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Idle sleep of the continual executor, in milliseconds.
    pub poll_interval_ms: u64,
    pub page_size: usize,
    /// Delegation target served by this process. Also its orchestrator
    /// identifier.
    pub instance_identifier: String,
    pub description: Option<String>,
    /// Where store snapshots live. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub register_orchestrator: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

impl EngineConfig {
    /// Build from a variable lookup; `Default` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            poll_interval_ms: parsed(&lookup, "OPQUEUE_POLL_INTERVAL_MS")
                .unwrap_or(DEFAULT_POLL_INTERVAL.as_millis() as u64),
            page_size: parsed(&lookup, "OPQUEUE_PAGE_SIZE").unwrap_or(DEFAULT_PAGE_SIZE),
            instance_identifier: lookup("OPQUEUE_INSTANCE")
                .unwrap_or_else(|| "default".to_string()),
            description: lookup("OPQUEUE_DESCRIPTION"),
            data_dir: lookup("OPQUEUE_DATA_DIR").map(PathBuf::from),
            register_orchestrator: parsed(&lookup, "OPQUEUE_REGISTER_ORCHESTRATOR")
                .unwrap_or(true),
        }
    }

    /// Read a JSON file; missing fields keep their `Default` value.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn operations_snapshot(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(OPERATIONS_SNAPSHOT))
    }

    pub fn orchestrators_snapshot(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(ORCHESTRATORS_SNAPSHOT))
    }

    /// A continual executor for `instance_identifier` with this config's
    /// interval, page size and registration.
    pub fn continual_executor(&self, app: &App) -> ContinualExecutor {
        let worker = app
            .continual_executor(self.instance_identifier.clone())
            .with_poll_interval(self.poll_interval())
            .with_page_size(self.page_size);
        if self.register_orchestrator {
            worker.with_registration(app.orchestrators().clone(), self.description.clone())
        } else {
            worker
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_builtin_values() {
        let config = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(config.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.instance_identifier, "default");
        assert!(config.register_orchestrator);
        assert_eq!(config.operations_snapshot(), None);
    }

    #[test]
    fn environment_overrides_and_bad_numbers_fall_back() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("OPQUEUE_POLL_INTERVAL_MS", "250"),
            ("OPQUEUE_PAGE_SIZE", "lots"),
            ("OPQUEUE_INSTANCE", "gpu-1"),
            ("OPQUEUE_DATA_DIR", "/var/lib/opqueue"),
            ("OPQUEUE_REGISTER_ORCHESTRATOR", "false"),
        ]));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.instance_identifier, "gpu-1");
        assert!(!config.register_orchestrator);
        assert_eq!(
            config.orchestrators_snapshot(),
            Some(PathBuf::from("/var/lib/opqueue/orchestrators.json"))
        );
    }

    #[test]
    fn json_file_sets_a_subset_of_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"instance_identifier": "worker-A", "page_size": 5}}"#).unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.instance_identifier, "worker-A");
        assert_eq!(config.page_size, 5);
    }

    #[test]
    fn unreadable_and_malformed_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = EngineConfig::from_json_file(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }
}
