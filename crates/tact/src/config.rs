//! Runner configuration.
//!
//! Loaded from `tact.config.json` or `tact.config.yaml` in the working
//! directory (format dispatched on extension). A missing file yields the
//! defaults with a single anonymous project; a malformed file is a fatal
//! configuration error.

use crate::error::{TactError, TactResult};
use crate::model::TestOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Per-test timeout in milliseconds; the pool kills the worker past it.
    pub timeout: u64,
    pub expect: ExpectConfig,
    /// Extra attempts after a failed one.
    pub retries: u32,
    /// Whole-run deadline in milliseconds; zero disables it.
    pub global_timeout: u64,
    /// Worker-pool size.
    pub workers: usize,
    /// Count flaky outcomes as failures for the exit code.
    pub fail_on_flaky: bool,
    pub projects: Vec<ProjectConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExpectConfig {
    /// Default `to_have_value` deadline in milliseconds.
    pub timeout: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: String,
    /// Globs selecting this project's test files, relative to cwd.
    pub test_match: Vec<String>,
    #[serde(rename = "use")]
    pub use_options: TestOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: 10_000,
            expect: ExpectConfig::default(),
            retries: 0,
            global_timeout: 0,
            workers: default_workers(),
            fail_on_flaky: false,
            projects: vec![ProjectConfig::default()],
        }
    }
}

impl Default for ExpectConfig {
    fn default() -> Self {
        Self { timeout: 5_000 }
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            test_match: vec!["tests/**/*.tact".to_string()],
            use_options: TestOptions::default(),
        }
    }
}

/// Half the cores, at least one.
#[must_use]
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    (cpus / 2).max(1)
}

const CANDIDATES: &[&str] = &["tact.config.json", "tact.config.yaml", "tact.config.yml"];

/// Load the configuration for `cwd`.
///
/// `explicit` skips the candidate search and must exist.
pub fn load(cwd: &Path, explicit: Option<&Path>) -> TactResult<Config> {
    let path = match explicit {
        Some(path) => {
            let path = cwd.join(path);
            if !path.is_file() {
                return Err(TactError::config(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            Some(path)
        }
        None => CANDIDATES
            .iter()
            .map(|name| cwd.join(name))
            .find(|path| path.is_file()),
    };
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let data = std::fs::read_to_string(&path)
        .map_err(|err| TactError::io(format!("failed to read {}", path.display()), err))?;
    let mut config: Config = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&data).map_err(|err| {
            TactError::config(format!("failed to parse {}: {err}", path.display()))
        })?
    } else {
        serde_yaml::from_str(&data).map_err(|err| {
            TactError::config(format!("failed to parse {}: {err}", path.display()))
        })?
    };
    if config.workers == 0 {
        config.workers = default_workers();
    }
    if config.projects.is_empty() {
        config.projects.push(ProjectConfig::default());
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(dir.path(), None).unwrap();
        assert_eq!(config.timeout, 10_000);
        assert_eq!(config.expect.timeout, 5_000);
        assert_eq!(config.retries, 0);
        assert_eq!(config.projects.len(), 1);
        assert!(config.workers >= 1);
    }

    #[test]
    fn json_config_parses_with_projects() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tact.config.json"),
            r#"{
                "timeout": 2000,
                "retries": 2,
                "projects": [
                    {"name": "wide", "test_match": ["wide/**/*.tact"], "use": {"columns": 160}}
                ]
            }"#,
        )
        .unwrap();
        let config = load(dir.path(), None).unwrap();
        assert_eq!(config.timeout, 2000);
        assert_eq!(config.retries, 2);
        assert_eq!(config.projects[0].name, "wide");
        assert_eq!(config.projects[0].use_options.columns, Some(160));
    }

    #[test]
    fn yaml_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tact.config.yaml"),
            "timeout: 1500\nexpect:\n  timeout: 800\n",
        )
        .unwrap();
        let config = load(dir.path(), None).unwrap();
        assert_eq!(config.timeout, 1500);
        assert_eq!(config.expect.timeout, 800);
    }

    #[test]
    fn malformed_config_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tact.config.json"), "{ not json").unwrap();
        let err = load(dir.path(), None).unwrap_err();
        assert_eq!(err.code, "E_CONFIG");
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(dir.path(), Some(Path::new("custom.json"))).unwrap_err();
        assert_eq!(err.code, "E_CONFIG");
    }
}
