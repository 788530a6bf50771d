//! Configuration loader and validator for the planet sync daemon.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::store::Layout;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub schedule: Schedule,
    pub ipfs: Ipfs,
    #[serde(default)]
    pub http: Http,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

/// Intervals for the scheduled engines, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    pub publish_interval_secs: u64,
    pub update_interval_secs: u64,
    pub aggregate_interval_secs: u64,
}

/// Local IPFS daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ipfs {
    pub api_url: String,
    pub gateway_url: String,
    #[serde(default = "default_ipfs_binary")]
    pub binary: String,
    #[serde(default = "default_publish_lifetime_hours")]
    pub publish_lifetime_hours: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Outbound HTTP settings for feeds, gateways and social images.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Http {
    pub user_agent: String,
    pub timeout_secs: u64,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_ipfs_binary() -> String {
    "ipfs".into()
}

fn default_publish_lifetime_hours() -> u64 {
    168
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            publish_interval_secs: 600,
            update_interval_secs: 300,
            aggregate_interval_secs: 300,
        }
    }
}

impl Default for Http {
    fn default() -> Self {
        Self {
            user_agent: "planet-sync/0.1".into(),
            timeout_secs: 30,
        }
    }
}

impl App {
    /// Expand a leading `~/` in `data_dir` using `$HOME`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return Path::new(&home).join(rest);
            }
        }
        PathBuf::from(&self.data_dir)
    }
}

impl Ipfs {
    pub fn publish_lifetime(&self) -> Duration {
        Duration::from_secs(self.publish_lifetime_hours * 3600)
    }
}

impl Config {
    pub fn layout(&self) -> Layout {
        Layout::new(self.app.resolved_data_dir())
    }

    /// Ensure required directories exist (`My/`, `Following/`, `Public/` under `app.data_dir`).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        let layout = self.layout();
        fs::create_dir_all(layout.my_root())?;
        fs::create_dir_all(layout.following_root())?;
        fs::create_dir_all(layout.public_root())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.max_concurrency == 0 {
        return Err(ConfigError::Invalid("app.max_concurrency must be > 0"));
    }

    let s = &cfg.schedule;
    if s.publish_interval_secs == 0 {
        return Err(ConfigError::Invalid("schedule.publish_interval_secs must be > 0"));
    }
    if s.update_interval_secs == 0 {
        return Err(ConfigError::Invalid("schedule.update_interval_secs must be > 0"));
    }
    if s.aggregate_interval_secs == 0 {
        return Err(ConfigError::Invalid("schedule.aggregate_interval_secs must be > 0"));
    }

    if Url::parse(&cfg.ipfs.api_url).is_err() {
        return Err(ConfigError::Invalid("ipfs.api_url must be a valid URL"));
    }
    if Url::parse(&cfg.ipfs.gateway_url).is_err() {
        return Err(ConfigError::Invalid("ipfs.gateway_url must be a valid URL"));
    }
    if cfg.ipfs.binary.trim().is_empty() {
        return Err(ConfigError::Invalid("ipfs.binary must be non-empty"));
    }
    if cfg.ipfs.publish_lifetime_hours == 0 {
        return Err(ConfigError::Invalid("ipfs.publish_lifetime_hours must be > 0"));
    }

    if cfg.http.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("http.user_agent must be non-empty"));
    }
    if cfg.http.timeout_secs == 0 {
        return Err(ConfigError::Invalid("http.timeout_secs must be > 0"));
    }

    Ok(())
}

/// Returns the documented example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  max_concurrency: 4

schedule:
  publish_interval_secs: 600
  update_interval_secs: 300
  aggregate_interval_secs: 300

ipfs:
  api_url: "http://127.0.0.1:5981/"
  gateway_url: "http://127.0.0.1:18181/"
  binary: "ipfs"
  publish_lifetime_hours: 168
  request_timeout_secs: 120

http:
  user_agent: "planet-sync/0.1"
  timeout_secs: 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.ipfs.publish_lifetime(), Duration::from_secs(168 * 3600));
    }

    #[test]
    fn optional_sections_fall_back_to_defaults() {
        let yaml = r#"app:
  data_dir: "/tmp/planets"
ipfs:
  api_url: "http://127.0.0.1:5001/"
  gateway_url: "http://127.0.0.1:8080/"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.max_concurrency, 4);
        assert_eq!(cfg.schedule, Schedule::default());
        assert_eq!(cfg.ipfs.binary, "ipfs");
        assert_eq!(cfg.ipfs.publish_lifetime_hours, 168);
        assert_eq!(cfg.http, Http::default());
    }

    #[test]
    fn invalid_data_dir() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("data_dir")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_intervals() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.schedule.publish_interval_secs = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("publish_interval")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.schedule.update_interval_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.schedule.aggregate_interval_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.max_concurrency = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_urls() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.ipfs.api_url = "not a url".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("api_url")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.ipfs.gateway_url = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_site_roots() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.join("My").is_dir());
        assert!(data_path.join("Following").is_dir());
        assert!(data_path.join("Public").is_dir());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.max_concurrency, 4);
        assert_eq!(cfg.schedule.publish_interval_secs, 600);
    }
}
