//! Configuration loader and validator for the openFDA sync connector.
use chrono::NaiveDate;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::RecordKind;

pub const DEFAULT_BASE_URL: &str = "https://api.fda.gov/";
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_PAGE_BUDGET: u32 = 100;
/// openFDA's published per-minute ceiling for keyed clients.
pub const KEYED_REQUESTS_PER_MINUTE: u32 = 240;
/// Conservative ceiling for anonymous clients, which also have a small daily quota.
pub const ANONYMOUS_REQUESTS_PER_MINUTE: u32 = 40;

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
    pub openfda: OpenFda,
    pub sync: ConnectorConfig,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Pages processed per invocation before stopping cleanly.
    #[serde(default)]
    pub max_pages_per_run: Option<u32>,
}

/// openFDA client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenFda {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Overrides the ceiling implied by the presence of an API key.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

/// Options recognised from the host, one record kind per configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub record_kind: RecordKind,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Only consulted on cold start.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default = "default_page_size", deserialize_with = "number_or_string")]
    pub page_size: u32,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_secs() -> u64 {
    60
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

// Hosts hand configuration over as flat string maps.
fn number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => u32::try_from(n).map_err(de::Error::custom),
        Raw::Text(s) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| de::Error::custom(format!("expected an integer, got '{}'", s))),
    }
}

impl Default for OpenFda {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            requests_per_minute: None,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

impl OpenFda {
    pub fn requests_per_minute(&self, has_api_key: bool) -> u32 {
        self.requests_per_minute.unwrap_or(if has_api_key {
            KEYED_REQUESTS_PER_MINUTE
        } else {
            ANONYMOUS_REQUESTS_PER_MINUTE
        })
    }
}

impl ConnectorConfig {
    pub fn new(record_kind: RecordKind) -> Self {
        Self {
            record_kind,
            api_key: None,
            start_date: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        non_empty(self.api_key.as_deref())
    }
}

impl App {
    pub fn database_url(&self) -> String {
        format!("sqlite://{}/fda-sync.db", self.data_dir.trim_end_matches('/'))
    }

    pub fn page_budget(&self) -> u32 {
        self.max_pages_per_run.unwrap_or(DEFAULT_PAGE_BUDGET)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `sync.api_key` wins over `openfda.api_key`; blank keys count as absent.
    pub fn api_key(&self) -> Option<&str> {
        self.sync
            .api_key()
            .or_else(|| non_empty(self.openfda.api_key.as_deref()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
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
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.max_pages_per_run == Some(0) {
        return Err(ConfigError::Invalid("app.max_pages_per_run must be > 0"));
    }

    let api = &cfg.openfda;
    if reqwest::Url::parse(&api.base_url).is_err() {
        return Err(ConfigError::Invalid("openfda.base_url must be an absolute URL"));
    }
    if api.timeout_secs == 0 {
        return Err(ConfigError::Invalid("openfda.timeout_secs must be > 0"));
    }
    if api.requests_per_minute == Some(0) {
        return Err(ConfigError::Invalid("openfda.requests_per_minute must be > 0"));
    }
    if api.max_attempts == 0 || api.max_attempts > 10 {
        return Err(ConfigError::Invalid("openfda.max_attempts must be within 1..=10"));
    }
    if api.backoff_base_ms == 0 {
        return Err(ConfigError::Invalid("openfda.backoff_base_ms must be > 0"));
    }
    if api.backoff_cap_secs.saturating_mul(1000) < api.backoff_base_ms {
        return Err(ConfigError::Invalid(
            "openfda.backoff_cap_secs must not be below openfda.backoff_base_ms",
        ));
    }

    validate_connector(&cfg.sync)
}

/// Validate the host-facing options on their own.
pub fn validate_connector(sync: &ConnectorConfig) -> Result<(), ConfigError> {
    if sync.page_size == 0 || sync.page_size > MAX_PAGE_SIZE {
        return Err(ConfigError::Invalid("sync.page_size must be within 1..=1000"));
    }
    Ok(())
}

/// Returns a complete, valid example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  max_pages_per_run: 100

openfda:
  base_url: "https://api.fda.gov/"
  # api_key: "YOUR_OPENFDA_API_KEY"
  timeout_secs: 30
  max_attempts: 5
  backoff_base_ms: 1000
  backoff_cap_secs: 60

sync:
  record_kind: adverse_event
  start_date: "2024-01-01"
  page_size: 100
"#
}
