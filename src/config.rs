//! Application configuration loaded from YAML

use crate::proxy::checker::{DEFAULT_NETWORK_TEST_URL, DEFAULT_TEST_URL};
use crate::Result;
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const DEFAULT_WORKER: usize = 100;
const DEFAULT_CHANNEL_CAPACITY: usize = 100;
const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 30;

/// Top-level configuration; every section falls back to its defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub sources: Vec<SourceConfig>,
    pub validator: ValidatorConfig,
    pub storage: StorageConfig,
    pub export: ExportConfig,
    pub proxy: ProxyConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// Size of the validation worker pool
    pub worker: usize,
    /// Capacity of the raw-link channel between sources and workers
    pub channel_capacity: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            worker: DEFAULT_WORKER,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// base64 encoded list of share-links
    Subscription,
    /// any text page containing share-links
    Page,
    /// local file, one link per line
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    /// URL, or path for file sources
    pub location: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_source_timeout() -> u64 {
    DEFAULT_SOURCE_TIMEOUT_SECS
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, kind: SourceKind, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            location: location.into(),
            enabled: true,
            timeout_secs: DEFAULT_SOURCE_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub test_url: String,
    pub test_timeout_secs: u64,
    pub test_count: usize,
    pub country_timeout_secs: u64,
    pub network_test_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmdb_path: Option<PathBuf>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            test_url: DEFAULT_TEST_URL.to_string(),
            test_timeout_secs: 5,
            test_count: 3,
            country_timeout_secs: 5,
            network_test_url: DEFAULT_NETWORK_TEST_URL.to_string(),
            mmdb_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_config_dir().join("freeproxy.db"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 7890,
            output_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl AppConfig {
    /// Built-in configuration with the default public sources
    pub fn with_default_sources() -> Self {
        Self {
            sources: default_sources(),
            ..Self::default()
        }
    }

    /// Load configuration from `path`; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::from_yaml(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::with_default_sources()),
            Err(e) => Err(e.into()),
        }
    }

    /// Parse YAML; sources are only defaulted when the key is absent
    pub fn from_yaml(content: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;
        let has_sources = value.get("sources").is_some();
        let mut config: Self = match value {
            serde_yaml::Value::Null => Self::default(),
            value => serde_yaml::from_value(value)?,
        };
        if !has_sources {
            config.sources = default_sources();
        }
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn with_worker(mut self, worker: usize) -> Self {
        self.app.worker = worker;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.path = path.into();
        self
    }
}

/// Default location of the configuration file
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

/// `~/.config/freeproxy`, or the platform config dir when home is unknown
fn default_config_dir() -> PathBuf {
    if let Some(base) = BaseDirs::new() {
        return base.home_dir().join(".config").join("freeproxy");
    }
    ProjectDirs::from("", "", "freeproxy")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new("freefq_ss", SourceKind::Page, "https://freefq.com/free-ss/"),
        SourceConfig::new("freefq_ssr", SourceKind::Page, "https://freefq.com/free-ssr/"),
        SourceConfig::new("freefq_v2ray", SourceKind::Page, "https://freefq.com/v2ray/"),
        SourceConfig::new("cfmem", SourceKind::Page, "https://www.cfmem.com/search/label/free"),
        SourceConfig::new(
            "feedburner",
            SourceKind::Page,
            "https://feeds.feedburner.com/mattkaydiary",
        ),
    ]
}
