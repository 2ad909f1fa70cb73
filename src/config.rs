//! Process-level settings.
//!
//! Layering, lowest to highest precedence: built-in defaults, an optional TOML
//! file, then `DISCOVERY__*` environment variables (`__` separates sections,
//! e.g. `DISCOVERY__SCAN__RATE_LIMIT_PPS=200`). A `.env` file is read first.
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ports;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub collector: CollectorSettings,
    pub server: ServerSettings,
    pub bus: BusSettings,
    pub scan: ScanDefaults,
    pub callbacks: CallbackSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CollectorSettings {
    /// Name reported as `collector` in callbacks.
    pub name: String,
    /// CloudEvents `source` attribute.
    pub source: String,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            name: "network-discovery".into(),
            source: "/collectors/network-discovery".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BusSettings {
    pub exchange: String,
    /// Base URL of the broker management API. Unset means events are only logged.
    pub url: Option<String>,
    pub vhost: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            exchange: "discovery.events".into(),
            url: None,
            vhost: "/".into(),
            username: None,
            password: None,
            timeout_ms: 5_000,
        }
    }
}

/// Defaults used by legacy scans, and by autonomous scans for limits they omit.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ScanDefaults {
    /// Empty means the local /24 networks are detected at scan time.
    pub subnets: Vec<String>,
    pub exclude_subnets: Vec<String>,
    pub port_ranges: Vec<String>,
    pub common_ports: Vec<u16>,
    pub ports_file: Option<PathBuf>,
    pub rate_limit_pps: u32,
    pub timeout_ms: u64,
    pub max_concurrent_hosts: usize,
    /// Consecutive unanswered ports before a silent host is abandoned; 0 disables.
    pub dead_host_threshold: u32,
    /// Also publish one `ServerDiscovered` per host with open ports.
    pub emit_server_events: bool,
}

impl Default for ScanDefaults {
    fn default() -> Self {
        Self {
            subnets: Vec::new(),
            exclude_subnets: Vec::new(),
            port_ranges: Vec::new(),
            common_ports: Vec::new(),
            ports_file: None,
            rate_limit_pps: crate::governor::DEFAULT_RATE_PPS,
            timeout_ms: 1_000,
            max_concurrent_hosts: 100,
            dead_host_threshold: 0,
            emit_server_events: false,
        }
    }
}

impl ScanDefaults {
    /// Ports for a legacy scan: the ports file when set, else ranges + common ports.
    pub fn resolve_ports(&self) -> anyhow::Result<Vec<u16>> {
        if let Some(path) = &self.ports_file {
            let from_file = ports::load_ports_from_path(path)?;
            if !from_file.is_empty() {
                return Ok(from_file);
            }
        }
        ports::resolve_ports(&self.port_ranges, &self.common_ports)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CallbackSettings {
    /// Sent as `X-Internal-API-Key` when a request does not carry its own key.
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub progress_interval_ms: u64,
    pub completion_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            request_timeout_ms: 10_000,
            progress_interval_ms: 2_000,
            completion_attempts: 3,
            retry_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SettingsLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<Settings, ConfigError> {
        load_env_file(self.env_file.as_deref())?;

        let mut builder = Config::builder();
        builder = match &self.config_path {
            Some(path) => builder.add_source(File::from(path.as_path()).format(FileFormat::Toml)),
            None => builder.add_source(File::with_name("discovery").required(false)),
        };
        builder = builder.add_source(
            Environment::with_prefix("DISCOVERY")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("scan.subnets")
                .with_list_parse_key("scan.exclude_subnets")
                .with_list_parse_key("scan.port_ranges")
                .with_list_parse_key("scan.common_ports")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.exchange.trim().is_empty() {
            return Err(ConfigError::Invalid("bus.exchange must not be empty".into()));
        }
        if self.scan.max_concurrent_hosts == 0 {
            return Err(ConfigError::Invalid("scan.max_concurrent_hosts must be at least 1".into()));
        }
        if self.scan.timeout_ms == 0 {
            return Err(ConfigError::Invalid("scan.timeout_ms must be positive".into()));
        }
        if self.callbacks.completion_attempts == 0 {
            return Err(ConfigError::Invalid("callbacks.completion_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn load_env_file(path: Option<&Path>) -> Result<bool, ConfigError> {
    let res = match path {
        Some(p) => dotenvy::from_path(p).map(|_| true),
        None => dotenvy::dotenv().map(|_| true),
    };
    match res {
        Ok(loaded) => Ok(loaded),
        Err(dotenvy::Error::Io(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
