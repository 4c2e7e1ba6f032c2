use anyhow::{bail, Context, Result};
use arbor_network::{NetworkConfig, NodeConfig};
use arbor_security::{Approval, ApprovalConfig};
use arbor_storage::{CacheOptions, FailPolicy, StorageConfig};
use arbor_types::{duration_serde, is_valid_address};
use clap::ValueEnum;
use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sled,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Defaults to `<data_dir>/db`.
    pub path: Option<PathBuf>,
    #[serde(with = "duration_serde")]
    pub normalize_interval: Duration,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sled,
            path: None,
            normalize_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Compact => "compact",
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder and serve `/metrics`.
    pub enabled: bool,
}

/// Everything the binary reads from the config file, `ARBOR__*` variables
/// and the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub network: NetworkConfig,
    pub storage: StorageSettings,
    pub approval: HashMap<String, ApprovalConfig>,
    pub behavior: HashMap<String, FailPolicy>,
    pub cache: HashMap<String, CacheOptions>,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            network: NetworkConfig::default(),
            storage: StorageSettings::default(),
            approval: HashMap::new(),
            behavior: HashMap::new(),
            cache: HashMap::new(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("arbor"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl AppConfig {
    /// Defaults, then the file at `path`, then `ARBOR__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            builder = builder.add_source(ConfigFile::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("ARBOR")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("network.initial_addresses")
                .with_list_parse_key("network.trusted_proxies")
                .try_parsing(true),
        );

        let config = builder.build().context("failed to read configuration")?;
        config
            .try_deserialize()
            .context("failed to parse configuration")
    }

    pub fn validate(&self) -> Result<()> {
        let network = &self.network;
        if network.host.trim().is_empty() {
            bail!("network.host must not be empty");
        }
        if network.port == 0 {
            bail!("network.port must be greater than zero");
        }
        if let Some(address) = network
            .initial_addresses
            .iter()
            .find(|address| !is_valid_address(address))
        {
            bail!("network.initial_addresses contains an invalid address `{address}`");
        }
        if network.sync_interval.is_zero() {
            bail!("network.sync_interval must be positive");
        }
        if network.request_timeout.is_zero() {
            bail!("network.request_timeout must be positive");
        }
        if !network.candidate_excuse_step.is_finite() || network.candidate_excuse_step < 0.0 {
            bail!("network.candidate_excuse_step must be a non-negative number");
        }
        if let Some(auth) = &network.auth {
            if auth.username.is_empty() {
                bail!("network.auth.username must not be empty");
            }
        }
        if self.storage.normalize_interval.is_zero() {
            bail!("storage.normalize_interval must be positive");
        }
        if self.storage.backend == StorageBackend::Sled && self.data_dir.as_os_str().is_empty() {
            bail!("data_dir must not be empty");
        }
        for (action, approval) in &self.approval {
            Approval::new(action, approval.clone())
                .with_context(|| format!("invalid approval.{action}"))?;
        }
        for (name, cache) in &self.cache {
            if cache.limit == 0 {
                bail!("cache.{name}.limit must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            network: self.network.clone(),
            approval: self.approval.clone(),
            behavior: self.behavior.clone(),
            cache: self.cache.clone(),
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        match self.storage.backend {
            StorageBackend::Memory => StorageConfig::Memory,
            StorageBackend::Sled => StorageConfig::Sled {
                path: self
                    .storage
                    .path
                    .clone()
                    .unwrap_or_else(|| self.data_dir.join("db")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_security::SchemeKind;
    use arbor_types::SizeValue;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.port, 4000);
        assert_eq!(config.storage.normalize_interval, Duration::from_secs(60));
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn loads_a_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arbor.toml");
        fs::write(
            &path,
            r#"
data_dir = "/var/lib/arbor"

[network]
port = 4100
initial_addresses = ["10.0.0.1:4000", "10.0.0.2:4000"]
slaves_limit = "50%"
sync_interval = "10s"

[storage]
backend = "memory"

[approval.post]
scheme = "captcha"
period = "10m"

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        config.validate().unwrap();
        assert_eq!(config.network.port, 4100);
        assert_eq!(config.network.initial_addresses.len(), 2);
        assert_eq!(config.network.slaves_limit, SizeValue::Percent(50.0));
        assert_eq!(config.network.slave_lifetime(), Duration::from_secs(30));
        assert_eq!(config.approval["post"].scheme, SchemeKind::Captcha);
        assert_eq!(config.approval["post"].period, Duration::from_secs(600));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.storage_config(), StorageConfig::Memory);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = AppConfig::default();
        config.network.initial_addresses = vec!["not-an-address".into()];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.network.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.approval.insert(
            "post".into(),
            ApprovalConfig {
                period: Duration::ZERO,
                ..ApprovalConfig::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn sled_path_defaults_under_data_dir() {
        let config = AppConfig {
            data_dir: PathBuf::from("/tmp/arbor"),
            ..AppConfig::default()
        };
        assert_eq!(
            config.storage_config(),
            StorageConfig::Sled {
                path: PathBuf::from("/tmp/arbor/db")
            }
        );
    }

    #[test]
    fn effective_config_renders_as_toml() {
        let rendered = toml::to_string(&AppConfig::default()).unwrap();
        assert!(rendered.contains("[network]"));
        assert!(rendered.contains("port = 4000"));
    }
}
