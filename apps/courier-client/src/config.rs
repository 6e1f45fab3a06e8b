//! Client configuration loading and types.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use courier_bus::KafkaConfig;
use courier_consumer::ConsumerSettings;
use courier_core::MailConfig;

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/courier/courier-client.yaml";

/// Root configuration document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub courier: RuntimeConfig,
    #[serde(rename = "courier-client")]
    pub client: ConsumerConfig,
}

/// Process-wide runtime settings, shared shape with the server.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Directory holding the persisted caches.
    pub cache_dir: PathBuf,
    /// Log file path; stdout when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Default log filter, overridable with `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// UNIX control socket path; disabled when unset.
    #[serde(default)]
    pub cli_socket: Option<PathBuf>,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub mail: Option<MailConfig>,
    pub bus: BusConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Cache file tuning.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
    #[serde(default)]
    pub compress: bool,
}

fn default_backup_count() -> u32 {
    1
}

/// Message bus settings. The consumer requires a group id.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    pub kafka: KafkaConfig,
}

/// Registered target plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Accepts everything and touches nothing; validates a deployment end
    /// to end.
    #[default]
    Null,
}

/// Consumer-side settings: the target plugin plus the engine settings,
/// embedded flat.
#[derive(Debug, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub target: TargetKind,
    #[serde(flatten)]
    pub settings: ConsumerSettings,
}

impl ClientConfig {
    /// Resolve the configuration path: CLI flag, environment, default.
    pub fn resolve_path(flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load and validate the configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<ClientConfig> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config '{}': {e}", path.display()))?;
        let config: ClientConfig = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config '{}': {e}", path.display()))?;
        if config.courier.bus.kafka.group_id.is_none() {
            anyhow::bail!("courier.bus.kafka.group_id is required for a consumer");
        }
        Ok(config)
    }
}
