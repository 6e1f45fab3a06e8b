//! Server configuration loading and types.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use courier_bus::KafkaConfig;
use courier_connector::DriverKind;
use courier_core::MailConfig;
use courier_producer::DatamodelConfig;

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/courier/courier-server.yaml";

/// Root configuration document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub courier: RuntimeConfig,
    #[serde(rename = "courier-server")]
    pub server: ProducerConfig,
}

/// Process-wide runtime settings, shared shape with the client.
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
    /// Declared datasources, keyed by the name the datamodel binds.
    #[serde(default)]
    pub datasources: BTreeMap<String, DatasourceConfig>,
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

/// One declared datasource: driver kind plus driver-specific settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasourceConfig {
    pub driver: DriverKind,
    pub settings: serde_yaml::Value,
}

/// Message bus settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    pub kafka: KafkaConfig,
}

/// Producer-side settings: poll interval and the datamodel.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProducerConfig {
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
    pub datamodel: DatamodelConfig,
}

fn default_update_interval_secs() -> u64 {
    60
}

impl ServerConfig {
    /// Resolve the configuration path: CLI flag, environment, default.
    pub fn resolve_path(flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load and validate the configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<ServerConfig> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config '{}': {e}", path.display()))?;
        let config: ServerConfig = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config '{}': {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        // Every source bound in the datamodel must be declared.
        for type_config in &self.server.datamodel.types {
            for source in &type_config.sources {
                if !self.courier.datasources.contains_key(&source.name) {
                    anyhow::bail!(
                        "type '{}' binds undeclared datasource '{}'",
                        type_config.name,
                        source.name
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
courier:
  cache_dir: /var/lib/courier/server
  datasources:
    hr:
      driver: postgresql
      settings:
        uri: postgres://courier@db/hr
  bus:
    kafka:
      bootstrap_servers: k1:9092
      topic: courier.events
courier-server:
  update_interval_secs: 30
  datamodel:
    types:
      - name: Users
        primary_key: uid
        sources:
          - name: hr
            fetch:
              type: fetch
              query: SELECT id, login FROM users
            attrsmapping:
              uid: id
              login: login
"#;

    #[test]
    fn test_sample_parses_and_validates() {
        let config: ServerConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.update_interval_secs, 30);
        assert_eq!(config.courier.cache.backup_count, 1);
        assert!(config.courier.cli_socket.is_none());
    }

    #[test]
    fn test_undeclared_datasource_rejected() {
        let broken = SAMPLE.replace("          - name: hr", "          - name: ghost");
        let config: ServerConfig = serde_yaml::from_str(&broken).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let broken = format!("{SAMPLE}\nextra: 1\n");
        assert!(serde_yaml::from_str::<ServerConfig>(&broken).is_err());
    }
}
