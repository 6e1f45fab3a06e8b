//! Kafka configuration

use serde::Deserialize;
use std::str::FromStr;

use crate::error::BusError;

/// Security protocol for the Kafka connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    /// rdkafka configuration string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::Ssl => "SSL",
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }
}

impl FromStr for SecurityProtocol {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLAINTEXT" => Ok(Self::Plaintext),
            "SSL" => Ok(Self::Ssl),
            "SASL_PLAINTEXT" => Ok(Self::SaslPlaintext),
            "SASL_SSL" => Ok(Self::SaslSsl),
            other => Err(BusError::ConnectionFailed {
                broker: String::new(),
                cause: format!("unknown security protocol '{other}'"),
            }),
        }
    }
}

/// SASL credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaslCredentials {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

fn default_client_id() -> String {
    "courier".to_string()
}

/// Kafka connection settings.
///
/// Ordering note: the event topic must have a single partition. Courier
/// relies on the bus being a FIFO; partitioned topics would reorder events
/// across entity types.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    /// Comma-separated broker list.
    pub bootstrap_servers: String,
    /// Event topic (single partition).
    pub topic: String,
    /// Consumer group (consumers only).
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub sasl: Option<SaslCredentials>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let yaml = "bootstrap_servers: k1:9092\ntopic: courier.events";
        let config: KafkaConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.client_id, "courier");
        assert_eq!(config.security_protocol, SecurityProtocol::Plaintext);
        assert!(config.sasl.is_none());
    }

    #[test]
    fn test_security_protocol_parse() {
        assert_eq!(
            "sasl_ssl".parse::<SecurityProtocol>().unwrap(),
            SecurityProtocol::SaslSsl
        );
        assert!("quantum".parse::<SecurityProtocol>().is_err());
    }
}
