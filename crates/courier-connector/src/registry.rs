//! Datasource registry
//!
//! Datasource instances are built from configuration and registered
//! explicitly at process start; nothing is discovered or loaded
//! implicitly. The registry then hands out shared handles by source name.

use std::collections::BTreeMap;

use crate::error::{ConnectorError, ConnectorResult};
use crate::traits::BoxedDatasource;

/// Kind of datasource driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Ldap,
    Postgresql,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Ldap => "ldap",
            DriverKind::Postgresql => "postgresql",
        }
    }
}

/// Name-indexed set of datasource instances.
#[derive(Default)]
pub struct DatasourceRegistry {
    instances: BTreeMap<String, BoxedDatasource>,
}

impl DatasourceRegistry {
    pub fn new() -> DatasourceRegistry {
        DatasourceRegistry::default()
    }

    /// Register an instance under a source name.
    pub fn register(&mut self, name: impl Into<String>, datasource: BoxedDatasource) {
        self.instances.insert(name.into(), datasource);
    }

    /// Get the datasource registered under `name`.
    pub fn get(&self, name: &str) -> ConnectorResult<BoxedDatasource> {
        self.instances
            .get(name)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownDatasource {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{Datasource, Row};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullDatasource;

    #[async_trait]
    impl Datasource for NullDatasource {
        async fn fetch(&self, _query: &str, _vars: &Row) -> ConnectorResult<Vec<Row>> {
            Ok(Vec::new())
        }
        async fn add(&self, _query: &str, _vars: &Row) -> ConnectorResult<()> {
            Ok(())
        }
        async fn modify(&self, _query: &str, _vars: &Row) -> ConnectorResult<()> {
            Ok(())
        }
        async fn delete(&self, _query: &str, _vars: &Row) -> ConnectorResult<()> {
            Ok(())
        }
        async fn test_connection(&self) -> ConnectorResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = DatasourceRegistry::new();
        registry.register("hr", Arc::new(NullDatasource));
        assert!(registry.get("hr").is_ok());
        assert!(matches!(
            registry.get("absent"),
            Err(ConnectorError::UnknownDatasource { .. })
        ));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["hr"]);
    }

    #[test]
    fn test_driver_kind_deserialization() {
        let kind: DriverKind = serde_yaml::from_str("postgresql").unwrap();
        assert_eq!(kind, DriverKind::Postgresql);
        assert_eq!(kind.as_str(), "postgresql");
    }
}
