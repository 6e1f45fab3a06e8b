//! LDAP datasource driver
//!
//! Fetches take `base`, `scope` (base/one/subtree), `filter` and `attrlist`
//! as vars; mutations take a `dn` plus structured `addlist` / `modlist` /
//! `dellist` values. The connection is cached and re-established
//! transparently when a transient failure is met.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use courier_core::Value;

use crate::error::{ConnectorError, ConnectorResult};
use crate::traits::{Datasource, Row};

fn default_timeout_secs() -> u64 {
    30
}

fn default_filter() -> String {
    "(objectClass=*)".to_string()
}

/// LDAP driver settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LdapConfig {
    /// Server URI, e.g. `ldaps://ldap.corp.example:636`.
    pub uri: String,
    pub bind_dn: String,
    #[serde(default)]
    pub bind_password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub connection_timeout_secs: u64,
}

/// LDAP datasource.
pub struct LdapDatasource {
    config: LdapConfig,
    /// Cached connection, lazily established and dropped on failure.
    connection: Arc<RwLock<Option<Ldap>>>,
}

impl LdapDatasource {
    pub fn new(config: LdapConfig) -> ConnectorResult<LdapDatasource> {
        if config.uri.is_empty() || config.bind_dn.is_empty() {
            return Err(ConnectorError::invalid_configuration(
                "ldap uri and bind_dn are required",
            ));
        }
        Ok(LdapDatasource {
            config,
            connection: Arc::new(RwLock::new(None)),
        })
    }

    async fn get_connection(&self) -> ConnectorResult<Ldap> {
        {
            let guard = self.connection.read().await;
            if let Some(ldap) = guard.as_ref() {
                return Ok(ldap.clone());
            }
        }
        let ldap = self.create_connection().await?;
        *self.connection.write().await = Some(ldap.clone());
        Ok(ldap)
    }

    async fn create_connection(&self) -> ConnectorResult<Ldap> {
        debug!(uri = %self.config.uri, "connecting to LDAP server");
        let settings = LdapConnSettings::new().set_conn_timeout(std::time::Duration::from_secs(
            self.config.connection_timeout_secs,
        ));
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.config.uri)
            .await
            .map_err(|e| {
                ConnectorError::connection_failed_with_source(
                    format!("failed to connect to {}", self.config.uri),
                    e,
                )
            })?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let password = self.config.bind_password.as_deref().unwrap_or("");
        let result = ldap
            .simple_bind(&self.config.bind_dn, password)
            .await
            .map_err(|e| ConnectorError::connection_failed_with_source("LDAP bind failed", e))?;
        if result.rc == 49 {
            return Err(ConnectorError::AuthenticationFailed);
        }
        if result.rc != 0 {
            return Err(ConnectorError::connection_failed(format!(
                "LDAP bind failed with code {}: {}",
                result.rc, result.text
            )));
        }

        info!(uri = %self.config.uri, "LDAP connection established");
        Ok(ldap)
    }

    /// Drop the cached connection so the next call reconnects.
    async fn invalidate(&self) {
        *self.connection.write().await = None;
    }

    async fn search_once(&self, vars: &Row) -> ConnectorResult<Vec<Row>> {
        let base = var_str(vars, "base")?;
        let scope = match vars.get("scope").and_then(Value::as_str).unwrap_or("subtree") {
            "base" => Scope::Base,
            "one" => Scope::OneLevel,
            "subtree" => Scope::Subtree,
            other => {
                return Err(ConnectorError::invalid_query(format!(
                    "invalid scope '{other}', expected one of: base, one, subtree"
                )))
            }
        };
        let filter = vars
            .get("filter")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(default_filter);
        let attrlist: Vec<String> = match vars.get("attrlist") {
            Some(Value::List(items)) => items.iter().map(ToString::to_string).collect(),
            Some(Value::String(attr)) => vec![attr.clone()],
            None => vec!["*".to_string()],
            Some(other) => {
                return Err(ConnectorError::invalid_query(format!(
                    "invalid attrlist: {other:?}"
                )))
            }
        };

        let mut ldap = self.get_connection().await?;
        let (entries, _result) = ldap
            .search(base, scope, &filter, &attrlist)
            .await
            .map_err(|e| ConnectorError::connection_failed_with_source("LDAP search failed", e))?
            .success()
            .map_err(|e| ConnectorError::query_failed_with_source("LDAP search rejected", e))?;

        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = SearchEntry::construct(entry);
            let mut row = Row::new();
            row.insert("dn".to_string(), Value::String(entry.dn));
            for (attr, values) in entry.attrs {
                row.insert(attr, string_values(values));
            }
            for (attr, values) in entry.bin_attrs {
                row.insert(attr, binary_values(values));
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

fn var_str<'a>(vars: &'a Row, name: &str) -> ConnectorResult<&'a str> {
    vars.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectorError::invalid_query(format!("missing string var '{name}'")))
}

fn string_values(mut values: Vec<String>) -> Value {
    if values.len() == 1 {
        Value::String(values.remove(0))
    } else {
        Value::List(values.into_iter().map(Value::String).collect())
    }
}

fn binary_values(mut values: Vec<Vec<u8>>) -> Value {
    if values.len() == 1 {
        Value::Bytes(values.remove(0))
    } else {
        Value::List(values.into_iter().map(Value::Bytes).collect())
    }
}

fn value_strings(value: &Value) -> HashSet<String> {
    match value {
        Value::List(items) => items.iter().map(ToString::to_string).collect(),
        other => [other.to_string()].into_iter().collect(),
    }
}

/// Build the `(attr, values)` list for an `add` from the structured
/// `addlist` map.
fn addlist_of(vars: &Row) -> ConnectorResult<Vec<(String, HashSet<String>)>> {
    match vars.get("addlist") {
        Some(Value::Map(map)) => Ok(map
            .iter()
            .map(|(attr, value)| (attr.clone(), value_strings(value)))
            .collect()),
        _ => Err(ConnectorError::invalid_query(
            "ldap add requires an 'addlist' map",
        )),
    }
}

/// Build the modification list from the structured `modlist`: a list of
/// `{op, attr, values}` maps where `op` is add/replace/delete.
fn modlist_of(vars: &Row) -> ConnectorResult<Vec<Mod<String>>> {
    let Some(Value::List(entries)) = vars.get("modlist") else {
        return Err(ConnectorError::invalid_query(
            "ldap modify requires a 'modlist' list",
        ));
    };
    let mut mods = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Map(map) = entry else {
            return Err(ConnectorError::invalid_query("modlist entries must be maps"));
        };
        let op = map
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::invalid_query("modlist entry misses 'op'"))?;
        let attr = map
            .get("attr")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::invalid_query("modlist entry misses 'attr'"))?
            .to_string();
        let values = map.get("values").map(value_strings).unwrap_or_default();
        mods.push(match op {
            "add" => Mod::Add(attr, values),
            "replace" => Mod::Replace(attr, values),
            "delete" => Mod::Delete(attr, values),
            other => {
                return Err(ConnectorError::invalid_query(format!(
                    "invalid modlist op '{other}'"
                )))
            }
        });
    }
    Ok(mods)
}

#[async_trait]
impl Datasource for LdapDatasource {
    /// The query string is unused for LDAP: the search is entirely
    /// described by the vars.
    #[instrument(skip(self, _query, vars))]
    async fn fetch(&self, _query: &str, vars: &Row) -> ConnectorResult<Vec<Row>> {
        match self.search_once(vars).await {
            Ok(rows) => Ok(rows),
            Err(e) if e.is_transient() => {
                // Reconnect once before giving up on the tick.
                warn!(error = %e, "transient LDAP failure, reconnecting");
                self.invalidate().await;
                self.search_once(vars).await
            }
            Err(e) => Err(e),
        }
    }

    async fn add(&self, _query: &str, vars: &Row) -> ConnectorResult<()> {
        let dn = var_str(vars, "dn")?.to_string();
        let addlist = addlist_of(vars)?;
        let mut ldap = self.get_connection().await?;
        ldap.add(&dn, addlist)
            .await
            .map_err(|e| ConnectorError::connection_failed_with_source("LDAP add failed", e))?
            .success()
            .map_err(|e| ConnectorError::query_failed_with_source("LDAP add rejected", e))?;
        Ok(())
    }

    async fn modify(&self, _query: &str, vars: &Row) -> ConnectorResult<()> {
        let dn = var_str(vars, "dn")?.to_string();
        let mods = modlist_of(vars)?;
        let mut ldap = self.get_connection().await?;
        ldap.modify(&dn, mods)
            .await
            .map_err(|e| ConnectorError::connection_failed_with_source("LDAP modify failed", e))?
            .success()
            .map_err(|e| ConnectorError::query_failed_with_source("LDAP modify rejected", e))?;
        Ok(())
    }

    async fn delete(&self, _query: &str, vars: &Row) -> ConnectorResult<()> {
        let dn = var_str(vars, "dn")?.to_string();
        let mut ldap = self.get_connection().await?;
        ldap.delete(&dn)
            .await
            .map_err(|e| ConnectorError::connection_failed_with_source("LDAP delete failed", e))?
            .success()
            .map_err(|e| ConnectorError::query_failed_with_source("LDAP delete rejected", e))?;
        Ok(())
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        self.get_connection().await.map(|_| ())
    }
}
