//! Datasource capability trait
//!
//! Every driver exposes the same four operations with identical result
//! shapes. A query is a template-rendered string, and a parameter mapping
//! that the driver binds using the backend's native parameter syntax -
//! never by string interpolation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use courier_core::Value;

use crate::error::ConnectorResult;

/// One fetched row, or one set of bound query variables: attribute name to
/// typed value. Null source values are never materialized.
pub type Row = BTreeMap<String, Value>;

/// Uniform access to a heterogeneous backend (relational, directory, flat
/// file).
///
/// Drivers must support transparent reconnect on transient failures: a
/// broken connection is re-established on the next call rather than
/// poisoning the instance.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Run a read query and return the fetched rows.
    async fn fetch(&self, query: &str, vars: &Row) -> ConnectorResult<Vec<Row>>;

    /// Run an insertion against the source.
    async fn add(&self, query: &str, vars: &Row) -> ConnectorResult<()>;

    /// Run a modification against the source.
    async fn modify(&self, query: &str, vars: &Row) -> ConnectorResult<()>;

    /// Run a deletion against the source.
    async fn delete(&self, query: &str, vars: &Row) -> ConnectorResult<()>;

    /// Cheap connectivity probe used at startup and by `status`.
    async fn test_connection(&self) -> ConnectorResult<()>;
}

/// Shared handle on a datasource instance.
pub type BoxedDatasource = Arc<dyn Datasource>;

/// Kind of query a source binding declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Fetch,
    Add,
    Modify,
    Delete,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Fetch => "fetch",
            QueryKind::Add => "add",
            QueryKind::Modify => "modify",
            QueryKind::Delete => "delete",
        }
    }
}

/// Dispatch one query of the declared kind on a datasource. Only `fetch`
/// returns rows.
pub async fn run_query(
    ds: &dyn Datasource,
    kind: QueryKind,
    query: &str,
    vars: &Row,
) -> ConnectorResult<Option<Vec<Row>>> {
    match kind {
        QueryKind::Fetch => Ok(Some(ds.fetch(query, vars).await?)),
        QueryKind::Add => ds.add(query, vars).await.map(|()| None),
        QueryKind::Modify => ds.modify(query, vars).await.map(|()| None),
        QueryKind::Delete => ds.delete(query, vars).await.map(|()| None),
    }
}
