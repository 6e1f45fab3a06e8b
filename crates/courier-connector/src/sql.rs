//! SQL datasource driver (PostgreSQL)
//!
//! Queries use named parameters (`:name`) bound through the driver, never
//! string interpolation. The connection pool re-establishes broken
//! connections transparently.

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, TypeInfo, ValueRef};
use tracing::{debug, instrument};

use courier_core::Value;

use crate::error::{ConnectorError, ConnectorResult};
use crate::traits::{Datasource, Row};

fn default_max_connections() -> u32 {
    4
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

/// PostgreSQL driver settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresConfig {
    /// Connection URI, e.g. `postgres://courier@db/hr`.
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

/// PostgreSQL datasource.
pub struct PostgresDatasource {
    pool: PgPool,
}

impl PostgresDatasource {
    /// Create the pool. Connections are established lazily, so a source
    /// that is down at startup does not prevent the process from running.
    pub fn new(config: &PostgresConfig) -> ConnectorResult<PostgresDatasource> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy(&config.uri)
            .map_err(|e| ConnectorError::connection_failed_with_source("invalid pool URI", e))?;
        Ok(PostgresDatasource { pool })
    }

    fn bind_all<'q>(
        mut query: Query<'q, Postgres, PgArguments>,
        binds: &'q [Value],
    ) -> Query<'q, Postgres, PgArguments> {
        for value in binds {
            query = match value {
                Value::Bool(b) => query.bind(*b),
                Value::Integer(i) => query.bind(*i),
                Value::Float(f) => query.bind(*f),
                Value::String(s) => query.bind(s.as_str()),
                Value::Bytes(b) => query.bind(b.as_slice()),
                Value::DateTime(dt) => query.bind(*dt),
                Value::List(_) | Value::Map(_) => query.bind(value.to_json()),
            };
        }
        query
    }

    async fn execute(&self, query: &str, vars: &Row) -> ConnectorResult<()> {
        let (sql, binds) = bind_named(query, vars)?;
        Self::bind_all(sqlx::query(&sql), &binds)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl Datasource for PostgresDatasource {
    #[instrument(skip(self, vars), fields(vars = vars.len()))]
    async fn fetch(&self, query: &str, vars: &Row) -> ConnectorResult<Vec<Row>> {
        let (sql, binds) = bind_named(query, vars)?;
        let rows = Self::bind_all(sqlx::query(&sql), &binds)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(decode_row(row)?);
        }
        debug!(rows = out.len(), "fetch completed");
        Ok(out)
    }

    async fn add(&self, query: &str, vars: &Row) -> ConnectorResult<()> {
        self.execute(query, vars).await
    }

    async fn modify(&self, query: &str, vars: &Row) -> ConnectorResult<()> {
        self.execute(query, vars).await
    }

    async fn delete(&self, query: &str, vars: &Row) -> ConnectorResult<()> {
        self.execute(query, vars).await
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> ConnectorError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ConnectorError::connection_failed_with_source("database unreachable", err)
        }
        _ => ConnectorError::query_failed_with_source("query execution failed", err),
    }
}

/// Rewrite `:name` placeholders to positional `$n` parameters and collect
/// the bound values in order. A name appearing several times binds once.
/// `::` (cast syntax) and quoted literals are left untouched.
pub fn bind_named(query: &str, vars: &Row) -> ConnectorResult<(String, Vec<Value>)> {
    let mut sql = String::with_capacity(query.len());
    let mut names: Vec<String> = Vec::new();
    let mut chars = query.chars().peekable();
    let mut in_quote = false;
    let mut prev = '\0';

    while let Some(c) = chars.next() {
        if c == '\'' {
            in_quote = !in_quote;
            sql.push(c);
            prev = c;
            continue;
        }
        if in_quote || c != ':' || prev == ':' {
            sql.push(c);
            prev = c;
            continue;
        }
        // A lone ':' followed by an identifier is a named parameter; '::'
        // is a cast.
        if chars.peek() == Some(&':') {
            sql.push(c);
            prev = c;
            continue;
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            sql.push(c);
            prev = c;
            continue;
        }
        let index = match names.iter().position(|n| *n == name) {
            Some(i) => i,
            None => {
                names.push(name.clone());
                names.len() - 1
            }
        };
        sql.push_str(&format!("${}", index + 1));
        prev = '\0';
    }

    let mut binds = Vec::with_capacity(names.len());
    for name in &names {
        let value = vars
            .get(name)
            .ok_or_else(|| ConnectorError::invalid_query(format!("unbound variable ':{name}'")))?;
        binds.push(value.clone());
    }
    Ok((sql, binds))
}

fn decode_row(row: &PgRow) -> ConnectorResult<Row> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let type_name = {
            let raw = row
                .try_get_raw(i)
                .map_err(|e| ConnectorError::query_failed_with_source("row decode failed", e))?;
            if raw.is_null() {
                continue;
            }
            raw.type_info().name().to_string()
        };

        let decode_err =
            |e: sqlx::Error| ConnectorError::query_failed_with_source("row decode failed", e);
        let value = match type_name.as_str() {
            "BOOL" => Value::Bool(row.try_get::<bool, _>(i).map_err(decode_err)?),
            "INT2" => Value::Integer(i64::from(row.try_get::<i16, _>(i).map_err(decode_err)?)),
            "INT4" => Value::Integer(i64::from(row.try_get::<i32, _>(i).map_err(decode_err)?)),
            "INT8" => Value::Integer(row.try_get::<i64, _>(i).map_err(decode_err)?),
            "FLOAT4" => Value::Float(f64::from(row.try_get::<f32, _>(i).map_err(decode_err)?)),
            "FLOAT8" => Value::Float(row.try_get::<f64, _>(i).map_err(decode_err)?),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
                Value::String(row.try_get::<String, _>(i).map_err(decode_err)?)
            }
            "BYTEA" => Value::Bytes(row.try_get::<Vec<u8>, _>(i).map_err(decode_err)?),
            "TIMESTAMP" => Value::DateTime(
                row.try_get::<chrono::NaiveDateTime, _>(i)
                    .map_err(decode_err)?,
            ),
            "TIMESTAMPTZ" => Value::DateTime(
                row.try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                    .map_err(decode_err)?
                    .naive_utc(),
            ),
            "DATE" => Value::DateTime(
                row.try_get::<chrono::NaiveDate, _>(i)
                    .map_err(decode_err)?
                    .and_time(chrono::NaiveTime::MIN),
            ),
            "JSON" | "JSONB" => {
                let json = row
                    .try_get::<serde_json::Value, _>(i)
                    .map_err(decode_err)?;
                match Value::from_json(json) {
                    Some(value) => value,
                    None => continue,
                }
            }
            other => {
                return Err(ConnectorError::UnsupportedColumn {
                    column: column.name().to_string(),
                    type_name: other.to_string(),
                })
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}
