//! Connector error types
//!
//! Errors raised by datasource drivers and by attribute projection, with
//! transient/permanent classification so callers can decide whether a source
//! is worth retrying this tick.

use thiserror::Error;

/// Error raised by a datasource driver or the projection engine.
#[derive(Debug, Error)]
pub enum ConnectorError {
    // Connection errors (transient)
    /// Failed to establish a connection to the source.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection timed out.
    #[error("connection timeout after {timeout_secs} seconds")]
    ConnectionTimeout { timeout_secs: u64 },

    /// Source is temporarily unavailable.
    #[error("source unavailable: {message}")]
    SourceUnavailable { message: String },

    // Authentication errors (permanent)
    /// Invalid credentials for the source.
    #[error("authentication failed: invalid credentials")]
    AuthenticationFailed,

    // Query errors (permanent)
    /// Query text or bound variables are invalid.
    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    /// Query execution failed on the source side.
    #[error("query failed: {message}")]
    QueryFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A fetched value could not be represented as a typed value.
    #[error("unsupported column '{column}' of type '{type_name}'")]
    UnsupportedColumn { column: String, type_name: String },

    // Projection errors (per row, recoverable)
    /// A mapping expression could not be parsed at compile time.
    #[error("invalid expression for attribute '{attribute}': {message}")]
    InvalidExpression { attribute: String, message: String },

    /// A filter referenced in an expression is not registered.
    #[error("unknown filter '{name}'")]
    UnknownFilter { name: String },

    /// A filter failed while projecting one row.
    #[error("filter '{filter}' failed on attribute '{attribute}': {message}")]
    FilterFailed {
        filter: String,
        attribute: String,
        message: String,
    },

    /// Projection of one row failed.
    #[error("projection failed for attribute '{attribute}': {message}")]
    ProjectionFailed { attribute: String, message: String },

    // Configuration errors (fatal at startup)
    /// Driver configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// No datasource registered under the given name.
    #[error("datasource '{name}' is not registered")]
    UnknownDatasource { name: String },
}

impl ConnectorError {
    /// Check if this error is transient: the source may come back on the
    /// next tick without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConnectionFailed { .. }
                | ConnectorError::ConnectionTimeout { .. }
                | ConnectorError::SourceUnavailable { .. }
        )
    }

    // Convenience constructors

    pub fn connection_failed(message: impl Into<String>) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn query_failed(message: impl Into<String>) -> Self {
        ConnectorError::QueryFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn query_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::QueryFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        ConnectorError::InvalidQuery {
            message: message.into(),
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        ConnectorError::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn projection_failed(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        ConnectorError::ProjectionFailed {
            attribute: attribute.into(),
            message: message.into(),
        }
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
