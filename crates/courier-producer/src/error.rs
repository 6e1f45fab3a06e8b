//! Producer error types

use thiserror::Error;

use courier_bus::BusError;
use courier_connector::ConnectorError;
use courier_core::CoreError;

/// Error raised by the producer engine.
#[derive(Debug, Error)]
pub enum ProducerError {
    /// Datamodel configuration is invalid; fatal at startup.
    #[error("invalid datamodel configuration: {message}")]
    ConfigInvalid { message: String },

    /// Core data model or cache failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Datasource failure.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Bus failure; the cycle aborts without advancing the cache.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl ProducerError {
    pub fn config_invalid(message: impl Into<String>) -> Self {
        ProducerError::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Transient failures abort the current tick only.
    pub fn is_transient(&self) -> bool {
        match self {
            ProducerError::ConfigInvalid { .. } => false,
            ProducerError::Core(e) => e.is_transient(),
            ProducerError::Connector(e) => e.is_transient(),
            ProducerError::Bus(e) => e.is_transient(),
        }
    }
}

/// Result type for producer operations.
pub type ProducerResult<T> = Result<T, ProducerError>;
