//! Consumer error types

use thiserror::Error;

use courier_bus::BusError;
use courier_core::CoreError;

/// Error raised by the consumer engine.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Runtime configuration is invalid; fatal at startup.
    #[error("invalid consumer configuration: {message}")]
    ConfigInvalid { message: String },

    /// The announced schema cannot be reconciled with local state.
    #[error("incompatible dataschema: {message}")]
    SchemaIncompatible { message: String },

    /// An event arrived before any schema was known.
    #[error("received a change event for '{entity}' before any dataschema")]
    NoSchema { entity: String },

    /// Core data model or cache failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Bus failure.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl ConsumerError {
    pub fn config_invalid(message: impl Into<String>) -> Self {
        ConsumerError::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn schema_incompatible(message: impl Into<String>) -> Self {
        ConsumerError::SchemaIncompatible {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ConsumerError::Core(e) => e.is_transient(),
            ConsumerError::Bus(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type for consumer operations.
pub type ConsumerResult<T> = Result<T, ConsumerError>;
