//! Core error types
//!
//! Error definitions shared by the data model and the persisted caches, with
//! transient/permanent classification for retry logic.

use thiserror::Error;

/// Error that can occur in the core data model and cache layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A required primary-key attribute is absent from an object.
    #[error("primary key attribute '{attribute}' missing on object of type '{entity}'")]
    MissingPkeyAttribute { entity: String, attribute: String },

    /// Two sources produced different values for the same attribute.
    #[error("merging conflict on attribute '{attribute}' of pkey {pkey}")]
    MergeConflict { attribute: String, pkey: String },

    /// The dataschema received or loaded is not usable.
    #[error("invalid dataschema: {message}")]
    InvalidSchema { message: String },

    /// Foreign keys form a reference cycle.
    #[error("circular foreign key references found through '{through}'")]
    CircularForeignKeys { through: String },

    /// A cache file exists but cannot be decoded.
    #[error("corrupt cache file '{file}': {message}")]
    CorruptCache { file: String, message: String },

    /// A cache file declares an unsupported format version.
    #[error("cache file '{file}' has unsupported format version {version}")]
    UnsupportedCacheVersion { file: String, version: u32 },

    /// Filesystem error while reading or writing persisted state.
    #[error("cache i/o error on '{file}': {source}")]
    CacheIo {
        file: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Mail alert could not be composed or sent.
    #[error("mail alert failed: {message}")]
    Mail { message: String },
}

impl CoreError {
    /// Check if this error is transient and the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::CacheIo { .. } | CoreError::Mail { .. })
    }

    /// Create a corrupt-cache error.
    pub fn corrupt_cache(file: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::CorruptCache {
            file: file.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        CoreError::InvalidSchema {
            message: message.into(),
        }
    }

    /// Create a cache i/o error.
    pub fn cache_io(file: impl Into<String>, source: std::io::Error) -> Self {
        CoreError::CacheIo {
            file: file.into(),
            source,
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = CoreError::cache_io("Users", std::io::Error::other("disk full"));
        assert!(io.is_transient());

        let schema = CoreError::invalid_schema("missing pkey");
        assert!(!schema.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::MissingPkeyAttribute {
            entity: "Users".to_string(),
            attribute: "uid".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "primary key attribute 'uid' missing on object of type 'Users'"
        );
    }
}
