//! # courier-connector
//!
//! Datasource drivers and attribute projection for the Courier CDC
//! pipeline.
//!
//! Every backend is reached through the same capability trait,
//! [`Datasource`]: `fetch`, `add`, `modify`, `delete` with identical result
//! shapes, template-rendered query strings and native parameter binding.
//! Fetched rows are turned into local attributes by the [`Projection`]
//! engine: a sandboxed expression language with a fixed registry of pure
//! filters.
//!
//! ## Drivers
//!
//! - [`ldap::LdapDatasource`] - directory sources, search vars
//!   `base`/`scope`/`filter`/`attrlist`, structured mutation lists
//! - [`sql::PostgresDatasource`] - relational sources, `:name` parameter
//!   binding

pub mod error;
pub mod expr;
pub mod filters;
pub mod ldap;
pub mod projection;
pub mod registry;
pub mod sql;
pub mod traits;

pub use error::{ConnectorError, ConnectorResult};
pub use expr::Template;
pub use filters::{FilterFn, FilterRegistry};
pub use projection::{AttrMapping, Projection, RESERVED_VARS};
pub use registry::{DatasourceRegistry, DriverKind};
pub use traits::{run_query, BoxedDatasource, Datasource, QueryKind, Row};

// Re-export async_trait for driver implementors.
pub use async_trait::async_trait;
