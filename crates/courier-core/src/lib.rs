//! # courier-core
//!
//! Core data model for the Courier CDC pipeline.
//!
//! Both sides of the pipeline are built on the same small set of pieces:
//!
//! - [`Value`] - typed, comparable attribute values with a JSON-safe
//!   canonical encoding
//! - [`Object`] / [`ObjectSet`] - realized rows and pkey-indexed sets of
//!   them, with diffing and multi-source merging
//! - [`Dataschema`] - the declared entity types, attribute classes and
//!   foreign keys, versioned and comparable across revisions
//! - [`Event`] - the typed change events flowing over the bus
//! - [`CacheDir`] - atomically-replaced, self-describing persisted state
//! - [`Alerter`] - operator mail alerts on error-state changes

pub mod alert;
pub mod cachefile;
pub mod ctl;
pub mod diff;
pub mod error;
pub mod event;
pub mod foreignkey;
pub mod object;
pub mod objectset;
pub mod pkey;
pub mod schema;
pub mod value;

pub use alert::{Alerter, MailConfig};
pub use cachefile::CacheDir;
pub use ctl::{CtlRequest, CtlResponse};
pub use diff::{AttrDiff, SetDiff};
pub use error::{CoreError, CoreResult};
pub use event::{Event, EventIdentity, EventOp};
pub use object::Object;
pub use objectset::{ObjectSet, PkeyMergeConstraint};
pub use pkey::Pkey;
pub use schema::{Dataschema, ForeignKeyRef, PkeyAttr, SchemaDiff, TypeDecl, TypeSchema};
pub use value::Value;
