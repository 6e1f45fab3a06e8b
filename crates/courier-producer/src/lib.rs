//! # courier-producer
//!
//! Producer engine for the Courier CDC pipeline.
//!
//! Change detection is purely differential: sources do not need a
//! change-log column. Each tick the engine fetches every declared source,
//! projects rows into typed objects, merges them per type under the
//! declared pkey and merge constraints, enforces cross-type integrity
//! constraints, diffs the result against the last-published cache and
//! publishes the ordered `added`/`modified`/`removed` stream. The cache
//! advances only with acknowledged events, so a crash or bus outage is
//! recovered by re-deriving the same events on the next tick.

pub mod config;
pub mod differ;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod integrity;
pub mod merge;
pub mod predicate;

pub use config::{DatamodelConfig, MergeConflictPolicy, QueryConfig, SourceConfig, TypeConfig};
pub use differ::{diff_snapshot, CycleEvent};
pub use emitter::{publish_cycle, publish_initsync, PublishOutcome};
pub use engine::{EngineStatus, ProducerEngine, TickReport, TypeStatus};
pub use error::{ProducerError, ProducerResult};
pub use fragment::{FetchedRows, SourceRuntime};
pub use integrity::enforce_integrity;
pub use merge::merge_type;
pub use predicate::Predicate;
