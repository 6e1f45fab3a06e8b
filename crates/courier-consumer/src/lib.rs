//! # courier-consumer
//!
//! Consumer engine for the Courier CDC pipeline.
//!
//! A consumer subscribes to the event stream, keeps a local cache of the
//! producer's snapshot, and applies every change to an arbitrary target
//! through the [`TargetHandler`] plugin trait. Eventual consistency under
//! partial failure comes from four cooperating pieces:
//!
//! - the [`ErrorQueue`] retries failed events per (type, pkey) in FIFO
//!   order, optionally coalescing queued events under the
//!   `conservative`/`maximum` autoremediation policies;
//! - the foreign-key policy defers events whose relatives have pending
//!   errors;
//! - the [`Trashbin`] defers physical deletion for a retention window, so
//!   a re-add restores the object without a target `add`;
//! - the schema [`evolver`] reconciles the local type registry whenever
//!   the producer announces a new revision.
//!
//! The bus offset is persisted only after an event was applied or durably
//! enqueued, which together with idempotent targets yields at-least-once,
//! drift-free delivery.

pub mod applier;
pub mod config;
pub mod error;
pub mod errorqueue;
pub mod evolver;
pub mod fkpolicy;
pub mod initsync;
pub mod state;
pub mod target;
pub mod trashbin;

pub use applier::Applier;
pub use config::{ConsumerSettings, ForeignKeysPolicy, RemediationPolicy};
pub use error::{ConsumerError, ConsumerResult};
pub use errorqueue::{ErrorQueue, QueuedEvent};
pub use evolver::evolve;
pub use fkpolicy::blocking_reason;
pub use initsync::{find_initsync_window, run_initsync, InitsyncWindow};
pub use state::{ConsumerState, Offsets};
pub use target::{ApplyContext, ApplyOutcome, BoxedTarget, NullTarget, TargetHandler};
pub use trashbin::{TrashEntry, Trashbin};
