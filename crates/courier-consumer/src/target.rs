//! Target plugin contract
//!
//! A target handler applies change events to an external system. Handlers
//! return a typed outcome instead of raising: `Applied`, `Retryable`
//! (enqueued and retried later) or `Fatal` (reported and dropped). The
//! mutable [`ApplyContext`] lets a handler record how far it got, so a
//! retried event resumes where it failed and the error queue knows it must
//! not coalesce across a partially-applied event.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use courier_core::{AttrDiff, Object, Pkey, Value};

/// Mutable context handed to every handler invocation.
#[derive(Debug, Clone, Default)]
pub struct ApplyContext {
    /// True when the event is re-invoked from the error queue.
    pub is_retry: bool,
    /// Resumable progress marker; a retried event starts from the step the
    /// previous attempt recorded.
    pub step: u32,
    /// Raised by the handler after its first non-idempotent mutation on
    /// the target.
    pub partially_processed: bool,
}

impl ApplyContext {
    pub fn retry(step: u32, partially_processed: bool) -> ApplyContext {
        ApplyContext {
            is_retry: true,
            step,
            partially_processed,
        }
    }

    /// Record progress past a non-idempotent mutation.
    pub fn mark_progress(&mut self, step: u32) {
        self.step = step;
        self.partially_processed = true;
    }
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The target reflects the event.
    Applied,
    /// Transient failure; the event is enqueued and retried later.
    Retryable(String),
    /// Permanent failure; the event is reported and dropped.
    Fatal(String),
}

/// Handlers applying events to a target system, keyed by operation.
///
/// The trashbin hooks default to no-ops: most targets only care about the
/// physical removal, which arrives through `on_removed` when the retention
/// window expires.
#[async_trait]
pub trait TargetHandler: Send + Sync {
    async fn on_added(
        &self,
        entity: &str,
        pkey: &Pkey,
        attrs: &BTreeMap<String, Value>,
        ctx: &mut ApplyContext,
    ) -> ApplyOutcome;

    async fn on_modified(
        &self,
        entity: &str,
        pkey: &Pkey,
        diff: &AttrDiff,
        cached: Option<&Object>,
        ctx: &mut ApplyContext,
    ) -> ApplyOutcome;

    async fn on_removed(
        &self,
        entity: &str,
        pkey: &Pkey,
        cached: Option<&Object>,
        ctx: &mut ApplyContext,
    ) -> ApplyOutcome;

    /// The object entered the trashbin (still recoverable).
    async fn on_trashed(
        &self,
        _entity: &str,
        _pkey: &Pkey,
        _cached: Option<&Object>,
        _ctx: &mut ApplyContext,
    ) -> ApplyOutcome {
        ApplyOutcome::Applied
    }

    /// Called once per loop iteration after caches were persisted.
    async fn on_save(&self) {}
}

/// Shared handle on a target handler.
pub type BoxedTarget = Arc<dyn TargetHandler>;

/// Target that accepts everything and does nothing; useful to validate a
/// deployment end to end before wiring a real target.
pub struct NullTarget;

#[async_trait]
impl TargetHandler for NullTarget {
    async fn on_added(
        &self,
        _entity: &str,
        _pkey: &Pkey,
        _attrs: &BTreeMap<String, Value>,
        _ctx: &mut ApplyContext,
    ) -> ApplyOutcome {
        ApplyOutcome::Applied
    }

    async fn on_modified(
        &self,
        _entity: &str,
        _pkey: &Pkey,
        _diff: &AttrDiff,
        _cached: Option<&Object>,
        _ctx: &mut ApplyContext,
    ) -> ApplyOutcome {
        ApplyOutcome::Applied
    }

    async fn on_removed(
        &self,
        _entity: &str,
        _pkey: &Pkey,
        _cached: Option<&Object>,
        _ctx: &mut ApplyContext,
    ) -> ApplyOutcome {
        ApplyOutcome::Applied
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Recorded handler invocation: `(operation, entity, pkey)`.
    pub(crate) type Call = (String, String, Pkey);

    /// Test target that records calls and fails on command.
    #[derive(Default)]
    pub(crate) struct RecordingTarget {
        pub calls: Mutex<Vec<Call>>,
        /// Outcome returned for the next invocations; `None` means
        /// `Applied`.
        pub next_outcome: Mutex<Option<ApplyOutcome>>,
    }

    impl RecordingTarget {
        pub fn new() -> Arc<RecordingTarget> {
            Arc::new(RecordingTarget::default())
        }

        pub fn fail_with(&self, outcome: ApplyOutcome) {
            if let Ok(mut next) = self.next_outcome.lock() {
                *next = Some(outcome);
            }
        }

        pub fn succeed(&self) {
            if let Ok(mut next) = self.next_outcome.lock() {
                *next = None;
            }
        }

        pub fn calls_of(&self, op: &str) -> Vec<Call> {
            self.calls
                .lock()
                .map(|calls| {
                    calls
                        .iter()
                        .filter(|(o, _, _)| o == op)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        }

        fn record(&self, op: &str, entity: &str, pkey: &Pkey) -> ApplyOutcome {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((op.to_string(), entity.to_string(), pkey.clone()));
            }
            self.next_outcome
                .lock()
                .ok()
                .and_then(|next| next.clone())
                .unwrap_or(ApplyOutcome::Applied)
        }
    }

    #[async_trait]
    impl TargetHandler for RecordingTarget {
        async fn on_added(
            &self,
            entity: &str,
            pkey: &Pkey,
            _attrs: &BTreeMap<String, Value>,
            _ctx: &mut ApplyContext,
        ) -> ApplyOutcome {
            self.record("added", entity, pkey)
        }

        async fn on_modified(
            &self,
            entity: &str,
            pkey: &Pkey,
            _diff: &AttrDiff,
            _cached: Option<&Object>,
            _ctx: &mut ApplyContext,
        ) -> ApplyOutcome {
            self.record("modified", entity, pkey)
        }

        async fn on_removed(
            &self,
            entity: &str,
            pkey: &Pkey,
            _cached: Option<&Object>,
            _ctx: &mut ApplyContext,
        ) -> ApplyOutcome {
            self.record("removed", entity, pkey)
        }

        async fn on_trashed(
            &self,
            entity: &str,
            pkey: &Pkey,
            _cached: Option<&Object>,
            _ctx: &mut ApplyContext,
        ) -> ApplyOutcome {
            self.record("trashed", entity, pkey)
        }
    }

    #[tokio::test]
    async fn test_null_target_applies_everything() {
        let target = NullTarget;
        let mut ctx = ApplyContext::default();
        let outcome = target
            .on_added("Users", &Pkey::from(1), &BTreeMap::new(), &mut ctx)
            .await;
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[test]
    fn test_mark_progress_sets_partial_flag() {
        let mut ctx = ApplyContext::default();
        assert!(!ctx.partially_processed);
        ctx.mark_progress(2);
        assert!(ctx.partially_processed);
        assert_eq!(ctx.step, 2);
    }
}
