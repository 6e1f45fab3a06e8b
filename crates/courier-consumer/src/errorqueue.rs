//! Error queue with autoremediation
//!
//! Events that failed to apply are queued per (type, pkey) and retried in
//! FIFO order. When a new event arrives for a pkey that already has queued
//! events, the autoremediation policy may coalesce it with its immediate
//! predecessor; the coalesced event takes the position of the earliest
//! predecessor, so ordering across distinct pkeys is never affected.
//!
//! Coalescing never crosses a partially-processed event: once a handler
//! raised the partial flag, that entry must replay exactly as recorded, but
//! untouched neighbours elsewhere in the same pkey queue may still merge
//! among themselves.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use courier_core::{AttrDiff, Event, EventOp, Pkey};

use crate::config::RemediationPolicy;

/// One queued failed event with its retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub event: Event,
    pub error: Option<String>,
    /// Step recorded by the failing attempt, so the retry resumes there.
    #[serde(default)]
    pub resume_step: u32,
    /// True when the failing attempt had already mutated the target.
    #[serde(default)]
    pub partially_processed: bool,
}

impl QueuedEvent {
    fn key(&self) -> Option<(String, Pkey)> {
        match (&self.event.entity, &self.event.pkey) {
            (Some(entity), Some(pkey)) => Some((entity.clone(), pkey.clone())),
            _ => None,
        }
    }
}

enum Coalesce {
    /// Keep both events as they are.
    Keep,
    /// Replace the predecessor with the merged event and drop the last.
    Merge(QueuedEvent),
    /// Drop both events.
    Annihilate,
}

/// FIFO of failed events, indexed per (type, pkey).
#[derive(Debug, Default)]
pub struct ErrorQueue {
    queue: BTreeMap<u64, QueuedEvent>,
    index: BTreeMap<(String, Pkey), BTreeSet<u64>>,
    next_number: u64,
    policy: RemediationPolicy,
}

impl ErrorQueue {
    pub fn new(policy: RemediationPolicy) -> ErrorQueue {
        ErrorQueue {
            queue: BTreeMap::new(),
            index: BTreeMap::new(),
            next_number: 1,
            policy,
        }
    }

    /// Rebuild a queue from persisted entries.
    pub fn from_entries(
        policy: RemediationPolicy,
        entries: Vec<(u64, QueuedEvent)>,
    ) -> ErrorQueue {
        let mut queue = ErrorQueue::new(policy);
        for (number, entry) in entries {
            if entry.key().is_none() {
                warn!(number, "dropping queued event without identity");
                continue;
            }
            queue.next_number = queue.next_number.max(number + 1);
            queue.insert(number, entry);
        }
        queue
    }

    /// Persistable view of the queue.
    pub fn entries(&self) -> Vec<(u64, QueuedEvent)> {
        self.queue
            .iter()
            .map(|(number, entry)| (*number, entry.clone()))
            .collect()
    }

    /// Append a failed event, coalescing with its predecessor per the
    /// policy. Returns the assigned position, or `None` for events without
    /// an object identity.
    pub fn append(
        &mut self,
        event: Event,
        error: Option<String>,
        resume_step: u32,
        partially_processed: bool,
    ) -> Option<u64> {
        self.push(event, error, resume_step, partially_processed, true)
    }

    /// Append without coalescing, regardless of the policy. Initsync adds
    /// are authoritative and use this path.
    pub fn append_raw(&mut self, event: Event, error: Option<String>) -> Option<u64> {
        self.push(event, error, 0, false, false)
    }

    fn push(
        &mut self,
        event: Event,
        error: Option<String>,
        resume_step: u32,
        partially_processed: bool,
        coalesce: bool,
    ) -> Option<u64> {
        let entry = QueuedEvent {
            event,
            error,
            resume_step,
            partially_processed,
        };
        if entry.key().is_none() {
            warn!("refusing to enqueue an event without an object identity");
            return None;
        }

        let number = self.next_number;
        self.next_number += 1;
        self.insert(number, entry);

        if coalesce && self.policy != RemediationPolicy::Disabled {
            self.remediate_with_previous(number);
        }
        Some(number)
    }

    fn insert(&mut self, number: u64, entry: QueuedEvent) {
        if let Some(key) = entry.key() {
            self.index.entry(key).or_default().insert(number);
        }
        self.queue.insert(number, entry);
    }

    /// Remove one entry by position.
    pub fn remove(&mut self, number: u64) -> Option<QueuedEvent> {
        let entry = self.queue.remove(&number)?;
        if let Some(key) = entry.key() {
            if let Some(numbers) = self.index.get_mut(&key) {
                numbers.remove(&number);
                if numbers.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
        Some(entry)
    }

    /// Record the outcome of a failed retry.
    pub fn update_failure(
        &mut self,
        number: u64,
        error: String,
        resume_step: u32,
        partially_processed: bool,
    ) {
        if let Some(entry) = self.queue.get_mut(&number) {
            entry.error = Some(error);
            entry.resume_step = resume_step;
            entry.partially_processed = partially_processed;
        }
    }

    /// Head events, in queue order: for every (type, pkey) only the oldest
    /// entry is eligible, the ones behind it wait for it to drain.
    pub fn heads(&self) -> Vec<(u64, QueuedEvent)> {
        self.queue
            .iter()
            .filter(|(number, entry)| {
                entry
                    .key()
                    .and_then(|key| self.index.get(&key))
                    .and_then(|numbers| numbers.first())
                    .is_some_and(|first| first == *number)
            })
            .map(|(number, entry)| (*number, entry.clone()))
            .collect()
    }

    pub fn contains_object(&self, entity: &str, pkey: &Pkey) -> bool {
        self.index
            .contains_key(&(entity.to_string(), pkey.clone()))
    }

    /// Drop every queued event of one object.
    pub fn purge_object(&mut self, entity: &str, pkey: &Pkey) {
        let key = (entity.to_string(), pkey.clone());
        if let Some(numbers) = self.index.remove(&key) {
            for number in numbers {
                self.queue.remove(&number);
            }
        }
    }

    /// Iterate over all queued entries, for inspection.
    pub fn iter(&self) -> impl Iterator<Item = (&u64, &QueuedEvent)> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued event count per entity type, for `status`.
    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.queue.values() {
            if let Some(entity) = &entry.event.entity {
                *counts.entry(entity.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    // Schema evolution support

    /// Drop entries whose type is no longer declared.
    pub fn retain_known_types(&mut self, known: &BTreeSet<String>) {
        let stale: Vec<u64> = self
            .queue
            .iter()
            .filter(|(_, entry)| {
                entry
                    .event
                    .entity
                    .as_ref()
                    .is_some_and(|entity| !known.contains(entity))
            })
            .map(|(number, _)| *number)
            .collect();
        for number in stale {
            self.remove(number);
        }
    }

    /// Drop removed attributes from every queued event of one type.
    pub fn strip_attrs(&mut self, entity: &str, removed: &BTreeSet<String>) {
        for entry in self.queue.values_mut() {
            if entry.event.entity.as_deref() != Some(entity) {
                continue;
            }
            for attr in removed {
                entry.event.attrs.remove(attr);
                entry.event.diff.added.remove(attr);
                entry.event.diff.modified.remove(attr);
                entry.event.diff.removed.remove(attr);
                entry.event.fkeys.remove(attr);
            }
        }
    }

    /// Re-key queued events of one type after a pkey rename.
    pub fn migrate_pkeys(&mut self, entity: &str, mapping: &BTreeMap<Pkey, Pkey>) {
        let numbers: Vec<u64> = self.queue.keys().copied().collect();
        for number in numbers {
            let Some(entry) = self.queue.get(&number) else {
                continue;
            };
            if entry.event.entity.as_deref() != Some(entity) {
                continue;
            }
            let Some(old_pkey) = entry.event.pkey.clone() else {
                continue;
            };
            let Some(new_pkey) = mapping.get(&old_pkey) else {
                continue;
            };
            if let Some(mut entry) = self.remove(number) {
                entry.event.pkey = Some(new_pkey.clone());
                self.insert(number, entry);
            }
        }
    }

    fn remediate_with_previous(&mut self, last_number: u64) {
        let Some(last) = self.queue.get(&last_number).cloned() else {
            return;
        };
        let Some(key) = last.key() else {
            return;
        };
        let Some(numbers) = self.index.get(&key) else {
            return;
        };
        let mut ordered: Vec<u64> = numbers.iter().copied().collect();
        ordered.sort_unstable();
        if ordered.len() < 2 {
            return;
        }
        let prev_number = ordered[ordered.len() - 2];
        let Some(prev) = self.queue.get(&prev_number).cloned() else {
            return;
        };

        // A partially-applied event is the boundary nothing merges across.
        if prev.partially_processed {
            info!(
                prev = prev_number,
                last = last_number,
                "predecessor partially processed, events kept apart"
            );
            return;
        }

        match self.coalesce(&prev, &last) {
            Coalesce::Keep => {}
            Coalesce::Merge(merged) => {
                info!(
                    prev = prev_number,
                    last = last_number,
                    op = %merged.event.op,
                    "coalesced queued events"
                );
                self.remove(last_number);
                self.remove(prev_number);
                self.insert(prev_number, merged);
            }
            Coalesce::Annihilate => {
                info!(
                    prev = prev_number,
                    last = last_number,
                    "queued add and remove annihilated"
                );
                self.remove(last_number);
                self.remove(prev_number);
            }
        }
    }

    fn coalesce(&self, prev: &QueuedEvent, last: &QueuedEvent) -> Coalesce {
        let maximum = self.policy == RemediationPolicy::Maximum;

        match (prev.event.op, last.event.op) {
            (EventOp::Added, EventOp::Modified) => {
                let mut merged = prev.clone();
                last.event.diff.apply_to(&mut merged.event.attrs);
                merged.resume_step = 0;
                merged.partially_processed = false;
                Coalesce::Merge(merged)
            }
            (EventOp::Modified, EventOp::Modified) => {
                let mut merged = prev.clone();
                merged.event.diff.merge_later(&last.event.diff);
                merged.resume_step = 0;
                merged.partially_processed = false;
                Coalesce::Merge(merged)
            }
            (EventOp::Added, EventOp::Removed) if maximum => Coalesce::Annihilate,
            (EventOp::Removed, EventOp::Added) if maximum => {
                // The object existed on the target when the removal got
                // stuck; the net effect is a modification to the re-added
                // attributes.
                let mut merged = last.clone();
                merged.event.op = EventOp::Modified;
                merged.event.diff = AttrDiff {
                    added: BTreeMap::new(),
                    modified: std::mem::take(&mut merged.event.attrs),
                    removed: BTreeSet::new(),
                };
                merged.error = prev.error.clone();
                merged.resume_step = 0;
                merged.partially_processed = false;
                Coalesce::Merge(merged)
            }
            (EventOp::Modified, EventOp::Removed) if maximum => {
                let mut merged = last.clone();
                merged.error = prev.error.clone();
                Coalesce::Merge(merged)
            }
            _ => Coalesce::Keep,
        }
    }
}
