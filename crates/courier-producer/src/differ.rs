//! Snapshot differ
//!
//! Diffs the post-integrity snapshot against the persisted cache and turns
//! the result into ordered events: adds and modifies in declared type
//! order, removals in reverse type order, `added -> modified -> removed`
//! within a type. Across cycles no reordering occurs.

use std::collections::BTreeMap;

use tracing::info;

use courier_core::{Dataschema, Event, Object, ObjectSet};

/// One event of a cycle, paired with the object it concerns so the emitter
/// can run commit hooks and advance the cache.
#[derive(Debug, Clone)]
pub struct CycleEvent {
    pub entity: String,
    pub event: Event,
    /// The post-fetch object for adds/modifies, the cached object for
    /// removals.
    pub object: Object,
}

/// Compute the ordered event stream for one cycle.
pub fn diff_snapshot(
    schema: &Dataschema,
    new: &BTreeMap<String, ObjectSet>,
    old: &BTreeMap<String, ObjectSet>,
    step: u64,
) -> Vec<CycleEvent> {
    let empty = ObjectSet::new();
    let rev = schema.revision;
    let mut events = Vec::new();

    let mut diffs = BTreeMap::new();
    for entity in schema.type_names() {
        let new_set = new.get(entity).unwrap_or(&empty);
        let old_set = old.get(entity).unwrap_or(&empty);
        let Some(type_schema) = schema.get(entity) else {
            continue;
        };
        let diff = new_set.diff_from(old_set, type_schema);
        if !diff.is_empty() {
            info!(entity, changes = %diff.summary(), "snapshot changed");
        }
        diffs.insert(entity.to_string(), diff);
    }

    // Adds and modifies walk the declared order.
    for entity in schema.type_names() {
        let Some(type_schema) = schema.get(entity) else {
            continue;
        };
        let Some(diff) = diffs.get(entity) else {
            continue;
        };
        for obj in &diff.added {
            events.push(CycleEvent {
                entity: entity.to_string(),
                event: Event::added(entity, obj, type_schema, step, rev),
                object: obj.clone(),
            });
        }
        for (obj, attr_diff) in &diff.modified {
            events.push(CycleEvent {
                entity: entity.to_string(),
                event: Event::modified(entity, obj.pkey.clone(), attr_diff.clone(), step, rev),
                object: obj.clone(),
            });
        }
    }

    // Removals walk the reverse order so children disappear before their
    // parents.
    for entity in schema.type_names().rev() {
        let Some(type_schema) = schema.get(entity) else {
            continue;
        };
        let Some(diff) = diffs.get(entity) else {
            continue;
        };
        for obj in &diff.removed {
            events.push(CycleEvent {
                entity: entity.to_string(),
                event: Event::removed(entity, obj, type_schema, step, rev),
                object: obj.clone(),
            });
        }
    }

    events
}
