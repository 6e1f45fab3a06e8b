//! Foreign-key policy engine
//!
//! When a foreign-key relative of an event has pending errors, applying the
//! event could observe or create an inconsistent target state. The policy
//! decides which events are deferred behind the erroring object instead of
//! being applied; deferred events join the error queue with a
//! `foreignkey_blocked` diagnostic and drain in arrival order once the
//! blocker clears.

use std::collections::BTreeMap;

use courier_core::{foreignkey, Dataschema, Event, EventOp, Pkey, Value};

use crate::config::ForeignKeysPolicy;
use crate::errorqueue::ErrorQueue;
use crate::state::ConsumerState;

/// Decide whether `event` must be deferred. Returns the diagnostic to
/// queue it under, or `None` to proceed.
pub fn blocking_reason(
    policy: ForeignKeysPolicy,
    event: &Event,
    schema: &Dataschema,
    state: &ConsumerState,
    queue: &ErrorQueue,
) -> Option<String> {
    if policy == ForeignKeysPolicy::Disabled || queue.is_empty() {
        return None;
    }
    let entity = event.entity.as_deref()?;
    let pkey = event.pkey.as_ref()?;
    let type_schema = schema.get(entity)?;

    // Child side: the event's object references a parent with queued
    // errors.
    let attrs = fk_attrs(event, state);
    for (parent_type, parent_pkey) in foreignkey::parent_refs(type_schema, &attrs) {
        if queue.contains_object(&parent_type, &parent_pkey) {
            return Some(format!(
                "foreignkey_blocked: parent {parent_type}[{parent_pkey}] has pending errors"
            ));
        }
    }

    // Parent side: removing an object whose children still have queued
    // errors.
    if policy == ForeignKeysPolicy::OnRemoveEvent
        && event.op == EventOp::Removed
        && children_errored(schema, state, queue, entity, pkey)
    {
        return Some(format!(
            "foreignkey_blocked: children of {entity}[{pkey}] have pending errors"
        ));
    }

    None
}

/// Attribute values relevant for foreign-key resolution of one event.
fn fk_attrs(event: &Event, state: &ConsumerState) -> BTreeMap<String, Value> {
    match event.op {
        EventOp::Added => event.attrs.clone(),
        // Removals carry their foreign-key linkage explicitly.
        EventOp::Removed => event.fkeys.clone(),
        EventOp::Modified => {
            let mut attrs = match (&event.entity, &event.pkey) {
                (Some(entity), Some(pkey)) => state
                    .object_or_trashed(entity, pkey)
                    .map(|obj| obj.attrs().clone())
                    .unwrap_or_default(),
                _ => BTreeMap::new(),
            };
            event.diff.apply_to(&mut attrs);
            attrs
        }
        _ => BTreeMap::new(),
    }
}

/// Whether any queued event belongs to a child object referencing
/// `entity[pkey]` through a declared foreign key.
fn children_errored(
    schema: &Dataschema,
    state: &ConsumerState,
    queue: &ErrorQueue,
    entity: &str,
    pkey: &Pkey,
) -> bool {
    let Pkey::Single(parent_value) = pkey else {
        // Foreign keys point at scalar parent attributes.
        return false;
    };

    for child_type in schema.type_names() {
        let Some(child_schema) = schema.get(child_type) else {
            continue;
        };
        let referencing: Vec<&String> = child_schema
            .foreign_keys
            .iter()
            .filter(|(_, fkey)| fkey.to_type == entity)
            .map(|(attr, _)| attr)
            .collect();
        if referencing.is_empty() {
            continue;
        }

        for (_, queued) in queue.iter() {
            if queued.event.entity.as_deref() != Some(child_type) {
                continue;
            }
            let attrs = fk_attrs(&queued.event, state);
            for attr in &referencing {
                if attrs.get(attr.as_str()) == Some(parent_value) {
                    return true;
                }
            }
        }
    }
    false
}
