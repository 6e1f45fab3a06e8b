//! Local schema evolution
//!
//! When the producer announces a new schema revision, the consumer
//! reconciles its local state before consuming any further event: removed
//! types drop everything they own (cache, trashbin, queued events), removed
//! attributes are stripped from cached objects and queued events, and a
//! renamed primary key migrates every index in place - the immutable
//! remote pkey keeps object identity, so no client-visible event is
//! generated.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use courier_core::{Dataschema, ObjectSet, Pkey};

use crate::error::{ConsumerError, ConsumerResult};
use crate::errorqueue::ErrorQueue;
use crate::state::ConsumerState;

/// Reconcile local state with a newly-announced schema.
pub fn evolve(
    state: &mut ConsumerState,
    queue: &mut ErrorQueue,
    new_schema: Dataschema,
) -> ConsumerResult<()> {
    let Some(old_schema) = state.schema.clone() else {
        info!(revision = new_schema.revision, "installing first dataschema");
        state.set_schema(new_schema);
        return Ok(());
    };

    let diff = new_schema.diff_from(&old_schema);
    if diff.is_empty() {
        state.set_schema(new_schema);
        return Ok(());
    }
    info!(
        revision = new_schema.revision,
        added = ?diff.added,
        removed = ?diff.removed,
        modified = ?diff.modified,
        "evolving local dataschema"
    );

    for entity in &diff.removed {
        state.drop_type(entity)?;
    }
    let known: BTreeSet<String> = new_schema.type_names().map(ToString::to_string).collect();
    queue.retain_known_types(&known);

    for entity in &diff.modified {
        let (Some(new_type), Some(old_type)) = (new_schema.get(entity), old_schema.get(entity))
        else {
            continue;
        };

        // Attributes gone from the schema leave every cached object and
        // every queued event. Added attributes need nothing: new events
        // will populate them.
        let removed_attrs: BTreeSet<String> = old_type
            .attributes
            .difference(&new_type.attributes)
            .cloned()
            .collect();
        if !removed_attrs.is_empty() {
            if let Some(set) = state.data.get_mut(entity) {
                let mut stripped = ObjectSet::new();
                for mut obj in set.iter().cloned() {
                    for attr in &removed_attrs {
                        obj.remove_attr(attr);
                    }
                    stripped.insert(obj);
                }
                *set = stripped;
            }
            if let Some(bin) = state.trashbin.get_mut(entity) {
                let mut entries: Vec<_> = bin.iter().cloned().collect();
                for entry in &mut entries {
                    for attr in &removed_attrs {
                        entry.object.remove_attr(attr);
                    }
                }
                let mut rebuilt = crate::trashbin::Trashbin::new();
                for entry in entries {
                    rebuilt.insert(entry.object, entry.deleted_at);
                }
                *bin = rebuilt;
            }
            queue.strip_attrs(entity, &removed_attrs);
        }

        // Renamed primary key: re-index in place, silently.
        if new_type.pkey != old_type.pkey {
            info!(%entity, "migrating local cache to renamed primary key");
            let mut mapping: BTreeMap<Pkey, Pkey> = BTreeMap::new();

            if let Some(set) = state.data.get_mut(entity) {
                let mut migrated = ObjectSet::new();
                for mut obj in set.iter().cloned() {
                    let old_pkey = obj.pkey.clone();
                    obj.rekey(entity, new_type).map_err(|e| {
                        ConsumerError::schema_incompatible(format!(
                            "cannot migrate '{entity}' to new primary key: {e}"
                        ))
                    })?;
                    mapping.insert(old_pkey, obj.pkey.clone());
                    migrated.insert(obj);
                }
                *set = migrated;
            }

            if let Some(bin) = state.trashbin.get_mut(entity) {
                let entries: Vec<_> = bin.iter().cloned().collect();
                let mut rebuilt = crate::trashbin::Trashbin::new();
                for mut entry in entries {
                    let old_pkey = entry.object.pkey.clone();
                    entry.object.rekey(entity, new_type).map_err(|e| {
                        ConsumerError::schema_incompatible(format!(
                            "cannot migrate trashbin of '{entity}': {e}"
                        ))
                    })?;
                    mapping.insert(old_pkey, entry.object.pkey.clone());
                    rebuilt.insert(entry.object, entry.deleted_at);
                }
                *bin = rebuilt;
            }

            queue.migrate_pkeys(entity, &mapping);
        }
    }

    state.set_schema(new_schema);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemediationPolicy;
    use courier_core::{
        AttrDiff, CacheDir, Event, EventOp, Object, PkeyAttr, TypeSchema, Value,
    };

    fn type_schema(attrs: &[&str], pkey: &str) -> TypeSchema {
        TypeSchema {
            attributes: attrs.iter().map(ToString::to_string).collect(),
            secrets: BTreeSet::new(),
            cacheonly: BTreeSet::new(),
            local: BTreeSet::new(),
            pkey: PkeyAttr::Single(pkey.to_string()),
            foreign_keys: BTreeMap::new(),
            to_string: None,
        }
    }

    fn schema_v1() -> Dataschema {
        Dataschema::new(
            1,
            vec![
                ("Users".to_string(), type_schema(&["uid", "login", "mail"], "uid")),
                ("Groups".to_string(), type_schema(&["gid"], "gid")),
            ],
        )
    }

    fn state_with_v1() -> (tempfile::TempDir, ConsumerState) {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ConsumerState::load(CacheDir::open(dir.path()).unwrap()).unwrap();
        state.set_schema(schema_v1());

        let attrs = [
            ("uid".to_string(), Value::from(1)),
            ("login".to_string(), Value::from("alice")),
            ("mail".to_string(), Value::from("a@x")),
        ]
        .into_iter()
        .collect();
        let obj =
            Object::from_attrs("Users", schema_v1().get("Users").unwrap(), attrs).unwrap();
        state.data.get_mut("Users").unwrap().insert(obj);
        (dir, state)
    }

    #[test]
    fn test_first_schema_installs_directly() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ConsumerState::load(CacheDir::open(dir.path()).unwrap()).unwrap();
        let mut queue = ErrorQueue::new(RemediationPolicy::Disabled);
        evolve(&mut state, &mut queue, schema_v1()).unwrap();
        assert!(state.schema.is_some());
        assert!(state.data.contains_key("Users"));
    }

    #[test]
    fn test_removed_type_drops_everything() {
        let (_dir, mut state) = state_with_v1();
        let mut queue = ErrorQueue::new(RemediationPolicy::Disabled);
        queue.append(
            Event {
                op: EventOp::Modified,
                entity: Some("Groups".to_string()),
                pkey: Some(courier_core::Pkey::from(5)),
                step: 1,
                schema_rev: 1,
                attrs: BTreeMap::new(),
                diff: AttrDiff::default(),
                fkeys: BTreeMap::new(),
                schema: None,
            },
            None,
            0,
            false,
        );

        let mut v2 = schema_v1();
        v2.revision = 2;
        v2.types.retain(|decl| decl.name != "Groups");

        evolve(&mut state, &mut queue, v2).unwrap();
        assert!(!state.data.contains_key("Groups"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_removed_attribute_stripped_from_cache() {
        let (_dir, mut state) = state_with_v1();
        let mut queue = ErrorQueue::new(RemediationPolicy::Disabled);

        let mut v2 = Dataschema::new(
            2,
            vec![
                ("Users".to_string(), type_schema(&["uid", "login"], "uid")),
                ("Groups".to_string(), type_schema(&["gid"], "gid")),
            ],
        );
        v2.revision = 2;

        evolve(&mut state, &mut queue, v2).unwrap();
        let obj = state
            .data
            .get("Users")
            .unwrap()
            .get(&courier_core::Pkey::from(1))
            .unwrap();
        assert!(obj.get("mail").is_none());
        assert!(obj.get("login").is_some());
    }

    #[test]
    fn test_pkey_rename_migrates_index_silently() {
        let (_dir, mut state) = state_with_v1();
        let mut queue = ErrorQueue::new(RemediationPolicy::Disabled);

        let v2 = Dataschema::new(
            2,
            vec![
                ("Users".to_string(), type_schema(&["uid", "login", "mail"], "login")),
                ("Groups".to_string(), type_schema(&["gid"], "gid")),
            ],
        );

        evolve(&mut state, &mut queue, v2).unwrap();
        let set = state.data.get("Users").unwrap();
        assert!(set.contains(&courier_core::Pkey::from("alice")));
        assert!(!set.contains(&courier_core::Pkey::from(1)));

        // Identity survives: the remote pkey still carries the original
        // key.
        let obj = set.get(&courier_core::Pkey::from("alice")).unwrap();
        assert_eq!(obj.remote_pkey, courier_core::Pkey::from(1));
    }
}
