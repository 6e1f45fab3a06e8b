//! Consumer persisted state
//!
//! Layout mirrors the producer cache directory: one file per type, a
//! `trashbin_<type>` file per type, plus `_dataschema`, `_errorqueue` and
//! `_offsets`. All files are atomically replaced and self-describing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use courier_core::{CacheDir, Dataschema, Object, ObjectSet, Pkey};

use crate::config::RemediationPolicy;
use crate::error::ConsumerResult;
use crate::errorqueue::{ErrorQueue, QueuedEvent};
use crate::trashbin::Trashbin;

const SCHEMA_FILE: &str = "_dataschema";
const OFFSETS_FILE: &str = "_offsets";
const ERRORQUEUE_FILE: &str = "_errorqueue";

/// Bus positions of this consumer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Offsets {
    /// Next offset to consume.
    pub next: Option<i64>,
    /// Offsets of the initsync window this consumer bootstrapped from.
    pub init_start: Option<i64>,
    pub init_stop: Option<i64>,
}

/// The consumer's local state: schema, object caches, trashbins, offsets.
pub struct ConsumerState {
    cache_dir: CacheDir,
    pub schema: Option<Dataschema>,
    pub data: BTreeMap<String, ObjectSet>,
    pub trashbin: BTreeMap<String, Trashbin>,
    pub offsets: Offsets,
}

impl ConsumerState {
    /// Load the persisted state, if any.
    pub fn load(cache_dir: CacheDir) -> ConsumerResult<ConsumerState> {
        let schema: Option<Dataschema> = cache_dir
            .load::<Dataschema>(SCHEMA_FILE)?
            .map(|(_, schema)| schema);

        let mut data = BTreeMap::new();
        let mut trashbin = BTreeMap::new();
        if let Some(schema) = &schema {
            for entity in schema.type_names() {
                let set = cache_dir
                    .load::<ObjectSet>(entity)?
                    .map(|(_, set)| set)
                    .unwrap_or_default();
                data.insert(entity.to_string(), set);

                let bin = cache_dir
                    .load::<Trashbin>(&format!("trashbin_{entity}"))?
                    .map(|(_, bin)| bin)
                    .unwrap_or_default();
                trashbin.insert(entity.to_string(), bin);
            }
        }

        let offsets = cache_dir
            .load::<Offsets>(OFFSETS_FILE)?
            .map(|(_, offsets)| offsets)
            .unwrap_or_default();

        Ok(ConsumerState {
            cache_dir,
            schema,
            data,
            trashbin,
            offsets,
        })
    }

    /// Persist schema, caches, trashbins and offsets.
    pub fn save(&self) -> ConsumerResult<()> {
        let revision = self.schema.as_ref().map_or(0, |s| s.revision);
        if let Some(schema) = &self.schema {
            self.cache_dir.save(SCHEMA_FILE, revision, schema)?;
            for entity in schema.type_names() {
                if let Some(set) = self.data.get(entity) {
                    self.cache_dir.save(entity, revision, set)?;
                }
                if let Some(bin) = self.trashbin.get(entity) {
                    self.cache_dir
                        .save(&format!("trashbin_{entity}"), revision, bin)?;
                }
            }
        }
        self.cache_dir.save(OFFSETS_FILE, revision, &self.offsets)?;
        Ok(())
    }

    /// Load the persisted error queue under the configured policy.
    pub fn load_error_queue(&self, policy: RemediationPolicy) -> ConsumerResult<ErrorQueue> {
        let entries: Vec<(u64, QueuedEvent)> = self
            .cache_dir
            .load(ERRORQUEUE_FILE)?
            .map(|(_, entries)| entries)
            .unwrap_or_default();
        Ok(ErrorQueue::from_entries(policy, entries))
    }

    pub fn save_error_queue(&self, queue: &ErrorQueue) -> ConsumerResult<()> {
        let revision = self.schema.as_ref().map_or(0, |s| s.revision);
        self.cache_dir
            .save(ERRORQUEUE_FILE, revision, &queue.entries())?;
        Ok(())
    }

    /// Install a schema, creating empty caches for newly-declared types.
    pub fn set_schema(&mut self, schema: Dataschema) {
        for entity in schema.type_names() {
            self.data.entry(entity.to_string()).or_default();
            self.trashbin.entry(entity.to_string()).or_default();
        }
        self.schema = Some(schema);
    }

    /// Drop a type entirely: cache, trashbin, and their files.
    pub fn drop_type(&mut self, entity: &str) -> ConsumerResult<()> {
        self.data.remove(entity);
        self.trashbin.remove(entity);
        self.cache_dir.delete(entity)?;
        self.cache_dir.delete(&format!("trashbin_{entity}"))?;
        Ok(())
    }

    /// Whether a full initsync sequence has been applied.
    pub fn has_initialized(&self) -> bool {
        match (self.offsets.init_stop, self.offsets.next) {
            (Some(stop), Some(next)) => self.offsets.init_start.is_some() && next >= stop,
            _ => false,
        }
    }

    /// Look up an object in the live cache or the trashbin.
    pub fn object_or_trashed(&self, entity: &str, pkey: &Pkey) -> Option<Object> {
        if let Some(obj) = self.data.get(entity).and_then(|set| set.get(pkey)) {
            return Some(obj.clone());
        }
        self.trashbin
            .get(entity)
            .and_then(|bin| bin.get(pkey))
            .map(|entry| entry.object.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{PkeyAttr, TypeSchema, Value};
    use std::collections::BTreeSet;

    fn schema() -> Dataschema {
        Dataschema::new(
            1,
            vec![(
                "Users".to_string(),
                TypeSchema {
                    attributes: ["uid"].iter().map(ToString::to_string).collect(),
                    secrets: BTreeSet::new(),
                    cacheonly: BTreeSet::new(),
                    local: BTreeSet::new(),
                    pkey: PkeyAttr::Single("uid".to_string()),
                    foreign_keys: BTreeMap::new(),
                    to_string: None,
                },
            )],
        )
    }

    fn obj(uid: i64) -> Object {
        let attrs = [("uid".to_string(), Value::from(uid))].into_iter().collect();
        Object::from_attrs("Users", schema().get("Users").unwrap(), attrs).unwrap()
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut state = ConsumerState::load(CacheDir::open(dir.path()).unwrap()).unwrap();
            state.set_schema(schema());
            state
                .data
                .get_mut("Users")
                .unwrap()
                .insert(obj(1));
            state.offsets.next = Some(42);
            state.save().unwrap();
        }

        let state = ConsumerState::load(CacheDir::open(dir.path()).unwrap()).unwrap();
        assert!(state.schema.is_some());
        assert!(state.data["Users"].contains(&Pkey::from(1)));
        assert_eq!(state.offsets.next, Some(42));
    }

    #[test]
    fn test_has_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ConsumerState::load(CacheDir::open(dir.path()).unwrap()).unwrap();
        assert!(!state.has_initialized());

        state.offsets.init_start = Some(0);
        state.offsets.init_stop = Some(10);
        state.offsets.next = Some(5);
        assert!(!state.has_initialized());

        state.offsets.next = Some(11);
        assert!(state.has_initialized());
    }

    #[test]
    fn test_drop_type_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ConsumerState::load(CacheDir::open(dir.path()).unwrap()).unwrap();
        state.set_schema(schema());
        state.data.get_mut("Users").unwrap().insert(obj(1));
        state.save().unwrap();
        assert!(dir.path().join("Users").exists());

        state.drop_type("Users").unwrap();
        assert!(!dir.path().join("Users").exists());
        assert!(state.data.get("Users").is_none());
    }

    #[test]
    fn test_object_or_trashed() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ConsumerState::load(CacheDir::open(dir.path()).unwrap()).unwrap();
        state.set_schema(schema());
        state
            .trashbin
            .get_mut("Users")
            .unwrap()
            .insert(obj(2), chrono::Utc::now());

        assert!(state.object_or_trashed("Users", &Pkey::from(2)).is_some());
        assert!(state.object_or_trashed("Users", &Pkey::from(9)).is_none());
    }
}
