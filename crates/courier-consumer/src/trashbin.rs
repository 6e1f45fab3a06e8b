//! Trashbin
//!
//! Removed objects are staged here with their deletion timestamp instead
//! of being destroyed immediately, so an object that reappears within the
//! retention window is restored without a target `add`. A periodic sweep
//! physically deletes expired entries. The trashbin is persisted across
//! restarts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use courier_core::{Object, Pkey};

/// One trashed object with its deletion timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashEntry {
    pub object: Object,
    pub deleted_at: DateTime<Utc>,
}

/// Per-type trashbin, indexed by pkey.
#[derive(Debug, Clone, Default)]
pub struct Trashbin {
    entries: BTreeMap<Pkey, TrashEntry>,
}

impl Trashbin {
    pub fn new() -> Trashbin {
        Trashbin::default()
    }

    /// Stage an object for deferred deletion.
    pub fn insert(&mut self, object: Object, deleted_at: DateTime<Utc>) {
        self.entries.insert(
            object.pkey.clone(),
            TrashEntry { object, deleted_at },
        );
    }

    pub fn contains(&self, pkey: &Pkey) -> bool {
        self.entries.contains_key(pkey)
    }

    pub fn get(&self, pkey: &Pkey) -> Option<&TrashEntry> {
        self.entries.get(pkey)
    }

    /// Take an object back out of the trashbin (a re-add within the
    /// retention window).
    pub fn restore(&mut self, pkey: &Pkey) -> Option<Object> {
        self.entries.remove(pkey).map(|entry| entry.object)
    }

    pub fn remove(&mut self, pkey: &Pkey) -> Option<TrashEntry> {
        self.entries.remove(pkey)
    }

    /// Pkeys whose retention expired, in pkey order.
    pub fn expired(&self, retention_days: u32, now: DateTime<Utc>) -> Vec<Pkey> {
        let limit = now - Duration::days(i64::from(retention_days));
        self.entries
            .iter()
            .filter(|(_, entry)| entry.deleted_at < limit)
            .map(|(pkey, _)| pkey.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrashEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Trashbin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.values())
    }
}

impl<'de> Deserialize<'de> for Trashbin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<TrashEntry>::deserialize(deserializer)?;
        let mut bin = Trashbin::new();
        for entry in entries {
            bin.entries.insert(entry.object.pkey.clone(), entry);
        }
        Ok(bin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{PkeyAttr, TypeSchema, Value};
    use std::collections::BTreeSet;

    fn obj(uid: i64) -> Object {
        let schema = TypeSchema {
            attributes: ["uid"].iter().map(ToString::to_string).collect(),
            secrets: BTreeSet::new(),
            cacheonly: BTreeSet::new(),
            local: BTreeSet::new(),
            pkey: PkeyAttr::Single("uid".to_string()),
            foreign_keys: BTreeMap::new(),
            to_string: None,
        };
        let attrs = [("uid".to_string(), Value::from(uid))].into_iter().collect();
        Object::from_attrs("Users", &schema, attrs).unwrap()
    }

    #[test]
    fn test_insert_restore() {
        let mut bin = Trashbin::new();
        bin.insert(obj(1), Utc::now());
        assert!(bin.contains(&Pkey::from(1)));

        let restored = bin.restore(&Pkey::from(1)).unwrap();
        assert_eq!(restored.pkey, Pkey::from(1));
        assert!(bin.is_empty());
    }

    #[test]
    fn test_expiry_respects_retention() {
        let now = Utc::now();
        let mut bin = Trashbin::new();
        bin.insert(obj(1), now - Duration::days(10));
        bin.insert(obj(2), now - Duration::hours(1));

        let expired = bin.expired(7, now);
        assert_eq!(expired, vec![Pkey::from(1)]);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut bin = Trashbin::new();
        bin.insert(obj(1), Utc::now());
        let json = serde_json::to_string(&bin).unwrap();
        let back: Trashbin = serde_json::from_str(&json).unwrap();
        assert!(back.contains(&Pkey::from(1)));
    }
}
