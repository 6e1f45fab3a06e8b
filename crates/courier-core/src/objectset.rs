//! Object sets
//!
//! A pkey-indexed collection of objects of one type, with duplicate
//! detection, multi-source merging under the per-source pkey constraint, and
//! set-level diffing. This is the in-memory shape of both the fetched
//! snapshots and the persisted caches.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::diff::SetDiff;
use crate::object::Object;
use crate::pkey::Pkey;
use crate::schema::TypeSchema;

/// Constraint on pkey membership enforced when merging one source's rows
/// into the already-merged set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PkeyMergeConstraint {
    /// No check.
    #[default]
    NoConstraint,
    /// Incoming pkeys must not already be present; overlaps are dropped.
    MustNotExist,
    /// Incoming pkeys must already be present; new ones are ignored.
    MustAlreadyExist,
    /// Keep only the intersection of both sides.
    MustExistInBoth,
}

impl PkeyMergeConstraint {
    pub fn as_str(&self) -> &'static str {
        match self {
            PkeyMergeConstraint::NoConstraint => "noConstraint",
            PkeyMergeConstraint::MustNotExist => "mustNotExist",
            PkeyMergeConstraint::MustAlreadyExist => "mustAlreadyExist",
            PkeyMergeConstraint::MustExistInBoth => "mustExistInBoth",
        }
    }
}

/// Pkey-indexed set of objects of one entity type.
///
/// The diagnostic sets (`inconsistencies`, `merge_conflicts`,
/// `merge_filtered`, `integrity_filtered`) are per-cycle working state and
/// are not persisted.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    objects: std::collections::BTreeMap<Pkey, Object>,
    /// Pkeys seen more than once in a single source.
    pub inconsistencies: BTreeSet<Pkey>,
    /// Pkeys dropped because two sources disagreed on an attribute value.
    pub merge_conflicts: BTreeSet<Pkey>,
    /// Pkeys filtered out by merge constraints.
    pub merge_filtered: BTreeSet<Pkey>,
    /// Pkeys filtered out by integrity constraints.
    pub integrity_filtered: BTreeSet<Pkey>,
}

impl ObjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_objects(objects: impl IntoIterator<Item = Object>) -> Self {
        let mut set = Self::new();
        for obj in objects {
            set.insert(obj);
        }
        set
    }

    /// Insert an object. A second object with the same pkey marks the pkey
    /// as inconsistent and evicts both; later inserts of a known-bad pkey
    /// are ignored.
    pub fn insert(&mut self, obj: Object) {
        let pkey = obj.pkey.clone();
        if self.inconsistencies.contains(&pkey) || self.merge_conflicts.contains(&pkey) {
            debug!(%pkey, "ignoring insert of pkey already known as inconsistent");
            return;
        }
        if self.objects.contains_key(&pkey) {
            warn!(%pkey, "duplicate pkey met, evicting both entries");
            self.inconsistencies.insert(pkey.clone());
            self.objects.remove(&pkey);
            return;
        }
        self.objects.insert(pkey, obj);
    }

    /// Replace an existing object (same pkey, new values).
    pub fn replace(&mut self, obj: Object) {
        self.objects.insert(obj.pkey.clone(), obj);
    }

    pub fn get(&self, pkey: &Pkey) -> Option<&Object> {
        self.objects.get(pkey)
    }

    pub fn contains(&self, pkey: &Pkey) -> bool {
        self.objects.contains_key(pkey)
    }

    pub fn remove(&mut self, pkey: &Pkey) -> Option<Object> {
        self.objects.remove(pkey)
    }

    pub fn pkeys(&self) -> BTreeSet<Pkey> {
        self.objects.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Merge one source's rows into this set, enforcing the pkey constraint.
    ///
    /// With `fail_on_conflict` (the `use_cached_entry` policy), an attribute
    /// disagreement evicts the row and records it in `merge_conflicts` so it
    /// can be replaced by its cached value later; otherwise the first value
    /// wins. Returns the pkeys filtered out by the constraint.
    pub fn merge_with(
        &mut self,
        incoming: Vec<Object>,
        constraint: PkeyMergeConstraint,
        fail_on_conflict: bool,
    ) -> BTreeSet<Pkey> {
        let mut merged: BTreeSet<Pkey> = BTreeSet::new();
        let mut to_remove: BTreeSet<Pkey> = BTreeSet::new();
        let mut ignored: BTreeSet<Pkey> = BTreeSet::new();

        for obj in incoming {
            let pkey = obj.pkey.clone();
            if !self.objects.contains_key(&pkey) {
                match constraint {
                    PkeyMergeConstraint::NoConstraint | PkeyMergeConstraint::MustNotExist => {
                        merged.insert(pkey);
                        self.insert(obj);
                    }
                    PkeyMergeConstraint::MustAlreadyExist
                    | PkeyMergeConstraint::MustExistInBoth => {
                        ignored.insert(pkey);
                    }
                }
            } else {
                match constraint {
                    PkeyMergeConstraint::NoConstraint
                    | PkeyMergeConstraint::MustAlreadyExist
                    | PkeyMergeConstraint::MustExistInBoth => {
                        merged.insert(pkey.clone());
                        if let Some(mut current) = self.objects.remove(&pkey) {
                            if current.merge_with(&obj, fail_on_conflict).is_ok() {
                                self.objects.insert(pkey, current);
                            } else {
                                self.merge_conflicts.insert(pkey);
                            }
                        }
                    }
                    PkeyMergeConstraint::MustNotExist => {
                        to_remove.insert(pkey);
                    }
                }
            }
        }

        if constraint == PkeyMergeConstraint::MustExistInBoth {
            for pkey in self.pkeys().difference(&merged) {
                to_remove.insert(pkey.clone());
            }
        }

        for pkey in &to_remove {
            self.objects.remove(pkey);
        }

        debug!(
            constraint = constraint.as_str(),
            merged = merged.len(),
            ignored = ignored.len(),
            removed = to_remove.len(),
            "pkey merge constraint enforced"
        );

        ignored.union(&to_remove).cloned().collect()
    }

    /// Replace entries evicted for inconsistency or merge conflict by their
    /// cached value, when one exists.
    pub fn replace_inconsistencies_with_cached(&mut self, cache: &ObjectSet) {
        let suspects: Vec<Pkey> = self
            .inconsistencies
            .iter()
            .chain(self.merge_conflicts.iter())
            .cloned()
            .collect();
        for pkey in suspects {
            match cache.get(&pkey) {
                Some(cached) => {
                    warn!(%pkey, "inconsistent entry found in cache, using cached value");
                    self.objects.insert(pkey, cached.clone());
                }
                None => {
                    warn!(%pkey, "inconsistent entry not found in cache, dropping it");
                }
            }
        }
    }

    /// Set-level diff against an older set, assuming `self` is the newer
    /// one.
    pub fn diff_from(&self, old: &ObjectSet, schema: &TypeSchema) -> SetDiff {
        let mut diff = SetDiff::default();
        let new_keys = self.pkeys();
        let old_keys = old.pkeys();

        for pkey in new_keys.difference(&old_keys) {
            diff.added.push(self.objects[pkey].clone());
        }
        for pkey in old_keys.difference(&new_keys) {
            diff.removed.push(old.objects[pkey].clone());
        }
        for pkey in new_keys.intersection(&old_keys) {
            let attr_diff = self.objects[pkey].diff_from(&old.objects[pkey], schema);
            if !attr_diff.is_empty() {
                diff.modified.push((self.objects[pkey].clone(), attr_diff));
            }
        }
        diff
    }
}

impl Serialize for ObjectSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.objects.values())
    }
}

impl<'de> Deserialize<'de> for ObjectSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let objects = Vec::<Object>::deserialize(deserializer)?;
        Ok(ObjectSet::from_objects(objects))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PkeyAttr;
    use crate::value::Value;
    use std::collections::BTreeMap;

    fn schema() -> TypeSchema {
        TypeSchema {
            attributes: ["uid", "mail"].iter().map(ToString::to_string).collect(),
            secrets: BTreeSet::new(),
            cacheonly: BTreeSet::new(),
            local: BTreeSet::new(),
            pkey: PkeyAttr::Single("uid".to_string()),
            foreign_keys: BTreeMap::new(),
            to_string: None,
        }
    }

    fn obj(uid: i64, mail: &str) -> Object {
        let attrs = [
            ("uid".to_string(), Value::from(uid)),
            ("mail".to_string(), Value::from(mail)),
        ]
        .into_iter()
        .collect();
        Object::from_attrs("Users", &schema(), attrs).unwrap()
    }

    fn set(uids: &[i64]) -> ObjectSet {
        ObjectSet::from_objects(uids.iter().map(|uid| obj(*uid, "x@y")))
    }

    #[test]
    fn test_duplicate_pkey_is_an_inconsistency() {
        let mut s = ObjectSet::new();
        s.insert(obj(1, "a@x"));
        s.insert(obj(1, "b@x"));
        assert!(s.is_empty());
        assert!(s.inconsistencies.contains(&Pkey::from(1)));
        // A third insert of the same pkey stays out.
        s.insert(obj(1, "c@x"));
        assert!(s.is_empty());
    }

    #[test]
    fn test_merge_no_constraint_unions() {
        let mut s = set(&[1, 2]);
        let filtered = s.merge_with(
            vec![obj(2, "x@y"), obj(3, "x@y")],
            PkeyMergeConstraint::NoConstraint,
            false,
        );
        assert!(filtered.is_empty());
        assert_eq!(s.pkeys(), set(&[1, 2, 3]).pkeys());
    }

    #[test]
    fn test_merge_must_not_exist_drops_overlap() {
        let mut s = set(&[1, 2]);
        let filtered = s.merge_with(
            vec![obj(2, "x@y"), obj(3, "x@y")],
            PkeyMergeConstraint::MustNotExist,
            false,
        );
        assert!(filtered.contains(&Pkey::from(2)));
        assert!(!s.contains(&Pkey::from(2)));
        assert!(s.contains(&Pkey::from(3)));
    }

    #[test]
    fn test_merge_must_already_exist_ignores_new() {
        let mut s = set(&[1, 2]);
        let filtered = s.merge_with(
            vec![obj(2, "x@y"), obj(3, "x@y")],
            PkeyMergeConstraint::MustAlreadyExist,
            false,
        );
        assert!(filtered.contains(&Pkey::from(3)));
        assert!(s.contains(&Pkey::from(1)));
        assert!(s.contains(&Pkey::from(2)));
        assert!(!s.contains(&Pkey::from(3)));
    }

    #[test]
    fn test_merge_must_exist_in_both_intersects() {
        // A: {1,2,3}, B: {2,3,4} -> {2,3}
        let mut s = set(&[1, 2, 3]);
        let filtered = s.merge_with(
            vec![obj(2, "x@y"), obj(3, "x@y"), obj(4, "x@y")],
            PkeyMergeConstraint::MustExistInBoth,
            false,
        );
        assert_eq!(s.pkeys(), set(&[2, 3]).pkeys());
        assert!(filtered.contains(&Pkey::from(1)));
        assert!(filtered.contains(&Pkey::from(4)));
    }

    #[test]
    fn test_merge_empty_source_semantics() {
        // mustAlreadyExist with an empty fetch drops nothing...
        let mut keep = set(&[1, 2]);
        keep.merge_with(vec![], PkeyMergeConstraint::MustAlreadyExist, false);
        assert_eq!(keep.len(), 2);

        // ...while mustExistInBoth drops everything.
        let mut drop_all = set(&[1, 2]);
        drop_all.merge_with(vec![], PkeyMergeConstraint::MustExistInBoth, false);
        assert!(drop_all.is_empty());
    }

    #[test]
    fn test_merge_conflict_eviction_and_cache_replacement() {
        let mut s = ObjectSet::new();
        s.insert(obj(1, "a@x"));
        s.merge_with(vec![obj(1, "b@x")], PkeyMergeConstraint::NoConstraint, true);
        assert!(!s.contains(&Pkey::from(1)));
        assert!(s.merge_conflicts.contains(&Pkey::from(1)));

        let mut cache = ObjectSet::new();
        cache.insert(obj(1, "cached@x"));
        s.replace_inconsistencies_with_cached(&cache);
        assert_eq!(
            s.get(&Pkey::from(1)).unwrap().get("mail"),
            Some(&Value::from("cached@x"))
        );
    }

    #[test]
    fn test_diff_from() {
        let new = set(&[2, 3]);
        let mut old = set(&[1, 2]);
        old.replace(obj(2, "old@x"));

        let diff = new.diff_from(&old, &schema());
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].pkey, Pkey::from(3));
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].pkey, Pkey::from(1));
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].0.pkey, Pkey::from(2));
    }

    #[test]
    fn test_serde_roundtrip_keeps_objects_only() {
        let mut s = set(&[1, 2]);
        s.merge_filtered.insert(Pkey::from(9));
        let json = serde_json::to_string(&s).unwrap();
        let back: ObjectSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pkeys(), s.pkeys());
        assert!(back.merge_filtered.is_empty());
    }
}
