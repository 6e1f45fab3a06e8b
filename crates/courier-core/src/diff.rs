//! Attribute and set level differences
//!
//! [`AttrDiff`] describes how one object changed between two snapshots;
//! [`SetDiff`] describes how a whole object set changed. Both always expose
//! the three buckets `added`, `modified` and `removed`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::object::Object;
use crate::value::Value;

/// Attribute-level difference between two versions of one object.
///
/// `added` and `modified` carry the new values; `removed` carries only the
/// attribute names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttrDiff {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub added: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub modified: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub removed: BTreeSet<String>,
}

impl AttrDiff {
    /// True when no attribute changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Fold a later diff for the same object into this one, so that applying
    /// the merged diff is equivalent to applying both in sequence.
    pub fn merge_later(&mut self, later: &AttrDiff) {
        for (attr, value) in &later.added {
            // An attribute we already removed and that comes back is a
            // modification from the merged diff's point of view.
            if self.removed.remove(attr) {
                self.modified.insert(attr.clone(), value.clone());
            } else {
                self.added.insert(attr.clone(), value.clone());
            }
        }

        for (attr, value) in &later.modified {
            if self.added.contains_key(attr) {
                self.added.insert(attr.clone(), value.clone());
            } else {
                self.modified.insert(attr.clone(), value.clone());
            }
        }

        for attr in &later.removed {
            // Added then removed while both events were queued: the target
            // never saw the attribute, drop it entirely.
            if self.added.remove(attr).is_some() {
                continue;
            }
            self.modified.remove(attr);
            self.removed.insert(attr.clone());
        }
    }

    /// Apply this diff to a plain attribute map (used when folding a
    /// `modified` event into a queued `added` event).
    pub fn apply_to(&self, attrs: &mut BTreeMap<String, Value>) {
        for (attr, value) in &self.added {
            attrs.insert(attr.clone(), value.clone());
        }
        for (attr, value) in &self.modified {
            attrs.insert(attr.clone(), value.clone());
        }
        for attr in &self.removed {
            attrs.remove(attr);
        }
    }
}

/// Set-level difference between two object sets, oriented from old to new.
#[derive(Debug, Default)]
pub struct SetDiff {
    /// Objects present in the new set only, sorted by pkey.
    pub added: Vec<Object>,
    /// Objects present in both sets with at least one diffable attribute
    /// change, paired with their attribute diff.
    pub modified: Vec<(Object, AttrDiff)>,
    /// Objects present in the old set only, sorted by pkey.
    pub removed: Vec<Object>,
}

impl SetDiff {
    /// True when the two sets were identical.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Human-oriented summary used in cycle logs.
    pub fn summary(&self) -> String {
        format!(
            "{} added, {} modified, {} removed",
            self.added.len(),
            self.modified.len(),
            self.removed.len()
        )
    }
}
