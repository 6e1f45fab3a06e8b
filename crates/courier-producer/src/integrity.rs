//! Integrity evaluation
//!
//! After all types have been merged, each type's integrity constraints are
//! evaluated per row with the peer pkey sets in scope. A failing row is
//! dropped from this cycle's snapshot only; the next cycle may restore it.
//! Evaluation follows the declared type order and loops until a fixed
//! point, so a drop in one type is visible to the types after it.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use courier_core::{Dataschema, ObjectSet, Pkey};

use crate::predicate::{eval_all, Predicate};

/// Enforce all integrity constraints on the merged snapshot in place.
pub fn enforce_integrity(
    schema: &Dataschema,
    constraints: &BTreeMap<String, Vec<Predicate>>,
    data: &mut BTreeMap<String, ObjectSet>,
) {
    if constraints.values().all(Vec::is_empty) {
        return;
    }

    loop {
        let mut changed = false;

        for entity in schema.type_names() {
            let Some(predicates) = constraints.get(entity) else {
                continue;
            };
            if predicates.is_empty() {
                continue;
            }

            // Peer pkey sets reflect all drops made so far.
            let pkeys: BTreeMap<String, BTreeSet<Pkey>> = data
                .iter()
                .map(|(name, set)| (name.clone(), set.pkeys()))
                .collect();

            let Some(set) = data.get_mut(entity) else {
                continue;
            };
            let failing: Vec<Pkey> = set
                .iter()
                .filter(|obj| !eval_all(predicates, obj, &pkeys))
                .map(|obj| obj.pkey.clone())
                .collect();

            if !failing.is_empty() {
                changed = true;
                debug!(
                    entity,
                    dropped = failing.len(),
                    "rows dropped by integrity constraints"
                );
                for pkey in failing {
                    set.remove(&pkey);
                    set.integrity_filtered.insert(pkey);
                }
            }
        }

        if !changed {
            return;
        }
    }
}
