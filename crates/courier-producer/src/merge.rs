//! Multi-source merge
//!
//! For a type with sources S1..Sn: each source's rows are filtered by its
//! merge constraints (to a fixed point, since dropping a row can change a
//! peer pkey set), then folded into one authoritative set in declaration
//! order under each source's pkey merge constraint. Attribute
//! disagreements are resolved per the type's merge-conflict policy, and
//! evicted rows fall back to their cached values.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use courier_core::{ObjectSet, Pkey};

use crate::config::MergeConflictPolicy;
use crate::fragment::{FetchedRows, SourceRuntime};
use crate::predicate::eval_all;

/// Enforce the per-source merge constraints, looping until no further row
/// is dropped. Returns the dropped pkeys.
fn apply_merge_constraints(
    sources: &[SourceRuntime],
    fetched: &mut [FetchedRows],
) -> BTreeSet<Pkey> {
    let mut filtered = BTreeSet::new();
    if sources.iter().all(|s| s.merge_constraints.is_empty()) {
        return filtered;
    }

    loop {
        let mut changed = false;

        // Current pkey set of every source, visible to all constraints.
        let pkeys: BTreeMap<String, BTreeSet<Pkey>> = sources
            .iter()
            .zip(fetched.iter())
            .map(|(source, rows)| {
                (
                    source.source_name.clone(),
                    rows.objects.iter().map(|obj| obj.pkey.clone()).collect(),
                )
            })
            .collect();

        for (source, rows) in sources.iter().zip(fetched.iter_mut()) {
            if source.merge_constraints.is_empty() {
                continue;
            }
            let before = rows.objects.len();
            rows.objects.retain(|obj| {
                let keep = eval_all(&source.merge_constraints, obj, &pkeys);
                if !keep {
                    filtered.insert(obj.pkey.clone());
                }
                keep
            });
            if rows.objects.len() != before {
                changed = true;
            }
        }

        if !changed {
            return filtered;
        }
    }
}

/// Merge the fetched rows of all sources of one type into the
/// authoritative snapshot for this cycle.
pub fn merge_type(
    entity: &str,
    sources: &[SourceRuntime],
    mut fetched: Vec<FetchedRows>,
    policy: MergeConflictPolicy,
    cache: &ObjectSet,
) -> ObjectSet {
    let constraint_filtered = apply_merge_constraints(sources, &mut fetched);
    let fail_on_conflict = policy == MergeConflictPolicy::UseCachedEntry;

    let mut merged = ObjectSet::new();
    let mut pkey_filtered: BTreeSet<Pkey> = BTreeSet::new();

    for (index, rows) in fetched.into_iter().enumerate() {
        if index == 0 {
            // The first source seeds the set; its pkey constraint does not
            // apply.
            for obj in rows.objects {
                merged.insert(obj);
            }
        } else {
            let dropped = merged.merge_with(
                rows.objects,
                sources[index].pkey_merge_constraint,
                fail_on_conflict,
            );
            pkey_filtered.extend(dropped);
        }
    }

    merged.merge_filtered.extend(constraint_filtered);
    merged.merge_filtered.extend(pkey_filtered);
    merged.replace_inconsistencies_with_cached(cache);

    debug!(
        entity,
        objects = merged.len(),
        merge_filtered = merged.merge_filtered.len(),
        conflicts = merged.merge_conflicts.len(),
        "type merged"
    );
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::fragment::tests::{users_schema, StaticSource};
    use courier_connector::FilterRegistry;
    use courier_core::{Object, Value};
    use std::sync::Arc;

    fn source_runtime(yaml: &str) -> SourceRuntime {
        let config: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        SourceRuntime::new(
            "Users",
            &users_schema(),
            &config,
            StaticSource::new(vec![]),
            Arc::new(FilterRegistry::builtin()),
        )
        .unwrap()
    }

    fn primary() -> SourceRuntime {
        source_runtime(
            r#"
name: hr
fetch: { type: fetch, query: q }
attrsmapping: { uid: id, mail: mail }
"#,
        )
    }

    fn secondary(constraint: &str) -> SourceRuntime {
        source_runtime(&format!(
            r#"
name: ldap
fetch: {{ type: fetch, query: q }}
attrsmapping: {{ uid: id, mail: mail }}
pkey_merge_constraint: {constraint}
"#
        ))
    }

    fn obj(uid: i64, mail: &str) -> Object {
        let attrs = [
            ("uid".to_string(), Value::from(uid)),
            ("mail".to_string(), Value::from(mail)),
        ]
        .into_iter()
        .collect();
        Object::from_attrs("Users", &users_schema(), attrs).unwrap()
    }

    fn rows(objs: Vec<Object>) -> FetchedRows {
        FetchedRows {
            objects: objs,
            dropped: 0,
        }
    }

    #[test]
    fn test_intersection_merge() {
        // A {1,2,3} then B {2,3,4} under mustExistInBoth -> {2,3}.
        let sources = vec![primary(), secondary("mustExistInBoth")];
        let fetched = vec![
            rows(vec![obj(1, "a@x"), obj(2, "a@x"), obj(3, "a@x")]),
            rows(vec![obj(2, "a@x"), obj(3, "a@x"), obj(4, "a@x")]),
        ];
        let merged = merge_type(
            "Users",
            &sources,
            fetched,
            MergeConflictPolicy::KeepFirstValue,
            &ObjectSet::new(),
        );
        let pkeys: Vec<Pkey> = merged.pkeys().into_iter().collect();
        assert_eq!(pkeys, vec![Pkey::from(2), Pkey::from(3)]);
        assert!(merged.merge_filtered.contains(&Pkey::from(1)));
        assert!(merged.merge_filtered.contains(&Pkey::from(4)));
    }

    #[test]
    fn test_conflict_uses_cached_entry() {
        let sources = vec![primary(), secondary("noConstraint")];
        let fetched = vec![
            rows(vec![obj(1, "first@x")]),
            rows(vec![obj(1, "second@x")]),
        ];
        let mut cache = ObjectSet::new();
        cache.insert(obj(1, "cached@x"));

        let merged = merge_type(
            "Users",
            &sources,
            fetched,
            MergeConflictPolicy::UseCachedEntry,
            &cache,
        );
        assert_eq!(
            merged.get(&Pkey::from(1)).unwrap().get("mail"),
            Some(&Value::from("cached@x"))
        );
        assert!(merged.merge_conflicts.contains(&Pkey::from(1)));
    }

    #[test]
    fn test_conflict_keeps_first_value() {
        let sources = vec![primary(), secondary("noConstraint")];
        let fetched = vec![
            rows(vec![obj(1, "first@x")]),
            rows(vec![obj(1, "second@x")]),
        ];
        let merged = merge_type(
            "Users",
            &sources,
            fetched,
            MergeConflictPolicy::KeepFirstValue,
            &ObjectSet::new(),
        );
        assert_eq!(
            merged.get(&Pkey::from(1)).unwrap().get("mail"),
            Some(&Value::from("first@x"))
        );
        assert!(merged.merge_conflicts.is_empty());
    }

    #[test]
    fn test_merge_constraints_filter_rows() {
        // Keep hr rows only when their pkey also exists on the ldap side.
        let constrained = source_runtime(
            r#"
name: hr
fetch: { type: fetch, query: q }
attrsmapping: { uid: id, mail: mail }
merge_constraints:
  - attr: uid
    in_pkeys_of: ldap
"#,
        );
        let sources = vec![constrained, secondary("mustAlreadyExist")];
        let fetched = vec![
            rows(vec![obj(1, "a@x"), obj(2, "a@x")]),
            rows(vec![obj(1, "a@x")]),
        ];
        let merged = merge_type(
            "Users",
            &sources,
            fetched,
            MergeConflictPolicy::KeepFirstValue,
            &ObjectSet::new(),
        );
        assert!(merged.contains(&Pkey::from(1)));
        assert!(!merged.contains(&Pkey::from(2)));
        assert!(merged.merge_filtered.contains(&Pkey::from(2)));
    }
}
