//! Event emitter and commit hooks
//!
//! Publishes a cycle's events to the bus in order. After each
//! acknowledged event, the bound sources' `commit_one` hooks run; the
//! cache advances only for objects whose hooks all succeeded. A failed
//! `commit_one` never retracts the event - it is already on the bus - it
//! marks the source for alerting instead. `commit_all` runs once per
//! source at end of cycle.

use std::collections::BTreeMap;

use tracing::{info, warn};

use courier_bus::BusProducer;
use courier_core::{Dataschema, Event, EventOp, ObjectSet};

use crate::differ::CycleEvent;
use crate::error::ProducerResult;
use crate::fragment::SourceRuntime;

/// Outcome of publishing one cycle.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    pub published: usize,
    /// Sources whose commit hooks failed, for alerting.
    pub commit_failures: Vec<String>,
}

/// Publish the cycle's events and advance the in-memory cache.
///
/// A bus failure aborts immediately: events already acknowledged have
/// advanced the cache, the failed one and everything after it have not,
/// and the next tick re-derives them from the unchanged snapshot diff.
pub async fn publish_cycle(
    bus: &dyn BusProducer,
    schema: &Dataschema,
    events: Vec<CycleEvent>,
    fragments: &BTreeMap<String, Vec<SourceRuntime>>,
    cache: &mut BTreeMap<String, ObjectSet>,
    commit: bool,
) -> ProducerResult<PublishOutcome> {
    let mut outcome = PublishOutcome::default();

    for cycle_event in events {
        let CycleEvent {
            entity,
            event,
            object,
        } = cycle_event;
        let secrets = schema.secrets_of(&entity);
        let rendered = event.to_display(&secrets);

        let offset = bus.publish(&event).await?;
        outcome.published += 1;
        info!(offset, "sent {}", rendered);

        let Some(type_schema) = schema.get(&entity) else {
            continue;
        };
        let cache_set = cache.entry(entity.clone()).or_default();

        let mut hooks_ok = true;
        if commit && event.op.is_change() {
            let cached_attrs = cache_set
                .get(&object.pkey)
                .map(|cached| cached.attrs().clone())
                .unwrap_or_default();
            if let Some(sources) = fragments.get(&entity) {
                for source in sources {
                    if let Err(e) = source.commit_one(object.attrs(), &cached_attrs).await {
                        warn!(
                            entity = %entity,
                            source = %source.source_name,
                            error = %e,
                            "commit_one failed, cache not advanced for this object"
                        );
                        outcome
                            .commit_failures
                            .push(format!("{entity}/{}", source.source_name));
                        hooks_ok = false;
                    }
                }
            }
        }
        if !hooks_ok {
            continue;
        }

        match event.op {
            EventOp::Added => cache_set.insert(object.cached_view(type_schema)),
            EventOp::Modified => cache_set.replace(object.cached_view(type_schema)),
            EventOp::Removed => {
                cache_set.remove(&object.pkey);
            }
            _ => {}
        }
    }

    if commit {
        for entity in schema.type_names() {
            let Some(sources) = fragments.get(entity) else {
                continue;
            };
            for source in sources {
                if let Err(e) = source.commit_all().await {
                    warn!(
                        entity = %entity,
                        source = %source.source_name,
                        error = %e,
                        "commit_all failed"
                    );
                    outcome
                        .commit_failures
                        .push(format!("{entity}/{}", source.source_name));
                }
            }
        }
    }

    Ok(outcome)
}

/// Publish an initsync sequence: the begin marker carrying the public
/// schema, the full cached snapshot as `added` events in declared type
/// order, then the end marker.
pub async fn publish_initsync(
    bus: &dyn BusProducer,
    schema: &Dataschema,
    cache: &BTreeMap<String, ObjectSet>,
    step: u64,
) -> ProducerResult<usize> {
    bus.publish(&Event::initsync_begin(schema.public(), step))
        .await?;

    let mut published = 0;
    for entity in schema.type_names() {
        let Some(type_schema) = schema.get(entity) else {
            continue;
        };
        let Some(set) = cache.get(entity) else {
            continue;
        };
        for obj in set.iter() {
            bus.publish(&Event::added(entity, obj, type_schema, step, schema.revision))
                .await?;
            published += 1;
        }
    }

    bus.publish(&Event::initsync_end(step, schema.revision))
        .await?;
    info!(objects = published, "initsync sequence published");
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_bus::MemoryBus;
    use courier_core::{Object, Pkey, PkeyAttr, TypeSchema, Value};
    use std::collections::BTreeSet;

    fn schema() -> Dataschema {
        Dataschema::new(
            1,
            vec![(
                "Users".to_string(),
                TypeSchema {
                    attributes: ["uid", "mail"].iter().map(ToString::to_string).collect(),
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

    fn user(uid: i64) -> Object {
        let schema = schema();
        let attrs = [
            ("uid".to_string(), Value::from(uid)),
            ("mail".to_string(), Value::from("a@x")),
        ]
        .into_iter()
        .collect();
        Object::from_attrs("Users", schema.get("Users").unwrap(), attrs).unwrap()
    }

    #[tokio::test]
    async fn test_publish_advances_cache_after_ack() {
        let bus = MemoryBus::new();
        let producer = bus.producer();
        let schema = schema();
        let obj = user(1);
        let events = vec![CycleEvent {
            entity: "Users".to_string(),
            event: Event::added("Users", &obj, schema.get("Users").unwrap(), 1, 1),
            object: obj,
        }];

        let mut cache = BTreeMap::new();
        let outcome = publish_cycle(
            &producer,
            &schema,
            events,
            &BTreeMap::new(),
            &mut cache,
            true,
        )
        .await
        .unwrap();

        assert_eq!(outcome.published, 1);
        assert!(cache["Users"].contains(&Pkey::from(1)));
        assert_eq!(bus.len().await, 1);
    }

    #[tokio::test]
    async fn test_removed_clears_cache_entry() {
        let bus = MemoryBus::new();
        let producer = bus.producer();
        let schema = schema();
        let obj = user(1);

        let mut cache: BTreeMap<String, ObjectSet> = BTreeMap::new();
        cache.insert(
            "Users".to_string(),
            ObjectSet::from_objects(vec![obj.clone()]),
        );

        let events = vec![CycleEvent {
            entity: "Users".to_string(),
            event: Event::removed("Users", &obj, schema.get("Users").unwrap(), 2, 1),
            object: obj,
        }];
        publish_cycle(
            &producer,
            &schema,
            events,
            &BTreeMap::new(),
            &mut cache,
            true,
        )
        .await
        .unwrap();

        assert!(cache["Users"].is_empty());
    }

    #[tokio::test]
    async fn test_initsync_brackets_snapshot() {
        let bus = MemoryBus::new();
        let producer = bus.producer();
        let schema = schema();

        let mut cache: BTreeMap<String, ObjectSet> = BTreeMap::new();
        cache.insert(
            "Users".to_string(),
            ObjectSet::from_objects(vec![user(1), user(2)]),
        );

        let published = publish_initsync(&producer, &schema, &cache, 7).await.unwrap();
        assert_eq!(published, 2);

        let events = bus.events().await;
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].op, EventOp::InitsyncBegin);
        assert!(events[0].schema.is_some());
        assert_eq!(events[1].op, EventOp::Added);
        assert_eq!(events[3].op, EventOp::InitsyncEnd);
    }
}
