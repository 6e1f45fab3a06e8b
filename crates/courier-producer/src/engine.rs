//! Producer engine
//!
//! One engine instance owns the producer side of a deployment: the derived
//! dataschema, the per-(type, source) runtimes, the persisted cache, and
//! the step counter. Each tick fetches all sources, merges, enforces
//! integrity, diffs against the cache and publishes the resulting events.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use courier_bus::BoxedBusProducer;
use courier_connector::{DatasourceRegistry, FilterRegistry};
use courier_core::{Alerter, CacheDir, Dataschema, Event, ObjectSet};

use crate::config::DatamodelConfig;
use crate::differ::diff_snapshot;
use crate::emitter::{publish_cycle, publish_initsync};
use crate::error::{ProducerError, ProducerResult};
use crate::fragment::{FetchedRows, SourceRuntime};
use crate::integrity::enforce_integrity;
use crate::merge::merge_type;
use crate::predicate::Predicate;

/// Cache file holding the schema between runs.
const SCHEMA_FILE: &str = "_dataschema";
/// Cache file holding the runtime counters.
const RUNTIME_FILE: &str = "_runtime";

/// Consecutive failures of one source before an alert is raised.
const SOURCE_ALERT_THRESHOLD: u32 = 3;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuntimeState {
    step: u64,
}

/// Per-type data diagnostics of the latest tick.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TypeStatus {
    pub objects: usize,
    pub inconsistencies: Vec<String>,
    pub merge_conflicts: Vec<String>,
    pub merge_filtered: Vec<String>,
    pub integrity_filtered: Vec<String>,
}

impl TypeStatus {
    fn has_errors(&self) -> bool {
        !self.inconsistencies.is_empty() || !self.merge_conflicts.is_empty()
    }
}

/// Engine status exposed on the control socket.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineStatus {
    pub step: u64,
    pub types: BTreeMap<String, TypeStatus>,
    pub failing_sources: Vec<String>,
}

/// Report of one tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub published: usize,
    /// Types skipped because one of their sources was unavailable.
    pub skipped_types: Vec<String>,
    pub dropped_rows: u32,
}

/// The producer engine.
pub struct ProducerEngine {
    schema: Dataschema,
    previous_schema: Option<Dataschema>,
    fragments: BTreeMap<String, Vec<SourceRuntime>>,
    integrity: BTreeMap<String, Vec<Predicate>>,
    conflict_policies: BTreeMap<String, crate::config::MergeConflictPolicy>,
    cache: BTreeMap<String, ObjectSet>,
    cache_dir: CacheDir,
    bus: BoxedBusProducer,
    alerter: Alerter,
    step: u64,
    status: EngineStatus,
    source_failures: BTreeMap<String, u32>,
    last_error_report: String,
}

impl ProducerEngine {
    /// Build the engine: derive the schema (bumping the revision when the
    /// declaration changed since last run), compile the source runtimes,
    /// and load the persisted cache.
    pub fn new(
        config: &DatamodelConfig,
        registry: &DatasourceRegistry,
        filters: Arc<FilterRegistry>,
        bus: BoxedBusProducer,
        cache_dir: CacheDir,
        alerter: Alerter,
    ) -> ProducerResult<ProducerEngine> {
        let previous_schema: Option<Dataschema> = cache_dir
            .load::<Dataschema>(SCHEMA_FILE)?
            .map(|(_, schema)| schema);

        let base_revision = previous_schema.as_ref().map_or(1, |s| s.revision);
        let mut schema = config.build_schema(base_revision)?;
        if let Some(previous) = &previous_schema {
            if !schema.diff_from(previous).is_empty() {
                schema = config.build_schema(base_revision + 1)?;
                info!(revision = schema.revision, "dataschema changed since last run");
            }
        }

        let mut fragments = BTreeMap::new();
        let mut integrity = BTreeMap::new();
        let mut conflict_policies = BTreeMap::new();
        for type_config in &config.types {
            let type_schema = schema
                .get(&type_config.name)
                .ok_or_else(|| ProducerError::config_invalid("schema lost a declared type"))?;
            let mut runtimes = Vec::with_capacity(type_config.sources.len());
            for source in &type_config.sources {
                runtimes.push(SourceRuntime::new(
                    &type_config.name,
                    type_schema,
                    source,
                    registry.get(&source.name)?,
                    filters.clone(),
                )?);
            }
            fragments.insert(type_config.name.clone(), runtimes);
            integrity.insert(
                type_config.name.clone(),
                type_config.integrity_constraints.clone(),
            );
            conflict_policies.insert(type_config.name.clone(), type_config.on_merge_conflict);
        }

        let mut cache = BTreeMap::new();
        for entity in schema.type_names() {
            let set = cache_dir
                .load::<ObjectSet>(entity)?
                .map(|(_, set)| set)
                .unwrap_or_default();
            cache.insert(entity.to_string(), set);
        }

        let step = cache_dir
            .load::<RuntimeState>(RUNTIME_FILE)?
            .map(|(_, state)| state.step)
            .unwrap_or(0);

        Ok(ProducerEngine {
            schema,
            previous_schema,
            fragments,
            integrity,
            conflict_policies,
            cache,
            cache_dir,
            bus,
            alerter,
            step,
            status: EngineStatus::default(),
            source_failures: BTreeMap::new(),
            last_error_report: String::new(),
        })
    }

    pub fn schema(&self) -> &Dataschema {
        &self.schema
    }

    pub fn status(&self) -> EngineStatus {
        let mut status = self.status.clone();
        status.step = self.step;
        status
    }

    /// Reconcile a schema change left by a previous run: emit removals for
    /// dropped types, migrate renamed pkeys in place, purge newly-secret
    /// attributes from the cache, then broadcast the new schema.
    pub async fn reconcile_schema(&mut self) -> ProducerResult<()> {
        let Some(previous) = self.previous_schema.take() else {
            // First ever run: persist the initial schema, nothing to
            // broadcast yet.
            self.cache_dir
                .save(SCHEMA_FILE, self.schema.revision, &self.schema)?;
            return Ok(());
        };

        let diff = self.schema.diff_from(&previous);
        if diff.is_empty() {
            self.cache_dir
                .save(SCHEMA_FILE, self.schema.revision, &self.schema)?;
            return Ok(());
        }
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "reconciling dataschema change"
        );

        // Removed types: their cached rows leave the stream as removals,
        // then the cache files go away.
        for entity in &diff.removed {
            let Some(type_schema) = previous.get(entity) else {
                continue;
            };
            let set = self
                .cache_dir
                .load::<ObjectSet>(entity)?
                .map(|(_, set)| set)
                .unwrap_or_default();
            for obj in set.iter() {
                let event =
                    Event::removed(entity, obj, type_schema, self.step, self.schema.revision);
                self.bus.publish(&event).await?;
            }
            self.cache_dir.delete(entity)?;
        }

        for entity in &diff.modified {
            let (Some(new_type), Some(old_type)) = (self.schema.get(entity), previous.get(entity))
            else {
                continue;
            };

            // Renamed pkey: migrate the index in place, identity is kept by
            // the untouched remote pkey.
            if new_type.pkey != old_type.pkey {
                info!(%entity, "migrating cache to renamed primary key");
                if let Some(set) = self.cache.remove(entity) {
                    let mut migrated = ObjectSet::new();
                    for mut obj in set.iter().cloned() {
                        obj.rekey(entity, new_type)?;
                        migrated.insert(obj);
                    }
                    self.cache.insert(entity.clone(), migrated);
                }
            }

            // Newly secret attributes must leave the persisted cache.
            let new_secrets: BTreeSet<&String> =
                new_type.secrets.difference(&old_type.secrets).collect();
            if !new_secrets.is_empty() {
                if let Some(set) = self.cache.get_mut(entity) {
                    let stripped: Vec<_> =
                        set.iter().map(|obj| obj.cached_view(new_type)).collect();
                    *set = ObjectSet::from_objects(stripped);
                }
            }
        }

        self.save_cache()?;
        let update = Event::schema_update(self.schema.public(), self.step);
        info!("broadcasting schema revision {}", self.schema.revision);
        self.bus.publish(&update).await?;
        self.cache_dir
            .save(SCHEMA_FILE, self.schema.revision, &self.schema)?;
        Ok(())
    }

    /// Run one producer cycle: fetch, merge, enforce integrity, diff,
    /// publish, persist.
    pub async fn tick(&mut self) -> ProducerResult<TickReport> {
        let mut report = TickReport::default();
        self.step += 1;

        // Fetch every type; a type with an unavailable source is carried
        // over unchanged this tick so its absence is never mistaken for a
        // mass removal.
        let mut snapshot: BTreeMap<String, ObjectSet> = BTreeMap::new();
        for entity in self.schema.type_names() {
            let Some(sources) = self.fragments.get(entity) else {
                continue;
            };
            let cache_set = self.cache.get(entity).cloned().unwrap_or_default();

            let results = join_all(sources.iter().map(|source| source.fetch(&cache_set))).await;

            let mut fetched: Vec<FetchedRows> = Vec::with_capacity(results.len());
            let mut skip = false;
            for (source, result) in sources.iter().zip(results) {
                let key = format!("{entity}/{}", source.source_name);
                match result {
                    Ok(rows) => {
                        report.dropped_rows += rows.dropped;
                        self.source_failures.remove(&key);
                        fetched.push(rows);
                    }
                    Err(e) if e.is_transient() => {
                        let failures = self.source_failures.entry(key.clone()).or_insert(0);
                        *failures += 1;
                        warn!(
                            source = %key,
                            failures = *failures,
                            error = %e,
                            "source unavailable, type skipped this tick"
                        );
                        if *failures == SOURCE_ALERT_THRESHOLD {
                            let _ = self.alerter.send(
                                "courier-server: source unavailable",
                                &format!("source {key} failed {failures} consecutive ticks: {e}"),
                            );
                        }
                        skip = true;
                    }
                    Err(e) => return Err(e),
                }
            }

            if skip {
                report.skipped_types.push(entity.to_string());
                snapshot.insert(entity.to_string(), cache_set);
                continue;
            }

            let policy = self
                .conflict_policies
                .get(entity)
                .copied()
                .unwrap_or_default();
            let merged = merge_type(entity, sources, fetched, policy, &cache_set);
            snapshot.insert(entity.to_string(), merged);
        }

        enforce_integrity(&self.schema, &self.integrity, &mut snapshot);
        self.record_status(&snapshot, &report.skipped_types);

        let events = diff_snapshot(&self.schema, &snapshot, &self.cache, self.step);
        let publish_result = publish_cycle(
            self.bus.as_ref(),
            &self.schema,
            events,
            &self.fragments,
            &mut self.cache,
            true,
        )
        .await;

        // Whatever happened, acknowledged events have advanced the
        // in-memory cache and must reach disk before the error propagates.
        self.save_cache()?;

        let outcome = publish_result?;
        report.published = outcome.published;
        if !outcome.commit_failures.is_empty() {
            let _ = self.alerter.send(
                "courier-server: commit hook failures",
                &outcome.commit_failures.join("\n"),
            );
        }

        self.notify_data_errors();
        info!(
            step = self.step,
            published = report.published,
            skipped = report.skipped_types.len(),
            "tick completed"
        );
        Ok(report)
    }

    /// Publish an initsync sequence from the current cache.
    pub async fn initsync(&mut self) -> ProducerResult<usize> {
        publish_initsync(self.bus.as_ref(), &self.schema, &self.cache, self.step).await
    }

    fn record_status(&mut self, snapshot: &BTreeMap<String, ObjectSet>, skipped: &[String]) {
        let mut types = BTreeMap::new();
        for (entity, set) in snapshot {
            let as_strings =
                |pkeys: &BTreeSet<courier_core::Pkey>| -> Vec<String> {
                    pkeys.iter().map(ToString::to_string).collect()
                };
            types.insert(
                entity.clone(),
                TypeStatus {
                    objects: set.len(),
                    inconsistencies: as_strings(&set.inconsistencies),
                    merge_conflicts: as_strings(&set.merge_conflicts),
                    merge_filtered: as_strings(&set.merge_filtered),
                    integrity_filtered: as_strings(&set.integrity_filtered),
                },
            );
        }
        self.status = EngineStatus {
            step: self.step,
            types,
            failing_sources: self
                .source_failures
                .keys()
                .cloned()
                .chain(skipped.iter().map(|t| format!("{t}/*")))
                .collect(),
        };
    }

    /// Mail the operators when the data-error picture changes, in either
    /// direction.
    fn notify_data_errors(&mut self) {
        let mut report = String::new();
        for (entity, status) in &self.status.types {
            if status.has_errors() {
                report.push_str(&format!(
                    "{entity}: inconsistencies={:?} merge_conflicts={:?}\n",
                    status.inconsistencies, status.merge_conflicts
                ));
            }
        }
        if report != self.last_error_report {
            let desc = if report.is_empty() {
                "no more data errors"
            } else {
                "data errors met"
            };
            if let Err(e) =
                self.alerter
                    .send_diff(&format!("courier-server: {desc}"), &self.last_error_report, &report)
            {
                error!(error = %e, "failed to send data-error alert");
            }
            self.last_error_report = report;
        }
    }

    fn save_cache(&self) -> ProducerResult<()> {
        for entity in self.schema.type_names() {
            if let Some(set) = self.cache.get(entity) {
                self.cache_dir.save(entity, self.schema.revision, set)?;
            }
        }
        self.cache_dir
            .save(RUNTIME_FILE, self.schema.revision, &RuntimeState { step: self.step })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_bus::{BusConsumer, MemoryBus};
    use courier_core::{EventOp, Pkey, Value};
    use std::time::Duration;

    const CONFIG: &str = r#"
types:
  - name: Users
    primary_key: uid
    sources:
      - name: hr
        fetch:
          type: fetch
          query: SELECT id, login FROM users
        attrsmapping:
          uid: id
          login: login
"#;

    fn registry(rows: Vec<courier_connector::Row>) -> DatasourceRegistry {
        let mut registry = DatasourceRegistry::new();
        registry.register("hr", crate::fragment::tests::StaticSource::new(rows));
        registry
    }

    fn row(uid: i64, login: &str) -> courier_connector::Row {
        [
            ("id".to_string(), Value::from(uid)),
            ("login".to_string(), Value::from(login)),
        ]
        .into_iter()
        .collect()
    }

    async fn engine(
        rows: Vec<courier_connector::Row>,
        dir: &tempfile::TempDir,
        bus: &MemoryBus,
    ) -> ProducerEngine {
        let config: DatamodelConfig = serde_yaml::from_str(CONFIG).unwrap();
        ProducerEngine::new(
            &config,
            &registry(rows),
            Arc::new(FilterRegistry::builtin()),
            Arc::new(bus.producer()),
            CacheDir::open(dir.path()).unwrap(),
            Alerter::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_tick_publishes_adds() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MemoryBus::new();
        let mut engine = engine(vec![row(1, "alice"), row(2, "bob")], &dir, &bus).await;
        engine.reconcile_schema().await.unwrap();

        let report = engine.tick().await.unwrap();
        assert_eq!(report.published, 2);

        let events = bus.events().await;
        assert!(events.iter().all(|e| e.op == EventOp::Added));
        assert_eq!(events[0].pkey, Some(Pkey::from(1)));
        assert_eq!(events[1].pkey, Some(Pkey::from(2)));
    }

    #[tokio::test]
    async fn test_second_tick_is_quiet_and_detects_removal() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MemoryBus::new();

        {
            let mut engine = engine(vec![row(1, "alice"), row(2, "bob")], &dir, &bus).await;
            engine.reconcile_schema().await.unwrap();
            engine.tick().await.unwrap();
        }

        // Same data again: nothing new on the bus.
        {
            let mut engine = engine(vec![row(1, "alice"), row(2, "bob")], &dir, &bus).await;
            engine.reconcile_schema().await.unwrap();
            let report = engine.tick().await.unwrap();
            assert_eq!(report.published, 0);
        }

        // Bob disappears from the source: one removal.
        {
            let mut engine = engine(vec![row(1, "alice")], &dir, &bus).await;
            engine.reconcile_schema().await.unwrap();
            let report = engine.tick().await.unwrap();
            assert_eq!(report.published, 1);
        }

        let events = bus.events().await;
        let last = events.last().unwrap();
        assert_eq!(last.op, EventOp::Removed);
        assert_eq!(last.pkey, Some(Pkey::from(2)));
    }

    #[tokio::test]
    async fn test_modified_event_on_attribute_change() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MemoryBus::new();

        {
            let mut engine = engine(vec![row(1, "alice")], &dir, &bus).await;
            engine.reconcile_schema().await.unwrap();
            engine.tick().await.unwrap();
        }
        {
            let mut engine = engine(vec![row(1, "alicia")], &dir, &bus).await;
            engine.reconcile_schema().await.unwrap();
            engine.tick().await.unwrap();
        }

        let events = bus.events().await;
        let last = events.last().unwrap();
        assert_eq!(last.op, EventOp::Modified);
        assert_eq!(
            last.diff.modified.get("login"),
            Some(&Value::from("alicia"))
        );
    }

    #[tokio::test]
    async fn test_initsync_replays_cache() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MemoryBus::new();
        let mut engine = engine(vec![row(1, "alice")], &dir, &bus).await;
        engine.reconcile_schema().await.unwrap();
        engine.tick().await.unwrap();

        let published = engine.initsync().await.unwrap();
        assert_eq!(published, 1);

        // The sequence is bracketed by markers.
        let consumer = bus.consumer();
        let mut ops = Vec::new();
        while let Some(message) = consumer.poll(Duration::from_millis(1)).await.unwrap() {
            ops.push(message.event.op);
        }
        assert!(ops.contains(&EventOp::InitsyncBegin));
        assert_eq!(ops.last(), Some(&EventOp::InitsyncEnd));
    }

    #[tokio::test]
    async fn test_step_counter_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MemoryBus::new();
        {
            let mut engine = engine(vec![row(1, "alice")], &dir, &bus).await;
            engine.reconcile_schema().await.unwrap();
            engine.tick().await.unwrap();
            assert_eq!(engine.status().step, 1);
        }
        {
            let mut engine = engine(vec![row(1, "alice")], &dir, &bus).await;
            engine.reconcile_schema().await.unwrap();
            engine.tick().await.unwrap();
            assert_eq!(engine.status().step, 2);
        }
    }
}
