//! Event applier
//!
//! Drives one dequeued event through schema evolution, the foreign-key
//! policy, the target handler, and - on success only - the local cache.
//! Recoverable failures enqueue the event; the bus offset advances after a
//! successful apply or a durable enqueue, never before.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use courier_bus::BusMessage;
use courier_core::{Alerter, Event, EventOp, Object, TypeSchema};

use crate::config::ConsumerSettings;
use crate::error::{ConsumerError, ConsumerResult};
use crate::errorqueue::ErrorQueue;
use crate::evolver::evolve;
use crate::fkpolicy::blocking_reason;
use crate::state::ConsumerState;
use crate::target::{ApplyContext, ApplyOutcome, BoxedTarget};

/// The consumer engine: local state, error queue and target handler.
pub struct Applier {
    pub state: ConsumerState,
    pub queue: ErrorQueue,
    target: BoxedTarget,
    settings: ConsumerSettings,
    alerter: Alerter,
}

impl Applier {
    pub fn new(
        state: ConsumerState,
        target: BoxedTarget,
        settings: ConsumerSettings,
        alerter: Alerter,
    ) -> ConsumerResult<Applier> {
        let queue = state.load_error_queue(settings.autoremediation)?;
        Ok(Applier {
            state,
            queue,
            target,
            settings,
            alerter,
        })
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Persist all consumer state, then give the target its save hook.
    pub async fn save(&self) -> ConsumerResult<()> {
        self.state.save()?;
        self.state.save_error_queue(&self.queue)?;
        self.target.on_save().await;
        Ok(())
    }

    /// Handle one bus message and advance the resume offset.
    pub async fn handle_message(
        &mut self,
        message: &BusMessage,
        during_initsync: bool,
    ) -> ConsumerResult<()> {
        match message.event.op {
            EventOp::SchemaUpdate | EventOp::InitsyncBegin => {
                if let Some(schema) = message.event.schema.clone() {
                    evolve(&mut self.state, &mut self.queue, schema)?;
                }
            }
            EventOp::InitsyncEnd => {}
            EventOp::Added | EventOp::Modified | EventOp::Removed => {
                self.process_event(message.event.clone(), during_initsync)
                    .await?;
            }
        }
        self.state.offsets.next = Some(message.offset + 1);
        Ok(())
    }

    /// Process one change event from the bus.
    pub async fn process_event(
        &mut self,
        event: Event,
        during_initsync: bool,
    ) -> ConsumerResult<()> {
        let Some(entity) = event.entity.clone() else {
            warn!("change event without a type, ignored");
            return Ok(());
        };
        let Some(pkey) = event.pkey.clone() else {
            warn!(%entity, "change event without a pkey, ignored");
            return Ok(());
        };

        let Some(schema) = &self.state.schema else {
            return Err(ConsumerError::NoSchema { entity });
        };
        if !schema.contains(&entity) {
            info!(%entity, "event of unknown type ignored");
            return Ok(());
        }

        // An object with unresolved errors keeps accumulating behind them,
        // preserving its intra-pkey order.
        if self.queue.contains_object(&entity, &pkey) {
            let reason = format!("object {entity}[{pkey}] already has unresolved errors");
            info!("{reason}, event queued");
            self.enqueue(event, reason, 0, false, during_initsync);
            return Ok(());
        }

        if let Some(reason) = blocking_reason(
            self.settings.foreignkeys_policy,
            &event,
            schema,
            &self.state,
            &self.queue,
        ) {
            info!("{reason}, event queued");
            self.enqueue(event, reason, 0, false, during_initsync);
            return Ok(());
        }

        let mut ctx = ApplyContext::default();
        match self.apply(&event, &mut ctx).await? {
            ApplyOutcome::Applied => Ok(()),
            ApplyOutcome::Retryable(message) => {
                info!(
                    %entity,
                    %pkey,
                    step = ctx.step,
                    "apply failed, event queued: {message}"
                );
                self.enqueue(
                    event,
                    message,
                    ctx.step,
                    ctx.partially_processed,
                    during_initsync,
                );
                Ok(())
            }
            ApplyOutcome::Fatal(message) => {
                error!(%entity, %pkey, "fatal apply failure, event dropped: {message}");
                let payload = serde_json::to_string(&event).unwrap_or_default();
                let _ = self.alerter.send(
                    "courier-client: event dropped after fatal failure",
                    &format!("{message}\n\n{payload}"),
                );
                Ok(())
            }
        }
    }

    fn enqueue(
        &mut self,
        event: Event,
        reason: String,
        step: u32,
        partially_processed: bool,
        during_initsync: bool,
    ) {
        // Initsync adds are authoritative snapshots and must not coalesce
        // with whatever is already queued.
        if during_initsync && event.op == EventOp::Added {
            self.queue.append_raw(event, Some(reason));
        } else {
            self.queue
                .append(event, Some(reason), step, partially_processed);
        }
    }

    /// Invoke the target and, on success, update the local cache. The
    /// cache reflects exactly the set of successfully applied events.
    async fn apply(
        &mut self,
        event: &Event,
        ctx: &mut ApplyContext,
    ) -> ConsumerResult<ApplyOutcome> {
        let entity = event.entity.clone().unwrap_or_default();
        let Some(pkey) = event.pkey.clone() else {
            return Ok(ApplyOutcome::Applied);
        };
        let Some(type_schema) = self
            .state
            .schema
            .as_ref()
            .and_then(|schema| schema.get(&entity))
            .cloned()
        else {
            return Ok(ApplyOutcome::Applied);
        };
        let target = self.target.clone();
        let retention = self.settings.trashbin_retention_days;
        let in_trash = self
            .state
            .trashbin
            .get(&entity)
            .is_some_and(|bin| bin.contains(&pkey));

        match event.op {
            EventOp::Added => {
                let incoming = self.object_from_attrs(&entity, &type_schema, event)?;
                if retention > 0 && in_trash {
                    // Recycle: the object never left the target, so the
                    // re-add converts into a modification locally.
                    let trashed = self
                        .state
                        .trashbin
                        .get(&entity)
                        .and_then(|bin| bin.get(&pkey))
                        .map(|entry| entry.object.clone());
                    let Some(trashed) = trashed else {
                        return Ok(ApplyOutcome::Retryable(
                            "trashbin entry vanished".to_string(),
                        ));
                    };
                    let diff = incoming.diff_from(&trashed, &type_schema);
                    let outcome = if diff.is_empty() {
                        ApplyOutcome::Applied
                    } else {
                        target
                            .on_modified(&entity, &pkey, &diff, Some(&trashed), ctx)
                            .await
                    };
                    if outcome == ApplyOutcome::Applied {
                        debug!(%entity, %pkey, "object recycled from trashbin");
                        if let Some(bin) = self.state.trashbin.get_mut(&entity) {
                            bin.restore(&pkey);
                        }
                        self.upsert(&entity, incoming);
                    }
                    Ok(outcome)
                } else {
                    let outcome = target.on_added(&entity, &pkey, &event.attrs, ctx).await;
                    if outcome == ApplyOutcome::Applied {
                        self.upsert(&entity, incoming);
                    }
                    Ok(outcome)
                }
            }

            EventOp::Modified => {
                if in_trash {
                    // The target will see the accumulated changes when the
                    // object is recycled or purged.
                    if let Some(bin) = self.state.trashbin.get_mut(&entity) {
                        if let Some(entry) = bin.remove(&pkey) {
                            let mut obj = entry.object;
                            obj.apply_diff(&event.diff);
                            bin.insert(obj, entry.deleted_at);
                        }
                    }
                    return Ok(ApplyOutcome::Applied);
                }
                let cached = self
                    .state
                    .data
                    .get(&entity)
                    .and_then(|set| set.get(&pkey))
                    .cloned();
                let Some(cached) = cached else {
                    return Ok(ApplyOutcome::Retryable(format!(
                        "object {entity}[{pkey}] is not in the local cache"
                    )));
                };
                let outcome = target
                    .on_modified(&entity, &pkey, &event.diff, Some(&cached), ctx)
                    .await;
                if outcome == ApplyOutcome::Applied {
                    let mut updated = cached;
                    updated.apply_diff(&event.diff);
                    if let Some(set) = self.state.data.get_mut(&entity) {
                        set.replace(updated);
                    }
                }
                Ok(outcome)
            }

            EventOp::Removed => {
                let cached = self.state.object_or_trashed(&entity, &pkey);
                if retention == 0 || in_trash {
                    // Physical removal.
                    let outcome = target.on_removed(&entity, &pkey, cached.as_ref(), ctx).await;
                    if outcome == ApplyOutcome::Applied {
                        if let Some(set) = self.state.data.get_mut(&entity) {
                            set.remove(&pkey);
                        }
                        if let Some(bin) = self.state.trashbin.get_mut(&entity) {
                            bin.remove(&pkey);
                        }
                        self.queue.purge_object(&entity, &pkey);
                    }
                    Ok(outcome)
                } else {
                    // Defer: move to the trashbin.
                    let outcome = target.on_trashed(&entity, &pkey, cached.as_ref(), ctx).await;
                    if outcome == ApplyOutcome::Applied {
                        let removed = self
                            .state
                            .data
                            .get_mut(&entity)
                            .and_then(|set| set.remove(&pkey));
                        if let Some(obj) = removed {
                            if let Some(bin) = self.state.trashbin.get_mut(&entity) {
                                bin.insert(obj, Utc::now());
                            }
                        }
                    }
                    Ok(outcome)
                }
            }

            _ => Ok(ApplyOutcome::Applied),
        }
    }

    fn object_from_attrs(
        &self,
        entity: &str,
        type_schema: &TypeSchema,
        event: &Event,
    ) -> ConsumerResult<Object> {
        Object::from_attrs(entity, type_schema, event.attrs.clone()).map_err(ConsumerError::from)
    }

    fn upsert(&mut self, entity: &str, obj: Object) {
        if let Some(set) = self.state.data.get_mut(entity) {
            if set.contains(&obj.pkey) {
                set.replace(obj);
            } else {
                set.insert(obj);
            }
        }
    }

    /// One pass over the error queue: re-submit every per-pkey head event
    /// in FIFO order. Retries preserve intra-pkey order because only heads
    /// are eligible.
    pub async fn retry_queue(&mut self) -> ConsumerResult<usize> {
        let heads = self.queue.heads();
        let mut drained = 0;

        for (number, entry) in heads {
            // The entry may have been purged by an earlier retry of this
            // pass (a removal purges its whole object).
            if !self.queue.iter().any(|(n, _)| *n == number) {
                continue;
            }

            // A still-blocked relative keeps the event deferred.
            if let Some(schema) = &self.state.schema {
                if let Some(reason) = blocking_reason(
                    self.settings.foreignkeys_policy,
                    &entry.event,
                    schema,
                    &self.state,
                    &self.queue,
                ) {
                    self.queue.update_failure(
                        number,
                        reason,
                        entry.resume_step,
                        entry.partially_processed,
                    );
                    continue;
                }
            }

            let identity = entry.event.identity();
            info!(
                number,
                op = %entry.event.op,
                "retrying queued event"
            );
            let mut ctx = ApplyContext::retry(entry.resume_step, entry.partially_processed);
            match self.apply(&entry.event, &mut ctx).await? {
                ApplyOutcome::Applied => {
                    // A removal purges its own queue entries; tolerate the
                    // entry being gone already.
                    self.queue.remove(number);
                    drained += 1;
                    debug!(number, ?identity, "queued event drained");
                }
                ApplyOutcome::Retryable(message) => {
                    info!(number, step = ctx.step, "retry failed: {message}");
                    self.queue
                        .update_failure(number, message, ctx.step, ctx.partially_processed);
                }
                ApplyOutcome::Fatal(message) => {
                    error!(number, "fatal failure on retry, event dropped: {message}");
                    self.queue.remove(number);
                    let _ = self.alerter.send(
                        "courier-client: queued event dropped after fatal failure",
                        &message,
                    );
                }
            }
        }
        Ok(drained)
    }

    /// One trashbin sweep: physically delete entries whose retention
    /// expired, walking types in reverse declaration order so children go
    /// before their parents.
    pub async fn purge_trashbin(&mut self) -> ConsumerResult<usize> {
        let retention = self.settings.trashbin_retention_days;
        if retention == 0 {
            return Ok(0);
        }
        let now = Utc::now();
        let entities: Vec<String> = match &self.state.schema {
            Some(schema) => schema.type_names().rev().map(ToString::to_string).collect(),
            None => return Ok(0),
        };

        let mut purged = 0;
        for entity in entities {
            let expired = self
                .state
                .trashbin
                .get(&entity)
                .map(|bin| bin.expired(retention, now))
                .unwrap_or_default();
            for pkey in expired {
                let cached = self
                    .state
                    .trashbin
                    .get(&entity)
                    .and_then(|bin| bin.get(&pkey))
                    .map(|entry| entry.object.clone());
                info!(%entity, %pkey, "purging expired trashbin entry");

                let mut ctx = ApplyContext::default();
                let outcome = self
                    .target
                    .clone()
                    .on_removed(&entity, &pkey, cached.as_ref(), &mut ctx)
                    .await;
                match outcome {
                    ApplyOutcome::Applied => {
                        if let Some(bin) = self.state.trashbin.get_mut(&entity) {
                            bin.remove(&pkey);
                        }
                        self.queue.purge_object(&entity, &pkey);
                        purged += 1;
                    }
                    ApplyOutcome::Retryable(message) | ApplyOutcome::Fatal(message) => {
                        // The entry stays for the next sweep.
                        warn!(%entity, %pkey, "trashbin purge failed: {message}");
                        let _ = self.alerter.send(
                            "courier-client: trashbin purge failure",
                            &format!("{entity}[{pkey}]: {message}"),
                        );
                    }
                }
            }
        }
        Ok(purged)
    }
}
