//! Initsync orchestration
//!
//! A consumer starting with no local cache bootstraps from an initsync
//! sequence instead of replaying every delta since the beginning of time:
//! it scans the bus for an `initsync_begin`/`initsync_end` pair, installs
//! the schema carried by the begin marker, and applies the bracketed
//! `added` events as an authoritative snapshot. Normal delta processing
//! resumes from the offset after the end marker.

use std::time::Duration;

use tracing::{debug, info};

use courier_bus::{BusConsumer, BusError};
use courier_core::EventOp;

use crate::applier::Applier;
use crate::error::ConsumerResult;

/// A complete initsync sequence on the bus: offsets of its begin and end
/// markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitsyncWindow {
    pub start: i64,
    pub stop: i64,
}

/// Scan the bus from the beginning for complete initsync sequences and
/// pick one: the oldest with `use_first`, the newest otherwise.
pub async fn find_initsync_window(
    consumer: &dyn BusConsumer,
    use_first: bool,
    idle_timeout: Duration,
) -> ConsumerResult<Option<InitsyncWindow>> {
    consumer.seek_to_beginning().await?;

    let mut windows: Vec<InitsyncWindow> = Vec::new();
    let mut start: Option<i64> = None;

    while let Some(message) = consumer.poll(idle_timeout).await? {
        match message.event.op {
            EventOp::InitsyncBegin => start = Some(message.offset),
            EventOp::InitsyncEnd => {
                if let Some(begin) = start.take() {
                    windows.push(InitsyncWindow {
                        start: begin,
                        stop: message.offset,
                    });
                    if use_first {
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    let window = if use_first {
        windows.first().copied()
    } else {
        windows.last().copied()
    };
    debug!(?window, "initsync scan completed");
    Ok(window)
}

/// Replay one initsync window through the applier. On return the consumer
/// is initialized and positioned after the end marker.
pub async fn run_initsync(
    applier: &mut Applier,
    consumer: &dyn BusConsumer,
    window: InitsyncWindow,
    idle_timeout: Duration,
) -> ConsumerResult<()> {
    info!(start = window.start, stop = window.stop, "initsync replay begins");
    applier.state.offsets.init_start = Some(window.start);
    applier.state.offsets.init_stop = Some(window.stop);

    consumer.seek(window.start).await?;
    loop {
        let Some(message) = consumer.poll(idle_timeout).await? else {
            // The window was found moments ago; going idle inside it means
            // the bus truncated it. Transient: the caller rescans.
            return Err(BusError::ConsumeFailed {
                cause: "bus went idle inside the initsync window".to_string(),
            }
            .into());
        };
        let finished = message.offset >= window.stop;
        applier.handle_message(&message, true).await?;
        if finished {
            break;
        }
    }

    applier.save().await?;
    info!("initsync replay completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerSettings;
    use crate::state::ConsumerState;
    use crate::target::NullTarget;
    use courier_bus::{BusProducer, MemoryBus};
    use courier_core::{
        AttrDiff, CacheDir, Dataschema, Event, Object, Pkey, PkeyAttr, TypeSchema, Value,
    };
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

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
        let attrs = [
            ("uid".to_string(), Value::from(uid)),
            ("mail".to_string(), Value::from("a@x")),
        ]
        .into_iter()
        .collect();
        Object::from_attrs("Users", schema().get("Users").unwrap(), attrs).unwrap()
    }

    async fn publish_sequence(bus: &MemoryBus, uids: &[i64]) {
        let producer = bus.producer();
        producer
            .publish(&Event::initsync_begin(schema().public(), 1))
            .await
            .unwrap();
        for uid in uids {
            producer
                .publish(&Event::added(
                    "Users",
                    &user(*uid),
                    schema().get("Users").unwrap(),
                    1,
                    1,
                ))
                .await
                .unwrap();
        }
        producer
            .publish(&Event::initsync_end(1, 1))
            .await
            .unwrap();
    }

    fn applier(dir: &tempfile::TempDir) -> Applier {
        let state = ConsumerState::load(CacheDir::open(dir.path()).unwrap()).unwrap();
        Applier::new(
            state,
            Arc::new(NullTarget),
            ConsumerSettings::default(),
            courier_core::Alerter::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_no_sequence_found_on_empty_bus() {
        let bus = MemoryBus::new();
        let consumer = bus.consumer();
        let window = find_initsync_window(&consumer, true, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(window.is_none());
    }

    #[tokio::test]
    async fn test_first_vs_last_sequence_selection() {
        let bus = MemoryBus::new();
        publish_sequence(&bus, &[1]).await;
        publish_sequence(&bus, &[1, 2]).await;

        let consumer = bus.consumer();
        let first = find_initsync_window(&consumer, true, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.start, 0);

        let last = find_initsync_window(&consumer, false, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert!(last.start > first.stop);
    }

    #[tokio::test]
    async fn test_fresh_consumer_converges_in_one_pass() {
        let bus = MemoryBus::new();
        publish_sequence(&bus, &[1, 2, 3]).await;

        let dir = tempfile::tempdir().unwrap();
        let mut applier = applier(&dir);
        let consumer = bus.consumer();

        let window = find_initsync_window(&consumer, true, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        run_initsync(&mut applier, &consumer, window, Duration::from_millis(10))
            .await
            .unwrap();

        assert!(applier.state.has_initialized());
        let users = &applier.state.data["Users"];
        assert_eq!(users.len(), 3);
        assert!(users.contains(&Pkey::from(2)));
        assert_eq!(applier.state.offsets.next, Some(window.stop + 1));
    }

    #[tokio::test]
    async fn test_delta_processing_resumes_after_window() {
        let bus = MemoryBus::new();
        publish_sequence(&bus, &[1]).await;

        // A delta follows the initsync sequence.
        let mut diff = AttrDiff::default();
        diff.modified.insert("mail".to_string(), Value::from("b@x"));
        bus.producer()
            .publish(&Event::modified("Users", Pkey::from(1), diff, 2, 1))
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut applier = applier(&dir);
        let consumer = bus.consumer();

        let window = find_initsync_window(&consumer, true, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        run_initsync(&mut applier, &consumer, window, Duration::from_millis(10))
            .await
            .unwrap();

        // Resume deltas from the persisted offset.
        consumer.seek(applier.state.offsets.next.unwrap()).await.unwrap();
        let message = consumer
            .poll(Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        applier.handle_message(&message, false).await.unwrap();

        let obj = applier.state.data["Users"].get(&Pkey::from(1)).unwrap();
        assert_eq!(obj.get("mail"), Some(&Value::from("b@x")));
    }
}
