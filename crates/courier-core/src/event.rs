//! Change events
//!
//! The typed messages flowing over the bus. The wire format is JSON with the
//! fields `op`, `type`, `pkey`, `step`, `schema_rev`, `attrs` (added and
//! modified), `fkeys` (removed) and `schema` (schema updates and initsync
//! begin markers). An event's identity is `(type, pkey, step, op)`:
//! retransmissions carry the same identity and consumers must tolerate
//! them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::diff::AttrDiff;
use crate::object::Object;
use crate::pkey::Pkey;
use crate::schema::{Dataschema, TypeSchema};
use crate::value::Value;

/// Operation carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    Added,
    Modified,
    Removed,
    InitsyncBegin,
    InitsyncEnd,
    SchemaUpdate,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOp::Added => "added",
            EventOp::Modified => "modified",
            EventOp::Removed => "removed",
            EventOp::InitsyncBegin => "initsync_begin",
            EventOp::InitsyncEnd => "initsync_end",
            EventOp::SchemaUpdate => "schema_update",
        }
    }

    /// Whether this is an object change (as opposed to a marker or schema
    /// broadcast).
    pub fn is_change(&self) -> bool {
        matches!(self, EventOp::Added | EventOp::Modified | EventOp::Removed)
    }
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of an event across retransmissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventIdentity {
    pub entity: Option<String>,
    pub pkey: Option<Pkey>,
    pub step: u64,
    pub op: EventOp,
}

/// A typed change event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub op: EventOp,
    /// Entity type; `None` for initsync markers and schema broadcasts.
    pub entity: Option<String>,
    pub pkey: Option<Pkey>,
    /// Producer step counter at emission time.
    pub step: u64,
    pub schema_rev: u32,
    /// Full sent attributes (`added` events).
    pub attrs: BTreeMap<String, Value>,
    /// Changed attributes (`modified` events).
    pub diff: AttrDiff,
    /// Foreign-key attribute values at the moment of removal (`removed`
    /// events), so the consumer can still resolve parent linkage.
    pub fkeys: BTreeMap<String, Value>,
    /// Public schema (`schema_update` and `initsync_begin` events).
    pub schema: Option<Dataschema>,
}

impl Event {
    /// Event for a newly appeared object.
    pub fn added(entity: &str, obj: &Object, schema: &TypeSchema, step: u64, rev: u32) -> Event {
        Event {
            op: EventOp::Added,
            entity: Some(entity.to_string()),
            pkey: Some(obj.pkey.clone()),
            step,
            schema_rev: rev,
            attrs: obj.sent_attrs(schema),
            diff: AttrDiff::default(),
            fkeys: BTreeMap::new(),
            schema: None,
        }
    }

    /// Event for a changed object.
    pub fn modified(entity: &str, pkey: Pkey, diff: AttrDiff, step: u64, rev: u32) -> Event {
        Event {
            op: EventOp::Modified,
            entity: Some(entity.to_string()),
            pkey: Some(pkey),
            step,
            schema_rev: rev,
            attrs: BTreeMap::new(),
            diff,
            fkeys: BTreeMap::new(),
            schema: None,
        }
    }

    /// Event for a disappeared object. Carries the values of its
    /// foreign-key attributes so consumers can gate on parent linkage.
    pub fn removed(entity: &str, obj: &Object, schema: &TypeSchema, step: u64, rev: u32) -> Event {
        let fkeys = schema
            .foreign_keys
            .keys()
            .filter_map(|attr| obj.get(attr).map(|value| (attr.clone(), value.clone())))
            .collect();
        Event {
            op: EventOp::Removed,
            entity: Some(entity.to_string()),
            pkey: Some(obj.pkey.clone()),
            step,
            schema_rev: rev,
            attrs: BTreeMap::new(),
            diff: AttrDiff::default(),
            fkeys,
            schema: None,
        }
    }

    /// Opening marker of an initsync sequence, carrying the public schema.
    pub fn initsync_begin(schema: Dataschema, step: u64) -> Event {
        let rev = schema.revision;
        Event {
            op: EventOp::InitsyncBegin,
            entity: None,
            pkey: None,
            step,
            schema_rev: rev,
            attrs: BTreeMap::new(),
            diff: AttrDiff::default(),
            fkeys: BTreeMap::new(),
            schema: Some(schema),
        }
    }

    /// Closing marker of an initsync sequence.
    pub fn initsync_end(step: u64, rev: u32) -> Event {
        Event {
            op: EventOp::InitsyncEnd,
            entity: None,
            pkey: None,
            step,
            schema_rev: rev,
            attrs: BTreeMap::new(),
            diff: AttrDiff::default(),
            fkeys: BTreeMap::new(),
            schema: None,
        }
    }

    /// Broadcast of a new public schema revision.
    pub fn schema_update(schema: Dataschema, step: u64) -> Event {
        let rev = schema.revision;
        Event {
            op: EventOp::SchemaUpdate,
            entity: None,
            pkey: None,
            step,
            schema_rev: rev,
            attrs: BTreeMap::new(),
            diff: AttrDiff::default(),
            fkeys: BTreeMap::new(),
            schema: Some(schema),
        }
    }

    pub fn identity(&self) -> EventIdentity {
        EventIdentity {
            entity: self.entity.clone(),
            pkey: self.pkey.clone(),
            step: self.step,
            op: self.op,
        }
    }

    /// Printable form with secret attribute values masked.
    pub fn to_display(&self, secrets: &BTreeSet<String>) -> String {
        let target = match (&self.entity, &self.pkey) {
            (Some(entity), Some(pkey)) => format!("{entity}[{pkey}]"),
            _ => "-".to_string(),
        };
        let mask = |attrs: &BTreeMap<String, Value>| -> String {
            let parts: Vec<String> = attrs
                .iter()
                .map(|(attr, value)| {
                    if secrets.contains(attr) {
                        format!("{attr}=<SECRET>")
                    } else {
                        format!("{attr}={value}")
                    }
                })
                .collect();
            parts.join(", ")
        };
        match self.op {
            EventOp::Added => format!("<Event(added {target} {{{}}})>", mask(&self.attrs)),
            EventOp::Modified => format!(
                "<Event(modified {target} added{{{}}} modified{{{}}} removed{:?})>",
                mask(&self.diff.added),
                mask(&self.diff.modified),
                self.diff.removed
            ),
            EventOp::Removed => format!("<Event(removed {target})>"),
            op => format!("<Event({op})>"),
        }
    }
}

/// Serde mirror of the wire shape; `attrs` is polymorphic on `op`.
#[derive(Serialize, Deserialize)]
struct WireEvent {
    op: EventOp,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pkey: Option<Pkey>,
    #[serde(default)]
    step: u64,
    schema_rev: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attrs: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fkeys: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema: Option<Dataschema>,
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let attrs = match self.op {
            EventOp::Added => Some(
                serde_json::to_value(&self.attrs).map_err(serde::ser::Error::custom)?,
            ),
            EventOp::Modified => {
                Some(serde_json::to_value(&self.diff).map_err(serde::ser::Error::custom)?)
            }
            _ => None,
        };
        let wire = WireEvent {
            op: self.op,
            entity: self.entity.clone(),
            pkey: self.pkey.clone(),
            step: self.step,
            schema_rev: self.schema_rev,
            attrs,
            fkeys: if self.fkeys.is_empty() {
                None
            } else {
                Some(self.fkeys.clone())
            },
            schema: self.schema.clone(),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEvent::deserialize(deserializer)?;
        let mut event = Event {
            op: wire.op,
            entity: wire.entity,
            pkey: wire.pkey,
            step: wire.step,
            schema_rev: wire.schema_rev,
            attrs: BTreeMap::new(),
            diff: AttrDiff::default(),
            fkeys: wire.fkeys.unwrap_or_default(),
            schema: wire.schema,
        };
        match (wire.op, wire.attrs) {
            (EventOp::Added, Some(json)) => {
                event.attrs = serde_json::from_value(json).map_err(D::Error::custom)?;
            }
            (EventOp::Modified, Some(json)) => {
                event.diff = serde_json::from_value(json).map_err(D::Error::custom)?;
            }
            _ => {}
        }
        Ok(event)
    }
}
