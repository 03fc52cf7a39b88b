//! The input trace object model.
//!
//! Upstream producers describe their traces with the types in this
//! module: self-describing field classes, stream and event classes,
//! and the runtime values (fields, events, packets) carried by
//! [`Message`]s. The sink consumes these and emits the strictly
//! narrower CTF 1.8 equivalent.

use crate::config::PreferredDisplayBase;
use derive_more::Display;
use internment::Intern;
use num_enum::{FromPrimitive, IntoPrimitive};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub type StreamId = u64;

pub type StreamClassId = u64;

pub type EventClassId = u64;

/// Clock snapshot in cycles
pub type ClockSnapshot = u64;

#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Display,
    IntoPrimitive,
    FromPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(i32)]
pub enum LogLevel {
    #[display("EMERG")]
    Emergency = 0,
    #[display("ALERT")]
    Alert = 1,
    #[display("CRIT")]
    Critical = 2,
    #[display("ERR")]
    Error = 3,
    #[display("WARNING")]
    Warning = 4,
    #[display("NOTICE")]
    Notice = 5,
    #[display("INFO")]
    Info = 6,
    #[display("DEBUG_SYSTEM")]
    DebugSystem = 7,
    #[display("DEBUG_PROGRAM")]
    DebugProgram = 8,
    #[display("DEBUG_PROCESS")]
    DebugProcess = 9,
    #[display("DEBUG_MODULE")]
    DebugModule = 10,
    #[display("DEBUG_UNIT")]
    DebugUnit = 11,
    #[display("DEBUG_FUNCTION")]
    DebugFunction = 12,
    #[display("DEBUG_LINE")]
    DebugLine = 13,
    #[display("DEBUG")]
    Debug = 14,
    #[display("{_0}")]
    #[num_enum(catch_all)]
    Other(i32),
}

/// A closed integer range `[lower, upper]`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IntegerRange<T> {
    pub lower: T,
    pub upper: T,
}

impl<T: Copy + Ord> IntegerRange<T> {
    pub fn new(lower: T, upper: T) -> Self {
        Self { lower, upper }
    }

    pub fn single(value: T) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    pub fn contains(&self, value: T) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// A set of integer ranges, signed or unsigned.
///
/// Both enumeration mappings and variant options carry their selector
/// values as one of these; the same equality is used to match a
/// variant option with its selector's enumeration mapping and to
/// compare plain range sets.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum RangeSet {
    Unsigned(Vec<IntegerRange<u64>>),
    Signed(Vec<IntegerRange<i64>>),
}

impl RangeSet {
    pub fn unsigned<I: IntoIterator<Item = (u64, u64)>>(ranges: I) -> Self {
        Self::Unsigned(
            ranges
                .into_iter()
                .map(|(lo, hi)| IntegerRange::new(lo, hi))
                .collect(),
        )
    }

    pub fn signed<I: IntoIterator<Item = (i64, i64)>>(ranges: I) -> Self {
        Self::Signed(
            ranges
                .into_iter()
                .map(|(lo, hi)| IntegerRange::new(lo, hi))
                .collect(),
        )
    }

    /// Set equality: same signedness and the same ranges, regardless
    /// of the order they were added in.
    pub fn is_equal(&self, other: &RangeSet) -> bool {
        match (self, other) {
            (Self::Unsigned(a), Self::Unsigned(b)) => {
                let mut a = a.clone();
                let mut b = b.clone();
                a.sort_unstable();
                b.sort_unstable();
                a == b
            }
            (Self::Signed(a), Self::Signed(b)) => {
                let mut a = a.clone();
                let mut b = b.clone();
                a.sort_unstable();
                b.sort_unstable();
                a == b
            }
            _ => false,
        }
    }
}

/// A single enumeration mapping: a label naming a set of integer
/// values.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EnumerationMapping {
    pub label: String,
    pub ranges: RangeSet,
}

/// A variant field class option.
#[derive(Clone, PartialEq, Debug)]
pub struct VariantOption {
    pub name: String,
    pub field_class: FieldClass,
    /// Selector values routing to this option; `None` when the variant
    /// has no selector field.
    pub ranges: Option<RangeSet>,
}

/// A field class describes the type of one data field.
#[derive(Clone, PartialEq, Debug)]
pub enum FieldClass {
    Bool,
    BitArray {
        length: u32,
    },
    UnsignedInteger {
        range_bits: u32,
        display_base: PreferredDisplayBase,
    },
    SignedInteger {
        range_bits: u32,
        display_base: PreferredDisplayBase,
    },
    UnsignedEnumeration {
        range_bits: u32,
        display_base: PreferredDisplayBase,
        mappings: Vec<EnumerationMapping>,
    },
    SignedEnumeration {
        range_bits: u32,
        display_base: PreferredDisplayBase,
        mappings: Vec<EnumerationMapping>,
    },
    SinglePrecisionReal,
    DoublePrecisionReal,
    String,
    Structure {
        members: Vec<(String, FieldClass)>,
    },
    StaticArray {
        element_field_class: Box<FieldClass>,
        length: u64,
    },
    DynamicArray {
        element_field_class: Box<FieldClass>,
        /// Path of the length field; `None` means the length is only
        /// known at run time and must be synthesized into the output.
        length_field_path: Option<FieldPath>,
    },
    Option {
        content_field_class: Box<FieldClass>,
        selector_field_path: Option<FieldPath>,
    },
    Variant {
        options: Vec<VariantOption>,
        selector_field_path: Option<FieldPath>,
    },
}

/// The scope a [`FieldPath`] is rooted in.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Scope {
    PacketContext,
    EventCommonContext,
    EventSpecificContext,
    EventPayload,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum FieldPathItem {
    /// Index of a structure member or variant option.
    Index(u64),
    CurrentArrayElement,
    CurrentOptionContent,
}

/// Locates a field class within one of the four root scopes.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FieldPath {
    pub scope: Scope,
    pub items: Vec<FieldPathItem>,
}

impl FieldPath {
    pub fn new<I: IntoIterator<Item = FieldPathItem>>(scope: Scope, items: I) -> Self {
        Self {
            scope,
            items: items.into_iter().collect(),
        }
    }
}

/// The type of a data stream clock.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ClockClass {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Frequency (Hz).
    pub frequency: u64,
    /// Precision (cycles).
    pub precision: u64,
    pub offset_seconds: i64,
    pub offset_cycles: u64,
    pub origin_is_unix_epoch: bool,
    pub uuid: Option<Uuid>,
}

impl Default for ClockClass {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            frequency: 1_000_000_000,
            precision: 0,
            offset_seconds: 0,
            offset_cycles: 0,
            origin_is_unix_epoch: true,
            uuid: None,
        }
    }
}

/// The type of an event record.
#[derive(Clone, PartialEq, Debug)]
pub struct EventClass {
    pub id: EventClassId,
    pub name: Option<Intern<String>>,
    pub emf_uri: Option<String>,
    pub log_level: Option<LogLevel>,
    /// Specific context structure, if any.
    pub specific_context_field_class: Option<FieldClass>,
    /// Payload structure, if any.
    pub payload_field_class: Option<FieldClass>,
}

impl EventClass {
    pub fn new(id: EventClassId) -> Self {
        Self {
            id,
            name: None,
            emf_uri: None,
            log_level: None,
            specific_context_field_class: None,
            payload_field_class: None,
        }
    }
}

/// The type of a data stream.
#[derive(Clone, PartialEq, Debug)]
pub struct StreamClass {
    pub id: StreamClassId,
    pub default_clock_class: Option<ClockClass>,
    pub supports_packets: bool,
    pub packets_have_beginning_clock_snapshot: bool,
    pub packets_have_end_clock_snapshot: bool,
    pub supports_discarded_events: bool,
    pub discarded_events_have_clock_snapshots: bool,
    pub supports_discarded_packets: bool,
    pub discarded_packets_have_clock_snapshots: bool,
    /// Packet context structure, if any.
    pub packet_context_field_class: Option<FieldClass>,
    /// Event common context structure, if any.
    pub event_common_context_field_class: Option<FieldClass>,
    pub event_classes: Vec<Arc<EventClass>>,
}

impl StreamClass {
    pub fn new(id: StreamClassId) -> Self {
        Self {
            id,
            default_clock_class: None,
            supports_packets: true,
            packets_have_beginning_clock_snapshot: false,
            packets_have_end_clock_snapshot: false,
            supports_discarded_events: false,
            discarded_events_have_clock_snapshots: false,
            supports_discarded_packets: false,
            discarded_packets_have_clock_snapshots: false,
            packet_context_field_class: None,
            event_common_context_field_class: None,
            event_classes: Vec::new(),
        }
    }

    pub fn event_class(&self, id: EventClassId) -> Option<&Arc<EventClass>> {
        self.event_classes.iter().find(|ec| ec.id == id)
    }
}

/// A trace environment entry value.
#[derive(Clone, PartialEq, Debug)]
pub enum EnvironmentValue {
    Integer(i64),
    String(String),
    Bool(bool),
    Real(OrderedFloat<f64>),
}

impl From<i64> for EnvironmentValue {
    fn from(v: i64) -> Self {
        EnvironmentValue::Integer(v)
    }
}

impl From<&str> for EnvironmentValue {
    fn from(v: &str) -> Self {
        EnvironmentValue::String(v.to_owned())
    }
}

impl From<String> for EnvironmentValue {
    fn from(v: String) -> Self {
        EnvironmentValue::String(v)
    }
}

/// A source trace: named stream container plus environment entries.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Trace {
    pub name: Option<Intern<String>>,
    pub uuid: Option<Uuid>,
    /// Ordered `(name, value)` entries.
    pub environment: Vec<(String, EnvironmentValue)>,
}

impl Trace {
    pub fn environment_entry(&self, name: &str) -> Option<&EnvironmentValue> {
        self.environment
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }
}

/// A data stream instance.
#[derive(Clone, PartialEq, Debug)]
pub struct Stream {
    pub id: StreamId,
    pub name: Option<Intern<String>>,
    pub class: Arc<StreamClass>,
    pub trace: Arc<Trace>,
}

/// A runtime field value; shapes mirror [`FieldClass`].
#[derive(Clone, PartialEq, Debug)]
pub enum Field {
    Bool(bool),
    BitArray(u64),
    UnsignedInteger(u64),
    SignedInteger(i64),
    Real(OrderedFloat<f64>),
    String(String),
    Structure(Vec<Field>),
    Array(Vec<Field>),
    Option(Option<Box<Field>>),
    Variant {
        selected_index: u64,
        field: Box<Field>,
    },
}

impl Field {
    pub fn structure<I: IntoIterator<Item = Field>>(members: I) -> Self {
        Field::Structure(members.into_iter().collect())
    }
}

impl From<u64> for Field {
    fn from(v: u64) -> Self {
        Field::UnsignedInteger(v)
    }
}

impl From<i64> for Field {
    fn from(v: i64) -> Self {
        Field::SignedInteger(v)
    }
}

impl From<f64> for Field {
    fn from(v: f64) -> Self {
        Field::Real(OrderedFloat(v))
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Field::String(v.to_owned())
    }
}

impl From<bool> for Field {
    fn from(v: bool) -> Self {
        Field::Bool(v)
    }
}

/// An event record.
#[derive(Clone, PartialEq, Debug)]
pub struct Event {
    pub class: Arc<EventClass>,
    pub common_context: Option<Field>,
    pub specific_context: Option<Field>,
    pub payload: Option<Field>,
}

/// A packet, as delivered by a packet beginning message.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Packet {
    /// Values for the stream class's packet context structure, if any.
    pub context: Option<Field>,
}

/// One message from the upstream iterator.
#[derive(Clone, PartialEq, Debug)]
pub enum Message {
    StreamBeginning {
        stream: Arc<Stream>,
    },
    StreamEnd {
        stream: Arc<Stream>,
    },
    PacketBeginning {
        stream: Arc<Stream>,
        packet: Packet,
        clock_snapshot: Option<ClockSnapshot>,
    },
    PacketEnd {
        stream: Arc<Stream>,
        clock_snapshot: Option<ClockSnapshot>,
    },
    Event {
        stream: Arc<Stream>,
        event: Event,
        clock_snapshot: Option<ClockSnapshot>,
    },
    DiscardedEvents {
        stream: Arc<Stream>,
        count: Option<u64>,
        beginning_clock_snapshot: Option<ClockSnapshot>,
        end_clock_snapshot: Option<ClockSnapshot>,
    },
    DiscardedPackets {
        stream: Arc<Stream>,
        count: Option<u64>,
        beginning_clock_snapshot: Option<ClockSnapshot>,
        end_clock_snapshot: Option<ClockSnapshot>,
    },
    /// No-op for this sink.
    MessageIteratorInactivity,
    /// No-op for this sink (not representable in CTF 1.8).
    StreamActivityBeginning {
        stream: Arc<Stream>,
    },
    /// No-op for this sink (not representable in CTF 1.8).
    StreamActivityEnd {
        stream: Arc<Stream>,
    },
}

/// Result of pulling one message batch from an upstream iterator.
#[derive(Clone, PartialEq, Debug)]
pub enum MessageIteratorNext {
    Messages(Vec<Message>),
    TryAgain,
    End,
}

/// The upstream message source the sink consumes from.
pub trait MessageIterator {
    fn next(&mut self) -> Result<MessageIteratorNext, crate::error::Error>;
}
