//! The CTF 1.8 metadata object model.
//!
//! This is the narrow target of the schema translation: a pure owned
//! tree of field classes plus the event/stream/trace class records
//! that own them. Nodes are addressed by index paths (the sequence of
//! child indices from a scope root), which stands in for object
//! identity during reference resolution.

use crate::config::PreferredDisplayBase;
use crate::ir;
use fxhash::FxHashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Child-index path from a scope root to a node. Structure members
/// and variant options use their member/option index; array elements
/// and option content use `0`.
pub(crate) type NodePath = Vec<u64>;

#[derive(Clone, PartialEq, Debug)]
pub struct NamedFieldClass {
    pub name: String,
    pub fc: FieldClass,
}

#[derive(Clone, PartialEq, Debug)]
pub struct IntFieldClass {
    pub size: u32,
    pub is_signed: bool,
    pub display_base: PreferredDisplayBase,
    /// Enumeration mappings, preserved verbatim from the source field
    /// class when it was an enumeration.
    pub mappings: Option<Vec<ir::EnumerationMapping>>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct StructFieldClass {
    pub members: Vec<NamedFieldClass>,
}

impl StructFieldClass {
    pub fn member_by_name(&self, name: &str) -> Option<&NamedFieldClass> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn has_member_named(&self, name: &str) -> bool {
        self.member_by_name(name).is_some()
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum FieldClassKind {
    /// CTF 1.8 has no boolean field class type; rendered as an 8-bit
    /// unsigned integer.
    Bool { size: u32 },
    /// CTF 1.8 has no bit array field class type; rendered as an
    /// unsigned integer with a hexadecimal base.
    BitArray { size: u32 },
    Int(IntFieldClass),
    Float { size: u32 },
    String,
    Struct(StructFieldClass),
    Array {
        length: u64,
        elem_fc: Option<Box<FieldClass>>,
    },
    Sequence {
        length_ref: String,
        length_is_before: bool,
        elem_fc: Option<Box<FieldClass>>,
    },
    /// CTF 1.8 has no option field class type; rendered as a variant
    /// with `none`/`content` alternatives and a synthesized 8-bit
    /// unsigned enumeration tag created just before it.
    Option {
        tag_ref: String,
        content_fc: Option<Box<FieldClass>>,
    },
    Variant {
        tag_ref: String,
        tag_is_before: bool,
        options: Vec<NamedFieldClass>,
    },
}

#[derive(Clone, PartialEq, Debug)]
pub struct FieldClass {
    /// Alignment of the first bit of instances (bits).
    pub alignment: u32,
    pub kind: FieldClassKind,
}

impl FieldClass {
    pub(crate) fn new(kind: FieldClassKind, alignment: u32) -> Self {
        Self { alignment, kind }
    }

    /// Alignment for a fixed-size bit field: byte alignment when the
    /// size is a whole number of bytes, bit alignment otherwise.
    pub(crate) fn bit_array_alignment(size: u32) -> u32 {
        if size % 8 == 0 {
            8
        } else {
            1
        }
    }

    pub(crate) fn as_struct(&self) -> Option<&StructFieldClass> {
        match &self.kind {
            FieldClassKind::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn as_int(&self) -> Option<&IntFieldClass> {
        match &self.kind {
            FieldClassKind::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Raises a structure's alignment to at least `alignment`; no-op
    /// for other kinds.
    pub(crate) fn align_at_least(&mut self, alignment: u32) {
        if matches!(self.kind, FieldClassKind::Struct(_)) && alignment > self.alignment {
            self.alignment = alignment;
        }
    }

    /// Borrows the direct child at `index` (see [`NodePath`]).
    pub(crate) fn child(&self, index: u64) -> Option<&FieldClass> {
        match &self.kind {
            FieldClassKind::Struct(s) => s.members.get(index as usize).map(|m| &m.fc),
            FieldClassKind::Variant { options, .. } => {
                options.get(index as usize).map(|o| &o.fc)
            }
            FieldClassKind::Array { elem_fc, .. } | FieldClassKind::Sequence { elem_fc, .. } => {
                elem_fc.as_deref()
            }
            FieldClassKind::Option { content_fc, .. } => content_fc.as_deref(),
            _ => None,
        }
    }

    /// Borrows the node at `path`, rooted at `self`.
    pub(crate) fn node_at(&self, path: &[u64]) -> Option<&FieldClass> {
        let mut fc = self;
        for index in path {
            fc = fc.child(*index)?;
        }
        Some(fc)
    }

    pub(crate) fn child_mut(&mut self, index: u64) -> Option<&mut FieldClass> {
        match &mut self.kind {
            FieldClassKind::Struct(s) => s.members.get_mut(index as usize).map(|m| &mut m.fc),
            FieldClassKind::Variant { options, .. } => {
                options.get_mut(index as usize).map(|o| &mut o.fc)
            }
            FieldClassKind::Array { elem_fc, .. } | FieldClassKind::Sequence { elem_fc, .. } => {
                elem_fc.as_deref_mut()
            }
            FieldClassKind::Option { content_fc, .. } => content_fc.as_deref_mut(),
            _ => None,
        }
    }

    pub(crate) fn node_at_mut(&mut self, path: &[u64]) -> Option<&mut FieldClass> {
        let mut fc = self;
        for index in path {
            fc = fc.child_mut(*index)?;
        }
        Some(fc)
    }
}

/// An event record class and the field classes it owns.
#[derive(Clone, PartialEq, Debug)]
pub struct EventClass {
    pub ir_ec: Arc<ir::EventClass>,
    pub spec_context_fc: Option<FieldClass>,
    pub payload_fc: Option<FieldClass>,
}

/// A data stream class and the field classes it owns.
#[derive(Clone, PartialEq, Debug)]
pub struct StreamClass {
    pub ir_sc: Arc<ir::StreamClass>,
    /// TSDL name of the default clock class, protected or synthesized
    /// (`default`, `default0`, ...); `None` without a default clock.
    pub default_clock_class_name: Option<String>,
    pub packets_have_ts_begin: bool,
    pub packets_have_ts_end: bool,
    pub has_discarded_events: bool,
    pub discarded_events_has_ts: bool,
    pub discarded_packets_has_ts: bool,
    pub packet_context_fc: Option<FieldClass>,
    pub event_common_context_fc: Option<FieldClass>,
    pub event_classes: Vec<EventClass>,
    event_classes_by_id: FxHashMap<ir::EventClassId, usize>,
}

impl StreamClass {
    pub(crate) fn new(ir_sc: Arc<ir::StreamClass>) -> Self {
        let has_discarded_events = ir_sc.supports_discarded_events;
        let discarded_events_has_ts =
            has_discarded_events && ir_sc.discarded_events_have_clock_snapshots;
        let discarded_packets_has_ts = ir_sc.supports_discarded_packets
            && ir_sc.discarded_packets_have_clock_snapshots;
        Self {
            packets_have_ts_begin: ir_sc.packets_have_beginning_clock_snapshot,
            packets_have_ts_end: ir_sc.packets_have_end_clock_snapshot,
            has_discarded_events,
            discarded_events_has_ts,
            discarded_packets_has_ts,
            default_clock_class_name: None,
            packet_context_fc: None,
            event_common_context_fc: None,
            event_classes: Vec::new(),
            event_classes_by_id: FxHashMap::default(),
            ir_sc,
        }
    }

    pub(crate) fn default_clock_class(&self) -> Option<&ir::ClockClass> {
        self.ir_sc.default_clock_class.as_ref()
    }

    pub fn event_class(&self, id: ir::EventClassId) -> Option<&EventClass> {
        self.event_classes_by_id
            .get(&id)
            .map(|i| &self.event_classes[*i])
    }

    pub(crate) fn insert_event_class(&mut self, ec: EventClass) -> &EventClass {
        let index = self.event_classes.len();
        self.event_classes_by_id.insert(ec.ir_ec.id, index);
        self.event_classes.push(ec);
        &self.event_classes[index]
    }
}

/// A trace class: the complete metadata for one output trace.
#[derive(Clone, PartialEq, Debug)]
pub struct TraceClass {
    pub ir_trace: Arc<ir::Trace>,
    /// Freshly generated for every output trace.
    pub uuid: Uuid,
    pub stream_classes: Vec<StreamClass>,
    stream_classes_by_id: FxHashMap<ir::StreamClassId, usize>,
}

impl TraceClass {
    pub(crate) fn new(ir_trace: Arc<ir::Trace>) -> Self {
        Self {
            ir_trace,
            uuid: Uuid::new_v4(),
            stream_classes: Vec::new(),
            stream_classes_by_id: FxHashMap::default(),
        }
    }

    pub fn stream_class_index(&self, id: ir::StreamClassId) -> Option<usize> {
        self.stream_classes_by_id.get(&id).copied()
    }

    pub(crate) fn stream_class_mut(&mut self, id: ir::StreamClassId) -> Option<&mut StreamClass> {
        let index = self.stream_class_index(id)?;
        Some(&mut self.stream_classes[index])
    }

    pub(crate) fn insert_stream_class(&mut self, sc: StreamClass) -> usize {
        let index = self.stream_classes.len();
        self.stream_classes_by_id.insert(sc.ir_sc.id, index);
        self.stream_classes.push(sc);
        index
    }

    pub(crate) fn clock_class_name_exists(&self, name: &str) -> bool {
        self.stream_classes
            .iter()
            .any(|sc| sc.default_clock_class_name.as_deref() == Some(name))
    }
}
