//! Per-stream runtime state: the packet state machine and the
//! recursive binary field writer.

use crate::{
    ctfser::Ctfser,
    error::Error,
    ir,
    meta::{EventClass, FieldClass, FieldClassKind, StreamClass},
};
use byteordered::Endianness;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Clock snapshot range carried by a discarded events/packets message,
/// kept until the surrounding packet boundaries validate it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct DiscardedRange {
    pub beginning_cs: u64,
    pub end_cs: u64,
}

#[derive(Clone, PartialEq, Debug, Default)]
pub(crate) struct PacketState {
    /// True between a packet beginning message and its packet end
    /// message; the serializer has an open packet exactly then.
    pub is_open: bool,
    pub beginning_cs: Option<u64>,
    pub end_cs: Option<u64>,
    /// Content size (bits) of the current packet.
    pub content_size: u64,
    /// Total size (bits) of the current packet.
    pub total_size: u64,
    /// Discarded events counter (free running).
    pub discarded_events_counter: u64,
    /// Sequence number (free running) of the current packet.
    pub seq_num: u64,
    /// Offset of the packet context structure within the current
    /// packet (bits), for the rewrite on close.
    pub context_offset_bits: u64,
    /// The source packet, held while the packet is open.
    pub packet: Option<ir::Packet>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub(crate) struct PrevPacketState {
    pub end_cs: Option<u64>,
    pub discarded_events_counter: Option<u64>,
    pub seq_num: Option<u64>,
}

pub(crate) struct Stream {
    pub ir_stream: Arc<ir::Stream>,
    /// Index of this stream's class within the trace class.
    pub sc_index: usize,
    pub file_name: String,
    pub packet_state: PacketState,
    pub prev_packet_state: PrevPacketState,
    pub discarded_events_range: Option<DiscardedRange>,
    pub discarded_packets_range: Option<DiscardedRange>,
    ctfser: Ctfser,
}

/// Replaces `/` and maps the `.`/`..` names so the stream name can be
/// used as a file name.
fn sanitize_stream_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c == '/' { '_' } else { c })
        .collect();

    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        "stream".to_owned()
    } else {
        sanitized
    }
}

/// Picks a stream file name that no other stream in the trace uses.
/// `metadata` is reserved for the metadata file and collides too.
pub(crate) fn make_unique_stream_file_name(existing: &[&str], base: &str) -> String {
    let base = sanitize_stream_file_name(base);
    let taken = |name: &str| name == "metadata" || existing.contains(&name);

    let mut name = base.clone();
    let mut suffix = 0_u32;
    while taken(&name) {
        name = format!("{base}-{suffix}");
        suffix += 1;
    }
    name
}

impl Stream {
    pub fn create(
        trace_dir: &Path,
        file_name: String,
        ir_stream: Arc<ir::Stream>,
        sc_index: usize,
        endianness: Endianness,
    ) -> Result<Self, Error> {
        let path = trace_dir.join(&file_name);
        let ctfser = Ctfser::new(&path, endianness)?;

        Ok(Self {
            ir_stream,
            sc_index,
            file_name,
            packet_state: PacketState::default(),
            prev_packet_state: PrevPacketState::default(),
            discarded_events_range: None,
            discarded_packets_range: None,
            ctfser,
        })
    }

    /// Flushes the stream file.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.ctfser.finish()
    }

    pub fn open_packet(
        &mut self,
        sc: &StreamClass,
        trace_uuid: &Uuid,
        cs: Option<u64>,
        packet: ir::Packet,
    ) -> Result<(), Error> {
        debug_assert!(!self.packet_state.is_open);
        self.packet_state.packet = Some(packet);
        if sc.packets_have_ts_begin {
            self.packet_state.beginning_cs = cs;
        }

        self.ctfser.open_packet();

        // Packet header
        self.ctfser.write_byte_aligned_unsigned(0xc1fc1fc1, 32);
        for b in trace_uuid.as_bytes() {
            self.ctfser.write_byte_aligned_unsigned(u64::from(*b), 8);
        }
        self.ctfser.write_byte_aligned_unsigned(sc.ir_sc.id, 64);
        self.ctfser
            .write_byte_aligned_unsigned(self.ir_stream.id, 64);

        // Save the context offset to rewrite it on close
        self.packet_state.context_offset_bits = self.ctfser.offset_in_current_packet_bits();

        // Placeholder packet context, just to advance to the content
        self.write_packet_context(sc)?;
        self.packet_state.is_open = true;
        debug!(
            stream_id = self.ir_stream.id,
            seq_num = self.packet_state.seq_num,
            "Opened packet"
        );
        Ok(())
    }

    pub fn close_packet(&mut self, sc: &StreamClass, cs: Option<u64>) -> Result<(), Error> {
        debug_assert!(self.packet_state.is_open);

        if sc.packets_have_ts_end {
            self.packet_state.end_cs = cs;
        }

        self.packet_state.content_size = self.ctfser.offset_in_current_packet_bits();
        self.packet_state.total_size = (self.packet_state.content_size + 7) & !7;

        // Rewrite the packet context with the true sizes and times
        self.ctfser
            .set_offset_in_current_packet_bits(self.packet_state.context_offset_bits);
        self.write_packet_context(sc)?;
        self.ctfser
            .close_current_packet(self.packet_state.total_size / 8)?;
        debug!(
            stream_id = self.ir_stream.id,
            seq_num = self.packet_state.seq_num,
            content_size = self.packet_state.content_size,
            total_size = self.packet_state.total_size,
            "Closed packet"
        );

        // Partially promote the current packet state; both counters
        // are free running
        debug_assert!(self
            .prev_packet_state
            .discarded_events_counter
            .map_or(true, |prev| self.packet_state.discarded_events_counter >= prev));
        debug_assert!(self
            .prev_packet_state
            .seq_num
            .map_or(true, |prev| self.packet_state.seq_num > prev));
        self.prev_packet_state.end_cs = self.packet_state.end_cs;
        self.prev_packet_state.discarded_events_counter =
            Some(self.packet_state.discarded_events_counter);
        self.prev_packet_state.seq_num = Some(self.packet_state.seq_num);

        // Reset the current packet state
        self.packet_state.beginning_cs = None;
        self.packet_state.end_cs = None;
        self.packet_state.content_size = 0;
        self.packet_state.total_size = 0;
        self.packet_state.seq_num += 1;
        self.packet_state.context_offset_bits = 0;
        self.packet_state.is_open = false;
        self.packet_state.packet = None;
        Ok(())
    }

    fn write_packet_context(&mut self, sc: &StreamClass) -> Result<(), Error> {
        // Unknown values stay at the sentinel until the rewrite
        self.ctfser
            .write_byte_aligned_unsigned(self.packet_state.total_size, 64);
        self.ctfser
            .write_byte_aligned_unsigned(self.packet_state.content_size, 64);

        if sc.packets_have_ts_begin {
            self.ctfser.write_byte_aligned_unsigned(
                self.packet_state.beginning_cs.unwrap_or(u64::MAX),
                64,
            );
        }

        if sc.packets_have_ts_end {
            self.ctfser
                .write_byte_aligned_unsigned(self.packet_state.end_cs.unwrap_or(u64::MAX), 64);
        }

        if sc.has_discarded_events {
            self.ctfser
                .write_byte_aligned_unsigned(self.packet_state.discarded_events_counter, 64);
        }

        self.ctfser
            .write_byte_aligned_unsigned(self.packet_state.seq_num, 64);

        // User members, from the source packet's context field
        if let Some(fc) = sc.packet_context_fc.as_ref() {
            let context_field = self
                .packet_state
                .packet
                .as_ref()
                .and_then(|packet| packet.context.as_ref())
                .ok_or_else(|| {
                    Error::unsupported_schema("packet has no context field for its context members")
                })?;
            write_struct_field(&mut self.ctfser, fc, context_field, false)?;
        }

        Ok(())
    }

    pub fn write_event(
        &mut self,
        sc: &StreamClass,
        ec: &EventClass,
        cs: Option<u64>,
        event: &ir::Event,
    ) -> Result<(), Error> {
        debug_assert!(self.packet_state.is_open);

        // Event header: event class id, then the clock snapshot when
        // the stream has a default clock
        self.ctfser.write_byte_aligned_unsigned(ec.ir_ec.id, 64);
        if sc.default_clock_class().is_some() {
            let cs = cs.ok_or_else(|| {
                Error::unsupported_schema("event carries no clock snapshot for a clocked stream")
            })?;
            self.ctfser.write_byte_aligned_unsigned(cs, 64);
        }

        if let Some(fc) = sc.event_common_context_fc.as_ref() {
            let field = event
                .common_context
                .as_ref()
                .ok_or_else(|| Error::unsupported_schema("event has no common context field"))?;
            write_struct_field(&mut self.ctfser, fc, field, true)?;
        }

        if let Some(fc) = ec.spec_context_fc.as_ref() {
            let field = event
                .specific_context
                .as_ref()
                .ok_or_else(|| Error::unsupported_schema("event has no specific context field"))?;
            write_struct_field(&mut self.ctfser, fc, field, true)?;
        }

        if let Some(fc) = ec.payload_fc.as_ref() {
            let field = event
                .payload
                .as_ref()
                .ok_or_else(|| Error::unsupported_schema("event has no payload field"))?;
            write_struct_field(&mut self.ctfser, fc, field, true)?;
        }

        Ok(())
    }
}

fn write_struct_field(
    ctfser: &mut Ctfser,
    fc: &FieldClass,
    field: &ir::Field,
    align_struct: bool,
) -> Result<(), Error> {
    let struct_fc = fc
        .as_struct()
        .ok_or_else(|| Error::unsupported_schema("expected a structure field class"))?;
    let ir::Field::Structure(members) = field else {
        return Err(field_mismatch());
    };

    if align_struct {
        ctfser.align_to(fc.alignment);
    }

    if members.len() != struct_fc.members.len() {
        return Err(field_mismatch());
    }

    for (named_fc, member_field) in struct_fc.members.iter().zip(members.iter()) {
        write_field(ctfser, &named_fc.fc, member_field)?;
    }

    Ok(())
}

fn write_field(ctfser: &mut Ctfser, fc: &FieldClass, field: &ir::Field) -> Result<(), Error> {
    match &fc.kind {
        FieldClassKind::Bool { size } => {
            let ir::Field::Bool(value) = field else {
                return Err(field_mismatch());
            };
            ctfser.write_unsigned(u64::from(*value), fc.alignment, *size);
            Ok(())
        }
        FieldClassKind::BitArray { size } => {
            let ir::Field::BitArray(value) = field else {
                return Err(field_mismatch());
            };
            ctfser.write_unsigned(*value, fc.alignment, *size);
            Ok(())
        }
        FieldClassKind::Int(int_fc) => {
            if int_fc.is_signed {
                let ir::Field::SignedInteger(value) = field else {
                    return Err(field_mismatch());
                };
                ctfser.write_signed(*value, fc.alignment, int_fc.size);
            } else {
                let ir::Field::UnsignedInteger(value) = field else {
                    return Err(field_mismatch());
                };
                ctfser.write_unsigned(*value, fc.alignment, int_fc.size);
            }
            Ok(())
        }
        FieldClassKind::Float { size } => {
            let ir::Field::Real(value) = field else {
                return Err(field_mismatch());
            };
            if *size == 32 {
                ctfser.write_float32(value.0 as f32, fc.alignment);
            } else {
                ctfser.write_float64(value.0, fc.alignment);
            }
            Ok(())
        }
        FieldClassKind::String => {
            let ir::Field::String(value) = field else {
                return Err(field_mismatch());
            };
            ctfser.write_string(value);
            Ok(())
        }
        FieldClassKind::Struct(_) => write_struct_field(ctfser, fc, field, true),
        FieldClassKind::Array { elem_fc, .. } => {
            let ir::Field::Array(elements) = field else {
                return Err(field_mismatch());
            };
            let elem_fc = elem_fc
                .as_deref()
                .expect("arrays are complete after translation");
            for element in elements.iter() {
                write_field(ctfser, elem_fc, element)?;
            }
            Ok(())
        }
        FieldClassKind::Sequence {
            length_is_before,
            elem_fc,
            ..
        } => {
            let ir::Field::Array(elements) = field else {
                return Err(field_mismatch());
            };

            if *length_is_before {
                // The synthesized length field: 32-bit unsigned, byte
                // aligned
                ctfser.write_unsigned(elements.len() as u64, 8, 32);
            }

            let elem_fc = elem_fc
                .as_deref()
                .expect("sequences are complete after translation");
            for element in elements.iter() {
                write_field(ctfser, elem_fc, element)?;
            }
            Ok(())
        }
        FieldClassKind::Option { content_fc, .. } => {
            let ir::Field::Option(content) = field else {
                return Err(field_mismatch());
            };

            // The synthesized tag: 0 = none, 1 = content
            ctfser.write_unsigned(u64::from(content.is_some()), 8, 8);

            if let Some(content_field) = content.as_deref() {
                let content_fc = content_fc
                    .as_deref()
                    .expect("options are complete after translation");
                write_field(ctfser, content_fc, content_field)?;
            }
            Ok(())
        }
        FieldClassKind::Variant {
            tag_is_before,
            options,
            ..
        } => {
            let ir::Field::Variant {
                selected_index,
                field: selected_field,
            } = field
            else {
                return Err(field_mismatch());
            };

            if *tag_is_before {
                // The synthesized tag: the selected option's index
                ctfser.write_unsigned(*selected_index, 8, 16);
            }

            let option = options
                .get(*selected_index as usize)
                .ok_or_else(field_mismatch)?;
            write_field(ctfser, &option.fc, selected_field)
        }
    }
}

fn field_mismatch() -> Error {
    Error::unsupported_schema("field value does not match its field class")
}
