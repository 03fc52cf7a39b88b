//! Rendering of a trace class as a TSDL metadata document.

use crate::{
    config::{NativeByteOrder, PreferredDisplayBase},
    ir,
    meta::{EventClass, FieldClass, FieldClassKind, IntFieldClass, StreamClass, TraceClass},
};
use std::fmt::Write;

/// Renders the complete TSDL metadata document for `tc`.
pub(crate) fn render_metadata(tc: &TraceClass, byte_order: NativeByteOrder) -> String {
    let mut ctx = Ctx {
        indent_level: 0,
        tsdl: String::new(),
    };

    ctx.tsdl.push_str("/* CTF 1.8 */\n\n");
    ctx.tsdl
        .push_str("/* This was generated by a ctf-fs-sink component. */\n\n");

    append_trace_class(&mut ctx, tc, byte_order);
    append_environment(&mut ctx, tc);

    for sc in tc.stream_classes.iter() {
        append_stream_class(&mut ctx, sc);
    }

    ctx.tsdl
}

struct Ctx {
    indent_level: usize,
    tsdl: String,
}

impl Ctx {
    fn append_indent(&mut self) {
        for _ in 0..self.indent_level {
            self.tsdl.push('\t');
        }
    }

    fn append(&mut self, s: &str) {
        self.tsdl.push_str(s);
    }

    fn append_line(&mut self, s: &str) {
        self.append_indent();
        self.tsdl.push_str(s);
        self.tsdl.push('\n');
    }

    fn append_end_block(&mut self) {
        self.indent_level -= 1;
        self.append_indent();
        self.tsdl.push('}');
    }

    fn append_end_block_semi_nl(&mut self) {
        self.indent_level -= 1;
        self.append_indent();
        self.tsdl.push_str("};\n");
    }

    fn append_end_block_semi_nl_nl(&mut self) {
        self.append_end_block_semi_nl();
        self.tsdl.push('\n');
    }
}

/// Appends the content of a TSDL literal string, escaping C-style:
/// printable ASCII passes through, `"` and `\` are escaped, the usual
/// control characters use their short forms, and any other byte is
/// `\xHH`.
fn append_quoted_string_content(ctx: &mut Ctx, s: &str) {
    for b in s.bytes() {
        match b {
            0x07 => ctx.append("\\a"),
            0x08 => ctx.append("\\b"),
            0x0c => ctx.append("\\f"),
            b'\n' => ctx.append("\\n"),
            b'\r' => ctx.append("\\r"),
            b'\t' => ctx.append("\\t"),
            0x0b => ctx.append("\\v"),
            b'"' => ctx.append("\\\""),
            b'\\' => ctx.append("\\\\"),
            0x20..=0x7e => ctx.tsdl.push(b as char),
            _ => {
                let _ = write!(ctx.tsdl, "\\x{b:02x}");
            }
        }
    }
}

fn append_quoted_string(ctx: &mut Ctx, s: &str) {
    ctx.tsdl.push('"');
    append_quoted_string_content(ctx, s);
    ctx.tsdl.push('"');
}

fn append_uuid(ctx: &mut Ctx, uuid: &uuid::Uuid) {
    let _ = write!(ctx.tsdl, "\"{uuid}\"");
}

/// Appends an `integer { ... }` type from raw properties; used both
/// for translated integer field classes and for the reserved members
/// the emitter synthesizes itself.
#[allow(clippy::too_many_arguments)]
fn append_integer_from_props(
    ctx: &mut Ctx,
    size: u32,
    alignment: u32,
    is_signed: bool,
    display_base: PreferredDisplayBase,
    mapped_clock_class_name: Option<&str>,
    field_name: Option<&str>,
    end: bool,
) {
    let _ = write!(ctx.tsdl, "integer {{ size = {size}; align = {alignment};");

    if is_signed {
        ctx.append(" signed = true;");
    }

    match display_base {
        PreferredDisplayBase::Decimal => (),
        PreferredDisplayBase::Binary => ctx.append(" base = b;"),
        PreferredDisplayBase::Octal => ctx.append(" base = o;"),
        PreferredDisplayBase::Hexadecimal => ctx.append(" base = x;"),
    }

    if let Some(clock_name) = mapped_clock_class_name {
        let _ = write!(ctx.tsdl, " map = clock.{clock_name}.value;");
    }

    ctx.append(" }");

    if let Some(name) = field_name {
        let _ = write!(ctx.tsdl, " {name}");
    }

    if end {
        ctx.append(";\n");
    }
}

fn append_enum_mappings(ctx: &mut Ctx, mappings: &[ir::EnumerationMapping]) {
    ctx.append(" {\n");
    ctx.indent_level += 1;

    for mapping in mappings.iter() {
        let ranges: Vec<String> = match &mapping.ranges {
            ir::RangeSet::Unsigned(ranges) => ranges
                .iter()
                .map(|r| {
                    if r.lower == r.upper {
                        format!("{}", r.lower)
                    } else {
                        format!("{} ... {}", r.lower, r.upper)
                    }
                })
                .collect(),
            ir::RangeSet::Signed(ranges) => ranges
                .iter()
                .map(|r| {
                    if r.lower == r.upper {
                        format!("{}", r.lower)
                    } else {
                        format!("{} ... {}", r.lower, r.upper)
                    }
                })
                .collect(),
        };

        for range in ranges.iter() {
            ctx.append_indent();
            ctx.tsdl.push('"');
            append_quoted_string_content(ctx, &mapping.label);
            ctx.append("\" = ");
            ctx.append(range);
            ctx.append(",\n");
        }
    }

    ctx.append_end_block();
}

fn append_int_field_class(ctx: &mut Ctx, fc: &FieldClass, int_fc: &IntFieldClass) {
    if int_fc.mappings.is_some() {
        ctx.append("enum : ");
    }

    append_integer_from_props(
        ctx,
        int_fc.size,
        fc.alignment,
        int_fc.is_signed,
        int_fc.display_base,
        None,
        None,
        false,
    );

    if let Some(mappings) = int_fc.mappings.as_deref() {
        append_enum_mappings(ctx, mappings);
    }
}

fn append_float_field_class(ctx: &mut Ctx, fc: &FieldClass, size: u32) {
    let (mant_dig, exp_dig) = if size == 32 { (24, 8) } else { (53, 11) };
    let _ = write!(
        ctx.tsdl,
        "floating_point {{ mant_dig = {mant_dig}; exp_dig = {exp_dig}; align = {}; }}",
        fc.alignment
    );
}

fn append_field_class(ctx: &mut Ctx, fc: &FieldClass) {
    match &fc.kind {
        // CTF 1.8 has no boolean type: 8-bit unsigned integer
        FieldClassKind::Bool { size } => append_integer_from_props(
            ctx,
            *size,
            fc.alignment,
            false,
            PreferredDisplayBase::Decimal,
            None,
            None,
            false,
        ),
        // CTF 1.8 has no bit array type: unsigned integer, hex base
        FieldClassKind::BitArray { size } => append_integer_from_props(
            ctx,
            *size,
            fc.alignment,
            false,
            PreferredDisplayBase::Hexadecimal,
            None,
            None,
            false,
        ),
        FieldClassKind::Int(int_fc) => append_int_field_class(ctx, fc, int_fc),
        FieldClassKind::Float { size } => append_float_field_class(ctx, fc, *size),
        FieldClassKind::String => ctx.append("string { encoding = UTF8; }"),
        FieldClassKind::Struct(_) => append_struct_field_class(ctx, fc),
        FieldClassKind::Option {
            tag_ref,
            content_fc,
        } => {
            let _ = write!(ctx.tsdl, "variant <{tag_ref}> {{\n");
            ctx.indent_level += 1;
            ctx.append_line("struct { } none;");
            ctx.append_indent();
            if let Some(content_fc) = content_fc.as_deref() {
                append_member(ctx, "content", content_fc);
            }
            ctx.append_end_block();
        }
        FieldClassKind::Variant {
            tag_ref, options, ..
        } => {
            let _ = write!(ctx.tsdl, "variant <{tag_ref}> {{\n");
            ctx.indent_level += 1;
            for option in options.iter() {
                ctx.append_indent();
                append_member(ctx, &option.name, &option.fc);
            }
            ctx.append_end_block();
        }
        FieldClassKind::Array { .. } | FieldClassKind::Sequence { .. } => {
            unreachable!("array lengths are peeled off by append_member")
        }
    }
}

/// Appends one named member, peeling array-family layers into
/// bracketed length suffixes (`name[4][len_ref]`).
fn append_member(ctx: &mut Ctx, name: &str, fc: &FieldClass) {
    let mut lengths = String::new();
    let mut fc = fc;

    loop {
        match &fc.kind {
            FieldClassKind::Array {
                length, elem_fc, ..
            } => {
                let _ = write!(lengths, "[{length}]");
                fc = elem_fc.as_deref().expect("arrays are complete after translation");
            }
            FieldClassKind::Sequence {
                length_ref,
                elem_fc,
                ..
            } => {
                let _ = write!(lengths, "[{length_ref}]");
                fc = elem_fc.as_deref().expect("sequences are complete after translation");
            }
            _ => break,
        }
    }

    append_field_class(ctx, fc);
    let _ = write!(ctx.tsdl, " {name}{lengths};\n");
}

/// Appends a structure's members, writing the synthesized length/tag
/// field of any created-before sequence, option, or variant member
/// first.
fn append_struct_field_class_members(ctx: &mut Ctx, fc: &FieldClass) {
    let struct_fc = fc.as_struct().expect("caller passes a structure");

    for member in struct_fc.members.iter() {
        match &member.fc.kind {
            FieldClassKind::Sequence {
                length_ref,
                length_is_before: true,
                ..
            } => {
                ctx.append_indent();
                append_integer_from_props(
                    ctx,
                    32,
                    8,
                    false,
                    PreferredDisplayBase::Decimal,
                    None,
                    Some(length_ref),
                    true,
                );
            }
            FieldClassKind::Option { tag_ref, .. } => {
                // The option is rendered as a variant; its 8-bit
                // enumeration tag always comes just before
                ctx.append_indent();
                ctx.append("enum : ");
                append_integer_from_props(
                    ctx,
                    8,
                    8,
                    false,
                    PreferredDisplayBase::Decimal,
                    None,
                    None,
                    false,
                );
                ctx.append(" {\n");
                ctx.indent_level += 1;
                ctx.append_line("none = 0,");
                ctx.append_line("content = 1,");
                ctx.append_end_block();
                let _ = write!(ctx.tsdl, " {tag_ref};\n");
            }
            FieldClassKind::Variant {
                tag_ref,
                tag_is_before: true,
                options,
            } => {
                ctx.append_indent();
                ctx.append("enum : ");
                append_integer_from_props(
                    ctx,
                    16,
                    8,
                    false,
                    PreferredDisplayBase::Decimal,
                    None,
                    None,
                    false,
                );
                ctx.append(" {\n");
                ctx.indent_level += 1;
                for (i, option) in options.iter().enumerate() {
                    ctx.append_indent();
                    ctx.tsdl.push('"');
                    append_quoted_string_content(ctx, &option.name);
                    let _ = write!(ctx.tsdl, "\" = {i},\n");
                }
                ctx.append_end_block();
                let _ = write!(ctx.tsdl, " {tag_ref};\n");
            }
            _ => (),
        }

        ctx.append_indent();
        append_member(ctx, &member.name, &member.fc);
    }
}

fn append_struct_field_class(ctx: &mut Ctx, fc: &FieldClass) {
    ctx.append("struct {\n");
    ctx.indent_level += 1;
    append_struct_field_class_members(ctx, fc);
    ctx.append_end_block();
    let _ = write!(ctx.tsdl, " align({})", fc.alignment);
}

fn append_event_class(ctx: &mut Ctx, sc: &StreamClass, ec: &EventClass) {
    ctx.append_indent();
    ctx.append("event {\n");
    ctx.indent_level += 1;

    ctx.append_indent();
    ctx.append("name = ");
    let name = ec
        .ir_ec
        .name
        .as_ref()
        .map(|n| n.as_str())
        .unwrap_or("unknown");
    append_quoted_string(ctx, name);
    ctx.append(";\n");

    ctx.append_indent();
    let _ = write!(ctx.tsdl, "stream_id = {};\n", sc.ir_sc.id);
    ctx.append_indent();
    let _ = write!(ctx.tsdl, "id = {};\n", ec.ir_ec.id);

    if let Some(emf_uri) = ec.ir_ec.emf_uri.as_deref() {
        ctx.append_indent();
        ctx.append("model.emf.uri = ");
        append_quoted_string(ctx, emf_uri);
        ctx.append(";\n");
    }

    if let Some(log_level) = ec.ir_ec.log_level {
        ctx.append_indent();
        let _ = write!(ctx.tsdl, "loglevel = {};\n", i32::from(log_level));
    }

    if let Some(fc) = ec.spec_context_fc.as_ref() {
        ctx.append_indent();
        ctx.append("context := ");
        append_field_class(ctx, fc);
        ctx.append(";\n");
    }

    if let Some(fc) = ec.payload_fc.as_ref() {
        ctx.append_indent();
        ctx.append("fields := ");
        append_field_class(ctx, fc);
        ctx.append(";\n");
    }

    ctx.append_end_block_semi_nl_nl();
}

fn append_clock_class(ctx: &mut Ctx, sc: &StreamClass) {
    let Some(clock_class) = sc.default_clock_class() else {
        return;
    };
    let name = sc
        .default_clock_class_name
        .as_deref()
        .expect("translated stream classes with a clock have a name");

    ctx.append_indent();
    ctx.append("clock {\n");
    ctx.indent_level += 1;
    ctx.append_indent();
    let _ = write!(ctx.tsdl, "name = {name};\n");

    if let Some(descr) = clock_class.description.as_deref() {
        ctx.append_indent();
        ctx.append("description = ");
        append_quoted_string(ctx, descr);
        ctx.append(";\n");
    }

    ctx.append_indent();
    let _ = write!(ctx.tsdl, "freq = {};\n", clock_class.frequency);
    ctx.append_indent();
    let _ = write!(ctx.tsdl, "precision = {};\n", clock_class.precision);
    ctx.append_indent();
    let _ = write!(ctx.tsdl, "offset_s = {};\n", clock_class.offset_seconds);
    ctx.append_indent();
    let _ = write!(ctx.tsdl, "offset = {};\n", clock_class.offset_cycles);
    ctx.append_indent();
    let _ = write!(
        ctx.tsdl,
        "absolute = {};\n",
        if clock_class.origin_is_unix_epoch {
            "true"
        } else {
            "false"
        }
    );

    if let Some(uuid) = clock_class.uuid.as_ref() {
        ctx.append_indent();
        ctx.append("uuid = ");
        append_uuid(ctx, uuid);
        ctx.append(";\n");
    }

    ctx.append_end_block_semi_nl_nl();
}

fn append_stream_class(ctx: &mut Ctx, sc: &StreamClass) {
    append_clock_class(ctx, sc);

    ctx.append_indent();
    ctx.append("stream {\n");
    ctx.indent_level += 1;

    ctx.append_indent();
    let _ = write!(ctx.tsdl, "id = {};\n", sc.ir_sc.id);

    // Packet context: the reserved members first, then the stream
    // class's own members
    ctx.append_indent();
    ctx.append("packet.context := struct {\n");
    ctx.indent_level += 1;
    ctx.append_indent();
    append_integer_from_props(
        ctx,
        64,
        8,
        false,
        PreferredDisplayBase::Decimal,
        None,
        Some("packet_size"),
        true,
    );
    ctx.append_indent();
    append_integer_from_props(
        ctx,
        64,
        8,
        false,
        PreferredDisplayBase::Decimal,
        None,
        Some("content_size"),
        true,
    );

    if sc.packets_have_ts_begin {
        ctx.append_indent();
        append_integer_from_props(
            ctx,
            64,
            8,
            false,
            PreferredDisplayBase::Decimal,
            sc.default_clock_class_name.as_deref(),
            Some("timestamp_begin"),
            true,
        );
    }

    if sc.packets_have_ts_end {
        ctx.append_indent();
        append_integer_from_props(
            ctx,
            64,
            8,
            false,
            PreferredDisplayBase::Decimal,
            sc.default_clock_class_name.as_deref(),
            Some("timestamp_end"),
            true,
        );
    }

    if sc.has_discarded_events {
        ctx.append_indent();
        append_integer_from_props(
            ctx,
            64,
            8,
            false,
            PreferredDisplayBase::Decimal,
            None,
            Some("events_discarded"),
            true,
        );
    }

    // Written unconditionally: even without discarded packets
    // messages the sequence number is useful information
    ctx.append_indent();
    append_integer_from_props(
        ctx,
        64,
        8,
        false,
        PreferredDisplayBase::Decimal,
        None,
        Some("packet_seq_num"),
        true,
    );

    if let Some(fc) = sc.packet_context_fc.as_ref() {
        append_struct_field_class_members(ctx, fc);
    }

    ctx.append_end_block();
    let _ = write!(
        ctx.tsdl,
        " align({});\n\n",
        sc.packet_context_fc.as_ref().map(|fc| fc.alignment).unwrap_or(8)
    );

    // Event header
    ctx.append_indent();
    ctx.append("event.header := struct {\n");
    ctx.indent_level += 1;
    ctx.append_indent();
    append_integer_from_props(
        ctx,
        64,
        8,
        false,
        PreferredDisplayBase::Decimal,
        None,
        Some("id"),
        true,
    );

    if sc.default_clock_class().is_some() {
        ctx.append_indent();
        append_integer_from_props(
            ctx,
            64,
            8,
            false,
            PreferredDisplayBase::Decimal,
            sc.default_clock_class_name.as_deref(),
            Some("timestamp"),
            true,
        );
    }

    ctx.append_end_block();
    ctx.append(" align(8);\n");

    if let Some(fc) = sc.event_common_context_fc.as_ref() {
        ctx.append_indent();
        ctx.append("event.context := ");
        append_field_class(ctx, fc);
        ctx.append(";\n");
    }

    ctx.append_end_block_semi_nl_nl();

    for ec in sc.event_classes.iter() {
        append_event_class(ctx, sc, ec);
    }
}

fn append_trace_class(ctx: &mut Ctx, tc: &TraceClass, byte_order: NativeByteOrder) {
    ctx.append_indent();
    ctx.append("trace {\n");
    ctx.indent_level += 1;

    ctx.append_line("major = 1;");
    ctx.append_line("minor = 8;");
    ctx.append_indent();
    ctx.append("uuid = ");
    append_uuid(ctx, &tc.uuid);
    ctx.append(";\n");
    ctx.append_indent();
    let _ = write!(
        ctx.tsdl,
        "byte_order = {};\n",
        match byte_order {
            NativeByteOrder::LittleEndian => "le",
            NativeByteOrder::BigEndian => "be",
        }
    );

    ctx.append_indent();
    ctx.append("packet.header := struct {\n");
    ctx.indent_level += 1;
    ctx.append_indent();
    append_integer_from_props(
        ctx,
        32,
        8,
        false,
        PreferredDisplayBase::Hexadecimal,
        None,
        Some("magic"),
        true,
    );
    ctx.append_indent();
    append_integer_from_props(
        ctx,
        8,
        8,
        false,
        PreferredDisplayBase::Decimal,
        None,
        Some("uuid[16]"),
        true,
    );
    ctx.append_indent();
    append_integer_from_props(
        ctx,
        64,
        8,
        false,
        PreferredDisplayBase::Decimal,
        None,
        Some("stream_id"),
        true,
    );
    ctx.append_indent();
    append_integer_from_props(
        ctx,
        64,
        8,
        false,
        PreferredDisplayBase::Decimal,
        None,
        Some("stream_instance_id"),
        true,
    );
    ctx.append_end_block();
    ctx.append(" align(8);\n");

    ctx.append_end_block_semi_nl_nl();
}

fn append_environment(ctx: &mut Ctx, tc: &TraceClass) {
    if tc.ir_trace.environment.is_empty() {
        return;
    }

    ctx.append_indent();
    ctx.append("env {\n");
    ctx.indent_level += 1;

    for (name, value) in tc.ir_trace.environment.iter() {
        ctx.append_indent();
        let _ = write!(ctx.tsdl, "{name} = ");

        match value {
            ir::EnvironmentValue::Integer(v) => {
                let _ = write!(ctx.tsdl, "{v}");
            }
            ir::EnvironmentValue::String(s) => append_quoted_string(ctx, s),
            // Checked by translate_trace()
            _ => unreachable!("non-TSDL environment values are rejected during translation"),
        }

        ctx.append(";\n");
    }

    ctx.append_end_block_semi_nl_nl();
}
