//! Translation of the input trace object model into the CTF 1.8
//! metadata model.
//!
//! Scope structures are rewritten member by member; cross-field
//! dependencies (sequence lengths, variant tags, option presence) are
//! resolved into a single-component relative field ref when possible,
//! an absolute field ref otherwise, and failing both, the dependent
//! field is marked to have its length/tag synthesized immediately
//! before it.

use crate::{
    error::Error,
    ident::{is_reserved_member_name, is_valid_identifier, protect_name},
    ir,
    meta::{
        EventClass, FieldClass, FieldClassKind, IntFieldClass, NamedFieldClass, NodePath,
        StreamClass, StructFieldClass, TraceClass,
    },
};
use itertools::Itertools;
use std::sync::Arc;
use tracing::error;

/// Validates the source trace's environment and creates the output
/// trace class. Stream classes and event classes are translated
/// lazily, on first sight.
pub(crate) fn translate_trace(ir_trace: &Arc<ir::Trace>) -> Result<TraceClass, Error> {
    for (name, value) in ir_trace.environment.iter() {
        if !is_valid_identifier(name) {
            error!(%name, "Unsupported trace environment entry name");
            return Err(Error::unsupported_environment(name));
        }

        match value {
            ir::EnvironmentValue::Integer(_) | ir::EnvironmentValue::String(_) => (),
            _ => {
                error!(%name, "Unsupported trace environment entry value type");
                return Err(Error::unsupported_environment(name));
            }
        }
    }

    Ok(TraceClass::new(ir_trace.clone()))
}

/// Returns the index of the stream class for `ir_sc` within `tc`,
/// translating it first if this is the first sight of it.
pub(crate) fn translate_stream_class(
    tc: &mut TraceClass,
    ir_sc: &Arc<ir::StreamClass>,
) -> Result<usize, Error> {
    if let Some(index) = tc.stream_class_index(ir_sc.id) {
        return Ok(index);
    }

    let mut sc = StreamClass::new(ir_sc.clone());

    if let Some(clock_class) = ir_sc.default_clock_class.as_ref() {
        sc.default_clock_class_name = Some(derive_clock_class_name(tc, clock_class));
    }

    sc.packet_context_fc = translate_scope_field_class(
        ir::Scope::PacketContext,
        ir_sc.packet_context_field_class.as_ref(),
        ScopeRoots::default(),
    )?;

    if let Some(fc) = sc.packet_context_fc.as_mut() {
        // The reserved members the emitter prepends are 8-bit aligned
        fc.align_at_least(8);
    }

    sc.event_common_context_fc = translate_scope_field_class(
        ir::Scope::EventCommonContext,
        ir_sc.event_common_context_field_class.as_ref(),
        ScopeRoots {
            packet_context: sc.packet_context_fc.as_ref(),
            ..Default::default()
        },
    )?;

    Ok(tc.insert_stream_class(sc))
}

/// Translates the event class for `ir_ec` within the stream class
/// identified by `sc_id`, unless it was already translated.
pub(crate) fn translate_event_class(
    tc: &mut TraceClass,
    sc_id: ir::StreamClassId,
    ir_ec: &Arc<ir::EventClass>,
) -> Result<(), Error> {
    let sc = tc
        .stream_class_mut(sc_id)
        .ok_or_else(|| Error::unsupported_schema("event for an untranslated stream class"))?;

    if sc.event_class(ir_ec.id).is_some() {
        return Ok(());
    }

    let spec_context_fc = translate_scope_field_class(
        ir::Scope::EventSpecificContext,
        ir_ec.specific_context_field_class.as_ref(),
        ScopeRoots {
            packet_context: sc.packet_context_fc.as_ref(),
            event_common_context: sc.event_common_context_fc.as_ref(),
            ..Default::default()
        },
    )?;

    let payload_fc = translate_scope_field_class(
        ir::Scope::EventPayload,
        ir_ec.payload_field_class.as_ref(),
        ScopeRoots {
            packet_context: sc.packet_context_fc.as_ref(),
            event_common_context: sc.event_common_context_fc.as_ref(),
            event_spec_context: spec_context_fc.as_ref(),
            event_payload: None,
        },
    )?;

    sc.insert_event_class(EventClass {
        ir_ec: ir_ec.clone(),
        spec_context_fc,
        payload_fc,
    });
    Ok(())
}

/// Derives the TSDL name for a stream class's default clock class:
/// the protected source name when it stays a valid identifier,
/// otherwise `default`, `default0`, `default1`, ... until the name is
/// unused within the trace.
fn derive_clock_class_name(tc: &TraceClass, clock_class: &ir::ClockClass) -> String {
    if let Some(name) = clock_class.name.as_deref() {
        let (protected, _) = protect_name(name, false);
        if is_valid_identifier(&protected) {
            return protected;
        }
    }

    let mut name = "default".to_owned();
    let mut suffix = 0_u32;
    while tc.clock_class_name_exists(&name) {
        name = format!("default{suffix}");
        suffix += 1;
    }
    name
}

/// Completed scope roots available for reference resolution while
/// another scope is being translated.
#[derive(Copy, Clone, Default)]
struct ScopeRoots<'a> {
    packet_context: Option<&'a FieldClass>,
    event_common_context: Option<&'a FieldClass>,
    event_spec_context: Option<&'a FieldClass>,
    event_payload: Option<&'a FieldClass>,
}

impl<'a> ScopeRoots<'a> {
    fn get(&self, scope: ir::Scope) -> Option<&'a FieldClass> {
        match scope {
            ir::Scope::PacketContext => self.packet_context,
            ir::Scope::EventCommonContext => self.event_common_context,
            ir::Scope::EventSpecificContext => self.event_spec_context,
            ir::Scope::EventPayload => self.event_payload,
        }
    }
}

/// One frame of the translator's current path.
struct Frame<'a> {
    name: Option<String>,
    ir_fc: &'a ir::FieldClass,
    /// Node path of the (partially built) parent the translated field
    /// class is appended to; `None` for the scope root frame.
    parent: Option<NodePath>,
}

/// Outcome of resolving a target field path.
enum Resolution {
    /// The target is reachable through a field ref.
    Ref {
        ref_str: String,
        target_scope: ir::Scope,
        target: NodePath,
    },
    /// The length/tag field must be synthesized just before the
    /// dependent field class.
    Before,
}

struct Translator<'a> {
    scope: ir::Scope,
    roots: ScopeRoots<'a>,
    /// The scope root structure being built.
    root: FieldClass,
    stack: Vec<Frame<'a>>,
}

fn empty_struct_fc() -> FieldClass {
    FieldClass::new(
        FieldClassKind::Struct(StructFieldClass {
            members: Vec::new(),
        }),
        1,
    )
}

/// Translates one scope's root structure field class, resolving field
/// refs and assigning synthesized `__...` ref names.
fn translate_scope_field_class(
    scope: ir::Scope,
    ir_fc: Option<&ir::FieldClass>,
    roots: ScopeRoots<'_>,
) -> Result<Option<FieldClass>, Error> {
    let Some(ir_fc) = ir_fc else {
        return Ok(None);
    };

    let ir::FieldClass::Structure { members } = ir_fc else {
        return Err(Error::unsupported_schema(
            "scope root field class is not a structure",
        ));
    };

    let mut translator = Translator {
        scope,
        roots,
        root: empty_struct_fc(),
        stack: vec![Frame {
            name: None,
            ir_fc,
            parent: None,
        }],
    };

    translator.translate_structure_members(Vec::new(), members)?;
    translator.stack.pop();

    let mut root = translator.root;
    set_field_refs(&mut root)?;
    Ok(Some(root))
}

impl<'a> Translator<'a> {
    fn push(
        &mut self,
        name: Option<&str>,
        protect: bool,
        ir_fc: &'a ir::FieldClass,
        parent: NodePath,
    ) -> Result<(), Error> {
        let final_name = match name {
            Some(raw) => {
                if self.scope == ir::Scope::PacketContext {
                    for reserved in [
                        "packet_size",
                        "content_size",
                        "timestamp_begin",
                        "timestamp_end",
                        "events_discarded",
                        "packet_seq_num",
                    ] {
                        if is_reserved_member_name(raw, reserved) {
                            error!(
                                name = raw,
                                "Unsupported reserved TSDL packet context member name"
                            );
                            return Err(Error::unsupported_identifier(raw));
                        }
                    }
                }

                let final_name = if protect {
                    protect_name(raw, false).0
                } else {
                    raw.to_owned()
                };

                if !is_valid_identifier(&final_name) {
                    error!(
                        name = %final_name,
                        "Unsupported non-TSDL structure member or variant option name"
                    );
                    return Err(Error::unsupported_identifier(final_name));
                }

                Some(final_name)
            }
            None => None,
        };

        self.stack.push(Frame {
            name: final_name,
            ir_fc,
            parent: Some(parent),
        });
        Ok(())
    }

    fn pop(&mut self) {
        self.stack.pop();
    }

    fn top(&self) -> &Frame<'a> {
        self.stack.last().expect("path stack is never empty here")
    }

    /// Appends `fc` under the top frame's parent; returns the new
    /// node's path.
    fn append_to_parent(&mut self, fc: FieldClass) -> NodePath {
        let frame = self.stack.last().expect("path stack is never empty here");
        let parent_path = frame
            .parent
            .clone()
            .expect("non-root frames always have a parent");
        let child_alignment = fc.alignment;
        let parent = self
            .root
            .node_at_mut(&parent_path)
            .expect("parent path points into the built tree");

        let mut child_path = parent_path;
        match &mut parent.kind {
            FieldClassKind::Struct(s) => {
                let name = frame
                    .name
                    .clone()
                    .expect("structure members always carry a name");
                s.members.push(NamedFieldClass { name, fc });
                child_path.push((s.members.len() - 1) as u64);
                parent.align_at_least(child_alignment);
            }
            FieldClassKind::Variant { options, .. } => {
                let name = frame
                    .name
                    .clone()
                    .expect("variant options always carry a name");
                options.push(NamedFieldClass { name, fc });
                child_path.push((options.len() - 1) as u64);
            }
            FieldClassKind::Option { content_fc, .. } => {
                *content_fc = Some(Box::new(fc));
                parent.alignment = child_alignment;
                child_path.push(0);
            }
            FieldClassKind::Array { elem_fc, .. } | FieldClassKind::Sequence { elem_fc, .. } => {
                *elem_fc = Some(Box::new(fc));
                parent.alignment = child_alignment;
                child_path.push(0);
            }
            _ => unreachable!("only compound field classes are parents"),
        }
        child_path
    }

    /// After a compound child is complete, propagates its final
    /// alignment into the top frame's parent.
    fn update_parent_alignment(&mut self, alignment: u32) {
        let frame = self.stack.last().expect("path stack is never empty here");
        let Some(parent_path) = frame.parent.clone() else {
            return;
        };
        let parent = self
            .root
            .node_at_mut(&parent_path)
            .expect("parent path points into the built tree");
        match &mut parent.kind {
            FieldClassKind::Struct(_) => parent.align_at_least(alignment),
            FieldClassKind::Array { .. } | FieldClassKind::Sequence { .. } => {
                parent.alignment = alignment;
            }
            _ => (),
        }
    }

    fn translate_structure_members(
        &mut self,
        struct_path: NodePath,
        members: &'a [(String, ir::FieldClass)],
    ) -> Result<(), Error> {
        for (name, member_ir_fc) in members.iter() {
            self.push(Some(name), true, member_ir_fc, struct_path.clone())?;
            self.translate_field_class()?;
            self.pop();
        }
        Ok(())
    }

    /// Translates the field class in the top frame, recursively.
    fn translate_field_class(&mut self) -> Result<(), Error> {
        let ir_fc = self.top().ir_fc;
        match ir_fc {
            ir::FieldClass::Bool => {
                // CTF 1.8 has no boolean type: 8-bit unsigned integer
                let fc = FieldClass::new(FieldClassKind::Bool { size: 8 }, 8);
                self.append_to_parent(fc);
                Ok(())
            }
            ir::FieldClass::BitArray { length } => {
                let fc = FieldClass::new(
                    FieldClassKind::BitArray { size: *length },
                    FieldClass::bit_array_alignment(*length),
                );
                self.append_to_parent(fc);
                Ok(())
            }
            ir::FieldClass::UnsignedInteger {
                range_bits,
                display_base,
            } => {
                self.translate_integer(*range_bits, false, *display_base, None);
                Ok(())
            }
            ir::FieldClass::SignedInteger {
                range_bits,
                display_base,
            } => {
                self.translate_integer(*range_bits, true, *display_base, None);
                Ok(())
            }
            ir::FieldClass::UnsignedEnumeration {
                range_bits,
                display_base,
                mappings,
            } => {
                self.translate_integer(*range_bits, false, *display_base, Some(mappings.clone()));
                Ok(())
            }
            ir::FieldClass::SignedEnumeration {
                range_bits,
                display_base,
                mappings,
            } => {
                self.translate_integer(*range_bits, true, *display_base, Some(mappings.clone()));
                Ok(())
            }
            ir::FieldClass::SinglePrecisionReal => {
                let fc = FieldClass::new(FieldClassKind::Float { size: 32 }, 8);
                self.append_to_parent(fc);
                Ok(())
            }
            ir::FieldClass::DoublePrecisionReal => {
                let fc = FieldClass::new(FieldClassKind::Float { size: 64 }, 8);
                self.append_to_parent(fc);
                Ok(())
            }
            ir::FieldClass::String => {
                let fc = FieldClass::new(FieldClassKind::String, 8);
                self.append_to_parent(fc);
                Ok(())
            }
            ir::FieldClass::Structure { members } => {
                let path = self.append_to_parent(empty_struct_fc());
                self.translate_structure_members(path.clone(), members)?;
                let alignment = self
                    .root
                    .node_at(&path)
                    .expect("appended node is reachable")
                    .alignment;
                self.update_parent_alignment(alignment);
                Ok(())
            }
            ir::FieldClass::StaticArray {
                element_field_class,
                length,
            } => {
                let fc = FieldClass::new(
                    FieldClassKind::Array {
                        length: *length,
                        elem_fc: None,
                    },
                    1,
                );
                let path = self.append_to_parent(fc);
                self.translate_element(path, element_field_class)
            }
            ir::FieldClass::DynamicArray {
                element_field_class,
                length_field_path,
            } => self.translate_dynamic_array(element_field_class, length_field_path.as_ref()),
            ir::FieldClass::Option {
                content_field_class,
                ..
            } => self.translate_option(content_field_class),
            ir::FieldClass::Variant {
                options,
                selector_field_path,
            } => self.translate_variant(options, selector_field_path.as_ref()),
        }
    }

    fn translate_integer(
        &mut self,
        size: u32,
        is_signed: bool,
        display_base: crate::config::PreferredDisplayBase,
        mappings: Option<Vec<ir::EnumerationMapping>>,
    ) {
        let fc = FieldClass::new(
            FieldClassKind::Int(IntFieldClass {
                size,
                is_signed,
                display_base,
                mappings,
            }),
            FieldClass::bit_array_alignment(size),
        );
        self.append_to_parent(fc);
    }

    /// Translates an array-family element into the node at `path`.
    fn translate_element(
        &mut self,
        path: NodePath,
        element_ir_fc: &'a ir::FieldClass,
    ) -> Result<(), Error> {
        self.push(None, false, element_ir_fc, path.clone())?;
        self.translate_field_class()?;
        self.pop();
        let alignment = self
            .root
            .node_at(&path)
            .expect("appended node is reachable")
            .alignment;
        self.update_parent_alignment(alignment);
        Ok(())
    }

    fn translate_dynamic_array(
        &mut self,
        element_ir_fc: &'a ir::FieldClass,
        length_field_path: Option<&ir::FieldPath>,
    ) -> Result<(), Error> {
        // Resolve the length field before appending to the parent so
        // that the sequence itself is not a resolution candidate
        let (length_ref, length_is_before) = match length_field_path {
            Some(field_path) => match self.resolve_field_class(Some(field_path))? {
                Resolution::Ref {
                    ref_str,
                    target_scope,
                    target,
                } => {
                    // The length must land on an integer field class
                    let is_int = self
                        .scope_node(target_scope, &target)
                        .map(|fc| fc.as_int().is_some())
                        .unwrap_or(false);
                    if is_int {
                        (ref_str, false)
                    } else {
                        (String::new(), true)
                    }
                }
                Resolution::Before => (String::new(), true),
            },
            None => (String::new(), true),
        };

        let fc = FieldClass::new(
            FieldClassKind::Sequence {
                length_ref,
                length_is_before,
                elem_fc: None,
            },
            1,
        );
        let path = self.append_to_parent(fc);
        self.translate_element(path, element_ir_fc)
    }

    /// CTF 1.8 does not support the option field class type; it is
    /// rendered as a variant whose options are an empty structure and
    /// the content itself, selected by an 8-bit unsigned enumeration
    /// tag that is always synthesized just before.
    fn translate_option(&mut self, content_ir_fc: &'a ir::FieldClass) -> Result<(), Error> {
        let fc = FieldClass::new(
            FieldClassKind::Option {
                tag_ref: String::new(),
                content_fc: None,
            },
            1,
        );
        let path = self.append_to_parent(fc);
        self.push(None, false, content_ir_fc, path.clone())?;
        self.translate_field_class()?;
        self.pop();
        let alignment = self
            .root
            .node_at(&path)
            .expect("appended node is reachable")
            .alignment;
        self.update_parent_alignment(alignment);
        Ok(())
    }

    fn translate_variant(
        &mut self,
        options: &'a [ir::VariantOption],
        selector_field_path: Option<&ir::FieldPath>,
    ) -> Result<(), Error> {
        let mut tag_ref = String::new();
        let mut tag_is_before = selector_field_path.is_none();
        let mut tag_mappings: Option<Vec<ir::EnumerationMapping>> = None;

        // Resolve the selector before appending to the parent
        if let Some(field_path) = selector_field_path {
            match self.resolve_field_class(Some(field_path))? {
                Resolution::Ref {
                    ref_str,
                    target_scope,
                    target,
                } => {
                    // The selector must be an integer enumeration with
                    // exactly one mapping per option
                    let mappings = self
                        .scope_node(target_scope, &target)
                        .and_then(|fc| fc.as_int())
                        .and_then(|int_fc| int_fc.mappings.clone());
                    match mappings {
                        Some(mappings) if mappings.len() == options.len() => {
                            tag_ref = ref_str;
                            tag_mappings = Some(mappings);
                        }
                        _ => tag_is_before = true,
                    }
                }
                Resolution::Before => tag_is_before = true,
            }
        }

        let mut option_names = if tag_is_before {
            None
        } else {
            let mappings = tag_mappings
                .as_deref()
                .expect("a resolved selector always has mappings here");
            match protect_option_names_against_mappings(options, mappings) {
                Some(names) => Some(names),
                None => {
                    tag_is_before = true;
                    None
                }
            }
        };

        // Bare protection when there's no selector to match against
        let names = option_names.take().unwrap_or_else(|| {
            options
                .iter()
                .map(|opt| protect_name(&opt.name, false).0)
                .collect::<Vec<_>>()
        });

        // Protected names that are no longer unique cannot reference a
        // selector; the synthesized one maps each option to its index
        if names.iter().duplicates().next().is_some() {
            tag_is_before = true;
        }

        if tag_is_before {
            tag_ref = String::new();
        }

        let fc = FieldClass::new(
            FieldClassKind::Variant {
                tag_ref,
                tag_is_before,
                options: Vec::new(),
            },
            1,
        );
        let path = self.append_to_parent(fc);

        for (name, opt) in names.iter().zip(options.iter()) {
            // Already protected at this point
            self.push(Some(name), false, &opt.field_class, path.clone())?;
            self.translate_field_class()?;
            self.pop();
        }

        Ok(())
    }

    /// Borrows the node at `path` within the given scope's root (the
    /// local root for the current scope).
    fn scope_node(&self, scope: ir::Scope, path: &NodePath) -> Option<&FieldClass> {
        let root = if scope == self.scope {
            &self.root
        } else {
            self.roots.get(scope)?
        };
        root.node_at(path)
    }

    /// Resolves a target field path into a field ref, or decides the
    /// target must be synthesized before the dependent field class.
    fn resolve_field_class(
        &self,
        target_field_path: Option<&ir::FieldPath>,
    ) -> Result<Resolution, Error> {
        let Some(field_path) = target_field_path else {
            return Ok(Resolution::Before);
        };

        if field_path.scope == self.scope {
            // 1. A relative ref (single name) is the most widely
            //    supported by CTF reading tools.
            // 2. An absolute ref can fail if the path traverses an
            //    array field class.
            // 3. Synthesize the target before the dependent field
            //    class (fallback).
            if let Some((ref_str, target)) = self.create_relative_field_ref(field_path) {
                Ok(Resolution::Ref {
                    ref_str,
                    target_scope: self.scope,
                    target,
                })
            } else if let Some((ref_str, target)) =
                create_absolute_field_ref(&self.root, field_path)
            {
                Ok(Resolution::Ref {
                    ref_str,
                    target_scope: self.scope,
                    target,
                })
            } else {
                Ok(Resolution::Before)
            }
        } else {
            let root = self.roots.get(field_path.scope).ok_or_else(|| {
                Error::unsupported_schema("field ref target scope is not available")
            })?;

            // An absolute ref always works for scopes before this one
            let (ref_str, target) =
                create_absolute_field_ref(root, field_path).ok_or_else(|| {
                    Error::unsupported_schema("cannot build an absolute field ref")
                })?;
            Ok(Resolution::Ref {
                ref_str,
                target_scope: field_path.scope,
                target,
            })
        }
    }

    /// Creates a relative field ref (a single name).
    ///
    /// Scans the current path from top to bottom, looking for a
    /// structure or variant having a direct child with the target's
    /// name. Array and sequence frames are transparent. Many CTF
    /// reading tools do not support a relative field ref with more
    /// than one component, so anything more distant fails here.
    fn create_relative_field_ref(&self, field_path: &ir::FieldPath) -> Option<(String, NodePath)> {
        let (target, target_name) = walk_target(&self.root, &field_path.items)?;

        for frame in self.stack.iter().rev() {
            let parent_path = frame.parent.as_ref()?;
            let parent = self.root.node_at(parent_path)?;

            let named: &[NamedFieldClass] = match &parent.kind {
                FieldClassKind::Struct(s) => &s.members,
                FieldClassKind::Variant { options, .. } => options,
                FieldClassKind::Array { .. } | FieldClassKind::Sequence { .. } => continue,
                // Not supported by TSDL 1.8
                _ => return None,
            };

            if let Some(index) = named.iter().position(|m| m.name == target_name) {
                // Reaching a different field class of the same name
                // through the single component is not TSDL 1.8
                let mut candidate = parent_path.clone();
                candidate.push(index as u64);
                return (candidate == target).then_some((target_name, target));
            }
        }

        None
    }
}

/// Walks a field path over a (possibly partially built) scope root,
/// returning the target's node path and its member/option name.
fn walk_target(root: &FieldClass, items: &[ir::FieldPathItem]) -> Option<(NodePath, String)> {
    let mut fc = root;
    let mut path = NodePath::new();
    let mut name: Option<String> = None;

    for item in items.iter() {
        if *item == ir::FieldPathItem::CurrentOptionContent {
            // Not supported by CTF 1.8
            return None;
        }

        match &fc.kind {
            FieldClassKind::Struct(s) => {
                let ir::FieldPathItem::Index(index) = item else {
                    return None;
                };
                let member = s.members.get(*index as usize)?;
                name = Some(member.name.clone());
                path.push(*index);
                fc = &member.fc;
            }
            FieldClassKind::Variant { options, .. } => {
                let ir::FieldPathItem::Index(index) = item else {
                    return None;
                };
                let option = options.get(*index as usize)?;
                name = Some(option.name.clone());
                path.push(*index);
                fc = &option.fc;
            }
            FieldClassKind::Array { elem_fc, .. } | FieldClassKind::Sequence { elem_fc, .. } => {
                if *item != ir::FieldPathItem::CurrentArrayElement {
                    return None;
                }
                path.push(0);
                fc = elem_fc.as_deref()?;
            }
            _ => return None,
        }
    }

    // The target of a length/tag ref is always an integer field class
    if fc.as_int().is_none() {
        return None;
    }

    name.map(|name| (path, name))
}

/// Creates an absolute field ref (`stream.packet.context.a.b`, ...).
/// Fails if the path traverses an array or sequence field class: CTF
/// 1.8 has no per-element absolute path.
fn create_absolute_field_ref(
    root: &FieldClass,
    field_path: &ir::FieldPath,
) -> Option<(String, NodePath)> {
    let mut ref_str = match field_path.scope {
        ir::Scope::PacketContext => "stream.packet.context".to_owned(),
        ir::Scope::EventCommonContext => "stream.event.context".to_owned(),
        ir::Scope::EventSpecificContext => "event.context".to_owned(),
        ir::Scope::EventPayload => "event.fields".to_owned(),
    };

    let mut fc = root;
    let mut path = NodePath::new();
    for item in field_path.items.iter() {
        let ir::FieldPathItem::Index(index) = item else {
            // Not supported by TSDL 1.8
            return None;
        };

        let named = match &fc.kind {
            FieldClassKind::Struct(s) => s.members.get(*index as usize)?,
            FieldClassKind::Variant { options, .. } => options.get(*index as usize)?,
            _ => return None,
        };

        ref_str.push('.');
        ref_str.push_str(&named.name);
        path.push(*index);
        fc = &named.fc;
    }

    Some((ref_str, path))
}

/// Computes the protected TSDL name of each variant option by
/// matching the option's range set against the selector enumeration's
/// mappings. `None` means at least one option cannot be represented
/// with the referenced selector and the tag must be synthesized.
fn protect_option_names_against_mappings(
    options: &[ir::VariantOption],
    mappings: &[ir::EnumerationMapping],
) -> Option<Vec<String>> {
    let mut names = Vec::with_capacity(options.len());

    for opt in options.iter() {
        let (mut name, force_protected) = protect_name(&opt.name, false);

        let Some(opt_ranges) = opt.ranges.as_ref() else {
            names.push(name);
            continue;
        };

        // Find the mapping with exactly this option's range set
        let label = mappings
            .iter()
            .find(|m| m.ranges.is_equal(opt_ranges))
            .map(|m| m.label.as_str())?;

        if label != name {
            if force_protected || label.is_empty() {
                return None;
            }

            // Try protecting the option name and compare again
            name = format!("_{}", opt.name);
            if label != name {
                return None;
            }
        }

        names.push(name);
    }

    Some(names)
}

/// Picks a `__<name>_<len|tag>` ref name that no member of the parent
/// structure already uses.
fn make_unique_ref_name(parent: &StructFieldClass, fc_name: &str, target_kind: &str) -> String {
    let mut ref_name = format!("__{fc_name}_{target_kind}");
    let mut suffix = 0_u32;
    while parent.has_member_named(&ref_name) {
        ref_name = format!("__{fc_name}_{target_kind}_{suffix}");
        suffix += 1;
    }
    ref_name
}

/// Recursively assigns the synthesized ref names of sequence, option,
/// and variant field classes that are created before, avoiding name
/// clashes with existing members.
///
/// Fails when such a field class has no enclosing structure to place
/// the synthesized length/tag in.
fn set_field_refs(root: &mut FieldClass) -> Result<(), Error> {
    match &mut root.kind {
        FieldClassKind::Struct(struct_fc) => {
            for index in 0..struct_fc.members.len() {
                let member_name = struct_fc.members[index].name.clone();
                let ref_name = match &struct_fc.members[index].fc.kind {
                    FieldClassKind::Sequence {
                        length_is_before: true,
                        ..
                    } => Some(make_unique_ref_name(struct_fc, &member_name, "len")),
                    FieldClassKind::Option { .. } => {
                        Some(make_unique_ref_name(struct_fc, &member_name, "tag"))
                    }
                    FieldClassKind::Variant {
                        tag_is_before: true,
                        ..
                    } => Some(make_unique_ref_name(struct_fc, &member_name, "tag")),
                    _ => None,
                };

                let member_fc = &mut struct_fc.members[index].fc;
                if let Some(ref_name) = ref_name {
                    match &mut member_fc.kind {
                        FieldClassKind::Sequence { length_ref, .. } => *length_ref = ref_name,
                        FieldClassKind::Option { tag_ref, .. }
                        | FieldClassKind::Variant { tag_ref, .. } => *tag_ref = ref_name,
                        _ => unreachable!("ref names are only made for these kinds"),
                    }
                }

                set_field_refs(member_fc)?;
            }
            Ok(())
        }
        FieldClassKind::Variant { options, .. } => {
            for option in options.iter_mut() {
                if needs_before_ref(&option.fc) {
                    // No structure to place the synthesized field in
                    return Err(Error::unsupported_schema(
                        "cannot synthesize a length/tag field outside a structure",
                    ));
                }
                set_field_refs(&mut option.fc)?;
            }
            Ok(())
        }
        FieldClassKind::Array { elem_fc, .. } | FieldClassKind::Sequence { elem_fc, .. } => {
            if let Some(elem_fc) = elem_fc.as_deref_mut() {
                if needs_before_ref(elem_fc) {
                    return Err(Error::unsupported_schema(
                        "cannot synthesize a length/tag field outside a structure",
                    ));
                }
                set_field_refs(elem_fc)?;
            }
            Ok(())
        }
        FieldClassKind::Option { content_fc, .. } => {
            if let Some(content_fc) = content_fc.as_deref_mut() {
                if needs_before_ref(content_fc) {
                    return Err(Error::unsupported_schema(
                        "cannot synthesize a length/tag field outside a structure",
                    ));
                }
                set_field_refs(content_fc)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn needs_before_ref(fc: &FieldClass) -> bool {
    matches!(
        &fc.kind,
        FieldClassKind::Sequence {
            length_is_before: true,
            ..
        } | FieldClassKind::Option { .. }
            | FieldClassKind::Variant {
                tag_is_before: true,
                ..
            }
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Translates a payload-scope structure in isolation.
    pub(crate) fn translate_payload(ir_fc: &ir::FieldClass) -> FieldClass {
        translate_scope_field_class(ir::Scope::EventPayload, Some(ir_fc), ScopeRoots::default())
            .unwrap()
            .unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PreferredDisplayBase;
    use crate::ir::{
        EnumerationMapping, FieldPath, FieldPathItem, RangeSet, Scope, VariantOption,
    };

    fn u32_fc() -> ir::FieldClass {
        ir::FieldClass::UnsignedInteger {
            range_bits: 32,
            display_base: PreferredDisplayBase::Decimal,
        }
    }

    fn u8_fc() -> ir::FieldClass {
        ir::FieldClass::UnsignedInteger {
            range_bits: 8,
            display_base: PreferredDisplayBase::Decimal,
        }
    }

    fn scope_struct(members: Vec<(&str, ir::FieldClass)>) -> ir::FieldClass {
        ir::FieldClass::Structure {
            members: members
                .into_iter()
                .map(|(n, fc)| (n.to_owned(), fc))
                .collect(),
        }
    }

    fn translate(ir_fc: &ir::FieldClass) -> FieldClass {
        translate_scope_field_class(Scope::EventPayload, Some(ir_fc), ScopeRoots::default())
            .unwrap()
            .unwrap()
    }

    fn member<'a>(root: &'a FieldClass, name: &str) -> &'a FieldClass {
        &root
            .as_struct()
            .unwrap()
            .member_by_name(name)
            .unwrap()
            .fc
    }

    #[test]
    fn reserved_member_name_is_protected() {
        let root = translate(&scope_struct(vec![("int", u8_fc())]));
        let s = root.as_struct().unwrap();
        assert!(s.has_member_named("_int"));
        assert!(!s.has_member_named("int"));
    }

    #[test]
    fn reserved_packet_context_member_is_rejected() {
        let ir_fc = scope_struct(vec![("packet_size", u32_fc())]);
        let res =
            translate_scope_field_class(Scope::PacketContext, Some(&ir_fc), ScopeRoots::default());
        assert!(matches!(res, Err(Error::UnsupportedIdentifier(_))));

        // Protected forms collide too
        let ir_fc = scope_struct(vec![("_timestamp_begin", u32_fc())]);
        let res =
            translate_scope_field_class(Scope::PacketContext, Some(&ir_fc), ScopeRoots::default());
        assert!(matches!(res, Err(Error::UnsupportedIdentifier(_))));
    }

    #[test]
    fn sequence_with_length_member_resolves_relative() {
        let ir_fc = scope_struct(vec![
            ("len", u32_fc()),
            (
                "data",
                ir::FieldClass::DynamicArray {
                    element_field_class: Box::new(u8_fc()),
                    length_field_path: Some(FieldPath::new(
                        Scope::EventPayload,
                        [FieldPathItem::Index(0)],
                    )),
                },
            ),
        ]);
        let root = translate(&ir_fc);
        match &member(&root, "data").kind {
            FieldClassKind::Sequence {
                length_ref,
                length_is_before,
                ..
            } => {
                assert!(!length_is_before);
                assert_eq!(length_ref, "len");
            }
            kind => panic!("unexpected kind {kind:?}"),
        }
    }

    #[test]
    fn sequence_without_length_field_synthesizes_ref() {
        let ir_fc = scope_struct(vec![(
            "buf",
            ir::FieldClass::DynamicArray {
                element_field_class: Box::new(u8_fc()),
                length_field_path: None,
            },
        )]);
        let root = translate(&ir_fc);
        match &member(&root, "buf").kind {
            FieldClassKind::Sequence {
                length_ref,
                length_is_before,
                ..
            } => {
                assert!(length_is_before);
                assert_eq!(length_ref, "__buf_len");
            }
            kind => panic!("unexpected kind {kind:?}"),
        }
    }

    #[test]
    fn synthesized_ref_avoids_member_clash() {
        let ir_fc = scope_struct(vec![
            ("__buf_len", u32_fc()),
            (
                "buf",
                ir::FieldClass::DynamicArray {
                    element_field_class: Box::new(u8_fc()),
                    length_field_path: None,
                },
            ),
        ]);
        let root = translate(&ir_fc);
        match &member(&root, "buf").kind {
            FieldClassKind::Sequence { length_ref, .. } => {
                assert_eq!(length_ref, "__buf_len_0");
            }
            kind => panic!("unexpected kind {kind:?}"),
        }
    }

    #[test]
    fn option_always_synthesizes_tag() {
        let ir_fc = scope_struct(vec![(
            "maybe",
            ir::FieldClass::Option {
                content_field_class: Box::new(u32_fc()),
                selector_field_path: None,
            },
        )]);
        let root = translate(&ir_fc);
        match &member(&root, "maybe").kind {
            FieldClassKind::Option { tag_ref, .. } => assert_eq!(tag_ref, "__maybe_tag"),
            kind => panic!("unexpected kind {kind:?}"),
        }
    }

    fn selector_enum(labels: &[(&str, (u64, u64))]) -> ir::FieldClass {
        ir::FieldClass::UnsignedEnumeration {
            range_bits: 8,
            display_base: PreferredDisplayBase::Decimal,
            mappings: labels
                .iter()
                .map(|(label, (lo, hi))| EnumerationMapping {
                    label: (*label).to_owned(),
                    ranges: RangeSet::unsigned([(*lo, *hi)]),
                })
                .collect(),
        }
    }

    fn variant_fc(
        options: Vec<(&str, ir::FieldClass, (u64, u64))>,
        with_selector: bool,
    ) -> ir::FieldClass {
        ir::FieldClass::Variant {
            options: options
                .into_iter()
                .map(|(name, fc, (lo, hi))| VariantOption {
                    name: name.to_owned(),
                    field_class: fc,
                    ranges: with_selector.then(|| RangeSet::unsigned([(lo, hi)])),
                })
                .collect(),
            selector_field_path: with_selector.then(|| {
                FieldPath::new(Scope::EventPayload, [FieldPathItem::Index(0)])
            }),
        }
    }

    #[test]
    fn variant_with_matching_selector_keeps_ref() {
        let ir_fc = scope_struct(vec![
            ("tag", selector_enum(&[("a", (0, 0)), ("b", (1, 1))])),
            (
                "v",
                variant_fc(
                    vec![("a", u8_fc(), (0, 0)), ("b", u32_fc(), (1, 1))],
                    true,
                ),
            ),
        ]);
        let root = translate(&ir_fc);
        match &member(&root, "v").kind {
            FieldClassKind::Variant {
                tag_ref,
                tag_is_before,
                options,
            } => {
                assert!(!tag_is_before);
                assert_eq!(tag_ref, "tag");
                assert_eq!(options[0].name, "a");
                assert_eq!(options[1].name, "b");
            }
            kind => panic!("unexpected kind {kind:?}"),
        }
    }

    // The selector names a reserved-keyword label; the matching option
    // name protects to the same label
    #[test]
    fn variant_protected_option_matches_protected_label() {
        let ir_fc = scope_struct(vec![
            ("tag", selector_enum(&[("_int", (0, 0)), ("b", (1, 1))])),
            (
                "v",
                variant_fc(
                    vec![("int", u8_fc(), (0, 0)), ("b", u32_fc(), (1, 1))],
                    true,
                ),
            ),
        ]);
        let root = translate(&ir_fc);
        match &member(&root, "v").kind {
            FieldClassKind::Variant {
                tag_is_before,
                options,
                ..
            } => {
                assert!(!tag_is_before);
                assert_eq!(options[0].name, "_int");
            }
            kind => panic!("unexpected kind {kind:?}"),
        }
    }

    #[test]
    fn variant_label_mismatch_forces_before() {
        let ir_fc = scope_struct(vec![
            ("tag", selector_enum(&[("x", (0, 0)), ("y", (1, 1))])),
            (
                "v",
                variant_fc(
                    vec![("a", u8_fc(), (0, 0)), ("b", u32_fc(), (1, 1))],
                    true,
                ),
            ),
        ]);
        let root = translate(&ir_fc);
        match &member(&root, "v").kind {
            FieldClassKind::Variant {
                tag_ref,
                tag_is_before,
                options,
            } => {
                assert!(tag_is_before);
                assert_eq!(tag_ref, "__v_tag");
                // Names fall back to bare protection
                assert_eq!(options[0].name, "a");
                assert_eq!(options[1].name, "b");
            }
            kind => panic!("unexpected kind {kind:?}"),
        }
    }

    #[test]
    fn variant_mapping_count_mismatch_forces_before() {
        let ir_fc = scope_struct(vec![
            (
                "tag",
                selector_enum(&[("a", (0, 0)), ("b", (1, 1)), ("c", (2, 2))]),
            ),
            (
                "v",
                variant_fc(
                    vec![("a", u8_fc(), (0, 0)), ("b", u32_fc(), (1, 1))],
                    true,
                ),
            ),
        ]);
        let root = translate(&ir_fc);
        match &member(&root, "v").kind {
            FieldClassKind::Variant { tag_is_before, .. } => assert!(tag_is_before),
            kind => panic!("unexpected kind {kind:?}"),
        }
    }

    // A node's alignment is at least any descendant's
    #[test]
    fn alignment_propagates_up() {
        let u64_arr = ir::FieldClass::StaticArray {
            element_field_class: Box::new(ir::FieldClass::UnsignedInteger {
                range_bits: 64,
                display_base: PreferredDisplayBase::Decimal,
            }),
            length: 2,
        };
        let inner = ir::FieldClass::Structure {
            members: vec![("small".to_owned(), u8_fc()), ("arr".to_owned(), u64_arr)],
        };
        let root = translate(&scope_struct(vec![("outer", inner)]));
        assert_eq!(member(&root, "outer").alignment, 8);
        assert_eq!(root.alignment, 8);
    }

    #[test]
    fn environment_is_validated() {
        let trace = Arc::new(ir::Trace {
            environment: vec![("ok".to_owned(), 3_i64.into())],
            ..Default::default()
        });
        assert!(translate_trace(&trace).is_ok());

        let trace = Arc::new(ir::Trace {
            environment: vec![("has-dash".to_owned(), 3_i64.into())],
            ..Default::default()
        });
        assert!(matches!(
            translate_trace(&trace),
            Err(Error::UnsupportedEnvironment(_))
        ));

        let trace = Arc::new(ir::Trace {
            environment: vec![("flag".to_owned(), ir::EnvironmentValue::Bool(true))],
            ..Default::default()
        });
        assert!(matches!(
            translate_trace(&trace),
            Err(Error::UnsupportedEnvironment(_))
        ));
    }

    #[test]
    fn clock_class_names_are_unique() {
        let trace = Arc::new(ir::Trace::default());
        let mut tc = translate_trace(&trace).unwrap();

        let mut sc0 = ir::StreamClass::new(0);
        sc0.default_clock_class = Some(ir::ClockClass::default());
        let mut sc1 = ir::StreamClass::new(1);
        sc1.default_clock_class = Some(ir::ClockClass::default());

        translate_stream_class(&mut tc, &Arc::new(sc0)).unwrap();
        translate_stream_class(&mut tc, &Arc::new(sc1)).unwrap();

        assert_eq!(
            tc.stream_classes[0].default_clock_class_name.as_deref(),
            Some("default")
        );
        assert_eq!(
            tc.stream_classes[1].default_clock_class_name.as_deref(),
            Some("default0")
        );
    }

    #[test]
    fn clock_class_name_is_protected() {
        let trace = Arc::new(ir::Trace::default());
        let mut tc = translate_trace(&trace).unwrap();

        let mut sc = ir::StreamClass::new(0);
        sc.default_clock_class = Some(ir::ClockClass {
            name: Some("clock".to_owned()),
            ..Default::default()
        });
        translate_stream_class(&mut tc, &Arc::new(sc)).unwrap();
        assert_eq!(
            tc.stream_classes[0].default_clock_class_name.as_deref(),
            Some("_clock")
        );
    }
}
