use ctf_fs_sink::ir::*;
use ctf_fs_sink::{Error, FsSink, NativeByteOrder, PreferredDisplayBase, SinkConfig, SinkStatus};
use internment::Intern;
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::sync::Arc;
use test_log::test;

struct TestSource {
    batches: VecDeque<MessageIteratorNext>,
}

impl TestSource {
    fn single_batch(messages: Vec<Message>) -> Self {
        Self {
            batches: [MessageIteratorNext::Messages(messages)].into_iter().collect(),
        }
    }
}

impl MessageIterator for TestSource {
    fn next(&mut self) -> Result<MessageIteratorNext, Error> {
        Ok(self
            .batches
            .pop_front()
            .unwrap_or(MessageIteratorNext::End))
    }
}

fn u8_fc() -> FieldClass {
    FieldClass::UnsignedInteger {
        range_bits: 8,
        display_base: PreferredDisplayBase::Decimal,
    }
}

fn u32_fc() -> FieldClass {
    FieldClass::UnsignedInteger {
        range_bits: 32,
        display_base: PreferredDisplayBase::Decimal,
    }
}

fn payload_struct(members: Vec<(&str, FieldClass)>) -> FieldClass {
    FieldClass::Structure {
        members: members
            .into_iter()
            .map(|(n, fc)| (n.to_owned(), fc))
            .collect(),
    }
}

fn event_class_with_payload(payload: FieldClass) -> Arc<EventClass> {
    let mut ec = EventClass::new(0);
    ec.name = Some(Intern::new("e".to_owned()));
    ec.payload_field_class = Some(payload);
    Arc::new(ec)
}

fn stream_with_event_class(ec: Arc<EventClass>) -> Arc<Stream> {
    let mut sc = StreamClass::new(0);
    sc.event_classes.push(ec);
    Arc::new(Stream {
        id: 0,
        name: None,
        class: Arc::new(sc),
        trace: Arc::new(Trace::default()),
    })
}

fn quiet_config(path: &std::path::Path) -> SinkConfig {
    let mut config = SinkConfig::new(path);
    config.assume_single_trace = true;
    config.quiet = true;
    config.byte_order = NativeByteOrder::LittleEndian;
    config
}

/// Runs one complete stream with a single event carrying `payload`,
/// returning the metadata text and the stream file bytes.
fn run_single_event(payload_fc: FieldClass, payload: Field) -> (String, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");
    let ec = event_class_with_payload(payload_fc);
    let stream = stream_with_event_class(ec.clone());

    let mut source = TestSource::single_batch(vec![
        Message::StreamBeginning {
            stream: stream.clone(),
        },
        Message::PacketBeginning {
            stream: stream.clone(),
            packet: Packet::default(),
            clock_snapshot: None,
        },
        Message::Event {
            stream: stream.clone(),
            event: Event {
                class: ec,
                common_context: None,
                specific_context: None,
                payload: Some(payload),
            },
            clock_snapshot: None,
        },
        Message::PacketEnd {
            stream: stream.clone(),
            clock_snapshot: None,
        },
        Message::StreamEnd {
            stream: stream.clone(),
        },
    ]);

    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::Ok);
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::End);

    let metadata = std::fs::read_to_string(out.join("metadata")).unwrap();
    let bytes = std::fs::read(out.join("stream")).unwrap();
    (metadata, bytes)
}

// Event content starts after the packet header (36 bytes) and the
// minimal packet context (24 bytes) and the event header (8 bytes)
const EVENT_CONTENT: usize = 36 + 24 + 8;

#[test]
fn reserved_keyword_member_and_variant_selector() {
    let selector = FieldClass::UnsignedEnumeration {
        range_bits: 8,
        display_base: PreferredDisplayBase::Decimal,
        mappings: vec![
            EnumerationMapping {
                label: "_int".to_owned(),
                ranges: RangeSet::unsigned([(0, 0)]),
            },
            EnumerationMapping {
                label: "word".to_owned(),
                ranges: RangeSet::unsigned([(1, 1)]),
            },
        ],
    };
    let variant = FieldClass::Variant {
        options: vec![
            VariantOption {
                name: "int".to_owned(),
                field_class: u8_fc(),
                ranges: Some(RangeSet::unsigned([(0, 0)])),
            },
            VariantOption {
                name: "word".to_owned(),
                field_class: u32_fc(),
                ranges: Some(RangeSet::unsigned([(1, 1)])),
            },
        ],
        selector_field_path: Some(FieldPath::new(
            Scope::EventPayload,
            [FieldPathItem::Index(0)],
        )),
    };

    let (metadata, bytes) = run_single_event(
        payload_struct(vec![("int", selector), ("v", variant)]),
        Field::structure([
            Field::UnsignedInteger(1),
            Field::Variant {
                selected_index: 1,
                field: Box::new(Field::UnsignedInteger(0xaabbccdd)),
            },
        ]),
    );

    // The reserved keyword member is protected in both places
    assert!(metadata.contains("} _int;"));
    assert!(metadata.contains("variant <_int> {"));
    assert!(metadata.contains("\"_int\" = 0,"));
    assert!(metadata.contains("} _int;\n"));
    assert!(metadata.contains("integer { size = 32; align = 8; } word;"));

    // Selector byte, then the selected option's value; no synthesized
    // tag in between
    assert_eq!(bytes[EVENT_CONTENT], 1);
    assert_eq!(
        &bytes[EVENT_CONTENT + 1..EVENT_CONTENT + 5],
        0xaabbccdd_u32.to_le_bytes()
    );
}

#[test]
fn sequence_without_length_field() {
    let (metadata, bytes) = run_single_event(
        payload_struct(vec![(
            "buf",
            FieldClass::DynamicArray {
                element_field_class: Box::new(u8_fc()),
                length_field_path: None,
            },
        )]),
        Field::structure([Field::Array(vec![
            Field::UnsignedInteger(0xaa),
            Field::UnsignedInteger(0xbb),
            Field::UnsignedInteger(0xcc),
        ])]),
    );

    assert!(metadata.contains("integer { size = 32; align = 8; } __buf_len;"));
    assert!(metadata.contains("integer { size = 8; align = 8; } buf[__buf_len];"));

    // The synthesized 32-bit length comes just before the elements
    assert_eq!(
        &bytes[EVENT_CONTENT..EVENT_CONTENT + 7],
        [0x03, 0x00, 0x00, 0x00, 0xaa, 0xbb, 0xcc]
    );
}

#[test]
fn option_tag_and_content() {
    let option_fc = FieldClass::Option {
        content_field_class: Box::new(u32_fc()),
        selector_field_path: None,
    };

    let (metadata, bytes) = run_single_event(
        payload_struct(vec![("maybe", option_fc.clone())]),
        Field::structure([Field::Option(Some(Box::new(Field::UnsignedInteger(42))))]),
    );

    assert!(metadata.contains("} __maybe_tag;"));
    assert!(metadata.contains("variant <__maybe_tag> {"));
    assert!(metadata.contains("struct { } none;"));
    assert!(metadata.contains("integer { size = 32; align = 8; } content;"));

    // Present: tag byte 1, then the content at its alignment
    assert_eq!(bytes[EVENT_CONTENT], 0x01);
    assert_eq!(
        &bytes[EVENT_CONTENT + 1..EVENT_CONTENT + 5],
        42_u32.to_le_bytes()
    );

    // Absent: tag byte 0 and nothing else
    let (_, bytes) = run_single_event(
        payload_struct(vec![("maybe", option_fc)]),
        Field::structure([Field::Option(None)]),
    );
    assert_eq!(bytes[EVENT_CONTENT], 0x00);
    assert_eq!(bytes.len(), EVENT_CONTENT + 1);
}

fn clocked_stream_with_discarded_events() -> Arc<Stream> {
    let mut sc = StreamClass::new(0);
    sc.default_clock_class = Some(ClockClass {
        name: Some("cycles".to_owned()),
        ..Default::default()
    });
    sc.packets_have_beginning_clock_snapshot = true;
    sc.packets_have_end_clock_snapshot = true;
    sc.supports_discarded_events = true;
    sc.discarded_events_have_clock_snapshots = true;
    Arc::new(Stream {
        id: 0,
        name: Some(Intern::new("chan".to_owned())),
        class: Arc::new(sc),
        trace: Arc::new(Trace::default()),
    })
}

fn discarded_events_messages(stream: &Arc<Stream>, second_end_cs: u64) -> Vec<Message> {
    vec![
        Message::StreamBeginning {
            stream: stream.clone(),
        },
        Message::PacketBeginning {
            stream: stream.clone(),
            packet: Packet::default(),
            clock_snapshot: Some(100),
        },
        Message::PacketEnd {
            stream: stream.clone(),
            clock_snapshot: Some(200),
        },
        Message::DiscardedEvents {
            stream: stream.clone(),
            count: Some(5),
            beginning_clock_snapshot: Some(200),
            end_clock_snapshot: Some(300),
        },
        Message::PacketBeginning {
            stream: stream.clone(),
            packet: Packet::default(),
            clock_snapshot: Some(300),
        },
        Message::PacketEnd {
            stream: stream.clone(),
            clock_snapshot: Some(second_end_cs),
        },
        Message::StreamEnd {
            stream: stream.clone(),
        },
    ]
}

#[test]
fn discarded_events_between_timed_packets() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");
    let stream = clocked_stream_with_discarded_events();

    let mut source = TestSource::single_batch(discarded_events_messages(&stream, 300));
    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::Ok);
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::End);

    let bytes = std::fs::read(out.join("chan")).unwrap();

    // Packet context: packet size, content size, ts begin, ts end,
    // events discarded, seq num; 36-byte header before it
    let packet_len = 36 + 48;
    assert_eq!(bytes.len(), 2 * packet_len);

    // First packet: ts 100..200, no discarded events yet, seq 0
    assert_eq!(&bytes[52..60], 100_u64.to_le_bytes());
    assert_eq!(&bytes[60..68], 200_u64.to_le_bytes());
    assert_eq!(&bytes[68..76], 0_u64.to_le_bytes());
    assert_eq!(&bytes[76..84], 0_u64.to_le_bytes());

    // Second packet: ts 300..300, the 5 discarded events, seq 1
    let p2 = packet_len;
    assert_eq!(&bytes[p2 + 52..p2 + 60], 300_u64.to_le_bytes());
    assert_eq!(&bytes[p2 + 60..p2 + 68], 300_u64.to_le_bytes());
    assert_eq!(&bytes[p2 + 68..p2 + 76], 5_u64.to_le_bytes());
    assert_eq!(&bytes[p2 + 76..p2 + 84], 1_u64.to_le_bytes());
}

#[test]
fn discarded_events_end_mismatch_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");
    let stream = clocked_stream_with_discarded_events();

    // The range ends at 300 but the second packet ends at 400
    let mut source = TestSource::single_batch(discarded_events_messages(&stream, 400));
    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    let res = sink.consume(&mut source);
    assert!(matches!(
        res,
        Err(Error::IncompatibleDiscardedRange { kind: "events", .. })
    ));
}

#[test]
fn discarded_events_inside_open_packet_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");
    let stream = clocked_stream_with_discarded_events();

    let mut source = TestSource::single_batch(vec![
        Message::StreamBeginning {
            stream: stream.clone(),
        },
        Message::PacketBeginning {
            stream: stream.clone(),
            packet: Packet::default(),
            clock_snapshot: Some(100),
        },
        Message::DiscardedEvents {
            stream: stream.clone(),
            count: None,
            beginning_clock_snapshot: Some(100),
            end_clock_snapshot: Some(150),
        },
    ]);
    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    let res = sink.consume(&mut source);
    assert!(matches!(
        res,
        Err(Error::IncompatibleDiscardedRange { kind: "events", .. })
    ));
}

#[test]
fn discarded_events_without_packet_timestamps_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");

    let mut sc = StreamClass::new(0);
    sc.supports_discarded_events = true;
    sc.discarded_events_have_clock_snapshots = true;
    let stream = Arc::new(Stream {
        id: 0,
        name: None,
        class: Arc::new(sc),
        trace: Arc::new(Trace::default()),
    });

    let mut source = TestSource::single_batch(vec![Message::StreamBeginning {
        stream: stream.clone(),
    }]);
    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    assert!(matches!(
        sink.consume(&mut source),
        Err(Error::IncompatibleStreamShape(_))
    ));
}

#[test]
fn ignored_discarded_events_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");
    let stream = clocked_stream_with_discarded_events();

    // The mismatching range is never validated when ignoring
    let mut source = TestSource::single_batch(discarded_events_messages(&stream, 400));
    let mut config = quiet_config(&out);
    config.ignore_discarded_events = true;
    let mut sink = FsSink::new(config).unwrap();
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::Ok);
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::End);

    let bytes = std::fs::read(out.join("chan")).unwrap();
    // The discarded events counter stays at zero in both packets
    assert_eq!(&bytes[68..76], 0_u64.to_le_bytes());
    let p2 = 36 + 48;
    assert_eq!(&bytes[p2 + 68..p2 + 76], 0_u64.to_le_bytes());
}

#[test]
fn discarded_packets_advance_the_sequence_number() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");

    let mut sc = StreamClass::new(0);
    sc.default_clock_class = Some(ClockClass::default());
    sc.packets_have_beginning_clock_snapshot = true;
    sc.packets_have_end_clock_snapshot = true;
    sc.supports_discarded_packets = true;
    sc.discarded_packets_have_clock_snapshots = true;
    let stream = Arc::new(Stream {
        id: 0,
        name: Some(Intern::new("chan".to_owned())),
        class: Arc::new(sc),
        trace: Arc::new(Trace::default()),
    });

    let mut source = TestSource::single_batch(vec![
        Message::StreamBeginning {
            stream: stream.clone(),
        },
        Message::PacketBeginning {
            stream: stream.clone(),
            packet: Packet::default(),
            clock_snapshot: Some(100),
        },
        Message::PacketEnd {
            stream: stream.clone(),
            clock_snapshot: Some(200),
        },
        Message::DiscardedPackets {
            stream: stream.clone(),
            count: Some(3),
            beginning_clock_snapshot: Some(200),
            end_clock_snapshot: Some(500),
        },
        Message::PacketBeginning {
            stream: stream.clone(),
            packet: Packet::default(),
            clock_snapshot: Some(500),
        },
        Message::PacketEnd {
            stream: stream.clone(),
            clock_snapshot: Some(600),
        },
        Message::StreamEnd {
            stream: stream.clone(),
        },
    ]);

    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::Ok);
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::End);

    let bytes = std::fs::read(out.join("chan")).unwrap();
    // No discarded events member in this packet context
    let packet_len = 36 + 40;
    assert_eq!(bytes.len(), 2 * packet_len);

    // Sequence numbers: 0, then 0 + 1 + 3 = 4
    assert_eq!(&bytes[68..76], 0_u64.to_le_bytes());
    assert_eq!(
        &bytes[packet_len + 68..packet_len + 76],
        4_u64.to_le_bytes()
    );
}

#[test]
fn discarded_packets_before_first_packet_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");

    let mut sc = StreamClass::new(0);
    sc.default_clock_class = Some(ClockClass::default());
    sc.packets_have_beginning_clock_snapshot = true;
    sc.packets_have_end_clock_snapshot = true;
    sc.supports_discarded_packets = true;
    sc.discarded_packets_have_clock_snapshots = true;
    let stream = Arc::new(Stream {
        id: 0,
        name: None,
        class: Arc::new(sc),
        trace: Arc::new(Trace::default()),
    });

    let mut source = TestSource::single_batch(vec![
        Message::StreamBeginning {
            stream: stream.clone(),
        },
        Message::DiscardedPackets {
            stream: stream.clone(),
            count: Some(1),
            beginning_clock_snapshot: Some(0),
            end_clock_snapshot: Some(100),
        },
        Message::PacketBeginning {
            stream: stream.clone(),
            packet: Packet::default(),
            clock_snapshot: Some(100),
        },
    ]);

    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    assert!(matches!(
        sink.consume(&mut source),
        Err(Error::IncompatibleDiscardedRange {
            kind: "packets",
            ..
        })
    ));
}

#[test]
fn event_contexts_and_double_precision_payload() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");

    let mut ec = EventClass::new(0);
    ec.name = Some(Intern::new("sample".to_owned()));
    ec.emf_uri = Some("http://example.com/model".to_owned());
    ec.log_level = Some(LogLevel::Warning);
    ec.specific_context_field_class = Some(payload_struct(vec![(
        "seq",
        FieldClass::UnsignedInteger {
            range_bits: 16,
            display_base: PreferredDisplayBase::Hexadecimal,
        },
    )]));
    ec.payload_field_class = Some(payload_struct(vec![(
        "val",
        FieldClass::DoublePrecisionReal,
    )]));
    let ec = Arc::new(ec);

    let mut sc = StreamClass::new(0);
    sc.event_common_context_field_class = Some(payload_struct(vec![("cpu", u8_fc())]));
    sc.event_classes.push(ec.clone());
    let stream = Arc::new(Stream {
        id: 0,
        name: None,
        class: Arc::new(sc),
        trace: Arc::new(Trace::default()),
    });

    let mut source = TestSource::single_batch(vec![
        Message::StreamBeginning {
            stream: stream.clone(),
        },
        Message::PacketBeginning {
            stream: stream.clone(),
            packet: Packet::default(),
            clock_snapshot: None,
        },
        Message::Event {
            stream: stream.clone(),
            event: Event {
                class: ec,
                common_context: Some(Field::structure([Field::UnsignedInteger(3)])),
                specific_context: Some(Field::structure([Field::UnsignedInteger(0x0102)])),
                payload: Some(Field::structure([Field::Real(2.5.into())])),
            },
            clock_snapshot: None,
        },
        Message::PacketEnd {
            stream: stream.clone(),
            clock_snapshot: None,
        },
        Message::StreamEnd {
            stream: stream.clone(),
        },
    ]);

    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::Ok);
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::End);

    let metadata = std::fs::read_to_string(out.join("metadata")).unwrap();
    assert!(metadata.contains(
        "event.context := struct {\n\t\tinteger { size = 8; align = 8; } cpu;\n\t} align(8);"
    ));
    assert!(metadata.contains("model.emf.uri = \"http://example.com/model\";"));
    assert!(metadata.contains("loglevel = 4;"));
    assert!(metadata.contains("context := struct {\n\t\tinteger { size = 16; align = 8; base = x; } seq;\n\t} align(8);"));
    assert!(metadata
        .contains("fields := struct {\n\t\tfloating_point { mant_dig = 53; exp_dig = 11; align = 8; } val;\n\t} align(8);"));

    let bytes = std::fs::read(out.join("stream")).unwrap();
    // Common context, specific context, then the 64-bit float payload
    assert_eq!(bytes[EVENT_CONTENT], 3);
    assert_eq!(
        &bytes[EVENT_CONTENT + 1..EVENT_CONTENT + 3],
        0x0102_u16.to_le_bytes()
    );
    assert_eq!(
        &bytes[EVENT_CONTENT + 3..EVENT_CONTENT + 11],
        2.5_f64.to_bits().to_le_bytes()
    );
    assert_eq!(bytes.len(), EVENT_CONTENT + 11);
}

#[test]
fn user_packet_context_members_follow_the_reserved_ones() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");

    let ec = event_class_with_payload(payload_struct(vec![("x", u32_fc())]));
    let mut sc = StreamClass::new(0);
    sc.packet_context_field_class = Some(payload_struct(vec![("cpu_id", u8_fc())]));
    sc.event_classes.push(ec.clone());
    let stream = Arc::new(Stream {
        id: 0,
        name: None,
        class: Arc::new(sc),
        trace: Arc::new(Trace::default()),
    });

    let mut source = TestSource::single_batch(vec![
        Message::StreamBeginning {
            stream: stream.clone(),
        },
        Message::PacketBeginning {
            stream: stream.clone(),
            packet: Packet {
                context: Some(Field::structure([Field::UnsignedInteger(9)])),
            },
            clock_snapshot: None,
        },
        Message::Event {
            stream: stream.clone(),
            event: Event {
                class: ec,
                common_context: None,
                specific_context: None,
                payload: Some(Field::structure([Field::UnsignedInteger(7)])),
            },
            clock_snapshot: None,
        },
        Message::PacketEnd {
            stream: stream.clone(),
            clock_snapshot: None,
        },
        Message::StreamEnd {
            stream: stream.clone(),
        },
    ]);

    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::Ok);
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::End);

    let metadata = std::fs::read_to_string(out.join("metadata")).unwrap();
    // User members come after the reserved packet context members
    let block = metadata
        .split("packet.context := struct {")
        .nth(1)
        .unwrap();
    let seq_at = block.find("packet_seq_num").unwrap();
    let cpu_at = block.find("cpu_id").unwrap();
    assert!(seq_at < cpu_at);

    let bytes = std::fs::read(out.join("stream")).unwrap();
    // Reserved members (24 bytes after the 36-byte header), then the
    // user member, then the event
    assert_eq!(bytes[60], 9);
    assert_eq!(&bytes[61..69], 0_u64.to_le_bytes());
    assert_eq!(&bytes[69..73], 7_u32.to_le_bytes());
}

#[test]
fn single_trace_mode_rejects_a_second_trace() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");

    let stream_a = stream_with_event_class(event_class_with_payload(payload_struct(vec![(
        "x",
        u32_fc(),
    )])));
    let stream_b = stream_with_event_class(event_class_with_payload(payload_struct(vec![(
        "x",
        u32_fc(),
    )])));

    let mut source = TestSource::single_batch(vec![
        Message::StreamBeginning {
            stream: stream_a.clone(),
        },
        Message::StreamBeginning {
            stream: stream_b.clone(),
        },
    ]);

    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    assert!(matches!(
        sink.consume(&mut source),
        Err(Error::SingleTraceModeCollision(_))
    ));
}

#[test]
fn lttng_environment_drives_the_trace_path() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");

    let trace = Arc::new(Trace {
        name: None,
        uuid: None,
        environment: vec![
            ("tracer_name".to_owned(), "lttng-ust".into()),
            ("tracer_major".to_owned(), 2_i64.into()),
            ("tracer_minor".to_owned(), 12_i64.into()),
            ("hostname".to_owned(), "host-a".into()),
            ("trace_name".to_owned(), "my-trace".into()),
            (
                "trace_creation_datetime".to_owned(),
                "2024-01-02T03:04:05Z".into(),
            ),
            ("domain".to_owned(), "ust".into()),
            ("tracer_buffering_scheme".to_owned(), "pid".into()),
            ("procname".to_owned(), "app".into()),
            ("vpid".to_owned(), 4242_i64.into()),
            ("vpid_datetime".to_owned(), "2024-01-02T03:04:05Z".into()),
        ],
    });

    let mut sc = StreamClass::new(0);
    sc.event_classes.push(event_class_with_payload(payload_struct(vec![(
        "x",
        u32_fc(),
    )])));
    let stream = Arc::new(Stream {
        id: 0,
        name: Some(Intern::new("chan".to_owned())),
        class: Arc::new(sc),
        trace,
    });

    let mut source = TestSource::single_batch(vec![
        Message::StreamBeginning {
            stream: stream.clone(),
        },
        Message::StreamEnd {
            stream: stream.clone(),
        },
    ]);

    let mut config = SinkConfig::new(&out);
    config.quiet = true;
    let mut sink = FsSink::new(config).unwrap();
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::Ok);
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::End);

    let trace_dir =
        out.join("host-a/my-trace-2024-01-02T03:04:05Z/ust/pid/app-4242-2024-01-02T03:04:05Z");
    assert!(trace_dir.join("metadata").is_file());
    assert!(trace_dir.join("chan").is_file());

    let metadata = std::fs::read_to_string(trace_dir.join("metadata")).unwrap();
    assert!(metadata.contains("hostname = \"host-a\";"));
    assert!(metadata.contains("tracer_major = 2;"));
}

#[test]
fn stream_named_metadata_is_suffixed() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");

    let sc = Arc::new(StreamClass::new(0));
    let stream = Arc::new(Stream {
        id: 0,
        name: Some(Intern::new("metadata".to_owned())),
        class: sc,
        trace: Arc::new(Trace::default()),
    });

    let mut source = TestSource::single_batch(vec![
        Message::StreamBeginning {
            stream: stream.clone(),
        },
        Message::StreamEnd {
            stream: stream.clone(),
        },
    ]);

    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::Ok);
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::End);

    // The stream file never shadows the metadata file
    assert!(out.join("metadata-0").is_file());
    let metadata = std::fs::read_to_string(out.join("metadata")).unwrap();
    assert!(metadata.starts_with("/* CTF 1.8 */"));
}

#[test]
fn clock_class_is_rendered_and_mapped() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("trace");

    let mut sc = StreamClass::new(0);
    sc.default_clock_class = Some(ClockClass {
        name: Some("cycles".to_owned()),
        description: Some("cycle counter".to_owned()),
        frequency: 1_000_000,
        precision: 1,
        offset_seconds: 2,
        offset_cycles: 3,
        origin_is_unix_epoch: false,
        uuid: None,
    });
    sc.packets_have_beginning_clock_snapshot = true;
    sc.packets_have_end_clock_snapshot = true;
    sc.event_classes.push(event_class_with_payload(payload_struct(vec![(
        "x",
        u32_fc(),
    )])));
    let ec = sc.event_classes[0].clone();
    let stream = Arc::new(Stream {
        id: 9,
        name: Some(Intern::new("chan".to_owned())),
        class: Arc::new(sc),
        trace: Arc::new(Trace::default()),
    });

    let mut source = TestSource::single_batch(vec![
        Message::StreamBeginning {
            stream: stream.clone(),
        },
        Message::PacketBeginning {
            stream: stream.clone(),
            packet: Packet::default(),
            clock_snapshot: Some(10),
        },
        Message::Event {
            stream: stream.clone(),
            event: Event {
                class: ec,
                common_context: None,
                specific_context: None,
                payload: Some(Field::structure([Field::UnsignedInteger(1)])),
            },
            clock_snapshot: Some(15),
        },
        Message::PacketEnd {
            stream: stream.clone(),
            clock_snapshot: Some(20),
        },
        Message::StreamEnd {
            stream: stream.clone(),
        },
    ]);

    let mut sink = FsSink::new(quiet_config(&out)).unwrap();
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::Ok);
    assert_eq!(sink.consume(&mut source).unwrap(), SinkStatus::End);

    let metadata = std::fs::read_to_string(out.join("metadata")).unwrap();
    assert!(metadata.contains("clock {\n\tname = cycles;"));
    assert!(metadata.contains("description = \"cycle counter\";"));
    assert!(metadata.contains("freq = 1000000;"));
    assert!(metadata.contains("absolute = false;"));
    assert!(metadata.contains("map = clock.cycles.value; } timestamp_begin;"));
    assert!(metadata.contains("map = clock.cycles.value; } timestamp_end;"));
    assert!(metadata.contains("map = clock.cycles.value; } timestamp;"));

    let bytes = std::fs::read(out.join("chan")).unwrap();
    // Packet context: sizes, then ts begin/end at 52 and 60; the
    // event header carries the event's clock snapshot
    assert_eq!(&bytes[52..60], 10_u64.to_le_bytes());
    assert_eq!(&bytes[60..68], 20_u64.to_le_bytes());
    // Header (36) + context (40): event id, then timestamp
    assert_eq!(&bytes[76..84], 0_u64.to_le_bytes());
    assert_eq!(&bytes[84..92], 15_u64.to_le_bytes());
    // stream_instance_id is the source stream's id
    assert_eq!(&bytes[28..36], 9_u64.to_le_bytes());
}
