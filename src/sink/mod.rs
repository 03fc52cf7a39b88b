//! The filesystem sink: consumes upstream messages and writes CTF 1.8
//! traces under the configured output directory.

use crate::{
    config::SinkConfig,
    error::{Error, SinkStatus},
    ir,
    sink::stream::{make_unique_stream_file_name, DiscardedRange, Stream},
    sink::trace::{stream_key, StreamKey, Trace},
    translate,
};
use fxhash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) mod stream;
pub(crate) mod trace;

/// Map key for live traces: the source trace's identity.
type TraceKey = usize;

fn trace_key(ir_trace: &Arc<ir::Trace>) -> TraceKey {
    Arc::as_ptr(ir_trace) as TraceKey
}

/// A CTF 1.8 filesystem sink.
///
/// Drive it by repeatedly calling [`consume`](Self::consume) with the
/// upstream message iterator until it returns
/// [`SinkStatus::End`] (or an error). Each trace's `metadata` file is
/// written when the trace is finalized, which happens at end of
/// stream or through [`finalize`](Self::finalize).
pub struct FsSink {
    config: SinkConfig,
    traces: FxHashMap<TraceKey, Trace>,
}

impl FsSink {
    pub fn new(config: SinkConfig) -> Result<Self, Error> {
        if config.assume_single_trace && config.path.exists() {
            return Err(Error::SingleTraceModeCollision(config.path.clone()));
        }

        if !config.assume_single_trace {
            std::fs::create_dir_all(&config.path)?;
        }

        Ok(Self {
            config,
            traces: FxHashMap::default(),
        })
    }

    /// Pulls one message batch from `upstream` and processes it.
    ///
    /// Returns [`SinkStatus::TryAgain`] untouched when the upstream
    /// has nothing to deliver; finalizes every live trace when the
    /// upstream ends. A fatal error aborts the call; the output trace
    /// is a valid prefix up to the last fully closed packet.
    pub fn consume<I: ir::MessageIterator>(
        &mut self,
        upstream: &mut I,
    ) -> Result<SinkStatus, Error> {
        match upstream.next()? {
            ir::MessageIteratorNext::Messages(messages) => {
                for message in messages {
                    self.handle_message(message)?;
                }
                Ok(SinkStatus::Ok)
            }
            ir::MessageIteratorNext::TryAgain => Ok(SinkStatus::TryAgain),
            ir::MessageIteratorNext::End => {
                self.finalize()?;
                Ok(SinkStatus::End)
            }
        }
    }

    /// Finalizes every live trace: closes remaining streams and
    /// writes each trace's metadata file.
    pub fn finalize(&mut self) -> Result<(), Error> {
        for (_, mut trace) in self.traces.drain() {
            for stream in trace.streams.values_mut() {
                stream.finish()?;
            }
            trace.finalize(&self.config);
        }
        Ok(())
    }

    fn handle_message(&mut self, message: ir::Message) -> Result<(), Error> {
        match message {
            ir::Message::StreamBeginning { stream } => self.handle_stream_beginning(&stream),
            ir::Message::StreamEnd { stream } => self.handle_stream_end(&stream),
            ir::Message::PacketBeginning {
                stream,
                packet,
                clock_snapshot,
            } => self.handle_packet_beginning(&stream, packet, clock_snapshot),
            ir::Message::PacketEnd {
                stream,
                clock_snapshot,
            } => self.handle_packet_end(&stream, clock_snapshot),
            ir::Message::Event {
                stream,
                event,
                clock_snapshot,
            } => self.handle_event(&stream, &event, clock_snapshot),
            ir::Message::DiscardedEvents {
                stream,
                count,
                beginning_clock_snapshot,
                end_clock_snapshot,
            } => self.handle_discarded_events(
                &stream,
                count,
                beginning_clock_snapshot,
                end_clock_snapshot,
            ),
            ir::Message::DiscardedPackets {
                stream,
                count,
                beginning_clock_snapshot,
                end_clock_snapshot,
            } => self.handle_discarded_packets(
                &stream,
                count,
                beginning_clock_snapshot,
                end_clock_snapshot,
            ),
            ir::Message::MessageIteratorInactivity => {
                debug!("Ignoring message iterator inactivity message");
                Ok(())
            }
            // Not representable in CTF 1.8
            ir::Message::StreamActivityBeginning { .. }
            | ir::Message::StreamActivityEnd { .. } => {
                debug!("Ignoring stream activity message");
                Ok(())
            }
        }
    }

    /// Looks up the trace and stream runtime records for `ir_stream`,
    /// creating them (and translating their classes) on first sight.
    fn borrow_stream(
        &mut self,
        ir_stream: &Arc<ir::Stream>,
    ) -> Result<(&mut Trace, StreamKey), Error> {
        let t_key = trace_key(&ir_stream.trace);
        if !self.traces.contains_key(&t_key) {
            if self.config.assume_single_trace && !self.traces.is_empty() {
                warn!(
                    stream_name = ir_stream.name.as_ref().map(|n| n.as_str()),
                    "Single trace mode, but getting more than one trace"
                );
                return Err(Error::SingleTraceModeCollision(self.config.path.clone()));
            }

            let trace = Trace::create(&self.config, &ir_stream.trace)?;
            self.traces.insert(t_key, trace);
        }

        let trace = self
            .traces
            .get_mut(&t_key)
            .expect("trace was just looked up or inserted");

        let s_key = stream_key(ir_stream);
        if !trace.streams.contains_key(&s_key) {
            let sc_index = translate::translate_stream_class(&mut trace.tc, &ir_stream.class)?;

            let existing: Vec<&str> = trace
                .streams
                .values()
                .map(|s| s.file_name.as_str())
                .collect();
            let base = ir_stream
                .name
                .as_ref()
                .map(|n| n.as_str())
                .unwrap_or("stream");
            let file_name = make_unique_stream_file_name(&existing, base);

            let stream = Stream::create(
                &trace.path,
                file_name,
                ir_stream.clone(),
                sc_index,
                self.config.byte_order.into(),
            )?;
            trace.streams.insert(s_key, stream);
        }

        Ok((trace, s_key))
    }

    fn handle_stream_beginning(&mut self, ir_stream: &Arc<ir::Stream>) -> Result<(), Error> {
        let ir_sc = &ir_stream.class;
        let packets_have_beginning_end_cs = ir_sc.packets_have_beginning_clock_snapshot
            && ir_sc.packets_have_end_clock_snapshot;

        // Discarded events/packets carrying clock snapshots require
        // packets timestamped on both ends
        if !self.config.ignore_discarded_events
            && ir_sc.discarded_events_have_clock_snapshots
            && !packets_have_beginning_end_cs
        {
            return Err(Error::IncompatibleStreamShape(format!(
                "discarded events have clock snapshots, but packets have no beginning \
                 and/or end clock snapshots (stream id {})",
                ir_stream.id
            )));
        }

        if !self.config.ignore_discarded_packets
            && ir_sc.discarded_packets_have_clock_snapshots
            && !packets_have_beginning_end_cs
        {
            return Err(Error::IncompatibleStreamShape(format!(
                "discarded packets have clock snapshots, but packets have no beginning \
                 and/or end clock snapshots (stream id {})",
                ir_stream.id
            )));
        }

        let (trace, s_key) = self.borrow_stream(ir_stream)?;
        let stream = &trace.streams[&s_key];
        info!(
            stream_id = ir_stream.id,
            stream_name = ir_stream.name.as_ref().map(|n| n.as_str()),
            path = %trace.path.join(&stream.file_name).display(),
            "Created new, empty stream file"
        );
        Ok(())
    }

    fn handle_stream_end(&mut self, ir_stream: &Arc<ir::Stream>) -> Result<(), Error> {
        let (trace, s_key) = self.borrow_stream(ir_stream)?;
        let mut stream = trace
            .streams
            .remove(&s_key)
            .expect("borrow_stream just created it");
        info!(
            stream_id = ir_stream.id,
            stream_name = ir_stream.name.as_ref().map(|n| n.as_str()),
            path = %trace.path.join(&stream.file_name).display(),
            "Closing stream file"
        );
        stream.finish()
    }

    fn handle_packet_beginning(
        &mut self,
        ir_stream: &Arc<ir::Stream>,
        packet: ir::Packet,
        clock_snapshot: Option<u64>,
    ) -> Result<(), Error> {
        let (trace, s_key) = self.borrow_stream(ir_stream)?;
        let stream = trace
            .streams
            .get_mut(&s_key)
            .expect("borrow_stream just created it");
        let sc = &trace.tc.stream_classes[stream.sc_index];

        let cs = sc.packets_have_ts_begin.then(|| {
            clock_snapshot.expect("packet beginning carries a clock snapshot for this stream class")
        });

        // A pending discarded events range must begin at the previous
        // packet's end time, or at this packet's beginning time when
        // this is the first packet. Its end time is validated when the
        // packet closes.
        if let Some(range) = stream.discarded_events_range {
            let expected_cs = match stream.prev_packet_state.end_cs {
                None => cs.expect("timestamped discarded events imply timestamped packets"),
                Some(end_cs) => end_cs,
            };

            if range.beginning_cs != expected_cs {
                return Err(Error::discarded_range(
                    "events",
                    format!(
                        "unexpected beginning time (clock snapshot {}, expected {expected_cs})",
                        range.beginning_cs
                    ),
                ));
            }
        }

        // A pending discarded packets range must span from the
        // previous packet's end time to this packet's beginning time
        if let Some(range) = stream.discarded_packets_range {
            let Some(prev_end_cs) = stream.prev_packet_state.end_cs else {
                return Err(Error::discarded_range(
                    "packets",
                    "message occurs before the stream's first packet",
                ));
            };

            if range.beginning_cs != prev_end_cs {
                return Err(Error::discarded_range(
                    "packets",
                    format!(
                        "unexpected beginning time (clock snapshot {}, expected {prev_end_cs})",
                        range.beginning_cs
                    ),
                ));
            }

            let expected_end_cs =
                cs.expect("timestamped discarded packets imply timestamped packets");
            if range.end_cs != expected_end_cs {
                return Err(Error::discarded_range(
                    "packets",
                    format!(
                        "unexpected end time (clock snapshot {}, expected {expected_end_cs})",
                        range.end_cs
                    ),
                ));
            }
        }

        // Discarded packets ranges span between packets; this packet
        // beginning closes any pending one
        stream.discarded_packets_range = None;

        stream.open_packet(sc, &trace.tc.uuid, cs, packet)
    }

    fn handle_packet_end(
        &mut self,
        ir_stream: &Arc<ir::Stream>,
        clock_snapshot: Option<u64>,
    ) -> Result<(), Error> {
        let (trace, s_key) = self.borrow_stream(ir_stream)?;
        let stream = trace
            .streams
            .get_mut(&s_key)
            .expect("borrow_stream just created it");
        let sc = &trace.tc.stream_classes[stream.sc_index];

        let cs = sc.packets_have_ts_end.then(|| {
            clock_snapshot.expect("packet end carries a clock snapshot for this stream class")
        });

        // A pending discarded events range must end at this packet's
        // end time; its beginning time was validated when the packet
        // opened
        if let Some(range) = stream.discarded_events_range {
            let expected_cs =
                cs.expect("timestamped discarded events imply timestamped packets");
            if range.end_cs != expected_cs {
                return Err(Error::discarded_range(
                    "events",
                    format!(
                        "unexpected end time (clock snapshot {}, expected {expected_cs})",
                        range.end_cs
                    ),
                ));
            }
        }

        stream.close_packet(sc, cs)?;

        // Discarded events ranges span from packet end to packet end;
        // this packet end closes any pending one
        stream.discarded_events_range = None;
        Ok(())
    }

    fn handle_event(
        &mut self,
        ir_stream: &Arc<ir::Stream>,
        event: &ir::Event,
        clock_snapshot: Option<u64>,
    ) -> Result<(), Error> {
        let (trace, s_key) = self.borrow_stream(ir_stream)?;
        let stream = trace
            .streams
            .get_mut(&s_key)
            .expect("borrow_stream just created it");

        translate::translate_event_class(&mut trace.tc, ir_stream.class.id, &event.class)?;

        let sc = &trace.tc.stream_classes[stream.sc_index];
        let ec = sc
            .event_class(event.class.id)
            .expect("event class was just translated");

        if !stream.packet_state.is_open {
            return Err(Error::IncompatibleStreamShape(format!(
                "got an event message while no packet is open (stream id {})",
                ir_stream.id
            )));
        }

        stream.write_event(sc, ec, clock_snapshot, event)
    }

    fn handle_discarded_events(
        &mut self,
        ir_stream: &Arc<ir::Stream>,
        count: Option<u64>,
        beginning_clock_snapshot: Option<u64>,
        end_clock_snapshot: Option<u64>,
    ) -> Result<(), Error> {
        if self.config.ignore_discarded_events {
            info!(
                stream_id = ir_stream.id,
                "Ignoring discarded events message"
            );
            return Ok(());
        }

        let (trace, s_key) = self.borrow_stream(ir_stream)?;
        let stream = trace
            .streams
            .get_mut(&s_key)
            .expect("borrow_stream just created it");
        let sc = &trace.tc.stream_classes[stream.sc_index];

        if stream.discarded_events_range.is_some() {
            return Err(Error::discarded_range(
                "events",
                "contiguous discarded events messages are not supported",
            ));
        }

        // A timestamped discarded events range must go from one
        // packet's end time to the next packet's end time, so it
        // cannot land within an open packet
        if stream.packet_state.is_open && sc.discarded_events_has_ts {
            return Err(Error::discarded_range(
                "events",
                "message with clock snapshots occurs within a packet",
            ));
        }

        if sc.discarded_events_has_ts {
            let (Some(beginning_cs), Some(end_cs)) =
                (beginning_clock_snapshot, end_clock_snapshot)
            else {
                return Err(Error::discarded_range(
                    "events",
                    "message carries no clock snapshots for this stream class",
                ));
            };

            // Validated at the next packet beginning and end
            stream.discarded_events_range = Some(DiscardedRange {
                beginning_cs,
                end_cs,
            });
        }

        // Without a count, record that at least something was lost
        stream.packet_state.discarded_events_counter += count.unwrap_or(1);
        Ok(())
    }

    fn handle_discarded_packets(
        &mut self,
        ir_stream: &Arc<ir::Stream>,
        count: Option<u64>,
        beginning_clock_snapshot: Option<u64>,
        end_clock_snapshot: Option<u64>,
    ) -> Result<(), Error> {
        if self.config.ignore_discarded_packets {
            info!(
                stream_id = ir_stream.id,
                "Ignoring discarded packets message"
            );
            return Ok(());
        }

        let (trace, s_key) = self.borrow_stream(ir_stream)?;
        let stream = trace
            .streams
            .get_mut(&s_key)
            .expect("borrow_stream just created it");
        let sc = &trace.tc.stream_classes[stream.sc_index];

        if stream.discarded_packets_range.is_some() {
            return Err(Error::discarded_range(
                "packets",
                "contiguous discarded packets messages are not supported",
            ));
        }

        // Discarded packets messages occur between packets
        if stream.packet_state.is_open {
            return Err(Error::discarded_range(
                "packets",
                "message occurs within a packet",
            ));
        }

        if sc.discarded_packets_has_ts {
            let (Some(beginning_cs), Some(end_cs)) =
                (beginning_clock_snapshot, end_clock_snapshot)
            else {
                return Err(Error::discarded_range(
                    "packets",
                    "message carries no clock snapshots for this stream class",
                ));
            };

            // Validated at the next packet beginning
            stream.discarded_packets_range = Some(DiscardedRange {
                beginning_cs,
                end_cs,
            });
        }

        stream.packet_state.seq_num += count.unwrap_or(1);
        Ok(())
    }
}
