/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Receive side of the AM824 processor pair: parses AMDTP packets into
//! frames plus a reconstructed presentation timestamp and appends them to
//! the stream's ring.

use crate::{
    amdtp::{self, CipHeader, QUADLET_LEN},
    buffer::RingProducer,
    dll::RateEstimatorDll,
    monitoring::{PacketCounters, StreamStatistics},
    port::MidiCaptureBackend,
    stream::{StreamSpec, StreamState},
    time::{diff_cycles, syt_recv_to_ticks, Ticks},
    transport::{CycleTimerSource, Disposition, ReceiveClient},
    utils::AverageCalculationBuffer,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Packet half of a receive stream processor. Owned by the iso handler and
/// driven from the packet callback; everything here runs on the iso
/// thread.
pub struct ReceiveProcessor {
    spec: StreamSpec,
    state: Arc<StreamState>,
    ring: RingProducer,
    dll: RateEstimatorDll,
    midi: Vec<MidiCaptureBackend>,
    clock: Arc<dyn CycleTimerSource>,
    last_timestamp: Option<Ticks>,
    last_dbc: Option<(u8, u32)>,
    events: Vec<u32>,
    lateness: AverageCalculationBuffer<i64>,
    counters: PacketCounters,
    fill_marks: StreamStatistics,
}

impl ReceiveProcessor {
    pub fn new(
        spec: StreamSpec,
        state: Arc<StreamState>,
        ring: RingProducer,
        dll: RateEstimatorDll,
        midi: Vec<MidiCaptureBackend>,
        clock: Arc<dyn CycleTimerSource>,
    ) -> Self {
        let fill_marks = StreamStatistics::new(format!("{}/fill", spec.name));
        Self {
            spec,
            state,
            ring,
            dll,
            midi,
            clock,
            last_timestamp: None,
            last_dbc: None,
            events: Vec::new(),
            // average packet lateness over roughly one second of packets
            lateness: AverageCalculationBuffer::new(vec![0i64; 1000].into()),
            counters: PacketCounters::default(),
            fill_marks,
        }
    }

    pub fn ticks_per_frame(&self) -> f64 {
        self.dll.ticks_per_frame()
    }

    /// Back to the pre-start state; called between runs with the iso
    /// thread stopped.
    pub fn reset(&mut self) {
        self.dll.reset();
        self.last_timestamp = None;
        self.last_dbc = None;
    }

    fn handle_enable(&mut self, cycle: u32) {
        // latency tolerant: a missed enable cycle still enables on the
        // next packet
        if let Some(enable_at) = self.state.enable_pending()
            && diff_cycles(cycle, enable_at) >= 0
        {
            if let Some(previous) = self.last_timestamp {
                self.ring.advance_tail_timestamp(previous);
            }
            self.state.mark_enabled();
            debug!(
                "receive stream '{}' enabled at cycle {cycle} (target {enable_at})",
                self.spec.name
            );
        }
    }

    fn demux_midi(&mut self, nevents: usize, dbc: u8) {
        if self.midi.is_empty() {
            return;
        }
        let dimension = self.spec.dimension;
        for port in &mut self.midi {
            let sub_slot = (port.location - 1) % amdtp::MIDI_MUX_SLOTS;
            for frame in 0..nevents {
                if (dbc as usize + frame) % amdtp::MIDI_MUX_SLOTS != sub_slot {
                    continue;
                }
                let event = self.events[frame * dimension + port.position];
                if let Some(byte) = amdtp::decode_midi_event(event) {
                    if port.producer.push(byte).is_err() {
                        warn!("MIDI ring full on '{}' slot {}", port.position, sub_slot);
                    }
                }
            }
        }
    }
}

impl ReceiveClient for ReceiveProcessor {
    fn put_packet(
        &mut self,
        data: &[u8],
        _channel: u8,
        _tag: u8,
        _sy: u8,
        cycle: u32,
        dropped: u32,
    ) -> Disposition {
        self.state.note_packet(cycle);
        self.counters.packets += 1;
        if dropped > 0 {
            warn!(
                "transport dropped {dropped} packets before cycle {cycle} on '{}'",
                self.spec.name
            );
            self.state.note_dropped(dropped);
            self.counters.dropped += dropped as u64;
        }

        self.handle_enable(cycle);

        // validity gate: only CIP-conformant DATA packets carry frames;
        // everything else only advances cycle bookkeeping
        let header = match CipHeader::parse(data) {
            Some(it) => it,
            None => {
                self.counters.discarded_invalid += 1;
                return Disposition::Ok;
            }
        };
        if header.is_no_data() || header.dbs == 0 || data.len() < 2 * QUADLET_LEN {
            return Disposition::Ok;
        }

        let nevents = (data.len() / QUADLET_LEN - 2) / header.dbs as usize;
        if nevents == 0 {
            return Disposition::Ok;
        }

        // lost packets show up as a DBC gap
        if let Some((prev_dbc, prev_nevents)) = self.last_dbc {
            let expected = prev_dbc.wrapping_add(prev_nevents as u8);
            if header.dbc != expected {
                let missing = header.dbc.wrapping_sub(expected);
                warn!(
                    "DBC discontinuity on '{}' at cycle {cycle}: expected {expected}, got {} ({missing} frames lost)",
                    self.spec.name, header.dbc
                );
            }
        }
        self.last_dbc = Some((header.dbc, nevents as u32));

        let previous_timestamp = self.last_timestamp;
        let timestamp = syt_recv_to_ticks(header.syt, cycle, self.clock.cycle_timer());
        self.last_timestamp = Some(timestamp);
        self.state.set_last_timestamp(timestamp);

        if let Some(previous) = previous_timestamp {
            let delta = timestamp.diff(previous);
            if delta > 0 {
                self.dll.put(delta as u64);
            }
            if !self.state.is_running() {
                self.state.set_running();
                debug!(
                    "receive stream '{}' started running at cycle {cycle}",
                    self.spec.name
                );
            }
        }

        if let Some(average) = self
            .lateness
            .update(self.clock.cycle_timer().to_ticks().diff(timestamp))
        {
            trace!(
                "'{}': average packet lateness {average} ticks",
                self.spec.name
            );
        }

        let tail = timestamp.add((self.spec.syt_interval as f64 * self.dll.ticks_per_frame()) as u64);

        // while disabled keep the tail moving so period estimation stays
        // coherent, but do not store samples
        if self.state.is_disabled() {
            self.ring.advance_tail_timestamp(tail);
            return Disposition::Defer;
        }

        let payload = &data
            [2 * QUADLET_LEN..2 * QUADLET_LEN + nevents * header.dbs as usize * QUADLET_LEN];
        amdtp::payload_to_events(payload, &mut self.events);
        let accepted = self.ring.write_frames(&self.events, tail);

        if !accepted {
            warn!(
                "receive buffer overrun on '{}' at cycle {cycle} (fill {})",
                self.spec.name,
                self.ring.fill()
            );
            self.state.record_xrun();
            return Disposition::Defer;
        }

        self.fill_marks.mark(self.ring.fill() as i64);
        self.demux_midi(nevents, header.dbc);
        Disposition::Ok
    }
}

impl Drop for ReceiveProcessor {
    fn drop(&mut self) {
        self.fill_marks.dump();
        debug!(
            "receive stream '{}': {} packets, {} dropped, {} invalid",
            self.spec.name, self.counters.packets, self.counters.dropped,
            self.counters.discarded_invalid
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        buffer::timestamped_ring,
        dll::DllOrder,
        port::{midi_port_pair, MidiBackend, PortDirection, PortSpec},
        stream::StreamDirection,
        time::TICKS_PER_CYCLE,
        transport::sim::SimTransport,
    };

    const DIM: usize = 2;
    const SYT_INTERVAL: u32 = 8;

    fn spec() -> StreamSpec {
        StreamSpec::new("rx-test", 0, StreamDirection::Receive, 48_000, DIM)
            .expect("valid spec")
    }

    fn processor(
        bus: &SimTransport,
        capacity: usize,
    ) -> (ReceiveProcessor, crate::buffer::RingConsumer, Arc<StreamState>) {
        let spec = spec();
        let state = StreamState::new();
        let (producer, consumer, control) = timestamped_ring(capacity, DIM);
        control.set_nominal_rate(512.0);
        let dll = RateEstimatorDll::new(48_000, SYT_INTERVAL, DllOrder::Second);
        let clock: Arc<dyn CycleTimerSource> = Arc::new(bus.clone());
        let processor =
            ReceiveProcessor::new(spec, state.clone(), producer, dll, Vec::new(), clock);
        (processor, consumer, state)
    }

    // presentation time of the first frame of packet 0
    const BASE_TICKS: u64 = TICKS_PER_CYCLE + 100;

    fn packet_timestamp(index: u32) -> Ticks {
        Ticks::new(BASE_TICKS + index as u64 * SYT_INTERVAL as u64 * 512)
    }

    fn data_packet_at(index: u32, sample_base: i32) -> (Vec<u8>, u32) {
        let ts = packet_timestamp(index);
        let cycle = (ts.value() / TICKS_PER_CYCLE) as u32;
        let header = CipHeader {
            sid: 1,
            dbs: DIM as u8,
            dbc: (index as usize * SYT_INTERVAL as usize % 256) as u8,
            fdf: 0x02,
            syt: crate::time::ticks_to_syt(ts),
        };
        let mut packet = vec![0u8; 8 + SYT_INTERVAL as usize * DIM * 4];
        header.write(&mut packet);
        let events: Vec<u32> = (0..SYT_INTERVAL as usize * DIM)
            .map(|i| amdtp::encode_int24(sample_base + i as i32))
            .collect();
        amdtp::events_to_payload(&events, &mut packet[8..]);
        (packet, cycle)
    }

    fn feed(processor: &mut ReceiveProcessor, bus: &SimTransport, index: u32) -> Disposition {
        let (packet, cycle) = data_packet_at(index, 0);
        bus.set_now(packet_timestamp(index).add(200));
        processor.put_packet(&packet, 0, 1, 0, cycle, 0)
    }

    #[test]
    fn discarded_packets_still_update_cycle_bookkeeping() {
        let bus = SimTransport::new();
        let (mut processor, _consumer, state) = processor(&bus, 64);
        // NO-DATA packet
        let mut packet = vec![0u8; 8];
        CipHeader::no_data(1, DIM as u8, 0).write(&mut packet);
        assert_eq!(processor.put_packet(&packet, 0, 1, 0, 77, 0), Disposition::Ok);
        assert_eq!(state.last_cycle(), 77);
        assert_eq!(state.packet_count(), 1);
    }

    #[test]
    fn disabled_stream_advances_tail_without_storing() {
        let bus = SimTransport::new();
        let (mut processor, consumer, _state) = processor(&bus, 64);
        assert_eq!(feed(&mut processor, &bus, 0), Disposition::Defer);
        assert_eq!(consumer.fill(), 0);
    }

    #[test]
    fn enable_happens_on_or_after_the_target_cycle() {
        let bus = SimTransport::new();
        let (mut processor, consumer, state) = processor(&bus, 64);
        // packet 0 arrives on cycle 1; request enable for cycle 2
        state.request_enable_at(2);
        assert_eq!(feed(&mut processor, &bus, 0), Disposition::Defer);
        assert!(state.is_disabled());
        // packet 2 arrives on cycle 3; the exact enable cycle was missed
        // but the stream still enables
        assert_eq!(feed(&mut processor, &bus, 2), Disposition::Ok);
        assert!(!state.is_disabled());
        assert_eq!(consumer.fill(), SYT_INTERVAL as u64);
    }

    #[test]
    fn enabled_stream_stores_frames_with_timestamps() {
        let bus = SimTransport::new();
        let (mut processor, consumer, state) = processor(&bus, 64);
        state.request_enable_at(0);
        feed(&mut processor, &bus, 0);
        feed(&mut processor, &bus, 1);
        let (head, fill) = consumer.head_timestamp();
        assert_eq!(fill, 2 * SYT_INTERVAL as u64);
        // head points at the first frame of the first stored packet
        let expected = packet_timestamp(0);
        assert!(
            head.diff(expected).abs() <= 1,
            "head {head} expected {expected}"
        );
    }

    #[test]
    fn overrun_disables_the_stream_and_counts_an_xrun() {
        let bus = SimTransport::new();
        let (mut processor, _consumer, state) = processor(&bus, 16);
        state.request_enable_at(0);
        assert_eq!(feed(&mut processor, &bus, 0), Disposition::Ok);
        assert_eq!(feed(&mut processor, &bus, 1), Disposition::Ok);
        // ring holds 16 frames; the third packet does not fit
        assert_eq!(feed(&mut processor, &bus, 2), Disposition::Defer);
        assert!(state.xrun_occurred());
        assert_eq!(state.xrun_count(), 1);
        assert!(state.is_disabled());
    }

    #[test]
    fn running_is_reported_after_two_timestamps() {
        let bus = SimTransport::new();
        let (mut processor, _consumer, state) = processor(&bus, 64);
        feed(&mut processor, &bus, 0);
        assert!(!state.is_running());
        feed(&mut processor, &bus, 1);
        assert!(state.is_running());
    }

    #[test]
    fn midi_events_are_demuxed_to_the_port_ring() {
        let bus = SimTransport::new();
        let spec = spec();
        let state = StreamState::new();
        let (producer, _consumer, control) = timestamped_ring(64, DIM);
        control.set_nominal_rate(512.0);
        let dll = RateEstimatorDll::new(48_000, SYT_INTERVAL, DllOrder::Second);
        let port_spec = PortSpec::midi("midi-in", 1, 1);
        let (mut client, backend) = midi_port_pair(port_spec, PortDirection::Capture);
        let MidiBackend::Capture(backend) = backend else {
            panic!("expected capture backend");
        };
        let mut processor = ReceiveProcessor::new(
            spec,
            state.clone(),
            producer,
            dll,
            vec![backend],
            Arc::new(bus.clone()) as Arc<dyn CycleTimerSource>,
        );
        state.request_enable_at(0);

        // dbc 0, location 1 -> frame 0 carries the byte, at quadlet slot 1
        let (mut packet, cycle) = data_packet_at(0, 0);
        let midi_event = amdtp::encode_midi_byte(0x90);
        packet[8 + 4..8 + 8].copy_from_slice(&midi_event.to_be_bytes());
        bus.set_now(packet_timestamp(0).add(200));
        assert_eq!(
            processor.put_packet(&packet, 0, 1, 0, cycle, 0),
            Disposition::Ok
        );

        let mut bytes = [0u8; 4];
        assert_eq!(client.read(&mut bytes), 1);
        assert_eq!(bytes[0], 0x90);
    }
}
