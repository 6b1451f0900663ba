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

//! Transmit side of the AM824 processor pair: builds AMDTP packets from
//! the stream's ring, attaches SYT presentation times and rate-limits the
//! stream by holding back NO-DATA fillers until frames fall due.

use crate::{
    amdtp::{self, CipHeader, CIP_HEADER_LEN, QUADLET_LEN, TAG_WITH_CIP},
    buffer::{RingConsumer, RingControl},
    monitoring::{PacketCounters, StreamStatistics},
    port::MidiPlaybackBackend,
    stream::{
        StreamSpec, StreamState, TRANSMIT_ADVANCE_CYCLES, TRANSMIT_TRANSFER_DELAY_TICKS,
    },
    time::{diff_cycles, ticks_of_cycle, ticks_to_syt, TICKS_PER_CYCLE},
    transport::{CycleTimerSource, Disposition, TransmitClient},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// NO-DATA packets to emit after a stop request before reporting the
/// stream quiescent; devices latch noise when a stream just ceases.
const STOP_TAIL_PACKETS: u32 = 8;

/// Packet half of a transmit stream processor. Owned by the iso handler
/// and driven from the cycle callback on the iso thread.
pub struct TransmitProcessor {
    spec: StreamSpec,
    state: Arc<StreamState>,
    ring: RingConsumer,
    ring_control: RingControl,
    midi: Vec<MidiPlaybackBackend>,
    midi_rate_interval: u32,
    clock: Arc<dyn CycleTimerSource>,
    node_id: u8,
    dbc: u8,
    events: Vec<u32>,
    stop_tail_remaining: u32,
    counters: PacketCounters,
    fill_marks: StreamStatistics,
}

impl TransmitProcessor {
    pub fn new(
        spec: StreamSpec,
        state: Arc<StreamState>,
        ring: RingConsumer,
        ring_control: RingControl,
        midi: Vec<MidiPlaybackBackend>,
        clock: Arc<dyn CycleTimerSource>,
        node_id: u8,
    ) -> Self {
        let midi_rate_interval = spec.midi_rate_interval_packets();
        let fill_marks = StreamStatistics::new(format!("{}/fill", spec.name));
        let events = vec![0u32; spec.syt_interval as usize * spec.dimension];
        Self {
            spec,
            state,
            ring,
            ring_control,
            midi,
            midi_rate_interval,
            clock,
            node_id,
            dbc: 0,
            events,
            stop_tail_remaining: STOP_TAIL_PACKETS,
            counters: PacketCounters::default(),
            fill_marks,
        }
    }

    /// Back to the pre-start state; called between runs with the iso
    /// thread stopped.
    pub fn reset(&mut self) {
        self.dbc = 0;
        self.stop_tail_remaining = STOP_TAIL_PACKETS;
    }

    fn events_per_packet(&self) -> usize {
        self.spec.syt_interval as usize * self.spec.dimension
    }

    fn packet_len(&self) -> usize {
        CIP_HEADER_LEN + self.events_per_packet() * QUADLET_LEN
    }

    /// CIP header + `syt_interval × dimension` pad quadlets; DBC advances
    /// as if data had been sent so the device's framing stays locked.
    fn no_data_packet(&mut self, buf: &mut [u8]) -> (usize, u8, u8, Disposition) {
        let header = CipHeader::no_data(self.node_id, self.spec.dimension as u8, self.dbc);
        header.write(buf);
        for quad in buf[CIP_HEADER_LEN..self.packet_len()].chunks_exact_mut(QUADLET_LEN) {
            quad.copy_from_slice(&amdtp::EVENT_AUDIO_SILENCE.to_be_bytes());
        }
        self.dbc = self.dbc.wrapping_add(self.spec.syt_interval as u8);
        (self.packet_len(), TAG_WITH_CIP, 0, Disposition::Defer)
    }

    /// One byte per matching sub-slot frame, at most one per rate window.
    fn mux_midi(&mut self, packet_dbc: u8) {
        let dimension = self.spec.dimension;
        let nevents = self.spec.syt_interval as usize;
        for port in &mut self.midi {
            if port.countdown > 0 {
                port.countdown -= 1;
            }
            let sub_slot = (port.location - 1) % amdtp::MIDI_MUX_SLOTS;
            for frame in 0..nevents {
                if (packet_dbc as usize + frame) % amdtp::MIDI_MUX_SLOTS != sub_slot {
                    continue;
                }
                if port.countdown == 0
                    && let Ok(byte) = port.consumer.pop()
                {
                    self.events[frame * dimension + port.position] =
                        amdtp::encode_midi_byte(byte);
                    port.countdown = self.midi_rate_interval;
                }
            }
        }
    }

    fn handle_enable(&mut self, cycle: u32) {
        if let Some(enable_at) = self.state.enable_pending()
            && diff_cycles(cycle, enable_at) >= 0
        {
            self.state.mark_enabled();
            debug!(
                "transmit stream '{}' enabled at cycle {cycle} (target {enable_at})",
                self.spec.name
            );
        }
    }
}

impl TransmitClient for TransmitProcessor {
    fn get_packet(
        &mut self,
        cycle: u32,
        dropped: u32,
        buf: &mut [u8],
    ) -> (usize, u8, u8, Disposition) {
        self.state.note_packet(cycle);
        self.counters.packets += 1;
        if dropped > 0 {
            warn!(
                "transport dropped {dropped} cycles before {cycle} on '{}'",
                self.spec.name
            );
            self.state.note_dropped(dropped);
            self.counters.dropped += dropped as u64;
        }

        let now = self.clock.cycle_timer();

        // a stopping stream only emits its NO-DATA tail
        if self.state.stop_pending() {
            if self.stop_tail_remaining > 0 {
                self.stop_tail_remaining -= 1;
            } else {
                self.state.mark_stop_ready();
            }
            return self.no_data_packet(buf);
        }

        // the stream counts as running once the requested cycles have
        // caught up with bus time
        if !self.state.is_running() {
            let cycle_lead = diff_cycles(cycle, now.cycles());
            if cycle_lead < 0 {
                return self.no_data_packet(buf);
            }
            // the oldest prefilled frame goes out with the transfer delay
            // from the start of this cycle
            let start = ticks_of_cycle(now, cycle);
            self.ring_control
                .set_head_timestamp(start.add(TRANSMIT_TRANSFER_DELAY_TICKS));
            self.state.set_running();
            debug!(
                "transmit stream '{}' started running at cycle {cycle}",
                self.spec.name
            );
        }

        self.handle_enable(cycle);

        if self.state.is_disabled() {
            return self.no_data_packet(buf);
        }

        let (head, fill) = self.ring.head_timestamp();
        // intended send time of the oldest frame; packets queued more than
        // the advance window early stay NO-DATA
        let horizon = now.to_ticks().add(TRANSMIT_ADVANCE_CYCLES as u64 * TICKS_PER_CYCLE);
        if head.diff(horizon) > 0 {
            return self.no_data_packet(buf);
        }

        if fill < self.spec.syt_interval as u64 {
            warn!(
                "transmit buffer underrun on '{}' at cycle {cycle} (fill {fill})",
                self.spec.name
            );
            self.state.record_xrun();
            return self.no_data_packet(buf);
        }

        let packet_dbc = self.dbc;
        let interval = self.spec.syt_interval as usize;
        if !self.ring.read_frames(interval, &mut self.events) {
            // fill was re-checked above; only reachable if the period side
            // resets concurrently, treat as underrun
            self.state.record_xrun();
            return self.no_data_packet(buf);
        }

        self.fill_marks.mark(self.ring.fill() as i64);
        self.mux_midi(packet_dbc);

        let ts_packet = head.add(TRANSMIT_TRANSFER_DELAY_TICKS);
        let header = CipHeader {
            sid: self.node_id,
            dbs: self.spec.dimension as u8,
            dbc: packet_dbc,
            fdf: self.spec.fdf,
            syt: ticks_to_syt(ts_packet),
        };
        header.write(buf);
        amdtp::events_to_payload(&self.events, &mut buf[CIP_HEADER_LEN..self.packet_len()]);
        self.dbc = self.dbc.wrapping_add(self.spec.syt_interval as u8);

        (self.packet_len(), TAG_WITH_CIP, 0, Disposition::Ok)
    }
}

impl Drop for TransmitProcessor {
    fn drop(&mut self) {
        self.fill_marks.dump();
        debug!(
            "transmit stream '{}': {} cycles served, {} dropped",
            self.spec.name, self.counters.packets, self.counters.dropped
        );
    }
}
