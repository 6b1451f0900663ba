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

//! Stream processors: the packet-side codecs bound to one isochronous
//! channel each, plus the lifecycle state they share with the period side.
//!
//! A processor is split across threads: the packet half (here and in the
//! `receive`/`transmit` submodules) runs on the iso thread inside the
//! packet callback; the period half lives in the manager. The two halves
//! communicate exclusively through the timestamped ring and the atomic
//! [`StreamState`].

pub mod receive;
pub mod transmit;

use crate::{
    amdtp,
    error::{ConfigError, ConfigResult},
    time::{TICKS_PER_SECOND, Ticks},
};
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

/// Kernel-side buffering shows up as extra latency on the receive path;
/// about 2 ms.
pub const RECEIVE_PROCESSING_DELAY_TICKS: u64 = 2 * TICKS_PER_SECOND / 1000;

/// Margin between pulling a frame out of the transmit buffer and its
/// presentation on the device; about 2 ms.
pub const TRANSMIT_TRANSFER_DELAY_TICKS: u64 = 2 * TICKS_PER_SECOND / 1000;

/// How many cycles ahead of the wire clock the transmit path is willing to
/// hand packets to the DMA queue.
pub const TRANSMIT_ADVANCE_CYCLES: u32 = 1;

/// Minimum pause between two MIDI bytes on one muxed sub-channel, in
/// microseconds (advisory lower bound).
pub const MIDI_RATE_LIMIT_US: u64 = 320;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamDirection {
    Receive,
    Transmit,
}

/// Static shape of one AMDTP stream, fully derived from channel, rate and
/// frame dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub channel: u8,
    pub direction: StreamDirection,
    pub sample_rate: u32,
    /// quadlets per frame (the CIP `dbs`)
    pub dimension: usize,
    pub syt_interval: u32,
    pub fdf: u8,
}

impl StreamSpec {
    pub fn new(
        name: impl Into<String>,
        channel: u8,
        direction: StreamDirection,
        sample_rate: u32,
        dimension: usize,
    ) -> ConfigResult<Self> {
        if dimension == 0 || dimension > 64 {
            return Err(ConfigError::InvalidDimension(dimension));
        }
        Ok(Self {
            name: name.into(),
            channel,
            direction,
            sample_rate,
            dimension,
            syt_interval: amdtp::syt_interval_for_rate(sample_rate)?,
            fdf: amdtp::fdf_for_rate(sample_rate)?,
        })
    }

    pub fn nominal_ticks_per_frame(&self) -> f64 {
        TICKS_PER_SECOND as f64 / self.sample_rate as f64
    }

    /// Packets to hold back between two MIDI bytes on one sub-channel.
    pub fn midi_rate_interval_packets(&self) -> u32 {
        let packet_time_us = 1_000_000 * self.syt_interval as u64 / self.sample_rate as u64;
        MIDI_RATE_LIMIT_US.div_ceil(packet_time_us.max(1)) as u32
    }
}

/// Lifecycle and health state shared between the packet half and the
/// period half of one stream processor. All fields are atomics; this is
/// the only cross-thread state next to the ring counters.
#[derive(Debug, Default)]
pub struct StreamState {
    running: AtomicBool,
    disabled: AtomicBool,
    enable_pending: AtomicBool,
    enable_at_cycle: AtomicU32,
    stop_pending: AtomicBool,
    stop_ready: AtomicBool,
    xrun_flag: AtomicBool,
    xruns: AtomicU32,
    packets: AtomicU64,
    dropped: AtomicU64,
    last_cycle: AtomicU32,
    last_timestamp: AtomicU64,
}

impl StreamState {
    pub fn new() -> Arc<Self> {
        let state = Arc::new(Self::default());
        state.disabled.store(true, Ordering::Release);
        state
    }

    /// Fresh run: disabled, not running, no pending requests. Xrun
    /// counters survive, the flag does not.
    pub fn reset_for_start(&self) {
        self.running.store(false, Ordering::Release);
        self.disabled.store(true, Ordering::Release);
        self.enable_pending.store(false, Ordering::Release);
        self.stop_pending.store(false, Ordering::Release);
        self.stop_ready.store(false, Ordering::Release);
        self.xrun_flag.store(false, Ordering::Release);
        self.packets.store(0, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn request_enable_at(&self, cycle: u32) {
        self.enable_at_cycle.store(cycle, Ordering::Release);
        self.enable_pending.store(true, Ordering::Release);
    }

    pub fn enable_pending(&self) -> Option<u32> {
        if self.enable_pending.load(Ordering::Acquire) {
            Some(self.enable_at_cycle.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn mark_enabled(&self) {
        self.enable_pending.store(false, Ordering::Release);
        self.disabled.store(false, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enable_pending.store(false, Ordering::Release);
        self.disabled.store(true, Ordering::Release);
    }

    pub fn record_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::AcqRel);
        self.xrun_flag.store(true, Ordering::Release);
        self.disable();
    }

    pub fn xrun_occurred(&self) -> bool {
        self.xrun_flag.load(Ordering::Acquire)
    }

    pub fn xrun_count(&self) -> u32 {
        self.xruns.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop_pending.store(true, Ordering::Release);
    }

    pub fn stop_pending(&self) -> bool {
        self.stop_pending.load(Ordering::Acquire)
    }

    pub fn mark_stop_ready(&self) {
        self.stop_ready.store(true, Ordering::Release);
    }

    pub fn stop_ready(&self) -> bool {
        self.stop_ready.load(Ordering::Acquire)
    }

    pub fn note_packet(&self, cycle: u32) {
        self.packets.fetch_add(1, Ordering::AcqRel);
        self.last_cycle.store(cycle, Ordering::Release);
    }

    pub fn packet_count(&self) -> u64 {
        self.packets.load(Ordering::Acquire)
    }

    pub fn note_dropped(&self, dropped: u32) {
        self.dropped.fetch_add(dropped as u64, Ordering::AcqRel);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn last_cycle(&self) -> u32 {
        self.last_cycle.load(Ordering::Acquire)
    }

    pub fn set_last_timestamp(&self, timestamp: Ticks) {
        self.last_timestamp
            .store(timestamp.value(), Ordering::Release);
    }

    pub fn last_timestamp(&self) -> Ticks {
        Ticks::new(self.last_timestamp.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spec_derives_wire_parameters() {
        let spec = StreamSpec::new("cap", 0, StreamDirection::Receive, 96_000, 10)
            .expect("valid spec");
        assert_eq!(spec.syt_interval, 16);
        assert_eq!(spec.fdf, 0x04);
        assert_eq!(spec.nominal_ticks_per_frame(), 256.0);
    }

    #[test]
    fn spec_rejects_bad_shapes() {
        assert!(matches!(
            StreamSpec::new("x", 0, StreamDirection::Receive, 48_000, 0),
            Err(ConfigError::InvalidDimension(0))
        ));
        assert!(matches!(
            StreamSpec::new("x", 0, StreamDirection::Receive, 12_345, 2),
            Err(ConfigError::UnsupportedSampleRate(12_345))
        ));
    }

    #[test]
    fn midi_rate_interval_is_at_least_two_packets_at_48k() {
        let spec = StreamSpec::new("out", 1, StreamDirection::Transmit, 48_000, 9)
            .expect("valid spec");
        assert_eq!(spec.midi_rate_interval_packets(), 2);
    }

    #[test]
    fn state_starts_disabled_and_enables_once() {
        let state = StreamState::new();
        assert!(state.is_disabled());
        state.request_enable_at(42);
        assert_eq!(state.enable_pending(), Some(42));
        state.mark_enabled();
        assert!(!state.is_disabled());
        assert_eq!(state.enable_pending(), None);
    }

    #[test]
    fn xrun_disables_and_counts() {
        let state = StreamState::new();
        state.mark_enabled();
        state.record_xrun();
        assert!(state.is_disabled());
        assert!(state.xrun_occurred());
        assert_eq!(state.xrun_count(), 1);
        state.reset_for_start();
        assert!(!state.xrun_occurred());
        assert_eq!(state.xrun_count(), 1);
    }
}
