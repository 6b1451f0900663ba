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

//! Arithmetic on IEEE 1394 bus time.
//!
//! Bus time is carried in a packed 32-bit register (7-bit seconds, 13-bit
//! cycles, 12-bit offset) that wraps every 128 seconds. All comparisons
//! between timestamps must go through [`Ticks::diff`]; raw subtraction is
//! wrong as soon as one operand has wrapped.

use std::fmt::{self, Display};

pub const TICKS_PER_CYCLE: u64 = 3072;
pub const CYCLES_PER_SECOND: u64 = 8000;
pub const TICKS_PER_SECOND: u64 = TICKS_PER_CYCLE * CYCLES_PER_SECOND;
pub const WRAP_SECONDS: u64 = 128;
pub const TICKS_PER_WRAP: u64 = WRAP_SECONDS * TICKS_PER_SECOND;

/// A point in bus time, in ticks (1/24,576,000 s), always `< TICKS_PER_WRAP`.
///
/// Additive operations wrap modulo 128 s. There is deliberately no `Sub`
/// between two `Ticks`; use [`Ticks::diff`], which resolves the wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Ticks(u64);

impl Ticks {
    pub fn new(value: u64) -> Self {
        Self(value % TICKS_PER_WRAP)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn add(self, ticks: u64) -> Self {
        Self((self.0 + ticks % TICKS_PER_WRAP) % TICKS_PER_WRAP)
    }

    pub fn sub(self, ticks: u64) -> Self {
        let ticks = ticks % TICKS_PER_WRAP;
        Self((self.0 + TICKS_PER_WRAP - ticks) % TICKS_PER_WRAP)
    }

    /// Signed distance from `earlier` to `self`, wrap-corrected.
    ///
    /// The result lies in `(−wrap/2, +wrap/2]`: a positive value means `self`
    /// is later on the bus than `earlier`.
    pub fn diff(self, earlier: Ticks) -> i64 {
        let raw = (self.0 + TICKS_PER_WRAP - earlier.0) % TICKS_PER_WRAP;
        if raw > TICKS_PER_WRAP / 2 {
            raw as i64 - TICKS_PER_WRAP as i64
        } else {
            raw as i64
        }
    }
}

impl Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ct = CycleTime::from_ticks(*self);
        write!(
            f,
            "{}t ({}s {}cy {}off)",
            self.0,
            ct.seconds(),
            ct.cycles(),
            ct.offset()
        )
    }
}

/// Signed distance between two cycle numbers, wrap-corrected modulo 8000.
pub fn diff_cycles(cycle: u32, earlier: u32) -> i32 {
    let cycles = CYCLES_PER_SECOND as i64;
    let raw = (cycle as i64 + cycles - earlier as i64) % cycles;
    if raw > cycles / 2 {
        (raw - cycles) as i32
    } else {
        raw as i32
    }
}

/// The packed sec:cycle:offset form of the bus cycle timer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleTime(u32);

impl CycleTime {
    pub fn from_register(value: u32) -> Self {
        Self(value)
    }

    pub fn from_parts(seconds: u32, cycles: u32, offset: u32) -> Self {
        Self(((seconds & 0x7F) << 25) | ((cycles & 0x1FFF) << 12) | (offset & 0xFFF))
    }

    pub fn from_ticks(ticks: Ticks) -> Self {
        let t = ticks.value();
        let seconds = (t / TICKS_PER_SECOND) as u32;
        let cycles = ((t % TICKS_PER_SECOND) / TICKS_PER_CYCLE) as u32;
        let offset = (t % TICKS_PER_CYCLE) as u32;
        Self::from_parts(seconds, cycles, offset)
    }

    pub fn register(self) -> u32 {
        self.0
    }

    pub fn seconds(self) -> u32 {
        (self.0 >> 25) & 0x7F
    }

    pub fn cycles(self) -> u32 {
        (self.0 >> 12) & 0x1FFF
    }

    pub fn offset(self) -> u32 {
        self.0 & 0xFFF
    }

    pub fn to_ticks(self) -> Ticks {
        Ticks::new(
            self.seconds() as u64 * TICKS_PER_SECOND
                + self.cycles() as u64 * TICKS_PER_CYCLE
                + self.offset() as u64,
        )
    }
}

/// Reconstruct a full-resolution timestamp from a received 16-bit SYT.
///
/// The SYT carries only the low 4 bits of the target cycle plus the 12-bit
/// intra-cycle offset; the rest is spliced back in from the cycle the packet
/// arrived on and the current cycle timer. The target cycle is always at or
/// after the arrival cycle (modulo 16).
pub fn syt_recv_to_ticks(syt: u16, recv_cycle: u32, now: CycleTime) -> Ticks {
    let syt_cycle = ((syt >> 12) & 0xF) as u32;
    let syt_offset = (syt & 0x0FFF) as u64;

    let mut seconds = now.seconds() as u64;
    // If the cycle timer already rolled into the next second after the packet
    // arrived, the packet's second is the previous one.
    if now.cycles() < recv_cycle {
        seconds = (seconds + WRAP_SECONDS - 1) % WRAP_SECONDS;
    }

    let delta = (syt_cycle.wrapping_sub(recv_cycle)) & 0xF;
    let mut cycles = recv_cycle as u64 + delta as u64;
    if cycles >= CYCLES_PER_SECOND {
        cycles -= CYCLES_PER_SECOND;
        seconds = (seconds + 1) % WRAP_SECONDS;
    }

    Ticks::new(seconds * TICKS_PER_SECOND + cycles * TICKS_PER_CYCLE + syt_offset)
}

/// Absolute bus time of the start of `cycle`, anchored at `now`. The cycle
/// is interpreted as the one closest to `now` (before or after).
pub fn ticks_of_cycle(now: CycleTime, cycle: u32) -> Ticks {
    let delta = diff_cycles(cycle, now.cycles());
    let now_cycle_start = now.to_ticks().sub(now.offset() as u64);
    if delta >= 0 {
        now_cycle_start.add(delta as u64 * TICKS_PER_CYCLE)
    } else {
        now_cycle_start.sub((-delta) as u64 * TICKS_PER_CYCLE)
    }
}

/// Compress a full timestamp into the 16-bit SYT for transmission.
pub fn ticks_to_syt(ticks: Ticks) -> u16 {
    let ct = CycleTime::from_ticks(ticks);
    (((ct.cycles() & 0xF) << 12) | ct.offset()) as u16
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_then_diff_roundtrips() {
        let t = Ticks::new(TICKS_PER_WRAP - 5000);
        for d in [0u64, 1, 3072, TICKS_PER_SECOND, TICKS_PER_WRAP / 2 - 1] {
            let later = t.add(d);
            assert_eq!(later.diff(t), d as i64, "d={d}");
        }
    }

    #[test]
    fn diff_is_signed_across_wrap() {
        let before = Ticks::new(TICKS_PER_WRAP - TICKS_PER_CYCLE);
        let after = before.add(2 * TICKS_PER_CYCLE);
        assert_eq!(after.value(), TICKS_PER_CYCLE);
        assert_eq!(after.diff(before), 2 * TICKS_PER_CYCLE as i64);
        assert_eq!(before.diff(after), -2 * (TICKS_PER_CYCLE as i64));
    }

    #[test]
    fn diff_cycles_wraps_mod_8000() {
        assert_eq!(diff_cycles(1, 7999), 2);
        assert_eq!(diff_cycles(7999, 1), -2);
        assert_eq!(diff_cycles(42, 42), 0);
        assert_eq!(diff_cycles(100, 90), 10);
    }

    #[test]
    fn cycle_time_packing_roundtrips() {
        let ct = CycleTime::from_parts(127, 7999, 4095);
        assert_eq!(ct.seconds(), 127);
        assert_eq!(ct.cycles(), 7999);
        assert_eq!(ct.offset(), 4095);
        let ticks = ct.to_ticks();
        assert_eq!(CycleTime::from_ticks(ticks), ct);
        assert_eq!(CycleTime::from_register(ct.register()), ct);
    }

    #[test]
    fn syt_reconstruction_tracks_the_arrival_cycle() {
        // packet arrives on cycle 100, syt points 3 cycles ahead with offset 0x123
        let now = CycleTime::from_parts(10, 102, 0);
        let syt = (((103u16) & 0xF) << 12) | 0x123;
        let ts = syt_recv_to_ticks(syt, 100, now);
        let expected =
            Ticks::new(10 * TICKS_PER_SECOND + 103 * TICKS_PER_CYCLE + 0x123);
        assert_eq!(ts, expected);
    }

    #[test]
    fn syt_reconstruction_handles_seconds_boundary() {
        // arrival cycle 7998, target cycle 8001 % 8000 = 1 in the next second
        let now = CycleTime::from_parts(10, 7999, 500);
        let syt = ((8001u16 & 0xF) << 12) | 0x080;
        let ts = syt_recv_to_ticks(syt, 7998, now);
        let expected = Ticks::new(11 * TICKS_PER_SECOND + TICKS_PER_CYCLE + 0x080);
        assert_eq!(ts, expected);
    }

    #[test]
    fn syt_reconstruction_handles_timer_already_in_next_second() {
        // the packet arrived on cycle 7999 but by the time we read the timer
        // it sits at cycle 2 of the following second
        let now = CycleTime::from_parts(11, 2, 0);
        let syt = ((7999u16 & 0xF) << 12) | 0x040;
        let ts = syt_recv_to_ticks(syt, 7999, now);
        let expected = Ticks::new(10 * TICKS_PER_SECOND + 7999 * TICKS_PER_CYCLE + 0x040);
        assert_eq!(ts, expected);
    }

    #[test]
    fn consecutive_packets_across_wrap_differ_by_one_cycle() {
        // one packet a cycle before the 128 s wrap, the next a cycle after
        let now_a = CycleTime::from_parts(127, 7999, 100);
        let ts_a = syt_recv_to_ticks(((7999u16 & 0xF) << 12) | 0x100, 7999, now_a);
        let now_b = CycleTime::from_parts(0, 0, 200);
        let ts_b = syt_recv_to_ticks(((0u16 & 0xF) << 12) | 0x100, 0, now_b);
        assert_eq!(ts_b.diff(ts_a), TICKS_PER_CYCLE as i64);
    }

    #[test]
    fn cycle_start_is_anchored_at_now() {
        let now = CycleTime::from_parts(5, 100, 1500);
        assert_eq!(
            ticks_of_cycle(now, 103),
            Ticks::new(5 * TICKS_PER_SECOND + 103 * TICKS_PER_CYCLE)
        );
        assert_eq!(
            ticks_of_cycle(now, 98),
            Ticks::new(5 * TICKS_PER_SECOND + 98 * TICKS_PER_CYCLE)
        );
        // across the seconds boundary
        let now = CycleTime::from_parts(5, 7999, 0);
        assert_eq!(
            ticks_of_cycle(now, 1),
            Ticks::new(6 * TICKS_PER_SECOND + TICKS_PER_CYCLE)
        );
    }

    #[test]
    fn syt_compression_keeps_low_cycle_bits_and_offset() {
        let ticks = Ticks::new(3 * TICKS_PER_SECOND + 4711 * TICKS_PER_CYCLE + 0x2AB);
        let syt = ticks_to_syt(ticks);
        assert_eq!((syt >> 12) & 0xF, (4711 & 0xF) as u16);
        assert_eq!(syt & 0xFFF, 0x2AB);
    }
}
