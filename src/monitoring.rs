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

//! Lightweight per-stream counters for post-mortem inspection. Marks are
//! cheap enough to take on the packet path.

use tracing::info;

/// Running min/avg/max over marked values (e.g. packet lateness in ticks,
/// buffer fill at period boundaries).
#[derive(Debug, Clone)]
pub struct StreamStatistics {
    name: String,
    count: u64,
    sum: i64,
    min: i64,
    max: i64,
}

impl StreamStatistics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: 0,
            sum: 0,
            min: i64::MAX,
            max: i64::MIN,
        }
    }

    pub fn mark(&mut self, value: i64) {
        if value > self.max {
            self.max = value;
        }
        if value < self.min {
            self.min = value;
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.sum = 0;
        self.min = i64::MAX;
        self.max = i64::MIN;
    }

    pub fn dump(&self) {
        if self.count == 0 {
            info!("stats for {}: no marks", self.name);
        } else {
            info!(
                "stats for {}: min={} avg={:.1} max={} cnt={}",
                self.name,
                self.min,
                self.average(),
                self.max,
                self.count
            );
        }
    }
}

/// Counters every stream processor keeps alongside its marks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCounters {
    pub packets: u64,
    pub dropped: u64,
    pub discarded_invalid: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn marks_track_extremes_and_average() {
        let mut stats = StreamStatistics::new("rx-0");
        for v in [3i64, -1, 10, 4] {
            stats.mark(v);
        }
        assert_eq!(stats.min(), -1);
        assert_eq!(stats.max(), 10);
        assert_eq!(stats.count(), 4);
        assert_eq!(stats.average(), 4.0);
    }

    #[test]
    fn reset_clears_marks() {
        let mut stats = StreamStatistics::new("tx-0");
        stats.mark(5);
        stats.reset();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.average(), 0.0);
    }
}
