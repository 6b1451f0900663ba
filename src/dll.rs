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

//! Delay-locked loop estimating the device's ticks-per-frame rate from
//! observed SYT timestamp deltas.

use crate::time::TICKS_PER_SECOND;
use std::f64::consts::{PI, SQRT_2};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DllOrder {
    First,
    Second,
}

/// Rate estimator fed with the tick distance between two consecutive SYT
/// timestamps (`syt_interval` frames apart). Output is ticks per frame.
///
/// The loop bandwidth is fixed at ~1e-3 of the update rate; second order adds
/// a drift integrator with critical (√2) damping.
#[derive(Debug, Clone)]
pub struct RateEstimatorDll {
    order: DllOrder,
    syt_interval: u32,
    nominal: f64,
    rate: f64,
    drift: f64,
    error: f64,
    b: f64,
    c: f64,
}

impl RateEstimatorDll {
    pub fn new(framerate: u32, syt_interval: u32, order: DllOrder) -> Self {
        let omega = 2.0 * PI * 0.001;
        let nominal = TICKS_PER_SECOND as f64 / framerate as f64;
        Self {
            order,
            syt_interval,
            nominal,
            rate: nominal,
            drift: 0.0,
            error: 0.0,
            b: SQRT_2 * omega,
            c: omega * omega,
        }
    }

    /// Back to the nominal rate. Called on stream (re)start.
    pub fn reset(&mut self) {
        self.rate = self.nominal;
        self.drift = 0.0;
        self.error = 0.0;
    }

    /// Inject an observed inter-SYT period, in ticks.
    ///
    /// Periods deviating more than ±50% from nominal are logged but still
    /// integrated; the loop filters transients and xrun detection further
    /// downstream is the backstop.
    pub fn put(&mut self, observed_period: u64) {
        let per_frame = observed_period as f64 / self.syt_interval as f64;

        let deviation = (per_frame - self.nominal).abs() / self.nominal;
        if deviation > 0.5 {
            warn!(
                "SYT period {observed_period} deviates {:.0}% from nominal",
                deviation * 100.0
            );
        }

        self.error = per_frame - self.rate;
        match self.order {
            DllOrder::First => {
                self.rate += self.b * self.error;
            }
            DllOrder::Second => {
                self.rate += self.b * self.error + self.drift;
                self.drift += self.c * self.error;
            }
        }
    }

    /// Current estimate, in ticks per frame.
    pub fn ticks_per_frame(&self) -> f64 {
        self.rate
    }

    pub fn nominal_ticks_per_frame(&self) -> f64 {
        self.nominal
    }

    pub fn last_error(&self) -> f64 {
        self.error
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_at_nominal() {
        let dll = RateEstimatorDll::new(48_000, 8, DllOrder::Second);
        assert_eq!(dll.ticks_per_frame(), 512.0);
    }

    #[test]
    fn converges_on_a_constant_rate() {
        let mut dll = RateEstimatorDll::new(48_000, 8, DllOrder::Second);
        // device runs 100 ppm fast
        let actual: f64 = 512.0 * (1.0 - 100e-6);
        for _ in 0..5_000 {
            dll.put((actual * 8.0).round() as u64);
        }
        let rel = (dll.ticks_per_frame() - actual).abs() / actual;
        assert!(rel < 1e-4, "relative error {rel}");
    }

    #[test]
    fn filters_syt_quantization_jitter() {
        let mut dll = RateEstimatorDll::new(48_000, 8, DllOrder::Second);
        // SYT timestamps have 1-tick resolution; the observed periods wobble
        // one tick around nominal
        let nominal_period = 512i64 * 8;
        let jitter = [-1i64, 0, 1];
        for i in 0..5_000usize {
            dll.put((nominal_period + jitter[i % 3]) as u64);
        }
        let rel = (dll.ticks_per_frame() - 512.0).abs() / 512.0;
        assert!(rel <= 1e-5, "relative error {rel}");
    }

    #[test]
    fn first_order_tracks_too() {
        let mut dll = RateEstimatorDll::new(96_000, 16, DllOrder::First);
        assert_eq!(dll.ticks_per_frame(), 256.0);
        for _ in 0..5_000 {
            dll.put(256 * 16 + 16);
        }
        assert!((dll.ticks_per_frame() - 257.0).abs() < 0.1);
    }

    #[test]
    fn reset_restores_nominal() {
        let mut dll = RateEstimatorDll::new(44_100, 8, DllOrder::Second);
        for _ in 0..100 {
            dll.put(5_000 * 8);
        }
        assert_ne!(dll.ticks_per_frame(), dll.nominal_ticks_per_frame());
        dll.reset();
        assert_eq!(dll.ticks_per_frame(), dll.nominal_ticks_per_frame());
    }
}
