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

use std::{
    fmt::Debug,
    iter::Sum,
    ops::{Add, Div},
    sync::{Condvar, Mutex},
    time::Duration,
};
use thread_priority::{
    RealtimeThreadSchedulePolicy, ThreadPriority, ThreadPriorityValue, ThreadSchedulePolicy,
    set_thread_priority_and_policy, thread_native_id,
};
use tracing::{info, warn};

/// Puts the calling thread on the FIFO real-time scheduler.
///
/// Failure is logged but not fatal; the engine degrades to best-effort
/// scheduling.
pub fn set_realtime_priority(priority: u8) {
    let pid = thread_native_id();
    let priority = match ThreadPriorityValue::try_from(priority) {
        Ok(it) => ThreadPriority::Crossplatform(it),
        Err(_) => ThreadPriority::Max,
    };
    if let Err(e) = set_thread_priority_and_policy(
        pid,
        priority,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    ) {
        warn!("Could not set thread priority: {e}");
    } else {
        info!("Successfully set real time priority for thread {pid}.");
    }
}

/// Counting semaphore between the streaming thread and the client.
///
/// Real-time threads must not be parked by an async scheduler, so this is
/// a plain mutex/condvar pair.
pub struct Semaphore {
    count: Mutex<u64>,
    signal: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            signal: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        *count += 1;
        self.signal.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        while *count == 0 {
            count = self
                .signal
                .wait(count)
                .expect("semaphore mutex poisoned");
        }
        *count -= 1;
    }

    /// Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        while *count == 0 {
            let (guard, result) = self
                .signal
                .wait_timeout(count, timeout)
                .expect("semaphore mutex poisoned");
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Clears pending signals, e.g. when restarting after an xrun.
    pub fn drain(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        *count = 0;
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

pub trait GetAverage<T> {
    fn average(&self) -> T;
}

impl<N, S> GetAverage<N> for S
where
    N: Copy + TryFrom<usize, Error: Debug> + Add + Div<Output = N> + Sum<N>,
    S: AsRef<[N]>,
{
    fn average(&self) -> N {
        let slice = self.as_ref();
        slice.iter().map(ToOwned::to_owned).sum::<N>()
            / N::try_from(slice.len()).expect("cannot cast slice length to value type")
    }
}

/// Fixed-window averaging buffer; yields one average per full window.
pub struct AverageCalculationBuffer<N> {
    buffer: Box<[N]>,
    cursor: usize,
}

impl<N> AverageCalculationBuffer<N>
where
    Box<[N]>: GetAverage<N>,
{
    pub fn new(buffer: Box<[N]>) -> Self {
        Self { buffer, cursor: 0 }
    }

    pub fn update(&mut self, value: N) -> Option<N> {
        self.buffer[self.cursor] = value;
        self.cursor += 1;
        if self.cursor >= self.buffer.len() {
            self.cursor = 0;
            let average = self.buffer.average();
            Some(average)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn semaphore_counts_posts() {
        let sema = Semaphore::new();
        sema.post();
        sema.post();
        assert!(sema.wait_timeout(Duration::from_millis(10)));
        assert!(sema.wait_timeout(Duration::from_millis(10)));
        assert!(!sema.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn semaphore_wakes_a_blocked_waiter() {
        let sema = Arc::new(Semaphore::new());
        let poster = sema.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post();
        });
        assert!(sema.wait_timeout(Duration::from_secs(2)));
        handle.join().expect("poster thread panicked");
    }

    #[test]
    fn drain_discards_pending_signals() {
        let sema = Semaphore::new();
        sema.post();
        sema.drain();
        assert!(!sema.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn average_buffer_yields_once_per_window() {
        let mut buf = AverageCalculationBuffer::new(vec![0i64; 4].into());
        assert_eq!(buf.update(1), None);
        assert_eq!(buf.update(2), None);
        assert_eq!(buf.update(3), None);
        assert_eq!(buf.update(6), Some(3));
        assert_eq!(buf.update(10), None);
    }
}
