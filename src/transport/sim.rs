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

//! In-process bus used by the tests and the loopback binary.
//!
//! Channels are backed by non-blocking pipes so the real poll loop drives
//! packet delivery exactly like it would against a kernel transport. The
//! cycle timer is advanced by the driver, optionally with a randomised
//! intra-cycle read offset to model callback timing jitter.

use crate::{
    error::{TransportError, TransportResult},
    time::{CYCLES_PER_SECOND, CycleTime, TICKS_PER_CYCLE, Ticks},
    transport::{
        ChannelParams, CycleTimerSource, Disposition, IsoTransport, IterateSummary, ReceiveClient,
        RxChannel, TransmitClient, TxChannel,
    },
};
use rand::Rng;
use std::{
    collections::{HashMap, VecDeque},
    io,
    os::fd::RawFd,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::warn;

/// How far ahead of "now" the simulated DMA queue requests transmit
/// packets, in cycles.
pub const TX_QUEUE_AHEAD_CYCLES: u32 = 2;

const DEFAULT_NODE_ID: u8 = 0x01;

/// A packet captured on the transmit side, or queued for the receive side.
#[derive(Debug, Clone)]
pub struct SimPacket {
    pub cycle: u32,
    pub data: Vec<u8>,
    pub tag: u8,
    pub sy: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimDirection {
    Receive,
    Transmit,
}

struct SimChannel {
    direction: SimDirection,
    started: bool,
    max_packet_size: usize,
    pending_rx: VecDeque<(Vec<u8>, u32, u32)>,
    tx_requests: VecDeque<(u32, u32)>,
    sent: Vec<SimPacket>,
    notify_read: RawFd,
    notify_write: RawFd,
}

impl SimChannel {
    fn notify(&self) {
        let byte = [1u8];
        // pipe full just means a wakeup is already pending
        unsafe { libc::write(self.notify_write, byte.as_ptr().cast(), 1) };
    }

    fn drain_notifications(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(self.notify_read, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.notify_read);
            libc::close(self.notify_write);
        }
    }
}

struct SimState {
    now: Ticks,
    jitter: bool,
    channels: HashMap<u8, SimChannel>,
}

/// The simulated transport; clones share one bus.
#[derive(Clone)]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
    node_id: u8,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::with_jitter(false)
    }

    /// With `jitter`, cycle timer reads land at a random intra-cycle
    /// offset instead of the cycle boundary.
    pub fn with_jitter(jitter: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                now: Ticks::new(0),
                jitter,
                channels: HashMap::new(),
            })),
            node_id: DEFAULT_NODE_ID,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("sim bus mutex poisoned")
    }

    pub fn set_now(&self, now: Ticks) {
        self.lock().now = now;
    }

    pub fn now(&self) -> Ticks {
        self.lock().now
    }

    pub fn current_cycle(&self) -> u32 {
        CycleTime::from_ticks(self.now()).cycles()
    }

    /// Queues an inbound packet for delivery on `channel`.
    pub fn deliver(&self, channel: u8, data: Vec<u8>, cycle: u32, dropped: u32) {
        let mut state = self.lock();
        if let Some(chan) = state.channels.get_mut(&channel) {
            chan.pending_rx.push_back((data, cycle, dropped));
            chan.notify();
        } else {
            warn!("dropping packet for closed sim channel {channel}");
        }
    }

    /// Queues a transmit-side cycle callback on `channel`.
    pub fn request_transmit(&self, channel: u8, cycle: u32, dropped: u32) {
        let mut state = self.lock();
        if let Some(chan) = state.channels.get_mut(&channel) {
            chan.tx_requests.push_back((cycle, dropped));
            chan.notify();
        }
    }

    /// Advances bus time by `cycles`, requesting one packet per cycle from
    /// every started transmit channel (queued `TX_QUEUE_AHEAD_CYCLES`
    /// ahead, the way a DMA ring runs ahead of the wire).
    pub fn tick(&self, cycles: u32) {
        for _ in 0..cycles {
            let mut state = self.lock();
            state.now = state.now.add(TICKS_PER_CYCLE);
            let cycle = CycleTime::from_ticks(state.now).cycles();
            let target =
                (cycle + TX_QUEUE_AHEAD_CYCLES) % CYCLES_PER_SECOND as u32;
            for chan in state.channels.values_mut() {
                if chan.direction == SimDirection::Transmit && chan.started {
                    chan.tx_requests.push_back((target, 0));
                    chan.notify();
                }
            }
        }
    }

    /// Takes everything captured on a transmit channel so far.
    pub fn take_sent(&self, channel: u8) -> Vec<SimPacket> {
        let mut state = self.lock();
        state
            .channels
            .get_mut(&channel)
            .map(|c| std::mem::take(&mut c.sent))
            .unwrap_or_default()
    }

    pub fn sent_count(&self, channel: u8) -> usize {
        self.lock()
            .channels
            .get(&channel)
            .map(|c| c.sent.len())
            .unwrap_or(0)
    }

    fn open(
        &self,
        channel: u8,
        params: &ChannelParams,
        direction: SimDirection,
    ) -> TransportResult<()> {
        let mut state = self.lock();
        if state.channels.contains_key(&channel) {
            return Err(TransportError::ChannelInUse(channel));
        }
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(TransportError::IoError(io::Error::last_os_error()));
        }
        state.channels.insert(
            channel,
            SimChannel {
                direction,
                started: false,
                max_packet_size: params.max_packet_size,
                pending_rx: VecDeque::new(),
                tx_requests: VecDeque::new(),
                sent: Vec::new(),
                notify_read: fds[0],
                notify_write: fds[1],
            },
        );
        Ok(())
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleTimerSource for SimTransport {
    fn cycle_timer(&self) -> CycleTime {
        let state = self.lock();
        let now = if state.jitter {
            let offset = rand::rng().random_range(0..TICKS_PER_CYCLE);
            state.now.add(offset)
        } else {
            state.now
        };
        CycleTime::from_ticks(now)
    }
}

impl IsoTransport for SimTransport {
    fn local_node_id(&self) -> u8 {
        self.node_id
    }

    fn open_receive(
        &self,
        channel: u8,
        params: &ChannelParams,
    ) -> TransportResult<Box<dyn RxChannel>> {
        self.open(channel, params, SimDirection::Receive)?;
        Ok(Box::new(SimRxChannel {
            bus: self.clone(),
            channel,
        }))
    }

    fn open_transmit(
        &self,
        channel: u8,
        params: &ChannelParams,
    ) -> TransportResult<Box<dyn TxChannel>> {
        self.open(channel, params, SimDirection::Transmit)?;
        Ok(Box::new(SimTxChannel {
            bus: self.clone(),
            channel,
        }))
    }
}

fn with_channel<T>(
    bus: &SimTransport,
    channel: u8,
    f: impl FnOnce(&mut SimChannel) -> T,
) -> TransportResult<T> {
    let mut state = bus.lock();
    let chan = state
        .channels
        .get_mut(&channel)
        .ok_or(TransportError::NotStarted)?;
    Ok(f(chan))
}

pub struct SimRxChannel {
    bus: SimTransport,
    channel: u8,
}

impl RxChannel for SimRxChannel {
    fn start(&mut self, _cycle: i32) -> TransportResult<()> {
        with_channel(&self.bus, self.channel, |c| c.started = true)
    }

    fn stop(&mut self) -> TransportResult<()> {
        with_channel(&self.bus, self.channel, |c| c.started = false)
    }

    fn fd(&self) -> RawFd {
        with_channel(&self.bus, self.channel, |c| c.notify_read).unwrap_or(-1)
    }

    fn iterate(&mut self, client: &mut dyn ReceiveClient) -> TransportResult<IterateSummary> {
        let packets = with_channel(&self.bus, self.channel, |c| {
            c.drain_notifications();
            if !c.started {
                return Vec::new();
            }
            c.pending_rx.drain(..).collect::<Vec<_>>()
        })?;

        let mut summary = IterateSummary::default();
        for (data, cycle, dropped) in packets {
            // callbacks run without the bus lock held
            let disposition = client.put_packet(&data, self.channel, 1, 0, cycle, dropped);
            summary.packets += 1;
            if disposition == Disposition::Error || disposition == Disposition::Stop {
                warn!(
                    "receive client on channel {} requested {disposition:?}",
                    self.channel
                );
                break;
            }
        }
        Ok(summary)
    }
}

impl Drop for SimRxChannel {
    fn drop(&mut self) {
        self.bus.lock().channels.remove(&self.channel);
    }
}

pub struct SimTxChannel {
    bus: SimTransport,
    channel: u8,
}

impl TxChannel for SimTxChannel {
    fn start(&mut self, _cycle: i32) -> TransportResult<()> {
        with_channel(&self.bus, self.channel, |c| c.started = true)
    }

    fn stop(&mut self) -> TransportResult<()> {
        with_channel(&self.bus, self.channel, |c| c.started = false)
    }

    fn fd(&self) -> RawFd {
        with_channel(&self.bus, self.channel, |c| c.notify_read).unwrap_or(-1)
    }

    fn iterate(&mut self, client: &mut dyn TransmitClient) -> TransportResult<IterateSummary> {
        let (requests, max_len) = with_channel(&self.bus, self.channel, |c| {
            c.drain_notifications();
            let requests = if c.started {
                c.tx_requests.drain(..).collect::<Vec<_>>()
            } else {
                Vec::new()
            };
            (requests, c.max_packet_size)
        })?;

        let mut summary = IterateSummary::default();
        let mut buf = vec![0u8; max_len];
        let mut produced = Vec::new();
        for &(cycle, dropped) in &requests {
            let (len, tag, sy, disposition) = client.get_packet(cycle, dropped, &mut buf);
            match disposition {
                Disposition::Ok | Disposition::Defer => {
                    produced.push(SimPacket {
                        cycle,
                        data: buf[..len].to_vec(),
                        tag,
                        sy,
                    });
                    summary.packets += 1;
                }
                Disposition::Again => {
                    // client wants this cycle retried; requeue and back off
                    let bus = &self.bus;
                    with_channel(bus, self.channel, |c| {
                        c.tx_requests.push_front((cycle, dropped));
                        c.notify();
                    })?;
                    break;
                }
                Disposition::Error | Disposition::Stop => {
                    warn!(
                        "transmit client on channel {} requested {disposition:?}",
                        self.channel
                    );
                    break;
                }
            }
        }

        if !produced.is_empty() {
            with_channel(&self.bus, self.channel, |c| c.sent.extend(produced))?;
        }
        Ok(summary)
    }
}

impl Drop for SimTxChannel {
    fn drop(&mut self) {
        self.bus.lock().channels.remove(&self.channel);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct CollectingClient {
        packets: Vec<(Vec<u8>, u32)>,
    }

    impl ReceiveClient for CollectingClient {
        fn put_packet(
            &mut self,
            data: &[u8],
            _channel: u8,
            _tag: u8,
            _sy: u8,
            cycle: u32,
            _dropped: u32,
        ) -> Disposition {
            self.packets.push((data.to_vec(), cycle));
            Disposition::Ok
        }
    }

    struct CountingProducer {
        served: usize,
    }

    impl TransmitClient for CountingProducer {
        fn get_packet(
            &mut self,
            _cycle: u32,
            _dropped: u32,
            buf: &mut [u8],
        ) -> (usize, u8, u8, Disposition) {
            self.served += 1;
            buf[0] = self.served as u8;
            (1, 1, 0, Disposition::Ok)
        }
    }

    fn params() -> ChannelParams {
        ChannelParams {
            buf_packets: 64,
            max_packet_size: 1024,
            irq_interval: 4,
        }
    }

    #[test]
    fn delivers_queued_packets_in_order() {
        let bus = SimTransport::new();
        let mut chan = bus.open_receive(7, &params()).expect("channel opens");
        chan.start(-1).expect("channel starts");
        bus.deliver(7, vec![1, 2, 3], 100, 0);
        bus.deliver(7, vec![4, 5, 6], 101, 0);

        let mut client = CollectingClient {
            packets: Vec::new(),
        };
        let summary = chan.iterate(&mut client).expect("iterate succeeds");
        assert_eq!(summary.packets, 2);
        assert_eq!(client.packets[0], (vec![1, 2, 3], 100));
        assert_eq!(client.packets[1], (vec![4, 5, 6], 101));
    }

    #[test]
    fn fd_becomes_readable_on_delivery() {
        let bus = SimTransport::new();
        let mut chan = bus.open_receive(3, &params()).expect("channel opens");
        chan.start(-1).expect("channel starts");

        let mut pfd = libc::pollfd {
            fd: chan.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(ready, 0, "no data yet");

        bus.deliver(3, vec![0], 1, 0);
        let ready = unsafe { libc::poll(&mut pfd, 1, 100) };
        assert_eq!(ready, 1);
        assert_ne!(pfd.revents & libc::POLLIN, 0);
    }

    #[test]
    fn tick_requests_packets_from_started_tx_channels() {
        let bus = SimTransport::new();
        let mut chan = bus.open_transmit(9, &params()).expect("channel opens");
        chan.start(-1).expect("channel starts");

        bus.tick(5);
        let mut client = CountingProducer { served: 0 };
        chan.iterate(&mut client).expect("iterate succeeds");
        assert_eq!(client.served, 5);
        assert_eq!(bus.sent_count(9), 5);
        let sent = bus.take_sent(9);
        assert_eq!(sent.len(), 5);
        // queued ahead of the wire clock
        assert_eq!(sent[0].cycle, 1 + TX_QUEUE_AHEAD_CYCLES);
        assert_eq!(bus.sent_count(9), 0);
    }

    #[test]
    fn channel_numbers_are_exclusive() {
        let bus = SimTransport::new();
        let _chan = bus.open_receive(1, &params()).expect("channel opens");
        assert!(matches!(
            bus.open_receive(1, &params()),
            Err(TransportError::ChannelInUse(1))
        ));
    }

    #[test]
    fn dropping_the_handle_frees_the_channel() {
        let bus = SimTransport::new();
        let chan = bus.open_receive(1, &params()).expect("channel opens");
        drop(chan);
        assert!(bus.open_receive(1, &params()).is_ok());
    }
}
