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

//! The contract the engine needs from the kernel ISO layer.
//!
//! A transport hands out one handle per isochronous channel. Each handle
//! exposes a pollable file descriptor; when it becomes readable the owner
//! calls [`RxChannel::iterate`] / [`TxChannel::iterate`], which drains the
//! DMA ring and invokes the bound packet client synchronously. Packet
//! callbacks for one channel arrive strictly in cycle order.

pub mod sim;

use crate::{error::TransportResult, time::CycleTime};
use std::os::fd::RawFd;

/// What the packet client tells the transport to do with the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Packet consumed/produced, keep going.
    Ok,
    /// Filler produced (or packet discarded); do not re-invoke until the
    /// next cycle.
    Defer,
    /// Retry the same cycle later.
    Again,
    /// The stream is broken.
    Error,
    /// Tear the channel down.
    Stop,
}

/// DMA ring dimensions for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParams {
    pub buf_packets: usize,
    pub max_packet_size: usize,
    pub irq_interval: usize,
}

/// Per-iteration outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterateSummary {
    pub packets: usize,
    pub bus_reset: bool,
}

pub trait ReceiveClient: Send {
    #[allow(clippy::too_many_arguments)]
    fn put_packet(
        &mut self,
        data: &[u8],
        channel: u8,
        tag: u8,
        sy: u8,
        cycle: u32,
        dropped: u32,
    ) -> Disposition;
}

pub trait TransmitClient: Send {
    /// Builds the packet for `cycle` into `buf`. Returns the packet length
    /// in bytes, tag, sy and the disposition.
    fn get_packet(&mut self, cycle: u32, dropped: u32, buf: &mut [u8]) -> (usize, u8, u8, Disposition);
}

pub trait RxChannel: Send {
    /// Arms reception; `cycle < 0` starts immediately.
    fn start(&mut self, cycle: i32) -> TransportResult<()>;
    fn stop(&mut self) -> TransportResult<()>;
    fn fd(&self) -> RawFd;
    fn iterate(&mut self, client: &mut dyn ReceiveClient) -> TransportResult<IterateSummary>;
}

pub trait TxChannel: Send {
    fn start(&mut self, cycle: i32) -> TransportResult<()>;
    fn stop(&mut self) -> TransportResult<()>;
    fn fd(&self) -> RawFd;
    fn iterate(&mut self, client: &mut dyn TransmitClient) -> TransportResult<IterateSummary>;
}

/// Read access to the bus cycle timer, shared with the packet processors.
pub trait CycleTimerSource: Send + Sync {
    fn cycle_timer(&self) -> CycleTime;
}

pub trait IsoTransport: CycleTimerSource {
    /// Our node ID on the bus; may change after a bus reset.
    fn local_node_id(&self) -> u8;
    fn open_receive(
        &self,
        channel: u8,
        params: &ChannelParams,
    ) -> TransportResult<Box<dyn RxChannel>>;
    fn open_transmit(
        &self,
        channel: u8,
        params: &ChannelParams,
    ) -> TransportResult<Box<dyn TxChannel>>;
}
