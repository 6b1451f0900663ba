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

//! Per-channel ISO handlers and the poll-driven scheduler thread.
//!
//! Each handler owns one transport channel and a reference to the bound
//! packet processor. The manager multiplexes all handler fds through one
//! `poll` loop on a dedicated real-time thread; a ready fd dispatches into
//! the handler's `iterate`, which synchronously drives the processor's
//! packet callback.
//!
//! Handlers live for exactly one run. On stop they are destroyed, not
//! parked; retained kernel handles accumulate across xrun restarts and
//! exhaust kernel memory.

use crate::{
    error::{TransportError, TransportResult},
    stream::{receive::ReceiveProcessor, transmit::TransmitProcessor},
    transport::{ChannelParams, IsoTransport, IterateSummary, RxChannel, TxChannel},
    utils::set_realtime_priority,
};
use std::{
    os::fd::RawFd,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, warn};

pub const POLL_TIMEOUT_MS: i32 = 100;

/// DMA ring dimensions for one channel: packet slots fit an integral
/// number per page, one interrupt per quarter period.
pub fn channel_params(
    period: usize,
    nb_buffers: usize,
    syt_interval: u32,
    dimension: usize,
) -> ChannelParams {
    let packets_per_period = (period / syt_interval as usize).max(1);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize;
    let wire_packet_size = 8 + syt_interval as usize * dimension * 4;
    let max_packet_size = (4 * page_size / packets_per_period)
        .clamp(wire_packet_size, page_size);
    ChannelParams {
        buf_packets: packets_per_period * nb_buffers,
        max_packet_size,
        irq_interval: (packets_per_period / 4).max(1),
    }
}

/// Knobs the manager may touch while the iso thread runs.
#[derive(Debug, Default)]
pub struct HandlerControl {
    polling_enabled: AtomicBool,
    packets: AtomicU64,
    bus_resets: AtomicU64,
}

impl HandlerControl {
    pub fn enable_polling(&self) {
        self.polling_enabled.store(true, Ordering::Release);
    }

    pub fn disable_polling(&self) {
        self.polling_enabled.store(false, Ordering::Release);
    }

    pub fn polling_enabled(&self) -> bool {
        self.polling_enabled.load(Ordering::Acquire)
    }

    pub fn packet_count(&self) -> u64 {
        self.packets.load(Ordering::Acquire)
    }

    pub fn bus_reset_count(&self) -> u64 {
        self.bus_resets.load(Ordering::Acquire)
    }
}

enum HandlerKind {
    Receive {
        channel: Box<dyn RxChannel>,
        processor: Arc<Mutex<ReceiveProcessor>>,
    },
    Transmit {
        channel: Box<dyn TxChannel>,
        processor: Arc<Mutex<TransmitProcessor>>,
    },
}

/// One isochronous channel bound to one stream processor.
pub struct IsoHandler {
    iso_channel: u8,
    kind: HandlerKind,
    control: Arc<HandlerControl>,
}

impl IsoHandler {
    pub fn fd(&self) -> RawFd {
        match &self.kind {
            HandlerKind::Receive { channel, .. } => channel.fd(),
            HandlerKind::Transmit { channel, .. } => channel.fd(),
        }
    }

    pub fn start(&mut self, cycle: i32) -> TransportResult<()> {
        debug!("starting iso handler for channel {}", self.iso_channel);
        match &mut self.kind {
            HandlerKind::Receive { channel, .. } => channel.start(cycle),
            HandlerKind::Transmit { channel, .. } => channel.start(cycle),
        }
    }

    pub fn stop(&mut self) -> TransportResult<()> {
        debug!("stopping iso handler for channel {}", self.iso_channel);
        match &mut self.kind {
            HandlerKind::Receive { channel, .. } => channel.stop(),
            HandlerKind::Transmit { channel, .. } => channel.stop(),
        }
    }

    /// Pumps one poll-ready notification into the bound processor.
    pub fn iterate(&mut self) -> TransportResult<IterateSummary> {
        match &mut self.kind {
            HandlerKind::Receive { channel, processor } => {
                let mut guard = processor.lock().expect("processor mutex poisoned");
                channel.iterate(&mut *guard)
            }
            HandlerKind::Transmit { channel, processor } => {
                let mut guard = processor.lock().expect("processor mutex poisoned");
                channel.iterate(&mut *guard)
            }
        }
    }
}

/// Owns the handlers and the iso thread that polls them.
pub struct IsoHandlerManager {
    transport: Arc<dyn IsoTransport>,
    handlers: Arc<Mutex<Vec<IsoHandler>>>,
    controls: Vec<Arc<HandlerControl>>,
    run_flag: Arc<AtomicBool>,
    error_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    rt_priority: u8,
}

impl IsoHandlerManager {
    pub fn new(transport: Arc<dyn IsoTransport>, rt_priority: u8) -> Self {
        Self {
            transport,
            handlers: Arc::new(Mutex::new(Vec::new())),
            controls: Vec::new(),
            run_flag: Arc::new(AtomicBool::new(false)),
            error_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
            rt_priority,
        }
    }

    pub fn transport(&self) -> &Arc<dyn IsoTransport> {
        &self.transport
    }

    fn assert_stopped(&self) {
        assert!(
            self.thread.is_none(),
            "handler registration requires a stopped iso thread"
        );
    }

    /// Allocates a handler for a receive stream. Only valid while the iso
    /// thread is stopped.
    pub fn register_receive(
        &mut self,
        iso_channel: u8,
        params: &ChannelParams,
        processor: Arc<Mutex<ReceiveProcessor>>,
    ) -> TransportResult<usize> {
        self.assert_stopped();
        let channel = self.transport.open_receive(iso_channel, params)?;
        self.push_handler(IsoHandler {
            iso_channel,
            kind: HandlerKind::Receive { channel, processor },
            control: Arc::new(HandlerControl::default()),
        })
    }

    /// Allocates a handler for a transmit stream. Only valid while the iso
    /// thread is stopped.
    pub fn register_transmit(
        &mut self,
        iso_channel: u8,
        params: &ChannelParams,
        processor: Arc<Mutex<TransmitProcessor>>,
    ) -> TransportResult<usize> {
        self.assert_stopped();
        let channel = self.transport.open_transmit(iso_channel, params)?;
        self.push_handler(IsoHandler {
            iso_channel,
            kind: HandlerKind::Transmit { channel, processor },
            control: Arc::new(HandlerControl::default()),
        })
    }

    fn push_handler(&mut self, handler: IsoHandler) -> TransportResult<usize> {
        let control = handler.control.clone();
        control.enable_polling();
        let mut handlers = self.handlers.lock().expect("handler mutex poisoned");
        handlers.push(handler);
        self.controls.push(control);
        Ok(handlers.len() - 1)
    }

    pub fn handler_control(&self, id: usize) -> Option<&Arc<HandlerControl>> {
        self.controls.get(id)
    }

    pub fn start_handlers(&mut self, cycle: i32) -> TransportResult<()> {
        let mut handlers = self.handlers.lock().expect("handler mutex poisoned");
        for handler in handlers.iter_mut() {
            handler.start(cycle)?;
        }
        Ok(())
    }

    pub fn stop_handlers(&mut self) {
        let mut handlers = self.handlers.lock().expect("handler mutex poisoned");
        for handler in handlers.iter_mut() {
            if let Err(e) = handler.stop() {
                warn!("could not stop handler: {e}");
            }
        }
    }

    /// Spawns the iso thread. Handlers registered afterwards are not
    /// picked up.
    pub fn start_thread(&mut self) -> TransportResult<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.error_flag.store(false, Ordering::Release);
        self.run_flag.store(true, Ordering::Release);
        let handlers = self.handlers.clone();
        let controls = self.controls.clone();
        let run_flag = self.run_flag.clone();
        let error_flag = self.error_flag.clone();
        let rt_priority = self.rt_priority;
        let thread = thread::Builder::new()
            .name("amdtp-iso".to_owned())
            .spawn(move || {
                set_realtime_priority(rt_priority);
                iso_loop(&handlers, &controls, &run_flag, &error_flag);
            })?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Stops and joins the iso thread; handler resources stay allocated.
    pub fn stop_thread(&mut self) {
        self.run_flag.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("iso thread panicked");
            self.error_flag.store(true, Ordering::Release);
        }
    }

    /// Destroys all handlers, releasing their transport channels. Only
    /// valid while the iso thread is stopped.
    pub fn clear(&mut self) {
        self.assert_stopped();
        self.handlers
            .lock()
            .expect("handler mutex poisoned")
            .clear();
        self.controls.clear();
        info!("all iso handlers destroyed");
    }

    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::Acquire)
    }
}

impl Drop for IsoHandlerManager {
    fn drop(&mut self) {
        self.stop_thread();
        self.stop_handlers();
    }
}

fn iso_loop(
    handlers: &Mutex<Vec<IsoHandler>>,
    controls: &[Arc<HandlerControl>],
    run_flag: &AtomicBool,
    error_flag: &AtomicBool,
) {
    info!("iso thread running");
    let mut pollfds: Vec<libc::pollfd> = Vec::new();

    while run_flag.load(Ordering::Acquire) {
        let mut handlers = handlers.lock().expect("handler mutex poisoned");
        if handlers.is_empty() {
            drop(handlers);
            thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
            continue;
        }

        pollfds.clear();
        for (handler, control) in handlers.iter().zip(controls) {
            pollfds.push(libc::pollfd {
                fd: handler.fd(),
                events: if control.polling_enabled() {
                    libc::POLLIN
                } else {
                    0
                },
                revents: 0,
            });
        }

        let ready = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                POLL_TIMEOUT_MS,
            )
        };
        if ready < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            error!("poll failed: {}", TransportError::PollError(errno));
            error_flag.store(true, Ordering::Release);
            break;
        }
        if ready == 0 {
            continue;
        }

        for (i, pollfd) in pollfds.iter().enumerate() {
            if pollfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                warn!(
                    "poll error on channel {} (revents {:#x})",
                    handlers[i].iso_channel, pollfd.revents
                );
            }
            if pollfd.revents & libc::POLLIN != 0 {
                match handlers[i].iterate() {
                    Ok(summary) => {
                        controls[i]
                            .packets
                            .fetch_add(summary.packets as u64, Ordering::AcqRel);
                        if summary.bus_reset {
                            // reconnection is a collaborator's job; log and
                            // keep streaming
                            warn!(
                                "bus reset observed on channel {}",
                                handlers[i].iso_channel
                            );
                            controls[i].bus_resets.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                    Err(e) => {
                        error!(
                            "iterate failed on channel {}: {e}",
                            handlers[i].iso_channel
                        );
                        error_flag.store(true, Ordering::Release);
                    }
                }
            }
        }
    }

    info!("iso thread stopped");
}
