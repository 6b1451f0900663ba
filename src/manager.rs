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

//! The period clock: turns a set of asynchronous packet processors into a
//! block-based, clocked interface.
//!
//! A streaming thread watches every registered processor and posts the
//! period semaphore once one period of frames has crossed the mark on the
//! slowest stream; the client blocks in [`StreamProcessorManager::wait_for_period`]
//! and moves data with [`StreamProcessorManager::transfer`]. Xruns tear the
//! pipeline down and surface through the semaphore.

use crate::{
    amdtp,
    buffer::{timestamped_ring, AudioBufferPointer, RingConsumer, RingControl, RingProducer},
    dll::{DllOrder, RateEstimatorDll},
    error::{ConfigError, EngineError, EngineResult, StreamError},
    handler::{channel_params, IsoHandlerManager},
    monitoring::StreamStatistics,
    port::{
        midi_port_pair, AudioPort, MidiBackend, MidiClientPort, PortDirection, PortManager,
        PortSpec, PortType,
    },
    stream::{
        receive::ReceiveProcessor, transmit::TransmitProcessor, StreamDirection, StreamSpec,
        StreamState, RECEIVE_PROCESSING_DELAY_TICKS,
    },
    time::CYCLES_PER_SECOND,
    transport::{CycleTimerSource, IsoTransport},
    utils::{set_realtime_priority, Semaphore},
};
use crossbeam::utils::Backoff;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

/// How far in the future the phase-aligned enable point is placed.
const ENABLE_DELAY_CYCLES: u32 = 16;

/// Bound on waiting for all streams to report running, and on the stop
/// handshake.
const STATE_TRANSITION_TIMEOUT: Duration = Duration::from_secs(2);

/// Streaming-thread poll interval; pure state polling, no I/O.
const STREAMING_POLL_INTERVAL: Duration = Duration::from_micros(250);

pub type StreamId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerPhase {
    Created,
    Prepared,
    Running,
    Error,
}

enum PeriodSide {
    Capture(RingConsumer),
    Playback(RingProducer),
}

enum PacketHalf {
    Unbuilt,
    Receive(Arc<Mutex<ReceiveProcessor>>),
    Transmit(Arc<Mutex<TransmitProcessor>>),
}

struct StreamSlot {
    spec: StreamSpec,
    state: Arc<StreamState>,
    ports: PortManager,
    midi_backends: Vec<MidiBackend>,
    side: Option<PeriodSide>,
    control: Option<RingControl>,
    packet: PacketHalf,
    outstanding: Arc<AtomicU64>,
    handler_id: Option<usize>,
    /// playback frame template: silence on audio slots, NO_DATA on MIDI
    /// slots
    template: Vec<u32>,
    scratch: Vec<u32>,
    fill_marks: StreamStatistics,
}

impl StreamSlot {
    fn direction(&self) -> StreamDirection {
        self.spec.direction
    }
}

/// Everything the streaming thread needs to judge one stream, lock-free.
struct WatchedStream {
    name: String,
    direction: StreamDirection,
    state: Arc<StreamState>,
    control: RingControl,
    outstanding: Arc<AtomicU64>,
    is_sync_source: bool,
    period: u64,
}

impl WatchedStream {
    fn one_period_ready(&self, now: crate::time::Ticks) -> bool {
        let period = self.period;
        let outstanding = self.outstanding.load(Ordering::Acquire);
        let rate = self.control.nominal_rate();
        match self.direction {
            StreamDirection::Receive => {
                let (head, fill) = self.control.head_timestamp();
                let fill = fill.saturating_sub(outstanding * period);
                if fill < period || (self.is_sync_source && fill == period) {
                    return false;
                }
                if self.is_sync_source {
                    // presentation gate: the oldest unconsumed sample must
                    // have fallen due, including the processing headroom
                    let head = head.add(((outstanding * period) as f64 * rate) as u64);
                    let presentation = head
                        .add((period as f64 * rate) as u64)
                        .add(RECEIVE_PROCESSING_DELAY_TICKS);
                    if presentation.diff(now) > 0 {
                        return false;
                    }
                }
                true
            }
            StreamDirection::Transmit => {
                let fill = self.control.fill() + outstanding * period;
                self.control.capacity() >= fill + period
            }
        }
    }
}

/// Period-driven frontend over a set of stream processors.
pub struct StreamProcessorManager {
    period: usize,
    nb_buffers: usize,
    rt_priority: u8,
    transport: Arc<dyn IsoTransport>,
    iso: IsoHandlerManager,
    slots: Vec<StreamSlot>,
    sync_source: Option<StreamId>,
    phase: ManagerPhase,
    sema: Arc<Semaphore>,
    xrun_flag: Arc<AtomicBool>,
    periods: Arc<AtomicU64>,
    run_flag: Arc<AtomicBool>,
    streaming_thread: Option<JoinHandle<()>>,
}

impl StreamProcessorManager {
    pub fn new(
        transport: Arc<dyn IsoTransport>,
        period: usize,
        nb_buffers: usize,
        rt_priority: u8,
    ) -> EngineResult<Self> {
        if nb_buffers < 2 {
            return Err(ConfigError::InvalidBufferCount(nb_buffers).into());
        }
        // the iso thread runs slightly above the streaming thread
        let iso = IsoHandlerManager::new(transport.clone(), rt_priority);
        Ok(Self {
            period,
            nb_buffers,
            rt_priority,
            transport,
            iso,
            slots: Vec::new(),
            sync_source: None,
            phase: ManagerPhase::Created,
            sema: Arc::new(Semaphore::new()),
            xrun_flag: Arc::new(AtomicBool::new(false)),
            periods: Arc::new(AtomicU64::new(0)),
            run_flag: Arc::new(AtomicBool::new(false)),
            streaming_thread: None,
        })
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn periods_elapsed(&self) -> u64 {
        self.periods.load(Ordering::Acquire)
    }

    fn ensure_stopped(&self) -> EngineResult<()> {
        if self.phase == ManagerPhase::Running {
            Err(EngineError::RegisterWhileRunning)
        } else {
            Ok(())
        }
    }

    /// Registers a stream; ports are added afterwards, everything before
    /// `prepare`.
    pub fn register_stream(&mut self, spec: StreamSpec) -> EngineResult<StreamId> {
        self.ensure_stopped()?;
        if self.period % spec.syt_interval as usize != 0 {
            return Err(ConfigError::InvalidPeriodSize(self.period).into());
        }
        let fill_marks = StreamStatistics::new(format!("{}/period-fill", spec.name));
        let template = vec![amdtp::EVENT_AUDIO_SILENCE; spec.dimension];
        let scratch = vec![0u32; self.period * spec.dimension];
        self.slots.push(StreamSlot {
            spec,
            state: StreamState::new(),
            ports: PortManager::default(),
            midi_backends: Vec::new(),
            side: None,
            control: None,
            packet: PacketHalf::Unbuilt,
            outstanding: Arc::new(AtomicU64::new(0)),
            handler_id: None,
            template,
            scratch,
            fill_marks,
        });
        let id = self.slots.len() - 1;
        // first receive stream becomes the sync source unless overridden
        if self.sync_source.is_none()
            && self.slots[id].direction() == StreamDirection::Receive
        {
            self.sync_source = Some(id);
        }
        Ok(id)
    }

    /// Drops a stream again, including its ports. Only possible before
    /// `prepare` wires the packet processors; later StreamIds shift down.
    pub fn unregister_stream(&mut self, stream: StreamId) -> EngineResult<()> {
        self.ensure_stopped()?;
        if self.phase != ManagerPhase::Created {
            return Err(StreamError::InvalidState {
                actual: "prepared",
                required: "created",
            }
            .into());
        }
        if stream >= self.slots.len() {
            return Err(EngineError::NoSuchStream(stream as u32));
        }
        self.slots.remove(stream);
        self.sync_source = match self.sync_source {
            Some(s) if s == stream => self
                .slots
                .iter()
                .position(|s| s.direction() == StreamDirection::Receive),
            Some(s) if s > stream => Some(s - 1),
            other => other,
        };
        Ok(())
    }

    pub fn set_sync_source(&mut self, stream: StreamId) -> EngineResult<()> {
        self.ensure_stopped()?;
        if stream >= self.slots.len() {
            return Err(EngineError::NoSuchStream(stream as u32));
        }
        self.sync_source = Some(stream);
        Ok(())
    }

    pub fn add_audio_port(&mut self, stream: StreamId, spec: PortSpec) -> EngineResult<usize> {
        self.ensure_stopped()?;
        let period = self.period;
        let slot = self
            .slots
            .get_mut(stream)
            .ok_or(EngineError::NoSuchStream(stream as u32))?;
        spec.validate(slot.spec.dimension).map_err(StreamError::from)?;
        let direction = match slot.direction() {
            StreamDirection::Receive => PortDirection::Capture,
            StreamDirection::Transmit => PortDirection::Playback,
        };
        slot.ports
            .add_audio(AudioPort::new(spec, direction, period))
            .map_err(StreamError::from)?;
        Ok(slot.ports.audio_ports().len() - 1)
    }

    pub fn add_midi_port(&mut self, stream: StreamId, spec: PortSpec) -> EngineResult<usize> {
        self.ensure_stopped()?;
        let slot = self
            .slots
            .get_mut(stream)
            .ok_or(EngineError::NoSuchStream(stream as u32))?;
        spec.validate(slot.spec.dimension).map_err(StreamError::from)?;
        let direction = match slot.direction() {
            StreamDirection::Receive => PortDirection::Capture,
            StreamDirection::Transmit => PortDirection::Playback,
        };
        // MIDI slots carry the NO_DATA label whenever no byte is muxed in
        slot.template[spec.position] = amdtp::EVENT_MIDI_NODATA;
        let (client, backend) = midi_port_pair(spec, direction);
        slot.ports.add_midi(client).map_err(StreamError::from)?;
        slot.midi_backends.push(backend);
        Ok(slot.ports.port_count(Some(PortType::Midi)) - 1)
    }

    pub fn port_count(
        &self,
        direction: StreamDirection,
        port_type: Option<PortType>,
    ) -> usize {
        self.slots
            .iter()
            .filter(|s| s.direction() == direction)
            .map(|s| s.ports.port_count(port_type))
            .sum()
    }

    pub fn port_name_by_index(
        &self,
        direction: StreamDirection,
        mut index: usize,
    ) -> Option<&str> {
        for slot in self.slots.iter().filter(|s| s.direction() == direction) {
            let count = slot.ports.port_count(None);
            if index < count {
                return slot.ports.port_name(index);
            }
            index -= count;
        }
        None
    }

    pub fn attach_buffer(
        &mut self,
        stream: StreamId,
        port_index: usize,
        buffer: AudioBufferPointer,
    ) -> EngineResult<()> {
        let slot = self
            .slots
            .get_mut(stream)
            .ok_or(EngineError::NoSuchStream(stream as u32))?;
        let port = slot
            .ports
            .audio_ports_mut()
            .get_mut(port_index)
            .ok_or(EngineError::NoSuchPort(port_index as u32))?;
        port.attach_buffer(buffer);
        Ok(())
    }

    /// `port_index` counts MIDI ports of the stream only.
    pub fn midi_port_mut(
        &mut self,
        stream: StreamId,
        port_index: usize,
    ) -> EngineResult<&mut MidiClientPort> {
        let slot = self
            .slots
            .get_mut(stream)
            .ok_or(EngineError::NoSuchStream(stream as u32))?;
        slot.ports
            .midi_port_mut(port_index)
            .ok_or(EngineError::NoSuchPort(port_index as u32))
    }

    /// Builds rings and packet processors. One-shot; xrun recovery reuses
    /// them.
    #[instrument(skip(self))]
    pub fn prepare(&mut self) -> EngineResult<()> {
        if self.slots.is_empty() {
            return Err(EngineError::NoStreams);
        }
        if self.phase != ManagerPhase::Created {
            return Ok(());
        }
        let node_id = self.transport.local_node_id();
        let clock: Arc<dyn CycleTimerSource> = self.transport.clone();

        for slot in &mut self.slots {
            let capacity = self.nb_buffers * self.period;
            let (producer, consumer, control) =
                timestamped_ring(capacity, slot.spec.dimension);
            control.set_nominal_rate(slot.spec.nominal_ticks_per_frame());
            let state = slot.state.clone();
            let backends = std::mem::take(&mut slot.midi_backends);

            match slot.direction() {
                StreamDirection::Receive => {
                    let midi = backends
                        .into_iter()
                        .filter_map(|b| match b {
                            MidiBackend::Capture(it) => Some(it),
                            MidiBackend::Playback(_) => None,
                        })
                        .collect();
                    let dll = RateEstimatorDll::new(
                        slot.spec.sample_rate,
                        slot.spec.syt_interval,
                        DllOrder::Second,
                    );
                    let processor = ReceiveProcessor::new(
                        slot.spec.clone(),
                        state,
                        producer,
                        dll,
                        midi,
                        clock.clone(),
                    );
                    slot.packet = PacketHalf::Receive(Arc::new(Mutex::new(processor)));
                    slot.side = Some(PeriodSide::Capture(consumer));
                }
                StreamDirection::Transmit => {
                    let midi = backends
                        .into_iter()
                        .filter_map(|b| match b {
                            MidiBackend::Playback(it) => Some(it),
                            MidiBackend::Capture(_) => None,
                        })
                        .collect();
                    let processor = TransmitProcessor::new(
                        slot.spec.clone(),
                        state,
                        consumer,
                        control.clone(),
                        midi,
                        clock.clone(),
                        node_id,
                    );
                    slot.packet = PacketHalf::Transmit(Arc::new(Mutex::new(processor)));
                    slot.side = Some(PeriodSide::Playback(producer));
                }
            }
            slot.control = Some(control);
        }

        self.prefill_transmit_streams();
        self.phase = ManagerPhase::Prepared;
        info!(
            "prepared {} streams (period {}, {} buffers)",
            self.slots.len(),
            self.period,
            self.nb_buffers
        );
        Ok(())
    }

    /// Transmit rings start with `nb_buffers × period` frames of silence
    /// so the DMA can run before the first client period arrives.
    fn prefill_transmit_streams(&mut self) {
        let frames = self.nb_buffers * self.period;
        for slot in &mut self.slots {
            if slot.direction() != StreamDirection::Transmit {
                continue;
            }
            if let (Some(PeriodSide::Playback(producer)), Some(control)) =
                (&mut slot.side, &slot.control)
            {
                control.reset();
                let frame: Vec<u32> = slot.template.clone();
                let mut block = Vec::with_capacity(frames * frame.len());
                for _ in 0..frames {
                    block.extend_from_slice(&frame);
                }
                if !producer.write_frames_rated(&block) {
                    warn!("could not prefill '{}'", slot.spec.name);
                }
                debug!("prefilled '{}' with {frames} frames", slot.spec.name);
            }
        }
    }

    /// Brings handlers and threads up, waits until every stream reports
    /// running, then enables all streams at one phase-aligned cycle.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> EngineResult<()> {
        self.prepare()?;
        if self.phase == ManagerPhase::Running {
            return Err(EngineError::AlreadyRunning);
        }
        self.xrun_flag.store(false, Ordering::Release);
        self.sema.drain();

        for slot in &mut self.slots {
            slot.state.reset_for_start();
            slot.outstanding.store(0, Ordering::Release);
        }

        // one handler per stream; fresh kernel resources every run
        if let Err(e) = self.bring_up_iso() {
            self.teardown_iso();
            self.phase = ManagerPhase::Error;
            return Err(e);
        }

        if let Err(e) = self.wait_for_streams_running() {
            self.teardown_iso();
            self.phase = ManagerPhase::Error;
            return Err(e);
        }

        // all packet callbacks are live; pick the common enable point
        let now = self.transport.cycle_timer();
        let enable_at = (now.cycles() + ENABLE_DELAY_CYCLES) % CYCLES_PER_SECOND as u32;
        for slot in &self.slots {
            slot.state.request_enable_at(enable_at);
        }
        debug!("streams enabled at cycle {enable_at}");

        if let Err(e) = self.spawn_streaming_thread() {
            self.teardown_iso();
            self.phase = ManagerPhase::Error;
            return Err(e);
        }
        self.phase = ManagerPhase::Running;
        info!("streaming started");
        Ok(())
    }

    fn bring_up_iso(&mut self) -> EngineResult<()> {
        for i in 0..self.slots.len() {
            let params = channel_params(
                self.period,
                self.nb_buffers,
                self.slots[i].spec.syt_interval,
                self.slots[i].spec.dimension,
            );
            let channel = self.slots[i].spec.channel;
            let handler_id = match &self.slots[i].packet {
                PacketHalf::Receive(processor) => {
                    self.iso
                        .register_receive(channel, &params, processor.clone())?
                }
                PacketHalf::Transmit(processor) => {
                    self.iso
                        .register_transmit(channel, &params, processor.clone())?
                }
                PacketHalf::Unbuilt => unreachable!("prepare builds all packet halves"),
            };
            self.slots[i].handler_id = Some(handler_id);
        }

        self.iso.start_handlers(-1)?;
        self.iso.start_thread()?;
        Ok(())
    }

    fn wait_for_streams_running(&self) -> EngineResult<()> {
        let deadline = Instant::now() + STATE_TRANSITION_TIMEOUT;
        while Instant::now() < deadline {
            if self.slots.iter().all(|s| s.state.is_running()) {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
        let report = self
            .slots
            .iter()
            .map(|s| {
                format!(
                    "  {}: running={} packets={} last_cycle={}",
                    s.spec.name,
                    s.state.is_running(),
                    s.state.packet_count(),
                    s.state.last_cycle()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        Err(EngineError::StartTimeout { report })
    }

    fn spawn_streaming_thread(&mut self) -> EngineResult<()> {
        let watched: Vec<WatchedStream> = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| WatchedStream {
                name: slot.spec.name.clone(),
                direction: slot.direction(),
                state: slot.state.clone(),
                control: slot.control.clone().expect("prepared stream has a ring"),
                outstanding: slot.outstanding.clone(),
                is_sync_source: self.sync_source == Some(i),
                period: self.period as u64,
            })
            .collect();
        let clock: Arc<dyn IsoTransport> = self.transport.clone();
        let sema = self.sema.clone();
        let xrun_flag = self.xrun_flag.clone();
        let periods = self.periods.clone();
        let run_flag = self.run_flag.clone();
        run_flag.store(true, Ordering::Release);
        let rt_priority = self.rt_priority.saturating_sub(1);

        let thread = thread::Builder::new()
            .name("amdtp-streaming".to_owned())
            .spawn(move || {
                set_realtime_priority(rt_priority);
                streaming_loop(&watched, &*clock, &sema, &xrun_flag, &periods, &run_flag);
            })?;
        self.streaming_thread = Some(thread);
        Ok(())
    }

    /// Blocks until a period is ready on every stream. `false` means an
    /// xrun ended the run.
    pub fn wait_for_period(&self) -> bool {
        self.sema.wait();
        !self.xrun_flag.load(Ordering::Acquire)
    }

    /// Bounded variant of [`Self::wait_for_period`]; `None` on timeout.
    pub fn wait_for_period_timeout(&self, timeout: Duration) -> Option<bool> {
        if !self.sema.wait_timeout(timeout) {
            return None;
        }
        Some(!self.xrun_flag.load(Ordering::Acquire))
    }

    /// Moves exactly one period between every stream of `direction` (or
    /// all) and its ports.
    pub fn transfer(&mut self, direction: Option<StreamDirection>) -> EngineResult<()> {
        let period = self.period;
        for slot in &mut self.slots {
            if direction.is_some() && direction != Some(slot.direction()) {
                continue;
            }
            let dimension = slot.spec.dimension;
            match slot.side.as_mut() {
                Some(PeriodSide::Capture(consumer)) => {
                    if !consumer.read_frames(period, &mut slot.scratch) {
                        return Err(StreamError::Overrun.into());
                    }
                    for port in slot.ports.audio_ports_mut() {
                        port.decode_period(&slot.scratch, period, dimension);
                    }
                    decrement(&slot.outstanding);
                    slot.fill_marks.mark(consumer.fill() as i64);
                }
                Some(PeriodSide::Playback(producer)) => {
                    for chunk in slot.scratch.chunks_exact_mut(dimension) {
                        chunk.copy_from_slice(&slot.template);
                    }
                    for port in slot.ports.audio_ports() {
                        port.encode_period(&mut slot.scratch, period, dimension);
                    }
                    if !producer.write_frames_rated(&slot.scratch) {
                        return Err(StreamError::Underrun.into());
                    }
                    decrement(&slot.outstanding);
                    slot.fill_marks.mark(producer.fill() as i64);
                }
                None => {
                    return Err(StreamError::InvalidState {
                        actual: "created",
                        required: "prepared",
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Stops the pipeline: processors get their stop handshake, then the
    /// threads come down and all handlers are destroyed.
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> EngineResult<()> {
        if self.phase != ManagerPhase::Running && self.phase != ManagerPhase::Error {
            return Ok(());
        }

        for slot in &self.slots {
            slot.state.request_stop();
        }
        self.wait_for_stop_handshake();

        self.run_flag.store(false, Ordering::Release);
        if let Some(thread) = self.streaming_thread.take()
            && thread.join().is_err()
        {
            warn!("streaming thread panicked");
        }

        self.teardown_iso();
        self.sema.drain();
        self.phase = ManagerPhase::Prepared;
        for slot in &self.slots {
            debug!(
                "'{}': {} packets, {} dropped, {} xruns",
                slot.spec.name,
                slot.state.packet_count(),
                slot.state.dropped_count(),
                slot.state.xrun_count()
            );
        }
        info!("streaming stopped");
        Ok(())
    }

    fn wait_for_stop_handshake(&self) {
        let deadline = Instant::now() + STATE_TRANSITION_TIMEOUT;
        let mut last_counts: Vec<u64> =
            self.slots.iter().map(|s| s.state.packet_count()).collect();
        while Instant::now() < deadline {
            let ready = self.slots.iter().all(|s| {
                s.direction() == StreamDirection::Receive || s.state.stop_ready()
            });
            if ready {
                return;
            }
            thread::sleep(Duration::from_millis(100));
            let counts: Vec<u64> =
                self.slots.iter().map(|s| s.state.packet_count()).collect();
            if counts == last_counts {
                // iso delivery has ceased (typically after an xrun); there
                // is nothing left to drain
                debug!("stop handshake aborted, streaming no longer active");
                return;
            }
            last_counts = counts;
        }
        warn!("stop handshake timed out");
    }

    fn teardown_iso(&mut self) {
        self.iso.stop_thread();
        self.iso.stop_handlers();
        self.iso.clear();
        for slot in &mut self.slots {
            slot.handler_id = None;
        }
    }

    /// Stop, reset every processor (prefilling transmit buffers), start
    /// again.
    #[instrument(skip(self))]
    pub fn handle_xrun(&mut self) -> EngineResult<()> {
        warn!("handling xrun");
        self.stop()?;
        self.reset_streams();
        self.start()
    }

    fn reset_streams(&mut self) {
        for slot in &mut self.slots {
            slot.state.reset_for_start();
            slot.outstanding.store(0, Ordering::Release);
            if let Some(control) = &slot.control {
                control.reset();
                control.set_nominal_rate(slot.spec.nominal_ticks_per_frame());
            }
            match &slot.packet {
                PacketHalf::Receive(processor) => {
                    processor.lock().expect("processor mutex poisoned").reset();
                }
                PacketHalf::Transmit(processor) => {
                    processor.lock().expect("processor mutex poisoned").reset();
                }
                PacketHalf::Unbuilt => {}
            }
        }
        self.prefill_transmit_streams();
    }

    pub fn xrun_count(&self) -> u32 {
        self.slots.iter().map(|s| s.state.xrun_count()).sum()
    }

    pub fn xrun_occurred(&self) -> bool {
        self.xrun_flag.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.phase == ManagerPhase::Running
    }

    /// Head timestamp of a capture stream's ring, for phase inspection.
    pub fn stream_head_timestamp(&self, stream: StreamId) -> Option<(crate::time::Ticks, u64)> {
        self.slots
            .get(stream)
            .and_then(|s| s.control.as_ref())
            .map(|c| c.head_timestamp())
    }
}

impl Drop for StreamProcessorManager {
    fn drop(&mut self) {
        if self.phase == ManagerPhase::Running {
            self.stop().ok();
        }
    }
}

fn decrement(counter: &AtomicU64) {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        .ok();
}

fn streaming_loop(
    watched: &[WatchedStream],
    clock: &dyn IsoTransport,
    sema: &Semaphore,
    xrun_flag: &AtomicBool,
    periods: &AtomicU64,
    run_flag: &AtomicBool,
) {
    info!("streaming thread running");
    let backoff = Backoff::new();
    while run_flag.load(Ordering::Acquire) {
        if watched.iter().any(|w| w.state.xrun_occurred()) {
            for w in watched {
                if w.state.xrun_occurred() {
                    warn!("xrun on stream '{}'", w.name);
                }
            }
            xrun_flag.store(true, Ordering::Release);
            sema.post();
            break;
        }

        let now = clock.cycle_timer().to_ticks();
        if watched.iter().all(|w| w.one_period_ready(now)) {
            for w in watched {
                w.outstanding.fetch_add(1, Ordering::AcqRel);
            }
            periods.fetch_add(1, Ordering::AcqRel);
            sema.post();
            backoff.reset();
        } else if backoff.is_completed() {
            // pure state polling, no blocking I/O; settle into a fixed
            // poll interval once the spin budget is spent
            thread::sleep(STREAMING_POLL_INTERVAL);
        } else {
            backoff.snooze();
        }
    }
    info!("streaming thread stopped");
}
