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

//! End-to-end smoke harness: runs the engine against the simulated bus,
//! with a device model feeding the capture streams and draining the
//! playback streams.

use amdtp_engine::{
    amdtp::{self, CipHeader},
    buffer::AudioBufferPointer,
    config::{Config, StreamEntry},
    engine::AmdtpEngine,
    port::{PortSpec, SampleEncoding},
    stream::StreamDirection,
    time::{ticks_to_syt, Ticks, TICKS_PER_CYCLE},
    transport::{sim::SimTransport, IsoTransport},
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const RUN_PERIODS: usize = 500;

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    info!("starting loopback for {}", config.instance_name());

    let bus = SimTransport::with_jitter(true);
    let transport: Arc<dyn IsoTransport> = Arc::new(bus.clone());
    let mut engine = AmdtpEngine::from_config(transport, &config.streaming)?;

    let entries = if config.streams.is_empty() {
        default_streams()
    } else {
        config.streams.clone()
    };

    let mut playback_buffers = Vec::new();
    let mut capture_channels = Vec::new();
    let mut playback_channels = Vec::new();
    for entry in &entries {
        let dimension = entry.audio_channels + usize::from(entry.midi_ports > 0);
        match entry.direction {
            StreamDirection::Receive => {
                let stream = engine.add_receive_stream(
                    entry.name.clone(),
                    entry.channel,
                    config.streaming.sample_rate,
                    dimension,
                )?;
                for ch in 0..entry.audio_channels {
                    let spec = PortSpec::audio(
                        format!("{}:{ch}", entry.name),
                        SampleEncoding::Int24,
                        ch,
                    );
                    engine.register_capture_port(stream, spec)?;
                }
                for m in 0..entry.midi_ports {
                    let spec = PortSpec::midi(
                        format!("{}:midi{m}", entry.name),
                        entry.audio_channels,
                        m + 1,
                    );
                    engine.register_capture_port(stream, spec)?;
                }
                capture_channels.push((entry.channel, dimension));
            }
            StreamDirection::Transmit => {
                let stream = engine.add_transmit_stream(
                    entry.name.clone(),
                    entry.channel,
                    config.streaming.sample_rate,
                    dimension,
                )?;
                for ch in 0..entry.audio_channels {
                    let spec = PortSpec::audio(
                        format!("{}:{ch}", entry.name),
                        SampleEncoding::Int24,
                        ch,
                    );
                    let port = engine.register_playback_port(stream, spec)?;
                    let buffer = vec![0i32; config.streaming.period_size];
                    engine.attach_buffer(port, AudioBufferPointer::from_slice(&buffer))?;
                    playback_buffers.push(buffer);
                }
                playback_channels.push(entry.channel);
            }
        }
    }

    let run = Arc::new(AtomicBool::new(true));
    let device = spawn_device_model(
        bus.clone(),
        capture_channels,
        !playback_channels.is_empty(),
        config.streaming.sample_rate,
        run.clone(),
    );

    engine.start()?;
    info!("engine running, {RUN_PERIODS} periods to go");

    let mut sample = 0i32;
    for period in 0..RUN_PERIODS {
        match engine.wait_period_timeout(Duration::from_secs(2))? {
            Some(0) => {
                warn!("xrun after {period} periods, recovering");
                engine.handle_xrun()?;
            }
            Some(_) => {
                // a sawtooth keeps the playback payload recognisable
                for buffer in &playback_buffers {
                    let pointer = AudioBufferPointer::from_slice(buffer);
                    let out = pointer.buffer_mut::<i32>();
                    for value in out.iter_mut() {
                        *value = sample;
                        sample = (sample + 1) & 0x3F_FFFF;
                    }
                }
                engine.transfer()?;
            }
            None => {
                warn!("timed out waiting for a period");
                break;
            }
        }
    }

    info!(
        "done: {} xruns over the run",
        engine.xrun_count()
    );
    for &channel in &playback_channels {
        let sent = bus.take_sent(channel);
        let data = sent
            .iter()
            .filter(|p| {
                CipHeader::parse(&p.data)
                    .map(|h| !h.is_no_data())
                    .unwrap_or(false)
            })
            .count();
        info!(
            "channel {channel}: {} packets on the wire, {data} carrying data",
            sent.len()
        );
    }

    engine.stop()?;
    run.store(false, Ordering::Release);
    device.join().ok();
    engine.finish()?;
    Ok(())
}

fn default_streams() -> Vec<StreamEntry> {
    vec![
        StreamEntry {
            name: "capture".to_owned(),
            channel: 0,
            direction: StreamDirection::Receive,
            audio_channels: 2,
            midi_ports: 0,
        },
        StreamEntry {
            name: "playback".to_owned(),
            channel: 1,
            direction: StreamDirection::Transmit,
            audio_channels: 2,
            midi_ports: 0,
        },
    ]
}

/// The "device": advances the bus clock cycle by cycle, sends AMDTP
/// packets on every capture channel at the configured rate and lets the
/// bus pull transmit packets.
fn spawn_device_model(
    bus: SimTransport,
    capture_channels: Vec<(u8, usize)>,
    has_playback: bool,
    sample_rate: u32,
    run: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let syt_interval = amdtp::syt_interval_for_rate(sample_rate).unwrap_or(8) as u64;
        let fdf = amdtp::fdf_for_rate(sample_rate).unwrap_or(0x02);
        let ticks_per_frame = 24_576_000f64 / sample_rate as f64;
        let packet_ticks = (syt_interval as f64 * ticks_per_frame) as u64;
        let mut next_packet = Ticks::new(100 * TICKS_PER_CYCLE);
        let mut index = 0u64;

        while run.load(Ordering::Acquire) {
            // one bus cycle per iteration; playback requests ride on tick()
            if has_playback || capture_channels.is_empty() {
                bus.tick(1);
            } else {
                bus.set_now(bus.now().add(TICKS_PER_CYCLE));
            }
            let now = bus.now();

            while next_packet.diff(now) <= 0 {
                let cycle = (next_packet.value() / TICKS_PER_CYCLE) as u32 % 8000;
                for &(channel, dim) in &capture_channels {
                    let header = CipHeader {
                        sid: 2,
                        dbs: dim as u8,
                        dbc: ((index * syt_interval) % 256) as u8,
                        fdf,
                        syt: ticks_to_syt(next_packet),
                    };
                    let mut packet = vec![0u8; 8 + syt_interval as usize * dim * 4];
                    header.write(&mut packet);
                    let events: Vec<u32> = (0..syt_interval as usize * dim)
                        .map(|i| {
                            amdtp::encode_int24((index as usize * 16 + i) as i32 & 0x3F_FFFF)
                        })
                        .collect();
                    amdtp::events_to_payload(&events, &mut packet[8..]);
                    bus.deliver(channel, packet, cycle, 0);
                }
                next_packet = next_packet.add(packet_ticks);
                index += 1;
            }

            thread::sleep(Duration::from_micros(125));
        }
    })
}
