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

//! Data-plane endpoints of a stream.
//!
//! Audio (and control) ports are period-signalled: one block of samples per
//! period, moved during `transfer`. MIDI ports are packet-signalled: a byte
//! stream hand-off between the packet path and the client through a
//! lock-free ring, since MIDI bytes are bound to the DBC of the packet they
//! travel in.

use crate::{
    amdtp,
    buffer::AudioBufferPointer,
    error::{ConfigError, ConfigResult},
};
use serde::{Deserialize, Serialize};

/// Bytes a single muxed MIDI channel can have in flight client <-> packet
/// path.
pub const MIDI_RING_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortDirection {
    Capture,
    Playback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortType {
    Audio,
    Midi,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleEncoding {
    Int24,
    Float,
}

/// Placement of a port inside the AMDTP frame: the quadlet slot, and for
/// MIDI the 1-based mux sub-slot within the MPX quadlet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    pub port_type: PortType,
    pub encoding: SampleEncoding,
    pub position: usize,
    pub location: usize,
}

impl PortSpec {
    pub fn audio(name: impl Into<String>, encoding: SampleEncoding, position: usize) -> Self {
        Self {
            name: name.into(),
            port_type: PortType::Audio,
            encoding,
            position,
            location: 0,
        }
    }

    pub fn control(name: impl Into<String>, position: usize) -> Self {
        Self {
            name: name.into(),
            port_type: PortType::Control,
            encoding: SampleEncoding::Int24,
            position,
            location: 0,
        }
    }

    pub fn midi(name: impl Into<String>, position: usize, location: usize) -> Self {
        Self {
            name: name.into(),
            port_type: PortType::Midi,
            encoding: SampleEncoding::Int24,
            position,
            location,
        }
    }

    pub fn validate(&self, dimension: usize) -> ConfigResult<()> {
        if self.position >= dimension {
            return Err(ConfigError::PortPositionOutOfRange {
                position: self.position,
                dimension,
            });
        }
        if self.port_type == PortType::Midi && !(1..=amdtp::MIDI_MUX_SLOTS).contains(&self.location)
        {
            return Err(ConfigError::InvalidMidiLocation(self.location));
        }
        Ok(())
    }
}

enum AudioBacking {
    OwnedInt(Vec<i32>),
    OwnedFloat(Vec<f32>),
    External(AudioBufferPointer),
}

/// A period-signalled audio or control port.
pub struct AudioPort {
    spec: PortSpec,
    direction: PortDirection,
    backing: AudioBacking,
}

impl AudioPort {
    pub fn new(spec: PortSpec, direction: PortDirection, period: usize) -> Self {
        let backing = match spec.encoding {
            SampleEncoding::Int24 => AudioBacking::OwnedInt(vec![0; period]),
            SampleEncoding::Float => AudioBacking::OwnedFloat(vec![0.0; period]),
        };
        Self {
            spec,
            direction,
            backing,
        }
    }

    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// Replaces the owned backing with a client-provided buffer.
    pub fn attach_buffer(&mut self, buffer: AudioBufferPointer) {
        self.backing = AudioBacking::External(buffer);
    }

    /// Capture path: pick this port's samples out of `events` (one period of
    /// full frames) into the backing buffer.
    pub fn decode_period(&mut self, events: &[u32], frames: usize, dimension: usize) {
        let position = self.spec.position;
        match &mut self.backing {
            AudioBacking::OwnedInt(samples) => {
                for (f, sample) in samples.iter_mut().take(frames).enumerate() {
                    *sample = amdtp::decode_int24(events[f * dimension + position]);
                }
            }
            AudioBacking::OwnedFloat(samples) => {
                for (f, sample) in samples.iter_mut().take(frames).enumerate() {
                    *sample = amdtp::decode_float(events[f * dimension + position]);
                }
            }
            AudioBacking::External(ptr) => match self.spec.encoding {
                SampleEncoding::Int24 => {
                    let samples = ptr.buffer_mut::<i32>();
                    for (f, sample) in samples.iter_mut().take(frames).enumerate() {
                        *sample = amdtp::decode_int24(events[f * dimension + position]);
                    }
                }
                SampleEncoding::Float => {
                    let samples = ptr.buffer_mut::<f32>();
                    for (f, sample) in samples.iter_mut().take(frames).enumerate() {
                        *sample = amdtp::decode_float(events[f * dimension + position]);
                    }
                }
            },
        }
    }

    /// Playback path: label this port's samples into `events`.
    pub fn encode_period(&self, events: &mut [u32], frames: usize, dimension: usize) {
        let position = self.spec.position;
        match &self.backing {
            AudioBacking::OwnedInt(samples) => {
                for (f, &sample) in samples.iter().take(frames).enumerate() {
                    events[f * dimension + position] = amdtp::encode_int24(sample);
                }
            }
            AudioBacking::OwnedFloat(samples) => {
                for (f, &sample) in samples.iter().take(frames).enumerate() {
                    events[f * dimension + position] = amdtp::encode_float(sample);
                }
            }
            AudioBacking::External(ptr) => match self.spec.encoding {
                SampleEncoding::Int24 => {
                    let samples = ptr.buffer::<i32>();
                    for (f, &sample) in samples.iter().take(frames).enumerate() {
                        events[f * dimension + position] = amdtp::encode_int24(sample);
                    }
                }
                SampleEncoding::Float => {
                    let samples = ptr.buffer::<f32>();
                    for (f, &sample) in samples.iter().take(frames).enumerate() {
                        events[f * dimension + position] = amdtp::encode_float(sample);
                    }
                }
            },
        }
    }
}

/// Client half of a packet-signalled MIDI port.
pub struct MidiClientPort {
    spec: PortSpec,
    direction: PortDirection,
    half: MidiClientHalf,
}

enum MidiClientHalf {
    Capture(rtrb::Consumer<u8>),
    Playback(rtrb::Producer<u8>),
}

impl MidiClientPort {
    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// Reads decoded MIDI bytes; returns how many were available.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        match &mut self.half {
            MidiClientHalf::Capture(consumer) => {
                let mut n = 0;
                while n < dst.len() {
                    match consumer.pop() {
                        Ok(byte) => {
                            dst[n] = byte;
                            n += 1;
                        }
                        Err(_) => break,
                    }
                }
                n
            }
            MidiClientHalf::Playback(_) => 0,
        }
    }

    /// Queues MIDI bytes for transmission; returns how many were accepted.
    pub fn write(&mut self, src: &[u8]) -> usize {
        match &mut self.half {
            MidiClientHalf::Playback(producer) => {
                let mut n = 0;
                for &byte in src {
                    if producer.push(byte).is_err() {
                        break;
                    }
                    n += 1;
                }
                n
            }
            MidiClientHalf::Capture(_) => 0,
        }
    }
}

/// Packet-path half of a capture MIDI port; fed by the receive processor.
pub struct MidiCaptureBackend {
    pub position: usize,
    pub location: usize,
    pub producer: rtrb::Producer<u8>,
}

/// Packet-path half of a playback MIDI port; drained by the transmit
/// processor under the mux rate limit.
pub struct MidiPlaybackBackend {
    pub position: usize,
    pub location: usize,
    pub consumer: rtrb::Consumer<u8>,
    /// packets to skip before the next byte may go out
    pub countdown: u32,
}

pub enum MidiBackend {
    Capture(MidiCaptureBackend),
    Playback(MidiPlaybackBackend),
}

/// Builds the client/packet halves of a MIDI port.
pub fn midi_port_pair(spec: PortSpec, direction: PortDirection) -> (MidiClientPort, MidiBackend) {
    let (producer, consumer) = rtrb::RingBuffer::new(MIDI_RING_CAPACITY);
    match direction {
        PortDirection::Capture => (
            MidiClientPort {
                spec: spec.clone(),
                direction,
                half: MidiClientHalf::Capture(consumer),
            },
            MidiBackend::Capture(MidiCaptureBackend {
                position: spec.position,
                location: spec.location,
                producer,
            }),
        ),
        PortDirection::Playback => (
            MidiClientPort {
                spec: spec.clone(),
                direction,
                half: MidiClientHalf::Playback(producer),
            },
            MidiBackend::Playback(MidiPlaybackBackend {
                position: spec.position,
                location: spec.location,
                consumer,
                countdown: 0,
            }),
        ),
    }
}

/// Client-side port collection of one stream.
#[derive(Default)]
pub struct PortManager {
    audio: Vec<AudioPort>,
    midi: Vec<MidiClientPort>,
}

impl PortManager {
    pub fn add_audio(&mut self, port: AudioPort) -> ConfigResult<()> {
        self.check_name(&port.spec().name)?;
        self.audio.push(port);
        Ok(())
    }

    pub fn add_midi(&mut self, port: MidiClientPort) -> ConfigResult<()> {
        self.check_name(&port.spec().name)?;
        self.midi.push(port);
        Ok(())
    }

    fn check_name(&self, name: &str) -> ConfigResult<()> {
        let taken = self.audio.iter().any(|p| p.spec().name == name)
            || self.midi.iter().any(|p| p.spec().name == name);
        if taken {
            Err(ConfigError::DuplicatePortName(name.to_owned()))
        } else {
            Ok(())
        }
    }

    pub fn audio_ports(&self) -> &[AudioPort] {
        &self.audio
    }

    pub fn audio_ports_mut(&mut self) -> &mut [AudioPort] {
        &mut self.audio
    }

    pub fn midi_port_mut(&mut self, index: usize) -> Option<&mut MidiClientPort> {
        self.midi.get_mut(index)
    }

    pub fn port_count(&self, port_type: Option<PortType>) -> usize {
        match port_type {
            None => self.audio.len() + self.midi.len(),
            Some(PortType::Midi) => self.midi.len(),
            Some(t) => self.audio.iter().filter(|p| p.spec().port_type == t).count(),
        }
    }

    /// Stable enumeration: audio/control ports first, then MIDI.
    pub fn port_name(&self, index: usize) -> Option<&str> {
        if index < self.audio.len() {
            Some(&self.audio[index].spec().name)
        } else {
            self.midi
                .get(index - self.audio.len())
                .map(|p| p.spec().name.as_str())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spec_validation_checks_frame_layout() {
        assert!(
            PortSpec::audio("out-l", SampleEncoding::Float, 0)
                .validate(2)
                .is_ok()
        );
        assert!(matches!(
            PortSpec::audio("out-r", SampleEncoding::Float, 2).validate(2),
            Err(ConfigError::PortPositionOutOfRange { .. })
        ));
        assert!(matches!(
            PortSpec::midi("midi", 1, 0).validate(2),
            Err(ConfigError::InvalidMidiLocation(0))
        ));
        assert!(PortSpec::midi("midi", 1, 1).validate(2).is_ok());
    }

    #[test]
    fn audio_port_decodes_its_slot_only() {
        let spec = PortSpec::audio("in", SampleEncoding::Int24, 1);
        let mut port = AudioPort::new(spec, PortDirection::Capture, 4);
        // two frames of dimension 2, port sits at slot 1
        let events = [
            amdtp::encode_int24(11),
            amdtp::encode_int24(101),
            amdtp::encode_int24(22),
            amdtp::encode_int24(102),
        ];
        let client = vec![0i32; 4];
        port.attach_buffer(AudioBufferPointer::from_slice(&client));
        port.decode_period(&events, 2, 2);
        assert_eq!(&client[..2], &[101, 102]);
    }

    #[test]
    fn audio_port_encodes_with_mbla_label() {
        let spec = PortSpec::audio("out", SampleEncoding::Int24, 0);
        let port = AudioPort::new(spec, PortDirection::Playback, 2);
        let mut events = [0u32; 2];
        port.encode_period(&mut events, 2, 1);
        assert_eq!(events, [amdtp::EVENT_AUDIO_SILENCE; 2]);
    }

    #[test]
    fn float_roundtrip_through_a_port_pair() {
        let client_out = vec![0.25f32, -0.5];
        let out_spec = PortSpec::audio("out", SampleEncoding::Float, 0);
        let mut out_port = AudioPort::new(out_spec, PortDirection::Playback, 2);
        out_port.attach_buffer(AudioBufferPointer::from_slice(&client_out));
        let mut events = [0u32; 2];
        out_port.encode_period(&mut events, 2, 1);

        let in_spec = PortSpec::audio("in", SampleEncoding::Float, 0);
        let mut in_port = AudioPort::new(in_spec, PortDirection::Capture, 2);
        let client_in = vec![0f32; 2];
        in_port.attach_buffer(AudioBufferPointer::from_slice(&client_in));
        in_port.decode_period(&events, 2, 1);

        for (a, b) in client_out.iter().zip(&client_in) {
            assert!((a - b).abs() <= 1.0 / (1 << 23) as f32);
        }
    }

    #[test]
    fn midi_pair_moves_bytes_between_halves() {
        let spec = PortSpec::midi("midi-out", 1, 1);
        let (mut client, backend) = midi_port_pair(spec, PortDirection::Playback);
        assert_eq!(client.write(&[0x90, 0x3C, 0x7F]), 3);
        let MidiBackend::Playback(mut backend) = backend else {
            panic!("expected playback backend");
        };
        assert_eq!(backend.consumer.pop(), Ok(0x90));
        assert_eq!(backend.consumer.pop(), Ok(0x3C));
        assert_eq!(backend.consumer.pop(), Ok(0x7F));
        assert!(backend.consumer.pop().is_err());
    }

    #[test]
    fn port_manager_rejects_duplicate_names() {
        let mut ports = PortManager::default();
        let spec = PortSpec::audio("mono", SampleEncoding::Float, 0);
        ports
            .add_audio(AudioPort::new(spec.clone(), PortDirection::Capture, 8))
            .expect("first registration succeeds");
        assert!(matches!(
            ports.add_audio(AudioPort::new(spec, PortDirection::Capture, 8)),
            Err(ConfigError::DuplicatePortName(_))
        ));
        assert_eq!(ports.port_count(None), 1);
        assert_eq!(ports.port_name(0), Some("mono"));
    }
}
