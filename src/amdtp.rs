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

//! The IEC 61883-6 AMDTP wire format: CIP header codec, AM824 event labels
//! and the FDF / SYT-interval tables.
//!
//! All multi-byte fields on the wire are big-endian. An audio event is a
//! quadlet `[8b label][24b sample]` (label `0x40` for 24-bit MBLA); a MIDI
//! event is `[8b label][8b 0][8b byte][8b 0]`.

use crate::error::{ConfigError, ConfigResult};

pub const CIP_HEADER_LEN: usize = 8;
pub const QUADLET_LEN: usize = 4;

pub const FMT_AMDTP: u8 = 0x10;
pub const FDF_NODATA: u8 = 0xFF;
pub const SYT_NODATA: u16 = 0xFFFF;
pub const TAG_WITH_CIP: u8 = 1;

pub const LABEL_MBLA: u8 = 0x40;
pub const LABEL_MIDI_NODATA: u8 = 0x80;
pub const LABEL_MIDI_1X: u8 = 0x81;

pub const EVENT_AUDIO_SILENCE: u32 = (LABEL_MBLA as u32) << 24;
pub const EVENT_MIDI_NODATA: u32 = (LABEL_MIDI_NODATA as u32) << 24;

/// Number of interleaved MIDI sub-channels per MPX quadlet slot.
pub const MIDI_MUX_SLOTS: usize = 8;

/// Two-quadlet CIP header. `fn`, `qpc`, `sph` and the reserved field are
/// always zero for AMDTP, `eoh1` is always 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipHeader {
    pub sid: u8,
    pub dbs: u8,
    pub dbc: u8,
    pub fdf: u8,
    pub syt: u16,
}

impl CipHeader {
    pub fn no_data(sid: u8, dbs: u8, dbc: u8) -> Self {
        Self {
            sid,
            dbs,
            dbc,
            fdf: FDF_NODATA,
            syt: SYT_NODATA,
        }
    }

    pub fn is_no_data(&self) -> bool {
        self.fdf == FDF_NODATA || self.syt == SYT_NODATA
    }

    /// Parses the first two quadlets of a packet. Returns `None` when the
    /// fixed fields do not match AMDTP.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < CIP_HEADER_LEN {
            return None;
        }
        let quad0 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let quad1 = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        // quad0: [2b 0][6b sid][8b dbs][1b fn][2b qpc][1b sph][8b dbc]
        if quad0 >> 30 != 0 {
            return None;
        }
        // quad1: [2b eoh1=2][6b fmt][8b fdf][16b syt]
        if quad1 >> 30 != 2 {
            return None;
        }
        let fmt = ((quad1 >> 24) & 0x3F) as u8;
        if fmt != FMT_AMDTP {
            return None;
        }

        Some(Self {
            sid: ((quad0 >> 24) & 0x3F) as u8,
            dbs: ((quad0 >> 16) & 0xFF) as u8,
            dbc: (quad0 & 0xFF) as u8,
            fdf: ((quad1 >> 16) & 0xFF) as u8,
            syt: (quad1 & 0xFFFF) as u16,
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        let quad0 = ((self.sid as u32 & 0x3F) << 24) | ((self.dbs as u32) << 16) | self.dbc as u32;
        let quad1 = (2u32 << 30)
            | ((FMT_AMDTP as u32 & 0x3F) << 24)
            | ((self.fdf as u32) << 16)
            | self.syt as u32;
        out[0..4].copy_from_slice(&quad0.to_be_bytes());
        out[4..8].copy_from_slice(&quad1.to_be_bytes());
    }
}

/// Sample-rate code carried in the FDF field (IEC 61883-6, AM824 basic
/// formats).
pub fn fdf_for_rate(rate: u32) -> ConfigResult<u8> {
    match rate {
        32_000 => Ok(0x00),
        44_100 => Ok(0x01),
        48_000 => Ok(0x02),
        88_200 => Ok(0x03),
        96_000 => Ok(0x04),
        176_400 => Ok(0x05),
        192_000 => Ok(0x06),
        other => Err(ConfigError::UnsupportedSampleRate(other)),
    }
}

/// Frames per packet for a given sample rate.
pub fn syt_interval_for_rate(rate: u32) -> ConfigResult<u32> {
    match rate {
        32_000 | 44_100 | 48_000 => Ok(8),
        88_200 | 96_000 => Ok(16),
        176_400 | 192_000 => Ok(32),
        other => Err(ConfigError::UnsupportedSampleRate(other)),
    }
}

/// Label a signed 24-bit sample as MBLA.
pub fn encode_int24(sample: i32) -> u32 {
    (sample as u32 & 0x00FF_FFFF) | ((LABEL_MBLA as u32) << 24)
}

/// Recover the signed 24-bit sample from an MBLA event.
pub fn decode_int24(event: u32) -> i32 {
    let mut v = (event & 0x00FF_FFFF) as i32;
    if v & 0x0080_0000 != 0 {
        v |= !0x00FF_FFFF;
    }
    v
}

/// Scale a float in [-1, 1) to 24-bit MBLA.
pub fn encode_float(sample: f32) -> u32 {
    let scaled = (sample * 0x7FFF_FF00u32 as f32) as i32;
    ((scaled >> 8) as u32 & 0x00FF_FFFF) | ((LABEL_MBLA as u32) << 24)
}

/// Recover a float in [-1, 1) from an MBLA event.
pub fn decode_float(event: u32) -> f32 {
    decode_int24(event) as f32 / 0x0080_0000 as f32
}

/// Wrap one MIDI byte into an MPX event.
pub fn encode_midi_byte(byte: u8) -> u32 {
    ((LABEL_MIDI_1X as u32) << 24) | ((byte as u32) << 8)
}

/// The data byte of an MPX event carrying one, `None` for `MIDI_NO_DATA`.
pub fn decode_midi_event(event: u32) -> Option<u8> {
    let label = (event >> 24) as u8;
    if label == LABEL_MIDI_NODATA {
        None
    } else {
        Some(((event >> 8) & 0xFF) as u8)
    }
}

/// Copy events out of a packet payload (big-endian quadlets after the CIP
/// header) into host-order events.
pub fn payload_to_events(payload: &[u8], events: &mut Vec<u32>) {
    events.clear();
    for quad in payload.chunks_exact(QUADLET_LEN) {
        events.push(u32::from_be_bytes([quad[0], quad[1], quad[2], quad[3]]));
    }
}

/// Serialise host-order events into a big-endian payload.
pub fn events_to_payload(events: &[u32], payload: &mut [u8]) {
    for (event, out) in events.iter().zip(payload.chunks_exact_mut(QUADLET_LEN)) {
        out.copy_from_slice(&event.to_be_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cip_header_roundtrips() {
        let hdr = CipHeader {
            sid: 0x3D,
            dbs: 9,
            dbc: 0x42,
            fdf: 0x02,
            syt: 0x5ABC,
        };
        let mut buf = [0u8; CIP_HEADER_LEN];
        hdr.write(&mut buf);
        assert_eq!(CipHeader::parse(&buf), Some(hdr));
    }

    #[test]
    fn cip_header_bit_layout_is_exact() {
        let hdr = CipHeader {
            sid: 0x01,
            dbs: 0x0A,
            dbc: 0x10,
            fdf: 0x02,
            syt: 0x1234,
        };
        let mut buf = [0u8; CIP_HEADER_LEN];
        hdr.write(&mut buf);
        assert_eq!(buf, [0x01, 0x0A, 0x00, 0x10, 0x90, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn no_data_header_has_reserved_markers() {
        let hdr = CipHeader::no_data(1, 4, 8);
        assert!(hdr.is_no_data());
        let mut buf = [0u8; CIP_HEADER_LEN];
        hdr.write(&mut buf);
        let parsed = CipHeader::parse(&buf).expect("header must parse");
        assert_eq!(parsed.fdf, FDF_NODATA);
        assert_eq!(parsed.syt, SYT_NODATA);
    }

    #[test]
    fn short_buffers_do_not_parse() {
        assert_eq!(CipHeader::parse(&[0u8; 7]), None);
    }

    #[test]
    fn fdf_and_syt_interval_tables() {
        let expected = [
            (32_000u32, 0x00u8, 8u32),
            (44_100, 0x01, 8),
            (48_000, 0x02, 8),
            (88_200, 0x03, 16),
            (96_000, 0x04, 16),
            (176_400, 0x05, 32),
            (192_000, 0x06, 32),
        ];
        for (rate, fdf, interval) in expected {
            assert_eq!(fdf_for_rate(rate).expect("rate is valid"), fdf);
            assert_eq!(syt_interval_for_rate(rate).expect("rate is valid"), interval);
        }
        assert!(fdf_for_rate(22_050).is_err());
        assert!(syt_interval_for_rate(0).is_err());
    }

    #[test]
    fn int24_roundtrips_exactly() {
        for s in [0i32, 1, -1, 0x7F_FFFF, -0x80_0000, 12_345, -54_321] {
            let event = encode_int24(s);
            assert_eq!(event >> 24, LABEL_MBLA as u32);
            assert_eq!(decode_int24(event), s);
        }
    }

    #[test]
    fn float_roundtrips_within_lsb() {
        for f in [0.0f32, 0.5, -0.5, 0.999_999, -1.0, 0.125, -0.333] {
            let back = decode_float(encode_float(f));
            assert!(
                (back - f).abs() <= 1.0 / (1 << 23) as f32,
                "f={f} back={back}"
            );
        }
    }

    #[test]
    fn midi_events_carry_the_byte_in_the_second_octet() {
        let event = encode_midi_byte(0x90);
        assert_eq!(event, 0x8100_9000);
        assert_eq!(decode_midi_event(event), Some(0x90));
        assert_eq!(decode_midi_event(EVENT_MIDI_NODATA), None);
    }

    #[test]
    fn payload_conversion_is_big_endian() {
        let events = [0x4001_0203u32, 0x8100_4100];
        let mut payload = [0u8; 8];
        events_to_payload(&events, &mut payload);
        assert_eq!(payload, [0x40, 0x01, 0x02, 0x03, 0x81, 0x00, 0x41, 0x00]);
        let mut back = Vec::new();
        payload_to_events(&payload, &mut back);
        assert_eq!(back, events);
    }
}
