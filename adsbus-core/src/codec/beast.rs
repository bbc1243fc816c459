//! Beast escaped-binary format.
//!
//! Frame: `0x1A`, type byte, 48-bit big-endian timestamp at 12 MHz, one RSSI
//! byte, payload. Any `0x1A` after the leading one is doubled on the wire.

use crate::buffer::RingBuffer;
use crate::codec::{ParserState, Parsed};
use crate::packet::{mlat_scale_in, mlat_scale_out, rssi_scale_in, rssi_scale_out, Packet, PacketKind};

const ESCAPE: u8 = 0x1A;
const MHZ: u32 = 12;
const MLAT_MAX: u64 = 0xFFFF_FFFF_FFFF;
const RSSI_MAX: u32 = u8::MAX as u32;
/// RSSI byte meaning "not measured".
const RSSI_ABSENT: u8 = 0xFF;

/// Type byte + timestamp + RSSI, after the leading escape.
const HEADER_LEN: usize = 2 + 6 + 1;
const FRAME_LEN_MAX: usize = HEADER_LEN + 14;

fn type_code(kind: PacketKind) -> u8 {
    match kind {
        PacketKind::ModeAc => 0x31,
        PacketKind::ModeSShort => 0x32,
        PacketKind::ModeSLong => 0x33,
    }
}

fn kind_for(code: u8) -> Option<PacketKind> {
    PacketKind::ALL.into_iter().find(|&k| type_code(k) == code)
}

/// Copy `out.len()` unescaped bytes out of `input`. Returns the number of
/// wire bytes used, or `None` if the input is short or badly escaped.
fn unescape(input: &[u8], out: &mut [u8]) -> Option<usize> {
    let mut i = 0;
    for slot in out.iter_mut() {
        let b = *input.get(i)?;
        if i > 0 && b == ESCAPE {
            if input.get(i + 1) != Some(&ESCAPE) {
                return None;
            }
            i += 1;
        }
        *slot = b;
        i += 1;
    }
    Some(i)
}

pub fn parse(buf: &mut RingBuffer, packet: &mut Packet, state: &mut ParserState) -> Option<Parsed> {
    let data = buf.data();
    if data.len() < 2 || data[0] != ESCAPE {
        return None;
    }
    let kind = kind_for(data[1])?;
    let mut frame = [0u8; FRAME_LEN_MAX];
    let frame = &mut frame[..HEADER_LEN + kind.payload_len()];
    let consumed = unescape(data, frame)?;

    let timestamp = frame[2..8]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64);
    let rssi = frame[8];

    packet.set_payload(kind, &frame[HEADER_LEN..]);
    packet.mlat_timestamp = mlat_scale_in(timestamp, MLAT_MAX, MHZ, &mut state.mlat);
    packet.rssi = if rssi == RSSI_ABSENT {
        0
    } else {
        rssi_scale_in(rssi as u32, RSSI_MAX)
    };
    buf.consume(consumed).ok()?;
    Some(Parsed::Frame)
}

pub fn serialize(packet: &Packet, out: &mut Vec<u8>) {
    let timestamp = mlat_scale_out(packet.mlat_timestamp, MLAT_MAX, MHZ);
    let rssi = if packet.rssi == 0 {
        RSSI_ABSENT
    } else {
        rssi_scale_out(packet.rssi, RSSI_MAX).min((RSSI_ABSENT - 1) as u32) as u8
    };

    out.push(ESCAPE);
    out.push(type_code(packet.kind));
    let ts_bytes = timestamp.to_be_bytes();
    let body = ts_bytes[2..]
        .iter()
        .copied()
        .chain(std::iter::once(rssi))
        .chain(packet.payload().iter().copied());
    for b in body {
        out.push(b);
        if b == ESCAPE {
            out.push(ESCAPE);
        }
    }
}
