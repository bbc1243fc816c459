//! airspy_adsb hex format.
//!
//! `*<payload hex>;<8 hex timestamp>;<2 hex half-MHz>;<4 hex RSSI>;` then CRLF
//! or a bare LF. The timestamp counter is 32 bits wide and its frequency is
//! announced per line.

use crate::buffer::RingBuffer;
use crate::codec::{ParserState, Parsed};
use crate::packet::{
    mlat_scale_in, mlat_scale_out, rssi_scale_in, rssi_scale_out, valid_mhz, Packet, PacketKind,
    PAYLOAD_LEN_MAX,
};
use crate::types::{hex_decode_into, hex_to_int, push_hex, push_hex_int};

/// Clock used for everything we emit.
const SEND_MHZ: u32 = 20;
const MLAT_MAX: u64 = u32::MAX as u64;
const RSSI_MAX: u32 = u16::MAX as u32;

/// `;TTTTTTTT;PP;RRRR;`
const TRAILER_LEN: usize = 18;

pub fn parse(buf: &mut RingBuffer, packet: &mut Packet, state: &mut ParserState) -> Option<Parsed> {
    for kind in PacketKind::ALL {
        if let Some(consumed) = parse_kind(buf.data(), packet, state, kind) {
            buf.consume(consumed).ok()?;
            return Some(Parsed::Frame);
        }
    }
    None
}

fn parse_kind(
    data: &[u8],
    packet: &mut Packet,
    state: &mut ParserState,
    kind: PacketKind,
) -> Option<usize> {
    let hex_end = 1 + kind.payload_len() * 2;
    let body_end = hex_end + TRAILER_LEN;
    if data.len() < body_end + 1 || data[0] != b'*' {
        return None;
    }

    let trailer = &data[hex_end..body_end];
    if trailer[0] != b';' || trailer[9] != b';' || trailer[12] != b';' || trailer[17] != b';' {
        return None;
    }
    let consumed = match (data[body_end], data.get(body_end + 1)) {
        (b'\n', _) => body_end + 1,
        (b'\r', Some(b'\n')) => body_end + 2,
        _ => return None,
    };

    let mhz = 2 * hex_to_int(&trailer[10..12])? as u32;
    if !valid_mhz(mhz) {
        return None;
    }
    let timestamp = hex_to_int(&trailer[1..9])?;
    let rssi = hex_to_int(&trailer[13..17])? as u32;
    let mut payload = [0u8; PAYLOAD_LEN_MAX];
    if !hex_decode_into(&mut payload[..kind.payload_len()], &data[1..hex_end]) {
        return None;
    }

    packet.set_payload(kind, &payload);
    packet.mlat_timestamp = mlat_scale_in(timestamp, MLAT_MAX, mhz, &mut state.mlat);
    packet.rssi = rssi_scale_in(rssi, RSSI_MAX);
    Some(consumed)
}

pub fn serialize(packet: &Packet, out: &mut Vec<u8>) {
    out.push(b'*');
    push_hex(out, packet.payload());
    out.push(b';');
    push_hex_int(out, mlat_scale_out(packet.mlat_timestamp, MLAT_MAX, SEND_MHZ), 8);
    out.push(b';');
    push_hex_int(out, (SEND_MHZ / 2) as u64, 2);
    out.push(b';');
    push_hex_int(out, rssi_scale_out(packet.rssi, RSSI_MAX) as u64, 4);
    out.extend_from_slice(b";\r\n");
}
