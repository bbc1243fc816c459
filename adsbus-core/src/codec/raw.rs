//! Minimal raw format: `*<payload hex>;` plus CRLF or LF. No timing or RSSI.

use crate::buffer::RingBuffer;
use crate::codec::Parsed;
use crate::packet::{Packet, PacketKind, PAYLOAD_LEN_MAX};
use crate::types::{hex_decode_into, push_hex};

pub fn parse(buf: &mut RingBuffer, packet: &mut Packet) -> Option<Parsed> {
    let data = buf.data();
    if data.first() != Some(&b'*') {
        return None;
    }
    for kind in PacketKind::ALL {
        let hex_end = 1 + kind.payload_len() * 2;
        if data.len() < hex_end + 2 || data[hex_end] != b';' {
            continue;
        }
        let consumed = match (data[hex_end + 1], data.get(hex_end + 2)) {
            (b'\n', _) => hex_end + 2,
            (b'\r', Some(b'\n')) => hex_end + 3,
            _ => continue,
        };
        let mut payload = [0u8; PAYLOAD_LEN_MAX];
        if !hex_decode_into(&mut payload[..kind.payload_len()], &data[1..hex_end]) {
            continue;
        }
        packet.set_payload(kind, &payload);
        buf.consume(consumed).ok()?;
        return Some(Parsed::Frame);
    }
    None
}

pub fn serialize(packet: &Packet, out: &mut Vec<u8>) {
    out.push(b'*');
    push_hex(out, packet.payload());
    out.extend_from_slice(b";\n");
}
