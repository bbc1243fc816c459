//! Length-prefixed structured format.
//!
//! Each message is a 4-byte big-endian length followed by a bincode-encoded
//! [`Message`]. Header semantics match the JSON format.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::buffer::BUF_CAPACITY;
use crate::buffer::RingBuffer;
use crate::codec::{accept_frame, accept_header, ParserState, Parsed, RemoteFrame, RemoteHeader, MAGIC};
use crate::packet::{Packet, PacketKind, MLAT_MAX, MLAT_MHZ, RSSI_MAX};
use crate::server::ServerInfo;
use crate::types::{AdsbusError, Result};

const PREFIX_LEN: usize = 4;
/// Largest body that still fits in a receive buffer behind its prefix.
const BODY_LEN_MAX: usize = BUF_CAPACITY - PREFIX_LEN;

#[derive(Debug, Serialize, Deserialize)]
enum Message {
    Header(HeaderMsg),
    ModeAc(PacketMsg),
    ModeSShort(PacketMsg),
    ModeSLong(PacketMsg),
}

#[derive(Debug, Serialize, Deserialize)]
struct HeaderMsg {
    magic: String,
    server_version: String,
    server_id: [u8; 16],
    mlat_timestamp_mhz: u32,
    mlat_timestamp_max: u64,
    rssi_max: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct PacketMsg {
    source_id: [u8; 16],
    payload: Vec<u8>,
    mlat_timestamp: u64,
    rssi: u32,
    hops: u16,
}

pub fn parse(
    buf: &mut RingBuffer,
    packet: &mut Packet,
    state: &mut ParserState,
    server: &ServerInfo,
) -> Result<Option<Parsed>> {
    let data = buf.data();
    let Some(prefix) = data.get(..PREFIX_LEN) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len == 0 || len > BODY_LEN_MAX {
        return Ok(None);
    }
    let Some(body) = data.get(PREFIX_LEN..PREFIX_LEN + len) else {
        return Ok(None);
    };
    let Ok(message) = bincode::deserialize::<Message>(body) else {
        return Ok(None);
    };

    let parsed = match message {
        Message::Header(h) => {
            let header = RemoteHeader {
                server_id: Uuid::from_bytes(h.server_id),
                server_version: h.server_version,
                mlat_mhz: h.mlat_timestamp_mhz,
                mlat_max: h.mlat_timestamp_max,
                rssi_max: h.rssi_max,
            };
            accept_header(state, server, &h.magic, header)?
        }
        Message::ModeAc(p) => accept_packet(state, PacketKind::ModeAc, p, packet)?,
        Message::ModeSShort(p) => accept_packet(state, PacketKind::ModeSShort, p, packet)?,
        Message::ModeSLong(p) => accept_packet(state, PacketKind::ModeSLong, p, packet)?,
    };
    buf.consume(PREFIX_LEN + len)?;
    Ok(Some(parsed))
}

fn accept_packet(
    state: &mut ParserState,
    kind: PacketKind,
    msg: PacketMsg,
    packet: &mut Packet,
) -> Result<Parsed> {
    let frame = RemoteFrame {
        kind,
        source_id: Uuid::from_bytes(msg.source_id),
        payload: &msg.payload,
        mlat_timestamp: msg.mlat_timestamp,
        rssi: msg.rssi as u64,
        hops: msg.hops,
    };
    accept_frame(state, frame, packet)
}

fn write_message(message: &Message, out: &mut Vec<u8>) -> Result<()> {
    let body =
        bincode::serialize(message).map_err(|e| AdsbusError::Codec(format!("bincode encode: {e}")))?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&n| n as usize <= BODY_LEN_MAX)
        .ok_or_else(|| AdsbusError::Codec(format!("message of {} bytes too large", body.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

pub fn serialize_header(server: &ServerInfo, out: &mut Vec<u8>) -> Result<()> {
    let header = Message::Header(HeaderMsg {
        magic: MAGIC.to_string(),
        server_version: server.version.to_string(),
        server_id: server.id.into_bytes(),
        mlat_timestamp_mhz: MLAT_MHZ,
        mlat_timestamp_max: MLAT_MAX,
        rssi_max: RSSI_MAX,
    });
    write_message(&header, out)
}

pub fn serialize(packet: &Packet, out: &mut Vec<u8>) -> Result<()> {
    let msg = PacketMsg {
        source_id: packet.source_id.into_bytes(),
        payload: packet.payload().to_vec(),
        mlat_timestamp: packet.mlat_timestamp % MLAT_MAX,
        rssi: packet.rssi,
        hops: packet.hops,
    };
    let message = match packet.kind {
        PacketKind::ModeAc => Message::ModeAc(msg),
        PacketKind::ModeSShort => Message::ModeSShort(msg),
        PacketKind::ModeSLong => Message::ModeSLong(msg),
    };
    write_message(&message, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(bytes: &[u8]) -> RingBuffer {
        let mut buf = RingBuffer::new();
        buf.fill(&mut &bytes[..]).unwrap();
        buf
    }

    #[test]
    fn test_roundtrip_preserves_metadata() {
        let server = ServerInfo::generate();
        let upstream = ServerInfo::generate();
        let mut packet = Packet::new(Uuid::new_v4());
        packet.set_payload(PacketKind::ModeSLong, &[0xAB; 14]);
        packet.mlat_timestamp = 123_456_789;
        packet.rssi = 4242;
        packet.hops = 4;

        let mut wire = Vec::new();
        serialize_header(&upstream, &mut wire).unwrap();
        serialize(&packet, &mut wire).unwrap();
        let mut buf = buffer(&wire);

        let mut out = Packet::new(Uuid::nil());
        let mut state = ParserState::default();
        assert_eq!(
            parse(&mut buf, &mut out, &mut state, &server).unwrap(),
            Some(Parsed::Control)
        );
        assert_eq!(
            parse(&mut buf, &mut out, &mut state, &server).unwrap(),
            Some(Parsed::Frame)
        );
        assert_eq!(out, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let server = ServerInfo::generate();
        let mut wire = Vec::new();
        serialize_header(&server, &mut wire).unwrap();
        let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(len + PREFIX_LEN, wire.len());
    }

    #[test]
    fn test_incomplete_body_waits() {
        let server = ServerInfo::generate();
        let mut wire = Vec::new();
        serialize_header(&ServerInfo::generate(), &mut wire).unwrap();
        wire.truncate(wire.len() - 1);
        let mut buf = buffer(&wire);
        let mut packet = Packet::new(Uuid::nil());
        let mut state = ParserState::default();
        assert_eq!(parse(&mut buf, &mut packet, &mut state, &server).unwrap(), None);
        assert_eq!(buf.len(), wire.len());
    }

    #[test]
    fn test_self_loop_header_rejected() {
        let server = ServerInfo::generate();
        let mut wire = Vec::new();
        serialize_header(&server, &mut wire).unwrap();
        let mut buf = buffer(&wire);
        let mut packet = Packet::new(Uuid::nil());
        let mut state = ParserState::default();
        assert!(matches!(
            parse(&mut buf, &mut packet, &mut state, &server),
            Err(AdsbusError::SelfLoop(_))
        ));
    }

    #[test]
    fn test_oversized_prefix_is_not_proto() {
        let server = ServerInfo::generate();
        let mut buf = buffer(b"*5D4840D6202CC3;\n");
        let mut packet = Packet::new(Uuid::nil());
        let mut state = ParserState::default();
        assert_eq!(parse(&mut buf, &mut packet, &mut state, &server).unwrap(), None);
    }
}
