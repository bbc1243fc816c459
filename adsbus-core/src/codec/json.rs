//! JSON-lines format.
//!
//! Each connection starts with a header object announcing the sender's clock
//! domain and server id; every later line is one packet.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::buffer::RingBuffer;
use crate::codec::{accept_frame, accept_header, ParserState, Parsed, RemoteFrame, RemoteHeader, MAGIC};
use crate::packet::{Packet, PacketKind, MLAT_MAX, MLAT_MHZ, PAYLOAD_LEN_MAX, RSSI_MAX};
use crate::server::ServerInfo;
use crate::types::{hex_decode_into, hex_encode, AdsbusError, Result};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Message {
    #[serde(rename = "header")]
    Header(HeaderMsg),
    #[serde(rename = "Mode-AC")]
    ModeAc(PacketMsg),
    #[serde(rename = "Mode-S short")]
    ModeSShort(PacketMsg),
    #[serde(rename = "Mode-S long")]
    ModeSLong(PacketMsg),
}

#[derive(Debug, Serialize, Deserialize)]
struct HeaderMsg {
    magic: String,
    server_version: String,
    server_id: Uuid,
    mlat_timestamp_mhz: u64,
    mlat_timestamp_max: u64,
    rssi_max: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PacketMsg {
    source_id: Uuid,
    payload: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    mlat_timestamp: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    rssi: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    hops: u16,
}

fn is_zero<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}

pub fn parse(
    buf: &mut RingBuffer,
    packet: &mut Packet,
    state: &mut ParserState,
    server: &ServerInfo,
) -> Result<Option<Parsed>> {
    let data = buf.data();
    let (message, mut consumed) = {
        let mut stream = serde_json::Deserializer::from_slice(data).into_iter::<Message>();
        match stream.next() {
            Some(Ok(message)) => (message, stream.byte_offset()),
            // Incomplete line, whitespace only, or not JSON at all.
            Some(Err(_)) | None => return Ok(None),
        }
    };
    while matches!(data.get(consumed), Some(b'\r' | b'\n')) {
        consumed += 1;
    }

    let parsed = match message {
        Message::Header(h) => {
            let header = RemoteHeader {
                server_id: h.server_id,
                server_version: h.server_version,
                mlat_mhz: u32::try_from(h.mlat_timestamp_mhz).unwrap_or(0),
                mlat_max: h.mlat_timestamp_max,
                rssi_max: u32::try_from(h.rssi_max).unwrap_or(0),
            };
            accept_header(state, server, &h.magic, header)?
        }
        Message::ModeAc(p) => accept_packet(state, PacketKind::ModeAc, p, packet)?,
        Message::ModeSShort(p) => accept_packet(state, PacketKind::ModeSShort, p, packet)?,
        Message::ModeSLong(p) => accept_packet(state, PacketKind::ModeSLong, p, packet)?,
    };
    buf.consume(consumed)?;
    Ok(Some(parsed))
}

fn accept_packet(
    state: &mut ParserState,
    kind: PacketKind,
    msg: PacketMsg,
    packet: &mut Packet,
) -> Result<Parsed> {
    let mut payload = [0u8; PAYLOAD_LEN_MAX];
    let len = kind.payload_len();
    if !hex_decode_into(&mut payload[..len], msg.payload.as_bytes()) {
        return Err(AdsbusError::InvalidHex(msg.payload));
    }
    let frame = RemoteFrame {
        kind,
        source_id: msg.source_id,
        payload: &payload[..len],
        mlat_timestamp: msg.mlat_timestamp,
        rssi: msg.rssi,
        hops: msg.hops,
    };
    accept_frame(state, frame, packet)
}

fn write_line(message: &Message, out: &mut Vec<u8>) -> Result<()> {
    serde_json::to_writer(&mut *out, message)
        .map_err(|e| AdsbusError::Codec(format!("json encode: {e}")))?;
    out.push(b'\n');
    Ok(())
}

pub fn serialize_header(server: &ServerInfo, out: &mut Vec<u8>) -> Result<()> {
    let header = Message::Header(HeaderMsg {
        magic: MAGIC.to_string(),
        server_version: server.version.to_string(),
        server_id: server.id,
        mlat_timestamp_mhz: MLAT_MHZ as u64,
        mlat_timestamp_max: MLAT_MAX,
        rssi_max: RSSI_MAX as u64,
    });
    write_line(&header, out)
}

pub fn serialize(packet: &Packet, out: &mut Vec<u8>) -> Result<()> {
    let msg = PacketMsg {
        source_id: packet.source_id,
        payload: hex_encode(packet.payload()),
        mlat_timestamp: packet.mlat_timestamp % MLAT_MAX,
        rssi: packet.rssi as u64,
        hops: packet.hops,
    };
    let message = match packet.kind {
        PacketKind::ModeAc => Message::ModeAc(msg),
        PacketKind::ModeSShort => Message::ModeSShort(msg),
        PacketKind::ModeSLong => Message::ModeSLong(msg),
    };
    write_line(&message, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(bytes: &[u8]) -> RingBuffer {
        let mut buf = RingBuffer::new();
        buf.fill(&mut &bytes[..]).unwrap();
        buf
    }

    fn header_bytes(server: &ServerInfo) -> Vec<u8> {
        let mut out = Vec::new();
        serialize_header(server, &mut out).unwrap();
        out
    }

    #[test]
    fn test_header_shape() {
        let server = ServerInfo::generate();
        let text = String::from_utf8(header_bytes(&server)).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["type"], "header");
        assert_eq!(value["magic"], "aDsB");
        assert_eq!(value["server_id"], server.id.to_string());
        assert_eq!(value["mlat_timestamp_mhz"], 120);
        assert_eq!(value["mlat_timestamp_max"], i64::MAX);
        assert_eq!(value["rssi_max"], u32::MAX);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_packet_shape_omits_unknowns() {
        let mut packet = Packet::new(Uuid::new_v4());
        packet.set_payload(PacketKind::ModeSShort, &[0x5D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3]);
        let mut out = Vec::new();
        serialize(&packet, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["type"], "Mode-S short");
        assert_eq!(value["payload"], "5D4840D6202CC3");
        assert!(value.get("mlat_timestamp").is_none());
        assert!(value.get("rssi").is_none());
        assert!(value.get("hops").is_none());
    }

    #[test]
    fn test_self_loop_header_rejected() {
        let server = ServerInfo::generate();
        let mut buf = buffer(&header_bytes(&server));
        let mut packet = Packet::new(Uuid::nil());
        let mut state = ParserState::default();
        let err = parse(&mut buf, &mut packet, &mut state, &server).unwrap_err();
        assert!(matches!(err, AdsbusError::SelfLoop(_)));
        assert!(state.header.is_none());
    }

    #[test]
    fn test_packet_before_header_rejected() {
        let server = ServerInfo::generate();
        let mut packet = Packet::new(Uuid::new_v4());
        packet.set_payload(PacketKind::ModeAc, &[1, 2]);
        let mut wire = Vec::new();
        serialize(&packet, &mut wire).unwrap();
        let mut buf = buffer(&wire);
        let mut state = ParserState::default();
        assert!(parse(&mut buf, &mut packet, &mut state, &server).is_err());
    }

    #[test]
    fn test_remote_clock_applied() {
        let server = ServerInfo::generate();
        let upstream = Uuid::new_v4();
        let source = Uuid::new_v4();
        let wire = format!(
            "{{\"type\":\"header\",\"magic\":\"aDsB\",\"server_version\":\"x\",\"server_id\":\"{upstream}\",\
             \"mlat_timestamp_mhz\":12,\"mlat_timestamp_max\":281474976710655,\"rssi_max\":255}}\r\n\
             {{\"type\":\"Mode-S long\",\"source_id\":\"{source}\",\"payload\":\"8D4840D6202CC371C32CE0576098\",\
             \"mlat_timestamp\":100,\"rssi\":255,\"hops\":3}}\n"
        );
        let mut buf = buffer(wire.as_bytes());
        let mut packet = Packet::new(Uuid::nil());
        let mut state = ParserState::default();
        assert_eq!(
            parse(&mut buf, &mut packet, &mut state, &server).unwrap(),
            Some(Parsed::Control)
        );
        assert_eq!(state.header.as_ref().unwrap().server_id, upstream);
        assert_eq!(
            parse(&mut buf, &mut packet, &mut state, &server).unwrap(),
            Some(Parsed::Frame)
        );
        assert!(buf.is_empty());
        assert_eq!(packet.source_id, source);
        assert_eq!(packet.kind, PacketKind::ModeSLong);
        assert_eq!(packet.mlat_timestamp, 1000);
        assert_eq!(packet.rssi, u32::MAX);
        assert_eq!(packet.hops, 3);
    }

    #[test]
    fn test_partial_line_waits() {
        let server = ServerInfo::generate();
        let mut buf = buffer(b"{\"type\":\"head");
        let mut packet = Packet::new(Uuid::nil());
        let mut state = ParserState::default();
        assert_eq!(parse(&mut buf, &mut packet, &mut state, &server).unwrap(), None);
        assert_eq!(buf.len(), 13);
    }

    #[test]
    fn test_rssi_above_announced_max_rejected() {
        let server = ServerInfo::generate();
        let wire = format!(
            "{{\"type\":\"header\",\"magic\":\"aDsB\",\"server_version\":\"x\",\"server_id\":\"{}\",\
             \"mlat_timestamp_mhz\":120,\"mlat_timestamp_max\":100,\"rssi_max\":10}}\n\
             {{\"type\":\"Mode-AC\",\"source_id\":\"{}\",\"payload\":\"0102\",\"rssi\":11}}\n",
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let mut buf = buffer(wire.as_bytes());
        let mut packet = Packet::new(Uuid::nil());
        let mut state = ParserState::default();
        parse(&mut buf, &mut packet, &mut state, &server).unwrap();
        assert!(parse(&mut buf, &mut packet, &mut state, &server).is_err());
    }
}
