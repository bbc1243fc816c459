//! Wire formats.
//!
//! Every format parses out of a [`RingBuffer`] into a caller-owned [`Packet`]
//! and serializes into a byte vector. Parsers never consume bytes unless they
//! produce a frame or a control message, which is what lets [`Decoder`] try
//! them one after another on the same buffer during format detection.

pub mod airspy_adsb;
pub mod beast;
pub mod json;
pub mod proto;
pub mod raw;
pub mod stats;

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::buffer::RingBuffer;
use crate::packet::{mlat_scale_in, rssi_scale_in, valid_mhz, MlatState, Packet, PacketKind};
use crate::server::ServerInfo;
use crate::types::{AdsbusError, Result};

/// Header magic shared by the JSON and structured formats.
pub const MAGIC: &str = "aDsB";

// ---------------------------------------------------------------------------
// Format table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Format {
    AirspyAdsb,
    Beast,
    Json,
    Proto,
    Raw,
    /// Serialize-only packet counters.
    Stats,
}

impl Format {
    pub const ALL: [Format; 6] = [
        Format::AirspyAdsb,
        Format::Beast,
        Format::Json,
        Format::Proto,
        Format::Raw,
        Format::Stats,
    ];

    /// Detection priority for receive connections.
    pub const PARSE_ORDER: [Format; 5] = [
        Format::AirspyAdsb,
        Format::Beast,
        Format::Json,
        Format::Proto,
        Format::Raw,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Format::AirspyAdsb => "airspy_adsb",
            Format::Beast => "beast",
            Format::Json => "json",
            Format::Proto => "proto",
            Format::Raw => "raw",
            Format::Stats => "stats",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = AdsbusError;

    fn from_str(s: &str) -> Result<Self> {
        Format::from_name(s).ok_or_else(|| AdsbusError::UnknownFormat(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Parser state
// ---------------------------------------------------------------------------

/// What a successful parse produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    /// The packet was filled in.
    Frame,
    /// A handshake or other non-data message was consumed.
    Control,
}

/// Clock domain announced by an upstream bus in its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHeader {
    pub server_id: Uuid,
    pub server_version: String,
    pub mlat_mhz: u32,
    pub mlat_max: u64,
    pub rssi_max: u32,
}

/// Per-connection parser state.
#[derive(Debug, Clone, Default)]
pub struct ParserState {
    pub mlat: MlatState,
    /// Set once a JSON or structured header has been accepted.
    pub header: Option<RemoteHeader>,
}

/// Run one format's parser.
///
/// `Ok(None)` means "not enough data, or not this format". `Err` is a
/// protocol violation that should end the connection.
pub fn parse(
    format: Format,
    buf: &mut RingBuffer,
    packet: &mut Packet,
    state: &mut ParserState,
    server: &ServerInfo,
) -> Result<Option<Parsed>> {
    match format {
        Format::AirspyAdsb => Ok(airspy_adsb::parse(buf, packet, state)),
        Format::Beast => Ok(beast::parse(buf, packet, state)),
        Format::Json => json::parse(buf, packet, state, server),
        Format::Proto => proto::parse(buf, packet, state, server),
        Format::Raw => Ok(raw::parse(buf, packet)),
        Format::Stats => Ok(None),
    }
}

/// Header validation shared by JSON and the structured format.
fn accept_header(
    state: &mut ParserState,
    server: &ServerInfo,
    magic: &str,
    header: RemoteHeader,
) -> Result<Parsed> {
    if magic != MAGIC {
        return Err(AdsbusError::Codec(format!("bad header magic {magic:?}")));
    }
    if !valid_mhz(header.mlat_mhz) || header.mlat_max == 0 || header.rssi_max == 0 {
        return Err(AdsbusError::Codec(format!(
            "unusable clock in header: {} MHz, max {}, rssi max {}",
            header.mlat_mhz, header.mlat_max, header.rssi_max
        )));
    }
    if header.server_id == server.id {
        return Err(AdsbusError::SelfLoop(header.server_id.to_string()));
    }
    state.header = Some(header);
    Ok(Parsed::Control)
}

/// Packet fields as carried by JSON and the structured format, still in the
/// sender's clock domain.
struct RemoteFrame<'a> {
    kind: PacketKind,
    source_id: Uuid,
    payload: &'a [u8],
    mlat_timestamp: u64,
    rssi: u64,
    hops: u16,
}

fn accept_frame(state: &mut ParserState, frame: RemoteFrame<'_>, packet: &mut Packet) -> Result<Parsed> {
    let ParserState { mlat, header } = state;
    let header = header
        .as_ref()
        .ok_or_else(|| AdsbusError::Codec("packet before header".into()))?;
    if frame.payload.len() != frame.kind.payload_len() {
        return Err(AdsbusError::Codec(format!(
            "{} payload of {} bytes",
            frame.kind.name(),
            frame.payload.len()
        )));
    }
    if frame.rssi > header.rssi_max as u64 {
        return Err(AdsbusError::Codec(format!(
            "rssi {} above announced max {}",
            frame.rssi, header.rssi_max
        )));
    }

    packet.source_id = frame.source_id;
    packet.set_payload(frame.kind, frame.payload);
    packet.hops = frame.hops;
    packet.mlat_timestamp = if frame.mlat_timestamp == 0 {
        0
    } else {
        mlat_scale_in(frame.mlat_timestamp, header.mlat_max, header.mlat_mhz, mlat)
    };
    packet.rssi = rssi_scale_in(frame.rssi as u32, header.rssi_max);
    Ok(Parsed::Frame)
}

// ---------------------------------------------------------------------------
// Decoder: format detection + pinning
// ---------------------------------------------------------------------------

/// Receive-side codec for one connection.
///
/// Until a parser succeeds, each candidate runs against a snapshot of the
/// packet and parser state, so a candidate that fails partway cannot leak
/// fields into the next one. The first success pins the format.
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    format: Option<Format>,
    state: ParserState,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format detected so far, if any.
    pub fn format(&self) -> Option<Format> {
        self.format
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    pub fn decode(
        &mut self,
        buf: &mut RingBuffer,
        packet: &mut Packet,
        server: &ServerInfo,
    ) -> Result<Option<Parsed>> {
        if let Some(format) = self.format {
            return parse(format, buf, packet, &mut self.state, server);
        }

        for format in Format::PARSE_ORDER {
            let mut candidate = packet.clone();
            let mut state = self.state.clone();
            if let Some(parsed) = parse(format, buf, &mut candidate, &mut state, server)? {
                *packet = candidate;
                self.state = state;
                self.format = Some(format);
                return Ok(Some(parsed));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Send-side codec for one format. Holds the counters the stats format needs;
/// every other format is stateless.
#[derive(Debug)]
pub struct Encoder {
    format: Format,
    stats: stats::StatsState,
}

impl Encoder {
    pub fn new(format: Format) -> Self {
        Encoder {
            format,
            stats: stats::StatsState::new(),
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Bytes to write as soon as a new stream is usable. May be empty.
    pub fn greeting(&mut self, server: &ServerInfo, out: &mut Vec<u8>) -> Result<()> {
        match self.format {
            Format::Json => json::serialize_header(server, out),
            Format::Proto => proto::serialize_header(server, out),
            Format::Stats => self.stats.snapshot(out),
            Format::AirspyAdsb | Format::Beast | Format::Raw => Ok(()),
        }
    }

    /// Serialize one packet. Output may be empty (stats between reports).
    pub fn encode(&mut self, packet: &Packet, out: &mut Vec<u8>) -> Result<()> {
        match self.format {
            Format::AirspyAdsb => airspy_adsb::serialize(packet, out),
            Format::Beast => beast::serialize(packet, out),
            Format::Json => return json::serialize(packet, out),
            Format::Proto => return proto::serialize(packet, out),
            Format::Raw => raw::serialize(packet, out),
            Format::Stats => return self.stats.record(packet, out),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
