//! Canonical packet representation and clock/amplitude normalization.
//!
//! Every codec converts between its wire clock (frequency + counter width)
//! and the canonical 120 MHz / `i64::MAX` domain, and between its wire RSSI
//! scale and the canonical `u32::MAX` linear scale.

use uuid::Uuid;

/// Canonical MLAT clock frequency.
pub const MLAT_MHZ: u32 = 120;
/// Canonical MLAT modulus. Signed max keeps consumers with signed integers happy.
pub const MLAT_MAX: u64 = i64::MAX as u64;
/// Canonical RSSI ceiling.
pub const RSSI_MAX: u32 = u32::MAX;
/// Largest payload of any packet kind.
pub const PAYLOAD_LEN_MAX: usize = 14;

// ---------------------------------------------------------------------------
// Packet kinds
// ---------------------------------------------------------------------------

/// The three raw payload lengths the bus recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketKind {
    ModeAc,
    ModeSShort,
    ModeSLong,
}

impl PacketKind {
    pub const ALL: [PacketKind; 3] = [
        PacketKind::ModeAc,
        PacketKind::ModeSShort,
        PacketKind::ModeSLong,
    ];

    /// Payload bytes carried by this kind.
    pub fn payload_len(self) -> usize {
        match self {
            PacketKind::ModeAc => 2,
            PacketKind::ModeSShort => 7,
            PacketKind::ModeSLong => 14,
        }
    }

    /// Human-readable name, as used on the JSON wire.
    pub fn name(self) -> &'static str {
        match self {
            PacketKind::ModeAc => "Mode-AC",
            PacketKind::ModeSShort => "Mode-S short",
            PacketKind::ModeSLong => "Mode-S long",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn from_payload_len(len: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.payload_len() == len)
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One decoded frame in the canonical clock and amplitude domains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Receive connection (or upstream relay) the packet came from.
    pub source_id: Uuid,
    pub kind: PacketKind,
    /// Only the first `kind.payload_len()` bytes are meaningful.
    pub payload: [u8; PAYLOAD_LEN_MAX],
    /// 0 = unknown.
    pub mlat_timestamp: u64,
    /// 0 = unknown.
    pub rssi: u32,
    pub hops: u16,
}

impl Packet {
    /// Blank packet attributed to `source_id`, ready for a parser to fill.
    pub fn new(source_id: Uuid) -> Self {
        Packet {
            source_id,
            kind: PacketKind::ModeSShort,
            payload: [0; PAYLOAD_LEN_MAX],
            mlat_timestamp: 0,
            rssi: 0,
            hops: 0,
        }
    }

    /// The meaningful prefix of the payload buffer.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.kind.payload_len()]
    }

    /// Set kind and payload together. `data` must be `kind.payload_len()` long.
    pub fn set_payload(&mut self, kind: PacketKind, data: &[u8]) {
        let len = kind.payload_len().min(data.len());
        self.kind = kind;
        self.payload = [0; PAYLOAD_LEN_MAX];
        self.payload[..len].copy_from_slice(&data[..len]);
    }

    /// Mutable view of the payload for `kind`, zeroing anything past it.
    pub fn payload_mut(&mut self, kind: PacketKind) -> &mut [u8] {
        self.kind = kind;
        self.payload = [0; PAYLOAD_LEN_MAX];
        &mut self.payload[..kind.payload_len()]
    }
}

// ---------------------------------------------------------------------------
// MLAT timestamp scaling
// ---------------------------------------------------------------------------

/// Per-parser wraparound tracking for a hardware MLAT counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MlatState {
    pub timestamp_last: u64,
    pub timestamp_generation: u64,
}

/// True if `mhz` is a clock the canonical domain can represent.
pub fn valid_mhz(mhz: u32) -> bool {
    mhz > 0 && mhz <= MLAT_MHZ
}

fn mhz_factor(mhz: u32) -> u64 {
    (MLAT_MHZ / mhz.clamp(1, MLAT_MHZ)) as u64
}

/// Widen a wrapping counter of modulus `max` at `mhz` into the canonical domain.
///
/// A value smaller than the previous one counts as a counter reset and bumps
/// the generation by `max`.
pub fn mlat_scale_in(timestamp: u64, max: u64, mhz: u32, state: &mut MlatState) -> u64 {
    if timestamp < state.timestamp_last {
        state.timestamp_generation = state.timestamp_generation.wrapping_add(max);
    }
    state.timestamp_last = timestamp;
    state
        .timestamp_generation
        .wrapping_add(timestamp)
        .wrapping_mul(mhz_factor(mhz))
}

/// Narrow a canonical timestamp to a counter of modulus `max` at `mhz`.
pub fn mlat_scale_out(timestamp: u64, max: u64, mhz: u32) -> u64 {
    let scaled = timestamp / mhz_factor(mhz);
    if max == 0 {
        scaled
    } else {
        scaled % max
    }
}

// ---------------------------------------------------------------------------
// RSSI scaling
// ---------------------------------------------------------------------------

fn rssi_factor(max: u32) -> u32 {
    RSSI_MAX / max.max(1)
}

/// Scale a wire RSSI with ceiling `max` into the canonical linear scale.
pub fn rssi_scale_in(value: u32, max: u32) -> u32 {
    value.wrapping_mul(rssi_factor(max))
}

/// Scale a canonical RSSI down to a wire ceiling of `max`.
pub fn rssi_scale_out(value: u32, max: u32) -> u32 {
    value / rssi_factor(max)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
