//! Stats pseudo-format: periodic JSON packet counters instead of packets.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

use crate::packet::{Packet, PacketKind};
use crate::types::{AdsbusError, Result};

/// A report is written every this many packets.
pub const REPORT_INTERVAL: u64 = 1000;

#[derive(Debug, Serialize)]
struct Report {
    uptime_seconds: u64,
    packet_counts: BTreeMap<&'static str, u64>,
}

#[derive(Debug)]
pub struct StatsState {
    start: Instant,
    total: u64,
    counts: BTreeMap<PacketKind, u64>,
}

impl Default for StatsState {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsState {
    pub fn new() -> Self {
        StatsState {
            start: Instant::now(),
            total: 0,
            counts: PacketKind::ALL.into_iter().map(|k| (k, 0)).collect(),
        }
    }

    #[cfg(test)]
    fn total(&self) -> u64 {
        self.total
    }

    /// Count `packet`; emit a report on every [`REPORT_INTERVAL`]th one.
    pub fn record(&mut self, packet: &Packet, out: &mut Vec<u8>) -> Result<()> {
        self.total += 1;
        *self.counts.entry(packet.kind).or_insert(0) += 1;
        if self.total % REPORT_INTERVAL == 0 {
            self.snapshot(out)?;
        }
        Ok(())
    }

    /// Emit the current counters unconditionally.
    pub fn snapshot(&self, out: &mut Vec<u8>) -> Result<()> {
        let report = Report {
            uptime_seconds: self.start.elapsed().as_secs(),
            packet_counts: self.counts.iter().map(|(k, &v)| (k.name(), v)).collect(),
        };
        serde_json::to_writer(&mut *out, &report)
            .map_err(|e| AdsbusError::Codec(format!("stats encode: {e}")))?;
        out.push(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_reports_every_interval() {
        let mut stats = StatsState::new();
        let mut packet = Packet::new(Uuid::nil());
        packet.set_payload(PacketKind::ModeSLong, &[0; 14]);
        let mut out = Vec::new();
        for _ in 0..REPORT_INTERVAL - 1 {
            stats.record(&packet, &mut out).unwrap();
        }
        assert!(out.is_empty());
        stats.record(&packet, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["packet_counts"]["Mode-S long"], 1000);
        assert_eq!(value["packet_counts"]["Mode-S short"], 0);
        assert_eq!(value["uptime_seconds"], 0);
        assert_eq!(stats.total(), 1000);
    }
}
