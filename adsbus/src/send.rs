//! Send side: the dispatcher that fans packets out to every output.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use mio::Token;
use tracing::{debug, warn};
use uuid::Uuid;

use adsbus_core::{Encoder, Format, Packet, ServerInfo};

use crate::flow::{CloseTarget, PeerId};
use crate::stream::{Stream, StreamIdentity};

/// One output stream.
#[derive(Debug)]
pub struct SendPeer {
    pub id: Uuid,
    pub stream: Stream,
    pub format: Format,
    /// Set when the stream is watched for peer close. Bridge halves and
    /// regular files are not.
    pub token: Option<Token>,
    pub identity: Option<StreamIdentity>,
    pub close: CloseTarget,
    failed: bool,
}

impl SendPeer {
    pub fn new(stream: Stream, format: Format, close: CloseTarget) -> Self {
        let identity = stream.identity();
        SendPeer {
            id: Uuid::new_v4(),
            stream,
            format,
            token: None,
            identity,
            close,
            failed: false,
        }
    }
}

/// Routes every received packet to the send peers, serializing once per
/// output format.
#[derive(Debug)]
pub struct Dispatcher {
    max_hops: u16,
    encoders: BTreeMap<Format, Encoder>,
    peers: BTreeMap<PeerId, SendPeer>,
    failed: Vec<PeerId>,
}

impl Dispatcher {
    pub fn new(max_hops: u16) -> Self {
        Dispatcher {
            max_hops,
            encoders: BTreeMap::new(),
            peers: BTreeMap::new(),
            failed: Vec::new(),
        }
    }

    fn encoder(&mut self, format: Format) -> &mut Encoder {
        self.encoders
            .entry(format)
            .or_insert_with(|| Encoder::new(format))
    }

    /// Bytes a new stream of `format` must start with.
    pub fn greeting(&mut self, format: Format, server: &ServerInfo) -> adsbus_core::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encoder(format).greeting(server, &mut out)?;
        Ok(out)
    }

    pub fn insert(&mut self, id: PeerId, peer: SendPeer) {
        self.peers.insert(id, peer);
    }

    pub fn remove(&mut self, id: PeerId) -> Option<SendPeer> {
        self.peers.remove(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut SendPeer> {
        self.peers.get_mut(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = (PeerId, &SendPeer)> {
        self.peers.iter().map(|(&id, peer)| (id, peer))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers whose last write failed. They are already half-closed and wait
    /// for the bus to tear them down.
    pub fn take_failed(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.failed)
    }

    /// Forward `packet` to every send peer except the one sharing `origin`.
    /// Returns the number of peers written to.
    pub fn send_write(&mut self, packet: &mut Packet, origin: Option<&StreamIdentity>) -> usize {
        if packet.hops >= self.max_hops {
            debug!(hops = packet.hops, "dropping packet at hop limit");
            return 0;
        }
        packet.hops += 1;

        let formats: BTreeSet<Format> = self
            .peers
            .values()
            .filter(|p| !p.failed)
            .map(|p| p.format)
            .collect();

        let mut delivered = 0;
        for format in formats {
            let mut out = Vec::new();
            if let Err(e) = self.encoder(format).encode(packet, &mut out) {
                warn!("Failed to serialize packet as {format}: {e}");
                continue;
            }
            if out.is_empty() {
                continue;
            }
            for (&id, peer) in self.peers.iter_mut() {
                if peer.failed || peer.format != format {
                    continue;
                }
                if origin.is_some() && peer.identity.as_ref() == origin {
                    continue;
                }
                match peer.stream.write(&out) {
                    Ok(n) if n == out.len() => delivered += 1,
                    result => {
                        match result {
                            Ok(n) => warn!(peer = %peer.id, "Short write ({n} of {} bytes); disconnecting", out.len()),
                            Err(e) => warn!(peer = %peer.id, "Write failed: {e}; disconnecting"),
                        }
                        peer.stream.shutdown_write();
                        peer.failed = true;
                        self.failed.push(id);
                    }
                }
            }
        }
        delivered
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
