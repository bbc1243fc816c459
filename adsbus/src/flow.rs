//! Bookkeeping that ties streams to the transports that produced them.
//!
//! A transport hands each usable stream to the bus together with a
//! [`CloseTarget`]. When the stream's peer closes, the target is told. A
//! send-receive stream becomes two peers sharing one bridge; the transport
//! hears about it only when both halves are gone.

use std::collections::BTreeMap;

use adsbus_core::Role;

/// Key of a peer or transport in the bus's maps.
pub type PeerId = u64;

pub type BridgeId = u64;

/// Transport to notify when its stream is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Outgoing(PeerId),
    Exec(PeerId),
    File(PeerId),
}

/// Who hears about a peer closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTarget {
    /// Accepted connections: nobody waits on them.
    None,
    Owner(Owner),
    Bridge(BridgeId),
}

impl From<Option<Owner>> for CloseTarget {
    fn from(owner: Option<Owner>) -> Self {
        owner.map_or(CloseTarget::None, CloseTarget::Owner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    Send,
    Receive,
}

/// Outcome of dropping one bridge reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeRelease {
    /// The other half is still open. `partner` is set when the halves share a
    /// socket and must be closed together.
    Partial { partner: Option<(Half, PeerId)> },
    /// Last reference dropped.
    Finished(Option<Owner>),
}

#[derive(Debug)]
struct Bridge {
    refs: u8,
    owner: Option<Owner>,
    send: PeerId,
    receive: PeerId,
    coupled: bool,
}

#[derive(Debug, Default)]
pub struct BridgeRegistry {
    bridges: BTreeMap<BridgeId, Bridge>,
    next_id: BridgeId,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Reserve an id; peers are attached once they exist.
    pub fn allocate(&mut self) -> BridgeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Start tracking a bridge with both halves open.
    pub fn open(&mut self, id: BridgeId, owner: Option<Owner>, send: PeerId, receive: PeerId, coupled: bool) {
        self.bridges.insert(
            id,
            Bridge {
                refs: 2,
                owner,
                send,
                receive,
                coupled,
            },
        );
    }

    pub fn owner(&self, id: BridgeId) -> Option<Owner> {
        self.bridges.get(&id).and_then(|b| b.owner)
    }

    /// Drop the reference held by `half`. Returns `None` for unknown ids, so
    /// repeated releases are harmless.
    pub fn release(&mut self, id: BridgeId, half: Half) -> Option<BridgeRelease> {
        let bridge = self.bridges.get_mut(&id)?;
        bridge.refs = bridge.refs.saturating_sub(1);
        if bridge.refs == 0 {
            return self.bridges.remove(&id).map(|b| BridgeRelease::Finished(b.owner));
        }
        let partner = bridge.coupled.then_some(match half {
            Half::Send => (Half::Receive, bridge.receive),
            Half::Receive => (Half::Send, bridge.send),
        });
        Some(BridgeRelease::Partial { partner })
    }
}

/// Live transports per role. The bus stops once no input or no output is
/// left. Bridged transports count as both.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowCounts {
    pub receive: usize,
    pub send: usize,
    pub send_receive: usize,
}

impl FlowCounts {
    fn slot(&mut self, role: Role) -> &mut usize {
        match role {
            Role::Receive => &mut self.receive,
            Role::Send(_) => &mut self.send,
            Role::SendReceive(_) => &mut self.send_receive,
        }
    }

    pub fn add(&mut self, role: Role) {
        *self.slot(role) += 1;
    }

    pub fn remove(&mut self, role: Role) {
        let slot = self.slot(role);
        *slot = slot.saturating_sub(1);
    }

    pub fn inputs(&self) -> usize {
        self.receive + self.send_receive
    }

    pub fn outputs(&self) -> usize {
        self.send + self.send_receive
    }

    pub fn is_live(&self) -> bool {
        self.inputs() > 0 && self.outputs() > 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
