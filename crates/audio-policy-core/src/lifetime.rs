//! Peer lifetime bookkeeping
//!
//! Records, per client token, which parts of the service hold state on the
//! peer's behalf. The host reports peer death once; the service looks up the
//! links here and undoes each through its normal release path.

use dashmap::DashMap;
use tracing::trace;

use crate::types::{ClientToken, StreamMask};

/// State held for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerLinks {
    /// Streams the peer has muted
    pub muted: StreamMask,
    /// The peer holds SCO starts
    pub sco: bool,
    /// The peer is on the mode stack
    pub mode: bool,
}

impl PeerLinks {
    pub fn is_empty(&self) -> bool {
        self.muted == StreamMask::EMPTY && !self.sco && !self.mode
    }
}

/// Death links of every live peer
#[derive(Debug, Default)]
pub struct PeerLifetimeRegistry {
    peers: DashMap<ClientToken, PeerLinks>,
}

impl PeerLifetimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the links of a peer; an empty set unlinks it
    pub fn set(&self, token: ClientToken, links: PeerLinks) {
        if links.is_empty() {
            if self.peers.remove(&token).is_some() {
                trace!(%token, "peer unlinked");
            }
        } else {
            trace!(%token, ?links, "peer linked");
            self.peers.insert(token, links);
        }
    }

    pub fn get(&self, token: &ClientToken) -> Option<PeerLinks> {
        self.peers.get(token).map(|l| *l)
    }

    pub fn is_linked(&self, token: &ClientToken) -> bool {
        self.peers.contains_key(token)
    }

    /// Remove and return the links of a dead peer
    pub fn take(&self, token: &ClientToken) -> Option<PeerLinks> {
        self.peers.remove(token).map(|(_, links)| links)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
