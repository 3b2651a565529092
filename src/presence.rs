// Presence Store
//
// Last-known locations of the other members of the active group. Mutated only
// by the session dispatcher's three inbound event paths (snapshot, incremental
// update, departure) plus the membership-destroying clear; read-only to every
// other consumer.

use crate::protocol::PeerLocation;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Peer id → last-known location for the active group.
///
/// Events are applied strictly in arrival order: if samples from the same peer
/// arrive out of network order, the last-arrived value wins even when it is
/// chronologically older. Staleness display is a UI concern, not a store
/// concern; entries are never expired here.
pub struct PresenceStore {
    peers: Arc<RwLock<HashMap<String, PeerLocation>>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the whole map from a snapshot, dropping any entry whose peer id
    /// equals self
    pub(crate) async fn apply_snapshot(&self, entries: Vec<PeerLocation>, self_peer: Option<&str>) {
        let mut peers = self.peers.write().await;
        peers.clear();
        for entry in entries {
            if Some(entry.peer_id.as_str()) == self_peer {
                continue;
            }
            peers.insert(entry.peer_id.clone(), entry);
        }
    }

    /// Upsert a single peer, leaving all others untouched.
    ///
    /// Returns false when the entry was self and therefore dropped.
    pub(crate) async fn apply_update(&self, entry: PeerLocation, self_peer: Option<&str>) -> bool {
        if Some(entry.peer_id.as_str()) == self_peer {
            return false;
        }
        let mut peers = self.peers.write().await;
        peers.insert(entry.peer_id.clone(), entry);
        true
    }

    /// Remove a departed peer
    pub(crate) async fn apply_departure(&self, peer_id: &str) -> Option<PeerLocation> {
        let mut peers = self.peers.write().await;
        peers.remove(peer_id)
    }

    /// Drop every entry; invoked on any membership-destroying transition
    pub(crate) async fn clear(&self) {
        let mut peers = self.peers.write().await;
        peers.clear();
    }

    /// Current peer list
    pub async fn snapshot(&self) -> Vec<PeerLocation> {
        let peers = self.peers.read().await;
        peers.values().cloned().collect()
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerLocation> {
        let peers = self.peers.read().await;
        peers.get(peer_id).cloned()
    }

    pub async fn len(&self) -> usize {
        let peers = self.peers.read().await;
        peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        let peers = self.peers.read().await;
        peers.is_empty()
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}
