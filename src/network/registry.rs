//! Peer registry: the concurrent store of known peers.
//!
//! [`PeerRegistry`] is cheap to clone; every clone shares the same map. Each
//! operation takes the lock exactly once, so concurrent updates for different
//! peers never interleave inside an entry and readers always see whole
//! records.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::utils::{Result, SessionError};

/// Metadata about one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer id derived from the public key
    pub id: String,
    /// Host name or IP the peer is reachable at
    pub address: String,
    /// Port the peer is reachable at
    pub port: u16,
    /// Public key announced in the handshake
    pub public_key: Vec<u8>,
    /// Whether a live session is bound to this peer
    pub is_connected: bool,
    /// Last connection-state change
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    /// Create a disconnected peer entry
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16, public_key: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            public_key,
            is_connected: false,
            last_seen: Utc::now(),
        }
    }

    /// `address:port`, bracketing IPv6 literals
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// First eight characters of the id, for display
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(8)
            .map_or(self.id.len(), |(index, _)| index);
        &self.id[..end]
    }
}

/// Thread-safe registry of all known peers plus the local peer record.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerInfo>>>,
    local: Arc<OnceLock<PeerInfo>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a peer by id.
    pub fn upsert(&self, peer: PeerInfo) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(peer.id.clone(), peer);
    }

    /// Remove a peer entirely.
    pub fn remove(&self, peer_id: &str) -> Option<PeerInfo> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(peer_id)
    }

    /// Update the connection flag and refresh `last_seen`.
    ///
    /// Silently ignored when the peer is unknown; a disconnect can race a
    /// handshake that never got as far as registering the peer.
    pub fn set_connected(&self, peer_id: &str, connected: bool) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.is_connected = connected;
            entry.last_seen = Utc::now();
        }
    }

    /// Get a snapshot of a specific peer.
    pub fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(peer_id).cloned()
    }

    /// Get all peers (connected + disconnected).
    pub fn get_all(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Get all connected peers.
    pub fn get_connected(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().filter(|p| p.is_connected).cloned().collect()
    }

    /// Mark every peer disconnected.
    pub fn disconnect_all(&self) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        for entry in peers.values_mut().filter(|p| p.is_connected) {
            entry.is_connected = false;
            entry.last_seen = now;
        }
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk-insert peers loaded from storage.
    ///
    /// Loaded peers are never live, so they are stored disconnected. Entries
    /// already present (e.g. connected during startup) are left alone, and the
    /// local peer is skipped.
    pub fn seed(&self, loaded: Vec<PeerInfo>) -> usize {
        let local_id = self.local().map(|l| l.id);
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let mut added = 0;
        for mut peer in loaded {
            if Some(&peer.id) == local_id.as_ref() || peers.contains_key(&peer.id) {
                continue;
            }
            peer.is_connected = false;
            peers.insert(peer.id.clone(), peer);
            added += 1;
        }
        added
    }

    /// Snapshot of every peer for saving, ordered by id.
    pub fn export(&self) -> Vec<PeerInfo> {
        let mut all = self.get_all();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Set the local peer record. Only the first call succeeds.
    pub fn set_local(&self, local: PeerInfo) -> Result<()> {
        self.local
            .set(local)
            .map_err(|_| SessionError::LocalPeerAlreadySet.into())
    }

    /// The local peer record, if set.
    pub fn local(&self) -> Option<PeerInfo> {
        self.local.get().cloned()
    }
}
