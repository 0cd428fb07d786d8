//! Peer registry: engine-scoped record of discovered peers and when each was last seen.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::transport::PeerAddress;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: PeerAddress,
    pub display_name: String,
    pub service_id: Uuid,
    pub last_seen: Instant,
}

/// Concurrency-safe map from peer address to record. Only the scanner writes to it.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerAddress, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Returns true if the address was not known.
    /// A refresh never moves `last_seen` backwards.
    pub async fn upsert(&self, record: PeerRecord) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(&record.address) {
            Some(existing) => {
                if record.last_seen >= existing.last_seen {
                    *existing = record;
                }
                false
            }
            None => {
                peers.insert(record.address.clone(), record);
                true
            }
        }
    }

    /// Drop peers unseen for longer than `window`. Returns the removed records.
    pub async fn prune(&self, window: Duration, now: Instant) -> Vec<PeerRecord> {
        let mut peers = self.peers.write().await;
        let stale: Vec<PeerAddress> = peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > window)
            .map(|p| p.address.clone())
            .collect();
        stale.iter().filter_map(|a| peers.remove(a)).collect()
    }

    /// All known peers, most recently seen first.
    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        let peers = self.peers.read().await;
        let mut out: Vec<PeerRecord> = peers.values().cloned().collect();
        out.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.address.cmp(&b.address))
        });
        out
    }

    pub async fn get(&self, address: &PeerAddress) -> Option<PeerRecord> {
        self.peers.read().await.get(address).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
