//! Status events for front-ends: peer list changes, discovery health, transfer progress.

use tokio::sync::broadcast;

use crate::error::FailureKind;
use crate::integrity::ContentHash;
use crate::protocol::FileId;
use crate::registry::PeerRecord;
use crate::session::Direction;
use crate::transport::PeerAddress;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    PeerFound(PeerRecord),
    PeerLost(PeerRecord),
    /// Full list after a scan changed it, most recently seen first.
    PeersChanged(Vec<PeerRecord>),
    Discovery(DiscoveryStatus),
    InboundConnection {
        peer: PeerAddress,
    },
    TransferProgress {
        peer: PeerAddress,
        file_id: FileId,
        direction: Direction,
        bytes: u64,
        total: u64,
    },
    TransferFinished {
        peer: PeerAddress,
        file_id: FileId,
        direction: Direction,
        status: TransferStatus,
    },
}

/// Non-fatal health of the discovery loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStatus {
    ScanCompleted { hits: usize },
    ScanFailed(String),
    Advertised,
    AdvertiseFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed { bytes: u64, hash: ContentHash },
    Failed(FailureKind),
}

/// Cloneable handle that publishes events; sending with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new(64)
    }
}
