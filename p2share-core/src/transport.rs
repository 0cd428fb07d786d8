//! Transport capability: what the engine needs from a platform binding.
//!
//! A binding scans for nearby devices, registers the local service, accepts inbound
//! connections and dials peers. Connections are plain async byte streams; message
//! boundaries come from the wire codec.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Transport-level peer identifier (device address). Unique per peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(pub String);

impl PeerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        PeerAddress(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        PeerAddress(s.to_string())
    }
}

/// Byte stream to one peer. Dropping it closes the connection.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

pub type BoxConnection = Box<dyn Connection>;

/// One scan hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: PeerAddress,
    pub name: String,
    pub service_ids: Vec<Uuid>,
}

/// Service registration announced by the local host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_id: Uuid,
    pub protocol_version: u8,
    pub service_name: String,
    pub display_name: String,
}

/// Connection accepted from a peer.
pub struct Inbound {
    pub peer: PeerAddress,
    pub connection: BoxConnection,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("connect to {address} failed: {source}")]
    Connect {
        address: PeerAddress,
        #[source]
        source: std::io::Error,
    },
    #[error("no peer at {0}")]
    Unreachable(PeerAddress),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Query nearby devices. Every call performs a fresh scan.
    async fn scan(&self) -> Result<BoxStream<'static, DiscoveredDevice>, TransportError>;

    /// Register (or refresh) the local service so other hosts' scans find it.
    async fn advertise(&self, service: &ServiceRecord) -> Result<(), TransportError>;

    /// Start accepting inbound connections. The stream ends if the binding stops listening.
    async fn listen(
        &self,
    ) -> Result<BoxStream<'static, Result<Inbound, TransportError>>, TransportError>;

    async fn connect(&self, address: &PeerAddress) -> Result<BoxConnection, TransportError>;
}
