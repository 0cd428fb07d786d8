//! In-memory transport, catalog and sink.
//!
//! `MemoryNetwork` simulates a neighbourhood of hosts: scan/advertise go through a shared
//! table and connections are `tokio::io::duplex` pipes. Used by the tests and usable by
//! hosts that want to exercise the engine without radio hardware.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::catalog::{ByteSource, Catalog, FileSink};
use crate::integrity::{hash_bytes, ContentHash};
use crate::protocol::{FileId, SharedFileEntry};
use crate::transport::{
    BoxConnection, DiscoveredDevice, Inbound, PeerAddress, ServiceRecord, Transport,
    TransportError,
};

/// Buffer size of each simulated connection.
const PIPE_CAPACITY: usize = 64 * 1024;

struct Node {
    name: String,
    services: Vec<Uuid>,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    in_range: bool,
}

/// Shared neighbourhood. Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<PeerAddress, Node>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<PeerAddress, Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a host to the network and return its transport.
    pub fn transport(&self, address: impl Into<String>, name: impl Into<String>) -> MemoryTransport {
        let address = PeerAddress::new(address);
        let name = name.into();
        self.nodes().insert(
            address.clone(),
            Node {
                name: name.clone(),
                services: Vec::new(),
                inbound: None,
                in_range: true,
            },
        );
        MemoryTransport {
            network: self.clone(),
            address,
            fail_scans: Arc::new(AtomicBool::new(false)),
            failing_connects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Move a host in or out of range. Out-of-range hosts are not scanned and refuse connections.
    pub fn set_in_range(&self, address: &PeerAddress, in_range: bool) {
        if let Some(node) = self.nodes().get_mut(address) {
            node.in_range = in_range;
        }
    }
}

/// One host's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: PeerAddress,
    fail_scans: Arc<AtomicBool>,
    failing_connects: Arc<AtomicU32>,
}

impl MemoryTransport {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Make every scan fail with `Unavailable` until switched back.
    pub fn set_scan_failure(&self, fail: bool) {
        self.fail_scans.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn scan(&self) -> Result<BoxStream<'static, DiscoveredDevice>, TransportError> {
        if self.fail_scans.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("radio switched off".into()));
        }
        let devices: Vec<DiscoveredDevice> = self
            .network
            .nodes()
            .iter()
            .filter(|(addr, node)| **addr != self.address && node.in_range)
            .map(|(addr, node)| DiscoveredDevice {
                address: addr.clone(),
                name: node.name.clone(),
                service_ids: node.services.clone(),
            })
            .collect();
        Ok(stream::iter(devices).boxed())
    }

    async fn advertise(&self, service: &ServiceRecord) -> Result<(), TransportError> {
        let mut nodes = self.network.nodes();
        let node = nodes
            .get_mut(&self.address)
            .ok_or_else(|| TransportError::Unavailable("host left the network".into()))?;
        node.name = service.display_name.clone();
        if !node.services.contains(&service.service_id) {
            node.services.push(service.service_id);
        }
        Ok(())
    }

    async fn listen(
        &self,
    ) -> Result<BoxStream<'static, Result<Inbound, TransportError>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut nodes = self.network.nodes();
        let node = nodes
            .get_mut(&self.address)
            .ok_or_else(|| TransportError::Unavailable("host left the network".into()))?;
        node.inbound = Some(tx);
        let incoming = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|inbound| (Ok(inbound), rx))
        });
        Ok(incoming.boxed())
    }

    async fn connect(&self, address: &PeerAddress) -> Result<BoxConnection, TransportError> {
        let pending_failures = self.failing_connects.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_connects.store(pending_failures - 1, Ordering::SeqCst);
            return Err(TransportError::Connect {
                address: address.clone(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "link dropped"),
            });
        }
        let inbound = {
            let nodes = self.network.nodes();
            match nodes.get(address) {
                Some(node) if node.in_range => node.inbound.clone(),
                _ => None,
            }
        };
        let inbound = inbound.ok_or_else(|| TransportError::Unreachable(address.clone()))?;
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        inbound
            .send(Inbound {
                peer: self.address.clone(),
                connection: Box::new(remote),
            })
            .map_err(|_| TransportError::Unreachable(address.clone()))?;
        Ok(Box::new(local))
    }
}

#[derive(Default)]
struct CatalogState {
    shared: BTreeMap<FileId, (SharedFileEntry, Arc<Vec<u8>>)>,
    received: HashMap<FileId, Vec<u8>>,
    discarded: Vec<FileId>,
}

/// Catalog holding shared files and completed downloads in memory.
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Share `data` under `name`. The hash is computed here, once.
    pub fn add(&self, name: &str, data: impl Into<Vec<u8>>) -> SharedFileEntry {
        let data = data.into();
        let hash = hash_bytes(&data);
        self.add_with_hash(name, data, hash)
    }

    /// Share `data` with a caller-supplied hash, e.g. to model a file edited after it was shared.
    pub fn add_with_hash(
        &self,
        name: &str,
        data: impl Into<Vec<u8>>,
        hash: ContentHash,
    ) -> SharedFileEntry {
        let data = data.into();
        let entry = SharedFileEntry {
            id: FileId::new(name),
            name: name.to_string(),
            size: data.len() as u64,
            hash,
        };
        self.state()
            .shared
            .insert(entry.id.clone(), (entry.clone(), Arc::new(data)));
        entry
    }

    pub fn remove(&self, id: &FileId) {
        self.state().shared.remove(id);
    }

    /// Committed download content.
    pub fn received(&self, id: &FileId) -> Option<Vec<u8>> {
        self.state().received.get(id).cloned()
    }

    /// Ids of downloads that were discarded, in order.
    pub fn discarded(&self) -> Vec<FileId> {
        self.state().discarded.clone()
    }

    /// Standalone sink writing into this catalog's received set.
    pub fn sink(&self, id: &FileId) -> Box<dyn FileSink> {
        Box::new(MemorySink {
            id: id.clone(),
            data: Vec::new(),
            catalog: self.clone(),
        })
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn list_entries(&self) -> io::Result<Vec<SharedFileEntry>> {
        Ok(self.state().shared.values().map(|(e, _)| e.clone()).collect())
    }

    async fn open_for_read(&self, id: &FileId) -> io::Result<Option<ByteSource>> {
        let data = self.state().shared.get(id).map(|(_, d)| d.clone());
        Ok(data.map(|d| Box::new(io::Cursor::new(d.to_vec())) as ByteSource))
    }

    async fn open_for_write(&self, entry: &SharedFileEntry) -> io::Result<Box<dyn FileSink>> {
        Ok(self.sink(&entry.id))
    }
}

/// Buffers a download; commit publishes it to the owning catalog.
pub struct MemorySink {
    id: FileId,
    data: Vec<u8>,
    catalog: MemoryCatalog,
}

#[async_trait]
impl FileSink for MemorySink {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> io::Result<()> {
        let MemorySink { id, data, catalog } = *self;
        catalog.state().received.insert(id, data);
        Ok(())
    }

    async fn discard(self: Box<Self>) -> io::Result<()> {
        self.catalog.state().discarded.push(self.id.clone());
        Ok(())
    }
}
