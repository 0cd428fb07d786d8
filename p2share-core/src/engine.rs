//! Engine: owns the registry and the background loops, and opens client connections.
//!
//! Hosts construct one engine per process with their transport binding and catalog,
//! call `start`, watch `subscribe`, and issue requests by peer address.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, FileSink};
use crate::config::EngineConfig;
use crate::discovery::{run_advertiser, run_scanner, scan_once};
use crate::endpoint::{Endpoint, EndpointContext, TransferReport};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventSender};
use crate::listener::{run_listener, wait_or_cancel};
use crate::protocol::{FileId, SharedFileEntry};
use crate::registry::{PeerRecord, PeerRegistry};
use crate::transport::{PeerAddress, Transport};

pub struct Engine {
    config: Arc<EngineConfig>,
    transport: Arc<dyn Transport>,
    catalog: Arc<dyn Catalog>,
    registry: Arc<PeerRegistry>,
    events: EventSender,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>, catalog: Arc<dyn Catalog>) -> Self {
        let events = EventSender::new(config.event_capacity);
        Self {
            config: Arc::new(config),
            transport,
            catalog,
            registry: Arc::new(PeerRegistry::new()),
            events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Known peers, most recently seen first.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.registry.snapshot().await
    }

    /// Spawn the scanner, advertiser and listener. Must be called inside a tokio runtime.
    /// Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        info!(name = %self.config.display_name, "starting engine");
        tasks.push(tokio::spawn(run_scanner(
            self.transport.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.events.clone(),
            self.cancel.child_token(),
        )));
        tasks.push(tokio::spawn(run_advertiser(
            self.transport.clone(),
            self.config.clone(),
            self.events.clone(),
            self.cancel.child_token(),
        )));
        tasks.push(tokio::spawn(run_listener(
            self.transport.clone(),
            self.endpoint_context(),
        )));
    }

    /// Cancel every loop and connection, then wait for the loops to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!("engine stopped");
    }

    /// Scan right away instead of waiting for the next interval.
    pub async fn scan_now(&self) -> Result<usize> {
        Ok(scan_once(self.transport.as_ref(), &self.registry, &self.config, &self.events).await?)
    }

    fn endpoint_context(&self) -> EndpointContext {
        EndpointContext {
            catalog: self.catalog.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    /// Open a client connection, retrying transport failures and timeouts.
    pub async fn connect(&self, address: &PeerAddress) -> Result<Endpoint> {
        let attempts = self.config.connect_attempts.max(1);
        let after = self.config.connect_timeout();
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let err = match tokio::time::timeout(after, self.transport.connect(address)).await {
                Ok(Ok(connection)) => {
                    debug!(peer = %address, attempt, "connected");
                    return Ok(Endpoint::new(address.clone(), connection, self.endpoint_context()));
                }
                Ok(Err(e)) => Error::Transport(e),
                Err(_) => Error::Timeout {
                    after,
                    during: "connecting",
                },
            };
            if attempt >= attempts {
                warn!(peer = %address, attempts, error = %err, "giving up on peer");
                return Err(err);
            }
            debug!(peer = %address, attempt, error = %err, "connect failed, retrying");
            attempt += 1;
            if wait_or_cancel(&self.cancel, self.config.retry_backoff()).await {
                return Err(Error::Cancelled);
            }
        }
    }

    pub async fn list_files(&self, address: &PeerAddress) -> Result<Vec<SharedFileEntry>> {
        let mut endpoint = self.connect(address).await?;
        let res = endpoint.list_files().await;
        endpoint.close().await;
        res
    }

    pub async fn request_file(
        &self,
        address: &PeerAddress,
        id: &FileId,
        sink: Box<dyn FileSink>,
    ) -> Result<TransferReport> {
        let mut endpoint = self.connect(address).await?;
        let res = endpoint.request_file(id, sink).await;
        endpoint.close().await;
        res
    }

    /// Download `entry` into the local catalog.
    pub async fn download(&self, address: &PeerAddress, entry: &SharedFileEntry) -> Result<TransferReport> {
        let sink = self.catalog.open_for_write(entry).await.map_err(Error::Catalog)?;
        self.request_file(address, &entry.id, sink).await
    }

    pub async fn ping(&self, address: &PeerAddress) -> Result<Duration> {
        let mut endpoint = self.connect(address).await?;
        let res = endpoint.ping().await;
        endpoint.close().await;
        res
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
