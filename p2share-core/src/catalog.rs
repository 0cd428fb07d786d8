//! Catalog capability: the host's shared files and where downloads land.

use std::io;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::protocol::{FileId, SharedFileEntry};

pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Destination of one download. Written in arrival order, then either committed
/// (hash verified) or discarded.
#[async_trait]
pub trait FileSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    async fn commit(self: Box<Self>) -> io::Result<()>;

    async fn discard(self: Box<Self>) -> io::Result<()>;
}

#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    /// Current snapshot of shared files.
    async fn list_entries(&self) -> io::Result<Vec<SharedFileEntry>>;

    /// Content of a shared file, or `None` if the id is unknown.
    async fn open_for_read(&self, id: &FileId) -> io::Result<Option<ByteSource>>;

    /// Sink for a file about to be downloaded.
    async fn open_for_write(&self, entry: &SharedFileEntry) -> io::Result<Box<dyn FileSink>>;

    async fn entry(&self, id: &FileId) -> io::Result<Option<SharedFileEntry>> {
        Ok(self.list_entries().await?.into_iter().find(|e| &e.id == id))
    }
}
