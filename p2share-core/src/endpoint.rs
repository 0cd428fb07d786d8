//! Connection endpoint: one connection, one codec, at most one transfer at a time.
//!
//! The client half issues requests (`list_files`, `request_file`, `ping`) and waits for the
//! answers; the server half (`serve`) answers requests from the catalog and streams files.
//! Fatal errors (transport, protocol, timeout, cancellation) close the connection; the rest
//! leave it usable for the next request.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{ByteSource, Catalog, FileSink};
use crate::config::EngineConfig;
use crate::error::{Error, FailureKind, ProtocolError, Result};
use crate::events::{EngineEvent, EventSender, TransferStatus};
use crate::integrity::ContentHash;
use crate::protocol::{ErrorCode, FileId, Message, SharedFileEntry, CHUNK_SIZE};
use crate::session::{Direction, TransferSession};
use crate::transport::{BoxConnection, PeerAddress, TransportError};
use crate::wire::MessageCodec;

/// A progress event is emitted every this many chunks.
const PROGRESS_EVERY_CHUNKS: u64 = 64;

type Reader = FramedRead<ReadHalf<BoxConnection>, MessageCodec>;
type Writer = FramedWrite<WriteHalf<BoxConnection>, MessageCodec>;

/// What an endpoint shares with the engine that created it.
#[derive(Clone)]
pub struct EndpointContext {
    pub catalog: Arc<dyn Catalog>,
    pub config: Arc<EngineConfig>,
    pub events: EventSender,
    pub cancel: CancellationToken,
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub peer: PeerAddress,
    pub file_id: FileId,
    pub direction: Direction,
    pub bytes: u64,
    pub hash: ContentHash,
    pub elapsed: Duration,
}

/// File being streamed by the server half. Holds the partially filled chunk so that
/// reading the source can be interrupted by inbound traffic without losing bytes.
struct Outbound {
    session: TransferSession,
    source: ByteSource,
    buf: Vec<u8>,
    filled: usize,
    chunks: u64,
}

pub struct Endpoint {
    peer: PeerAddress,
    reader: Reader,
    writer: Writer,
    ctx: EndpointContext,
    next_session_id: u32,
    closed: bool,
}

impl Endpoint {
    pub fn new(peer: PeerAddress, connection: BoxConnection, ctx: EndpointContext) -> Self {
        let (read, write) = tokio::io::split(connection);
        let max = ctx.config.max_frame_len;
        Self {
            peer,
            reader: FramedRead::new(read, MessageCodec::new(max)),
            writer: FramedWrite::new(write, MessageCodec::new(max)),
            ctx,
            next_session_id: 1,
            closed: false,
        }
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Ask the peer for its catalog.
    pub async fn list_files(&mut self) -> Result<Vec<SharedFileEntry>> {
        let res = self.exchange_list().await;
        self.settle(res).await
    }

    async fn exchange_list(&mut self) -> Result<Vec<SharedFileEntry>> {
        self.send(Message::ListFiles).await?;
        let during = "awaiting FILE_LIST";
        match self.recv(self.ctx.config.io_timeout(), during).await? {
            Message::FileList { entries } => Ok(entries),
            Message::Error { code, detail } => Err(Error::from_remote(code, detail)),
            other => Err(unexpected(&other, during)),
        }
    }

    /// Round-trip time of a PING.
    pub async fn ping(&mut self) -> Result<Duration> {
        let res = self.exchange_ping().await;
        self.settle(res).await
    }

    async fn exchange_ping(&mut self) -> Result<Duration> {
        let started = Instant::now();
        self.send(Message::Ping).await?;
        let during = "awaiting PONG";
        match self.recv(self.ctx.config.io_timeout(), during).await? {
            Message::Pong => Ok(started.elapsed()),
            Message::Error { code, detail } => Err(Error::from_remote(code, detail)),
            other => Err(unexpected(&other, during)),
        }
    }

    /// Download one file into `sink`. The sink is committed only after the hash matched;
    /// on any failure it is discarded.
    pub async fn request_file(
        &mut self,
        id: &FileId,
        mut sink: Box<dyn FileSink>,
    ) -> Result<TransferReport> {
        let started = Instant::now();
        let mut session = None;
        let mut res = self.receive_into(id, sink.as_mut(), &mut session).await;
        if res.is_ok() {
            if let Err(e) = sink.commit().await {
                res = Err(Error::Catalog(e));
            }
        } else if let Err(e) = sink.discard().await {
            warn!(peer = %self.peer, file_id = %id, error = %e, "failed to discard partial download");
        }
        let bytes = session.as_ref().map_or(0, TransferSession::bytes_transferred);
        let status = match &res {
            Ok(hash) => {
                info!(peer = %self.peer, file_id = %id, bytes, "download complete");
                TransferStatus::Completed { bytes, hash: *hash }
            }
            Err(e) => {
                warn!(peer = %self.peer, file_id = %id, error = %e, "download failed");
                TransferStatus::Failed(e.kind())
            }
        };
        self.ctx.events.emit(EngineEvent::TransferFinished {
            peer: self.peer.clone(),
            file_id: id.clone(),
            direction: Direction::Receive,
            status,
        });
        let hash = self.settle(res).await?;
        Ok(TransferReport {
            peer: self.peer.clone(),
            file_id: id.clone(),
            direction: Direction::Receive,
            bytes,
            hash,
            elapsed: started.elapsed(),
        })
    }

    async fn receive_into(
        &mut self,
        id: &FileId,
        sink: &mut dyn FileSink,
        slot: &mut Option<TransferSession>,
    ) -> Result<ContentHash> {
        self.send(Message::RequestFile { id: id.clone() }).await?;
        let during = "awaiting FILE_INFO";
        let session = match self.recv(self.ctx.config.io_timeout(), during).await? {
            Message::FileInfo {
                id: got,
                size,
                hash,
                session_id,
            } => {
                if &got != id {
                    return Err(ProtocolError::WrongFile {
                        requested: id.clone(),
                        got,
                    }
                    .into());
                }
                slot.insert(TransferSession::receiving(session_id, got, size, hash))
            }
            Message::Error { code, detail } => return Err(Error::from_remote(code, detail)),
            other => return Err(unexpected(&other, during)),
        };
        session.await_chunks();
        debug!(peer = %self.peer, file_id = %id, session_id = session.session_id(), size = session.size(), "receiving file");

        let idle = self.ctx.config.idle_timeout();
        let mut chunks = 0u64;
        loop {
            let msg = match self.recv(idle, "receiving chunks").await {
                Ok(msg) => msg,
                Err(e) => {
                    session.fail(e.kind());
                    return Err(e);
                }
            };
            match msg {
                Message::FileChunk {
                    session_id,
                    seq,
                    data,
                } => {
                    session.on_chunk(session_id, seq, &data)?;
                    if let Err(e) = sink.write(&data).await {
                        // The rest of the file is still in flight; the connection cannot be reused.
                        session.fail(FailureKind::Local);
                        let err = Error::Catalog(e);
                        self.shutdown(&err).await;
                        return Err(err);
                    }
                    chunks += 1;
                    if chunks % PROGRESS_EVERY_CHUNKS == 0 {
                        self.ctx.events.emit(EngineEvent::TransferProgress {
                            peer: self.peer.clone(),
                            file_id: id.clone(),
                            direction: Direction::Receive,
                            bytes: session.bytes_transferred(),
                            total: session.size(),
                        });
                    }
                }
                Message::TransferComplete { session_id } => return session.on_complete(session_id),
                Message::Error { code, detail } => {
                    let err = Error::from_remote(code, detail);
                    session.fail(err.kind());
                    return Err(err);
                }
                other => {
                    session.fail(FailureKind::Protocol);
                    return Err(unexpected(&other, "receiving chunks"));
                }
            }
        }
    }

    /// Answer requests until the peer hangs up, the connection idles out, a fatal error
    /// occurs, or the engine is cancelled.
    pub async fn serve(mut self) -> Result<()> {
        debug!(peer = %self.peer, "serving connection");
        let mut outbound: Option<Outbound> = None;
        let res = loop {
            let idle = outbound
                .is_none()
                .then(|| self.ctx.config.serve_idle_timeout());
            let step = tokio::select! {
                _ = self.ctx.cancel.cancelled() => Err(Error::Cancelled),
                msg = next_inbound(&mut self.reader, idle) => match msg {
                    Ok(Some(msg)) => self.dispatch(msg, &mut outbound).await.map(|()| true),
                    Ok(None) => Ok(false),
                    Err(e) => Err(e),
                },
                filled = fill_chunk(outbound.as_mut()), if outbound.is_some() => {
                    self.pump(filled, &mut outbound).await.map(|()| true)
                }
            };
            match step {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Some(mut out) = outbound.take() {
            let kind = match &res {
                Ok(()) => FailureKind::Transport,
                Err(e) => e.kind(),
            };
            out.session.fail(kind);
            warn!(peer = %self.peer, file_id = %out.session.file_id(), bytes = out.session.bytes_transferred(), "upload interrupted");
            self.upload_finished(&out.session, TransferStatus::Failed(kind));
        }
        match &res {
            Ok(()) => debug!(peer = %self.peer, "connection finished"),
            Err(Error::Cancelled) => debug!(peer = %self.peer, "connection cancelled"),
            Err(e) => warn!(peer = %self.peer, error = %e, "connection failed"),
        }
        let res = self.settle(res).await;
        self.close().await;
        res
    }

    async fn dispatch(&mut self, msg: Message, outbound: &mut Option<Outbound>) -> Result<()> {
        match msg {
            Message::ListFiles => {
                let reply = match self.ctx.catalog.list_entries().await {
                    Ok(entries) => Message::FileList { entries },
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "catalog listing failed");
                        Message::error(ErrorCode::Internal, "catalog unavailable")
                    }
                };
                if let Err(e) = self.send(reply).await {
                    return self.report_oversize(e, "catalog").await;
                }
                Ok(())
            }
            Message::RequestFile { id } => self.start_upload(id, outbound).await,
            Message::Ping => self.send(Message::Pong).await,
            Message::Pong => Ok(()),
            Message::Error { code, detail } => {
                warn!(peer = %self.peer, %code, detail = %detail, "peer reported error");
                Ok(())
            }
            other => Err(unexpected(&other, "serving")),
        }
    }

    async fn start_upload(&mut self, id: FileId, outbound: &mut Option<Outbound>) -> Result<()> {
        if let Some(active) = outbound {
            debug!(peer = %self.peer, file_id = %id, active = active.session.session_id(), "rejecting concurrent request");
            let detail = format!("session {} in progress", active.session.session_id());
            return self.send(Message::error(ErrorCode::Busy, detail)).await;
        }
        let opened = match self.ctx.catalog.entry(&id).await {
            Ok(Some(entry)) => match self.ctx.catalog.open_for_read(&id).await {
                Ok(Some(source)) => Ok(Some((entry, source))),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            },
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        let (entry, source) = match opened {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!(peer = %self.peer, file_id = %id, "requested file not shared");
                return self
                    .send(Message::error(ErrorCode::NotFound, id.to_string()))
                    .await;
            }
            Err(e) => {
                warn!(peer = %self.peer, file_id = %id, error = %e, "cannot open shared file");
                return self
                    .send(Message::error(ErrorCode::Internal, "cannot open file"))
                    .await;
            }
        };

        let session_id = self.next_session_id;
        self.next_session_id = self.next_session_id.checked_add(1).unwrap_or(1);
        let mut session = TransferSession::sending(session_id, &entry);
        if let Err(e) = self.send(session.file_info()).await {
            return self.report_oversize(e, "file info").await;
        }
        info!(peer = %self.peer, file_id = %id, session_id, size = entry.size, "sending file");
        *outbound = Some(Outbound {
            session,
            source,
            buf: vec![0; CHUNK_SIZE],
            filled: 0,
            chunks: 0,
        });
        Ok(())
    }

    /// Handle one filled chunk (or end of source) of the active upload.
    async fn pump(&mut self, filled: io::Result<usize>, outbound: &mut Option<Outbound>) -> Result<()> {
        let Some(out) = outbound.as_mut() else {
            return Ok(());
        };
        let n = match filled {
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %self.peer, file_id = %out.session.file_id(), error = %e, "reading shared file failed");
                out.session.fail(FailureKind::Local);
                self.upload_finished(&out.session, TransferStatus::Failed(FailureKind::Local));
                *outbound = None;
                return self
                    .send(Message::error(ErrorCode::Internal, "read failed"))
                    .await;
            }
        };
        if n == 0 {
            let Some(mut out) = outbound.take() else {
                return Ok(());
            };
            return self.finish_upload(&mut out).await;
        }

        let data = out.buf[..n].to_vec();
        out.filled = 0;
        let msg = match out.session.next_chunk(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "shared file grew since it was listed");
                self.upload_finished(&out.session, TransferStatus::Failed(e.kind()));
                *outbound = None;
                return self
                    .send(Message::error(ErrorCode::Internal, "file changed"))
                    .await;
            }
        };
        if let Err(e) = self.send(msg).await {
            if matches!(e, Error::Oversize { .. }) {
                out.session.fail(FailureKind::Local);
                self.upload_finished(&out.session, TransferStatus::Failed(FailureKind::Local));
                *outbound = None;
            }
            return self.report_oversize(e, "chunk").await;
        }
        out.chunks += 1;
        if out.chunks % PROGRESS_EVERY_CHUNKS == 0 {
            self.ctx.events.emit(EngineEvent::TransferProgress {
                peer: self.peer.clone(),
                file_id: out.session.file_id().clone(),
                direction: Direction::Send,
                bytes: out.session.bytes_transferred(),
                total: out.session.size(),
            });
        }
        Ok(())
    }

    async fn finish_upload(&mut self, out: &mut Outbound) -> Result<()> {
        match out.session.finish_sending() {
            Ok(complete) => {
                if let Err(e) = self.send(complete).await {
                    out.session.fail(e.kind());
                    self.upload_finished(&out.session, TransferStatus::Failed(e.kind()));
                    return Err(e);
                }
                info!(peer = %self.peer, file_id = %out.session.file_id(), bytes = out.session.bytes_transferred(), "file sent");
                let status = TransferStatus::Completed {
                    bytes: out.session.bytes_transferred(),
                    hash: out.session.expected_hash(),
                };
                self.upload_finished(&out.session, status);
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "shared file changed since it was listed");
                self.upload_finished(&out.session, TransferStatus::Failed(e.kind()));
                self.send(Message::error(ErrorCode::Internal, "file changed"))
                    .await
            }
        }
    }

    /// A reply that does not fit in one frame is our limit, not the peer's fault: answer
    /// with `ERROR(INTERNAL)` and keep the connection. Other send errors pass through.
    async fn report_oversize(&mut self, err: Error, what: &str) -> Result<()> {
        let Error::Oversize { len, max } = err else {
            return Err(err);
        };
        warn!(peer = %self.peer, len, max, "{what} does not fit in one frame");
        self.send(Message::error(ErrorCode::Internal, format!("{what} too large")))
            .await
    }

    fn upload_finished(&self, session: &TransferSession, status: TransferStatus) {
        self.ctx.events.emit(EngineEvent::TransferFinished {
            peer: self.peer.clone(),
            file_id: session.file_id().clone(),
            direction: Direction::Send,
            status,
        });
    }

    /// Flush and shut down the write side. Dropping the endpoint closes the rest.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let io_timeout = self.ctx.config.io_timeout();
        if let Ok(Err(e)) = tokio::time::timeout(io_timeout, self.writer.close()).await {
            debug!(peer = %self.peer, error = %e, "close failed");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    async fn send(&mut self, msg: Message) -> Result<()> {
        self.ensure_open()?;
        let io_timeout = self.ctx.config.io_timeout();
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(io_timeout, self.writer.send(msg)) => match res {
                Ok(sent) => sent.map_err(Error::from),
                Err(_) => Err(Error::Timeout { after: io_timeout, during: "writing" }),
            },
        }
    }

    /// Next message other than PING; PINGs are answered on the way.
    async fn recv(&mut self, after: Duration, during: &'static str) -> Result<Message> {
        loop {
            self.ensure_open()?;
            let next = tokio::select! {
                _ = self.ctx.cancel.cancelled() => return Err(Error::Cancelled),
                next = tokio::time::timeout(after, self.reader.next()) => next,
            };
            let msg = match next {
                Err(_) => return Err(Error::Timeout { after, during }),
                Ok(None) => return Err(TransportError::ConnectionClosed.into()),
                Ok(Some(frame)) => frame?,
            };
            if msg == Message::Ping {
                self.send(Message::Pong).await?;
                continue;
            }
            return Ok(msg);
        }
    }

    /// Close the connection after a fatal error. Protocol violations are reported first.
    async fn shutdown(&mut self, err: &Error) {
        if self.closed {
            return;
        }
        if let Error::Protocol(p) = err {
            let report = Message::error(ErrorCode::Malformed, p.to_string());
            let io_timeout = self.ctx.config.io_timeout();
            let _ = tokio::time::timeout(io_timeout, self.writer.send(report)).await;
        }
        debug!(peer = %self.peer, error = %err, "closing connection");
        self.close().await;
    }

    async fn settle<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.is_fatal() {
                self.shutdown(e).await;
            }
        }
        res
    }
}

fn unexpected(msg: &Message, during: &'static str) -> Error {
    ProtocolError::Unexpected {
        got: msg.kind(),
        during,
    }
    .into()
}

/// Next inbound message. `Ok(None)` when the peer hung up or nothing arrived within `idle`.
async fn next_inbound(reader: &mut Reader, idle: Option<Duration>) -> Result<Option<Message>> {
    let next = match idle {
        Some(after) => match tokio::time::timeout(after, reader.next()).await {
            Ok(next) => next,
            Err(_) => {
                debug!(idle = ?after, "idle connection");
                return Ok(None);
            }
        },
        None => reader.next().await,
    };
    match next {
        None => Ok(None),
        Some(frame) => Ok(Some(frame?)),
    }
}

/// Fill the upload's chunk buffer. Returns the bytes buffered, 0 once the source is exhausted.
/// Pending forever when there is no upload.
async fn fill_chunk(outbound: Option<&mut Outbound>) -> io::Result<usize> {
    let Some(out) = outbound else {
        return std::future::pending().await;
    };
    while out.filled < out.buf.len() {
        let n = out.source.read(&mut out.buf[out.filled..]).await?;
        if n == 0 {
            break;
        }
        out.filled += n;
    }
    Ok(out.filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_bytes;
    use crate::memory::MemoryCatalog;
    use rand::RngCore;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    type StubReader = FramedRead<ReadHalf<DuplexStream>, MessageCodec>;
    type StubWriter = FramedWrite<WriteHalf<DuplexStream>, MessageCodec>;

    fn context(catalog: &MemoryCatalog) -> EndpointContext {
        EndpointContext {
            catalog: Arc::new(catalog.clone()),
            config: Arc::new(EngineConfig::default()),
            events: EventSender::new(1024),
            cancel: CancellationToken::new(),
        }
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    /// Client endpoint wired to a serving endpoint sharing `shared`.
    fn serve_pair(server_ctx: EndpointContext) -> (Endpoint, JoinHandle<Result<()>>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Endpoint::new("server".into(), Box::new(a), context(&MemoryCatalog::new()));
        let server = Endpoint::new("client".into(), Box::new(b), server_ctx);
        (client, tokio::spawn(server.serve()))
    }

    /// Client endpoint wired to a hand-driven stub peer.
    fn stub_pair(ctx: EndpointContext) -> (Endpoint, StubReader, StubWriter) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = Endpoint::new("stub".into(), Box::new(a), ctx);
        let (r, w) = tokio::io::split(b);
        (
            client,
            FramedRead::new(r, MessageCodec::default()),
            FramedWrite::new(w, MessageCodec::default()),
        )
    }

    fn chunk(session_id: u32, seq: u64, data: &[u8]) -> Message {
        Message::FileChunk {
            session_id,
            seq,
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn list_files_reflects_catalog_at_request_time() {
        let shared = MemoryCatalog::new();
        shared.add("a.txt", b"alpha".to_vec());
        let (mut client, server) = serve_pair(context(&shared));

        let first = client.list_files().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "a.txt");
        assert_eq!(first[0].hash, hash_bytes(b"alpha"));

        shared.add("b.txt", b"beta".to_vec());
        let second = client.list_files().await.unwrap();
        let names: Vec<&str> = second.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        shared.remove(&"a.txt".into());
        let third = client.list_files().await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].name, "b.txt");

        client.close().await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transfer_completes_with_matching_hash() {
        let shared = MemoryCatalog::new();
        let content = random_bytes(CHUNK_SIZE * 2 + 1808);
        let entry = shared.add("photo.jpg", content.clone());
        let server_ctx = context(&shared);
        let mut server_events = server_ctx.events.subscribe();
        let (mut client, _server) = serve_pair(server_ctx);

        let downloads = MemoryCatalog::new();
        let report = client
            .request_file(&entry.id, downloads.sink(&entry.id))
            .await
            .unwrap();
        assert_eq!(report.bytes, content.len() as u64);
        assert_eq!(report.hash, entry.hash);
        assert_eq!(report.direction, Direction::Receive);
        assert_eq!(downloads.received(&entry.id).unwrap(), content);

        loop {
            if let EngineEvent::TransferFinished { status, direction, .. } =
                server_events.recv().await.unwrap()
            {
                assert_eq!(direction, Direction::Send);
                assert_eq!(
                    status,
                    TransferStatus::Completed {
                        bytes: content.len() as u64,
                        hash: entry.hash
                    }
                );
                break;
            }
        }
    }

    #[tokio::test]
    async fn empty_file_transfers() {
        let shared = MemoryCatalog::new();
        let entry = shared.add("empty", Vec::new());
        let (mut client, _server) = serve_pair(context(&shared));
        let downloads = MemoryCatalog::new();
        let report = client
            .request_file(&entry.id, downloads.sink(&entry.id))
            .await
            .unwrap();
        assert_eq!(report.bytes, 0);
        assert_eq!(downloads.received(&entry.id).unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn not_found_leaves_connection_usable() {
        let shared = MemoryCatalog::new();
        shared.add("a.txt", b"alpha".to_vec());
        let (mut client, _server) = serve_pair(context(&shared));

        let downloads = MemoryCatalog::new();
        let missing = FileId::new("nope");
        let err = client
            .request_file(&missing, downloads.sink(&missing))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(ref d) if d == "nope"));
        assert!(!client.is_closed());
        assert_eq!(downloads.discarded(), vec![missing]);

        assert_eq!(client.list_files().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_catalog_is_reported_as_internal() {
        let shared = MemoryCatalog::new();
        for i in 0..50 {
            shared.add(&format!("holiday-photo-{i:03}.jpg"), vec![i as u8; 16]);
        }
        let server_ctx = EndpointContext {
            config: Arc::new(EngineConfig {
                max_frame_len: 2048,
                ..EngineConfig::default()
            }),
            ..context(&shared)
        };
        let (mut client, server) = serve_pair(server_ctx);

        let err = client.list_files().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Remote { code: ErrorCode::Internal, ref detail } if detail == "catalog too large"
        ));
        assert!(!client.is_closed());
        assert!(client.ping().await.is_ok());

        client.close().await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn source_changed_since_listing_fails_transfer() {
        let shared = MemoryCatalog::new();
        let stale = shared.add_with_hash(
            "notes.txt",
            random_bytes(CHUNK_SIZE + 10),
            hash_bytes(b"what was shared"),
        );
        let server_ctx = context(&shared);
        let mut server_events = server_ctx.events.subscribe();
        let (mut client, _server) = serve_pair(server_ctx);

        let downloads = MemoryCatalog::new();
        let err = client
            .request_file(&stale.id, downloads.sink(&stale.id))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Remote { code: ErrorCode::Internal, ref detail } if detail == "file changed"
        ));
        assert!(downloads.received(&stale.id).is_none());
        assert_eq!(downloads.discarded(), vec![stale.id.clone()]);
        assert!(!client.is_closed());

        let status = loop {
            if let EngineEvent::TransferFinished { status, .. } = server_events.recv().await.unwrap() {
                break status;
            }
        };
        assert_eq!(status, TransferStatus::Failed(FailureKind::Integrity));
        assert_eq!(client.list_files().await.unwrap(), vec![stale]);
    }

    #[tokio::test]
    async fn second_request_during_transfer_is_busy() {
        let shared = MemoryCatalog::new();
        let big = random_bytes(CHUNK_SIZE * 64);
        let entry = shared.add("big.bin", big.clone());
        shared.add("small.txt", b"small".to_vec());

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = Endpoint::new("client".into(), Box::new(b), context(&shared));
        let server = tokio::spawn(server.serve());
        let (r, w) = tokio::io::split(a);
        let mut reader = FramedRead::new(r, MessageCodec::default());
        let mut writer = FramedWrite::new(w, MessageCodec::default());

        writer
            .send(Message::RequestFile { id: entry.id.clone() })
            .await
            .unwrap();
        writer
            .send(Message::RequestFile { id: "small.txt".into() })
            .await
            .unwrap();

        let mut received = Vec::new();
        let mut saw_busy = false;
        let session = match reader.next().await.unwrap().unwrap() {
            Message::FileInfo { session_id, size, .. } => {
                assert_eq!(size, big.len() as u64);
                session_id
            }
            other => panic!("expected FILE_INFO, got {other:?}"),
        };
        loop {
            match reader.next().await.unwrap().unwrap() {
                Message::FileChunk { session_id, data, .. } => {
                    assert_eq!(session_id, session);
                    received.extend_from_slice(&data);
                }
                Message::Error { code, .. } => {
                    assert_eq!(code, ErrorCode::Busy);
                    saw_busy = true;
                }
                Message::TransferComplete { session_id } => {
                    assert_eq!(session_id, session);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(saw_busy);
        assert_eq!(hash_bytes(&received), entry.hash);

        drop(writer);
        drop(reader);
        server.await.unwrap().ok();
    }

    #[tokio::test]
    async fn integrity_failure_discards_and_keeps_connection() {
        let good = b"good data".to_vec();
        let downloads = MemoryCatalog::new();
        let (mut client, mut reader, mut writer) = stub_pair(context(&MemoryCatalog::new()));

        let stub = tokio::spawn(async move {
            let id = match reader.next().await.unwrap().unwrap() {
                Message::RequestFile { id } => id,
                other => panic!("unexpected {other:?}"),
            };
            writer
                .send(Message::FileInfo {
                    id,
                    size: good.len() as u64,
                    hash: hash_bytes(&good),
                    session_id: 7,
                })
                .await
                .unwrap();
            writer.send(chunk(7, 0, b"evil data")).await.unwrap();
            writer
                .send(Message::TransferComplete { session_id: 7 })
                .await
                .unwrap();
            assert_eq!(reader.next().await.unwrap().unwrap(), Message::ListFiles);
            writer
                .send(Message::FileList { entries: vec![] })
                .await
                .unwrap();
        });

        let id = FileId::new("doc");
        let err = client.request_file(&id, downloads.sink(&id)).await.unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(downloads.received(&id).is_none());
        assert_eq!(downloads.discarded(), vec![id]);
        assert!(!client.is_closed());

        assert!(client.list_files().await.unwrap().is_empty());
        stub.await.unwrap();
    }

    #[tokio::test]
    async fn out_of_order_chunk_closes_connection() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 3).map(|i| i as u8).collect();
        let parts: Vec<Vec<u8>> = data.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        let downloads = MemoryCatalog::new();
        let (mut client, mut reader, mut writer) = stub_pair(context(&MemoryCatalog::new()));

        let hash = hash_bytes(&data);
        let size = data.len() as u64;
        let stub = tokio::spawn(async move {
            let id = match reader.next().await.unwrap().unwrap() {
                Message::RequestFile { id } => id,
                other => panic!("unexpected {other:?}"),
            };
            writer
                .send(Message::FileInfo { id, size, hash, session_id: 1 })
                .await
                .unwrap();
            for seq in [0u64, 2, 1] {
                writer.send(chunk(1, seq, &parts[seq as usize])).await.unwrap();
            }
            writer
                .send(Message::TransferComplete { session_id: 1 })
                .await
                .unwrap();
            let report = reader.next().await.unwrap().unwrap();
            assert!(matches!(report, Message::Error { code: ErrorCode::Malformed, .. }));
            assert!(reader.next().await.is_none());
        });

        let id = FileId::new("f");
        let err = client.request_file(&id, downloads.sink(&id)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::OutOfSequence { expected: 1, got: 2 })
        ));
        assert!(client.is_closed());
        assert!(downloads.received(&id).is_none());
        stub.await.unwrap();

        assert!(matches!(client.list_files().await, Err(Error::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_sender_times_out() {
        let downloads = MemoryCatalog::new();
        let ctx = context(&MemoryCatalog::new());
        let idle = ctx.config.idle_timeout();
        let mut events = ctx.events.subscribe();
        let (mut client, mut reader, mut writer) = stub_pair(ctx);

        let stub = tokio::spawn(async move {
            let id = match reader.next().await.unwrap().unwrap() {
                Message::RequestFile { id } => id,
                other => panic!("unexpected {other:?}"),
            };
            writer
                .send(Message::FileInfo {
                    id,
                    size: 10_000,
                    hash: hash_bytes(b"whatever"),
                    session_id: 1,
                })
                .await
                .unwrap();
            writer.send(chunk(1, 0, &[0u8; 100])).await.unwrap();
            // Stall; the next read only ends when the client hangs up.
            assert!(reader.next().await.is_none());
        });

        let started = Instant::now();
        let id = FileId::new("slow");
        let err = client.request_file(&id, downloads.sink(&id)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() >= idle);
        assert!(client.is_closed());
        assert_eq!(downloads.discarded(), vec![id]);
        stub.await.unwrap();

        let finished = loop {
            if let EngineEvent::TransferFinished { status, .. } = events.recv().await.unwrap() {
                break status;
            }
        };
        assert_eq!(finished, TransferStatus::Failed(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn client_hanging_up_fails_upload() {
        let shared = MemoryCatalog::new();
        let entry = shared.add("big.bin", random_bytes(CHUNK_SIZE * 256));
        let server_ctx = context(&shared);
        let mut events = server_ctx.events.subscribe();

        let (a, b) = tokio::io::duplex(16 * 1024);
        let server = Endpoint::new("client".into(), Box::new(b), server_ctx);
        let server = tokio::spawn(server.serve());
        let (r, w) = tokio::io::split(a);
        let mut reader = FramedRead::new(r, MessageCodec::default());
        let mut writer = FramedWrite::new(w, MessageCodec::default());
        writer
            .send(Message::RequestFile { id: entry.id.clone() })
            .await
            .unwrap();
        assert!(matches!(
            reader.next().await.unwrap().unwrap(),
            Message::FileInfo { .. }
        ));
        drop(reader);
        drop(writer);

        let status = loop {
            if let EngineEvent::TransferFinished { status, direction, .. } =
                events.recv().await.unwrap()
            {
                assert_eq!(direction, Direction::Send);
                break status;
            }
        };
        assert_eq!(status, TransferStatus::Failed(FailureKind::Transport));
        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let shared = MemoryCatalog::new();
        let (mut client, _server) = serve_pair(context(&shared));
        let rtt = client.ping().await.unwrap();
        assert!(rtt < Duration::from_secs(5));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiting_request() {
        let ctx = context(&MemoryCatalog::new());
        let cancel = ctx.cancel.clone();
        let (mut client, mut reader, _writer) = stub_pair(ctx);

        let stub = tokio::spawn(async move {
            assert_eq!(reader.next().await.unwrap().unwrap(), Message::ListFiles);
            cancel.cancel();
            reader.next().await
        });

        let err = client.list_files().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(client.is_closed());
        assert!(stub.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_answered_with_malformed() {
        use tokio::io::AsyncWriteExt;

        let shared = MemoryCatalog::new();
        let (mut a, b) = tokio::io::duplex(4096);
        let server = Endpoint::new("client".into(), Box::new(b), context(&shared));
        let server = tokio::spawn(server.serve());

        a.write_all(&[0, 0, 0, 8, 0, 0, 0, 4, b'n', b'o', b'p', b'e'])
            .await
            .unwrap();
        let mut reader = FramedRead::new(a, MessageCodec::default());
        assert!(matches!(
            reader.next().await.unwrap().unwrap(),
            Message::Error { code: ErrorCode::Malformed, .. }
        ));
        assert!(reader.next().await.is_none());
        assert!(matches!(server.await.unwrap(), Err(Error::Protocol(_))));
    }
}
