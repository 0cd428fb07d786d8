//! P2Share protocol engine.
//! Peer discovery, framed messaging and hash-verified chunked file transfer over any
//! byte-stream transport the host provides (see `Transport` and `Catalog`).

pub mod catalog;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod events;
pub mod integrity;
pub mod listener;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod wire;

pub use catalog::{ByteSource, Catalog, FileSink};
pub use config::EngineConfig;
pub use endpoint::{Endpoint, TransferReport};
pub use engine::Engine;
pub use error::{Error, FailureKind, ProtocolError, Result};
pub use events::{DiscoveryStatus, EngineEvent, TransferStatus};
pub use integrity::{hash_bytes, hash_reader, ContentHash};
pub use protocol::{
    ErrorCode, FileId, Message, SharedFileEntry, CHUNK_SIZE, PROTOCOL_VERSION, SERVICE_ID,
    SERVICE_NAME,
};
pub use registry::{PeerRecord, PeerRegistry};
pub use session::Direction;
pub use transport::{
    BoxConnection, DiscoveredDevice, Inbound, PeerAddress, ServiceRecord, Transport,
    TransportError,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameError, MessageCodec};
