//! P2Share wire protocol: message types, catalog values and protocol constants.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::integrity::ContentHash;

/// Current protocol version. Carried in service advertisements; hosts ignore
/// announcements of other versions.
pub const PROTOCOL_VERSION: u8 = 1;

/// Service identifier both peers advertise and scan for.
pub const SERVICE_ID: Uuid = Uuid::from_u128(0x94f39d29_7d6d_437d_973b_fba39e49d4ee);

/// Human-readable service name registered next to [`SERVICE_ID`].
pub const SERVICE_NAME: &str = "P2P File Share";

/// Payload bytes per `FILE_CHUNK`. The last chunk of a file may be shorter.
pub const CHUNK_SIZE: usize = 4096;

/// Catalog identifier of a shared file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        FileId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        FileId(s.to_string())
    }
}

/// One file a host offers. The hash is fixed when the file is shared and never recomputed here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFileEntry {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    pub hash: ContentHash,
}

/// Error codes carried by [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Busy,
    Malformed,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Busy => "BUSY",
            ErrorCode::Malformed => "MALFORMED",
            ErrorCode::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// All wire message types. The header is a tagged JSON object; `FileChunk` data travels
/// as raw bytes after it (see the wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Ask the peer for its catalog.
    ListFiles,
    /// Catalog snapshot taken when the request arrived.
    FileList { entries: Vec<SharedFileEntry> },
    /// Ask the peer to stream one file.
    RequestFile { id: FileId },
    /// Sent before the first chunk. Streaming follows without an acknowledgement.
    FileInfo {
        id: FileId,
        size: u64,
        hash: ContentHash,
        #[serde(default)]
        session_id: u32,
    },
    /// One chunk of file data; `data` is carried outside the header.
    FileChunk {
        session_id: u32,
        seq: u64,
        #[serde(skip)]
        data: Vec<u8>,
    },
    /// All chunks for the session were sent.
    TransferComplete { session_id: u32 },
    Error { code: ErrorCode, detail: String },
    /// Liveness probe.
    Ping,
    Pong,
}

impl Message {
    /// Short tag name for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ListFiles => "LIST_FILES",
            Message::FileList { .. } => "FILE_LIST",
            Message::RequestFile { .. } => "REQUEST_FILE",
            Message::FileInfo { .. } => "FILE_INFO",
            Message::FileChunk { .. } => "FILE_CHUNK",
            Message::TransferComplete { .. } => "TRANSFER_COMPLETE",
            Message::Error { .. } => "ERROR",
            Message::Ping => "PING",
            Message::Pong => "PONG",
        }
    }

    pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
        Message::Error {
            code,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_id_matches_advertised_uuid() {
        assert_eq!(
            SERVICE_ID.to_string(),
            "94f39d29-7d6d-437d-973b-fba39e49d4ee"
        );
    }

    #[test]
    fn header_uses_screaming_tags() {
        let json = serde_json::to_string(&Message::RequestFile { id: "a.txt".into() }).unwrap();
        assert_eq!(json, r#"{"type":"REQUEST_FILE","id":"a.txt"}"#);
        let json = serde_json::to_string(&Message::error(ErrorCode::NotFound, "gone")).unwrap();
        assert!(json.contains(r#""code":"NOT_FOUND""#));
    }

    #[test]
    fn chunk_data_stays_out_of_header() {
        let msg = Message::FileChunk {
            session_id: 1,
            seq: 2,
            data: vec![0xAA; 16],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"FILE_CHUNK","session_id":1,"seq":2}"#);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"TRANSFER_COMPLETE","session_id":7,"extra":true}"#)
                .unwrap();
        assert_eq!(msg, Message::TransferComplete { session_id: 7 });
    }
}
