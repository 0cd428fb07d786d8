//! Integrity: streaming SHA-256 over file content and final verification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::CHUNK_SIZE;

/// SHA-256 digest of a whole file. Hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(ContentHash(out))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Running hash for one transfer. Bytes must be fed in the order they were produced.
#[derive(Clone, Default)]
pub struct Verifier {
    hasher: Sha256,
    bytes: u64,
}

impl Verifier {
    pub fn start() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.bytes += bytes.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> ContentHash {
        ContentHash(self.hasher.finalize().into())
    }
}

/// Hash a complete buffer.
pub fn hash_bytes(payload: &[u8]) -> ContentHash {
    let mut v = Verifier::start();
    v.update(payload);
    v.finish()
}

/// Hash everything `reader` yields. Returns the digest and the byte count.
/// Used by catalogs when a file is shared.
pub async fn hash_reader<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<(ContentHash, u64)> {
    let mut v = Verifier::start();
    let mut buf = vec![0u8; CHUNK_SIZE * 16];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        v.update(&buf[..n]);
    }
    let len = v.bytes();
    Ok((v.finish(), len))
}
