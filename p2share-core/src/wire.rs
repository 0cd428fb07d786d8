//! Framing: length prefix (4 bytes BE) + header length (4 bytes BE) + JSON header + raw body.
//!
//! Only `FILE_CHUNK` has a body; its bytes follow the header unencoded.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::protocol::Message;

const LEN_SIZE: usize = 4;
const HEADER_LEN_SIZE: usize = 4;

/// Default frame limit (1 MiB). Chunks are far smaller; only large catalogs get close.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Error from the codec: transport I/O, protocol violation, or header serialization.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// A local message too large to send. Nothing was written.
    #[error("outgoing frame of {len} bytes exceeds limit of {max}")]
    Oversize { len: usize, max: usize },
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Error decoding one frame from a buffer.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Encode a message into a single frame with the default size limit.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let mut out = BytesMut::new();
    encode_into(msg, DEFAULT_MAX_FRAME_LEN, &mut out)?;
    Ok(out.to_vec())
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until a whole frame is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = match frame_len(bytes, DEFAULT_MAX_FRAME_LEN)? {
        Some(len) if bytes.len() >= LEN_SIZE + len => len,
        _ => return Err(FrameDecodeError::NeedMore),
    };
    let msg = parse_payload(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

fn frame_len(bytes: &[u8], max: usize) -> Result<Option<usize>, ProtocolError> {
    if bytes.len() < LEN_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > max {
        return Err(ProtocolError::FrameTooLarge { len, max });
    }
    Ok(Some(len))
}

fn encode_into(msg: &Message, max: usize, dst: &mut BytesMut) -> Result<(), FrameError> {
    let header = serde_json::to_vec(msg)?;
    let body: &[u8] = match msg {
        Message::FileChunk { data, .. } => data,
        _ => &[],
    };
    let len = HEADER_LEN_SIZE + header.len() + body.len();
    if len > max {
        return Err(FrameError::Oversize { len, max });
    }
    dst.reserve(LEN_SIZE + len);
    dst.put_u32(len as u32);
    dst.put_u32(header.len() as u32);
    dst.put_slice(&header);
    dst.put_slice(body);
    Ok(())
}

fn parse_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    if payload.len() < HEADER_LEN_SIZE {
        return Err(ProtocolError::Malformed("frame shorter than header length".into()));
    }
    let header_len =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let rest = &payload[HEADER_LEN_SIZE..];
    if header_len > rest.len() {
        return Err(ProtocolError::Malformed(format!(
            "header of {header_len} bytes overruns {}-byte frame",
            payload.len()
        )));
    }
    let (header, body) = rest.split_at(header_len);
    let mut msg: Message =
        serde_json::from_slice(header).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let kind = msg.kind();
    if let Message::FileChunk { data, .. } = &mut msg {
        *data = body.to_vec();
    } else if !body.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "{kind} carries {} unexpected body bytes",
            body.len()
        )));
    }
    Ok(msg)
}

/// Codec turning a byte stream into a stream of [`Message`]s and back.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_len: usize,
}

impl MessageCodec {
    /// `max_frame_len` is capped at what the 4-byte length prefix can express.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u32::MAX as usize),
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        let Some(len) = frame_len(&src[..], self.max_frame_len)? else {
            return Ok(None);
        };
        if src.len() < LEN_SIZE + len {
            src.reserve(LEN_SIZE + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_SIZE);
        let payload = src.split_to(len);
        Ok(Some(parse_payload(&payload)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::Truncated {
                remaining: src.len(),
            }
            .into()),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_into(&msg, self.max_frame_len, dst)
    }
}
