//! Transfer session: state machine for one file transfer over one connection.
//!
//! Pure bookkeeping, no I/O. The endpoint feeds it messages and chunk bytes and sends
//! whatever it returns.

use crate::error::{Error, FailureKind, ProtocolError};
use crate::integrity::{ContentHash, Verifier};
use crate::protocol::{FileId, Message, SharedFileEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    /// Sender: `FILE_INFO` sent, chunks streaming (no explicit ack in the protocol).
    AwaitingInfoAck,
    /// Receiver: `FILE_INFO` accepted, sink allocated.
    AwaitingChunks,
    Verifying,
    Completed,
    Failed(FailureKind),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed(_))
    }
}

pub struct TransferSession {
    session_id: u32,
    direction: Direction,
    file_id: FileId,
    size: u64,
    expected_hash: ContentHash,
    next_seq: u64,
    verifier: Verifier,
    state: SessionState,
}

impl TransferSession {
    /// Sender side, for a catalog entry the peer requested.
    pub fn sending(session_id: u32, entry: &SharedFileEntry) -> Self {
        Self::new(session_id, Direction::Send, entry.id.clone(), entry.size, entry.hash)
    }

    /// Receiver side, from the peer's `FILE_INFO`.
    pub fn receiving(session_id: u32, file_id: FileId, size: u64, hash: ContentHash) -> Self {
        Self::new(session_id, Direction::Receive, file_id, size, hash)
    }

    fn new(
        session_id: u32,
        direction: Direction,
        file_id: FileId,
        size: u64,
        expected_hash: ContentHash,
    ) -> Self {
        Self {
            session_id,
            direction,
            file_id,
            size,
            expected_hash,
            next_seq: 0,
            verifier: Verifier::start(),
            state: SessionState::Init,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn expected_hash(&self) -> ContentHash {
        self.expected_hash
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.verifier.bytes()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Force a terminal failure. No-op once terminal.
    pub fn fail(&mut self, kind: FailureKind) {
        if !self.is_terminal() {
            self.state = SessionState::Failed(kind);
        }
    }

    // Sender

    /// `FILE_INFO` announcing this session. Moves INIT to AWAITING_INFO_ACK.
    pub fn file_info(&mut self) -> Message {
        if self.state == SessionState::Init {
            self.state = SessionState::AwaitingInfoAck;
        }
        Message::FileInfo {
            id: self.file_id.clone(),
            size: self.size,
            hash: self.expected_hash,
            session_id: self.session_id,
        }
    }

    /// Wrap the next slice of source bytes into a `FILE_CHUNK`.
    /// Fails if the source yields more than the advertised size.
    pub fn next_chunk(&mut self, data: Vec<u8>) -> Result<Message, Error> {
        debug_assert_eq!(self.state, SessionState::AwaitingInfoAck);
        let total = self.bytes_transferred() + data.len() as u64;
        self.verifier.update(&data);
        if total > self.size {
            self.state = SessionState::Failed(FailureKind::Integrity);
            return Err(self.integrity_error(self.verifier.clone().finish()));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(Message::FileChunk {
            session_id: self.session_id,
            seq,
            data,
        })
    }

    /// Source exhausted: `TRANSFER_COMPLETE` if what was streamed matches what was advertised.
    pub fn finish_sending(&mut self) -> Result<Message, Error> {
        self.state = SessionState::Verifying;
        let actual = self.verifier.clone().finish();
        if self.bytes_transferred() != self.size || actual != self.expected_hash {
            self.state = SessionState::Failed(FailureKind::Integrity);
            return Err(self.integrity_error(actual));
        }
        self.state = SessionState::Completed;
        Ok(Message::TransferComplete {
            session_id: self.session_id,
        })
    }

    // Receiver

    /// Sink is ready; start accepting chunks.
    pub fn await_chunks(&mut self) {
        if self.state == SessionState::Init {
            self.state = SessionState::AwaitingChunks;
        }
    }

    /// Account one inbound chunk. Chunks must arrive with sequence 0, 1, 2, ...
    /// Any violation fails the session with a protocol error.
    pub fn on_chunk(&mut self, session_id: u32, seq: u64, data: &[u8]) -> Result<(), ProtocolError> {
        let res = self.check_chunk(session_id, seq, data.len());
        match res {
            Ok(()) => {
                self.verifier.update(data);
                self.next_seq += 1;
                Ok(())
            }
            Err(e) => {
                self.fail(FailureKind::Protocol);
                Err(e)
            }
        }
    }

    fn check_chunk(&self, session_id: u32, seq: u64, len: usize) -> Result<(), ProtocolError> {
        if self.state != SessionState::AwaitingChunks {
            return Err(ProtocolError::Unexpected {
                got: "FILE_CHUNK",
                during: "no active receive",
            });
        }
        if session_id != self.session_id {
            return Err(ProtocolError::SessionMismatch {
                expected: self.session_id,
                got: session_id,
            });
        }
        if seq != self.next_seq {
            return Err(ProtocolError::OutOfSequence {
                expected: self.next_seq,
                got: seq,
            });
        }
        let got = self.bytes_transferred() + len as u64;
        if got > self.size {
            return Err(ProtocolError::SizeExceeded {
                advertised: self.size,
                got,
            });
        }
        Ok(())
    }

    /// `TRANSFER_COMPLETE` received: verify and reach a terminal state.
    pub fn on_complete(&mut self, session_id: u32) -> Result<ContentHash, Error> {
        if self.state != SessionState::AwaitingChunks {
            self.fail(FailureKind::Protocol);
            return Err(ProtocolError::Unexpected {
                got: "TRANSFER_COMPLETE",
                during: "no active receive",
            }
            .into());
        }
        if session_id != self.session_id {
            self.fail(FailureKind::Protocol);
            return Err(ProtocolError::SessionMismatch {
                expected: self.session_id,
                got: session_id,
            }
            .into());
        }
        self.state = SessionState::Verifying;
        let actual = self.verifier.clone().finish();
        if self.bytes_transferred() != self.size || actual != self.expected_hash {
            self.state = SessionState::Failed(FailureKind::Integrity);
            return Err(self.integrity_error(actual));
        }
        self.state = SessionState::Completed;
        Ok(actual)
    }

    fn integrity_error(&self, actual: ContentHash) -> Error {
        Error::Integrity {
            file_id: self.file_id.clone(),
            expected: self.expected_hash,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_bytes;
    use crate::protocol::CHUNK_SIZE;

    fn three_chunk_file() -> Vec<u8> {
        (0..CHUNK_SIZE * 2 + 100).map(|i| (i * 7) as u8).collect()
    }

    fn receiver(data: &[u8]) -> TransferSession {
        let mut s = TransferSession::receiving(1, "f".into(), data.len() as u64, hash_bytes(data));
        s.await_chunks();
        s
    }

    #[test]
    fn in_order_chunks_complete() {
        let data = three_chunk_file();
        let mut s = receiver(&data);
        for (seq, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            s.on_chunk(1, seq as u64, chunk).unwrap();
        }
        assert_eq!(s.bytes_transferred(), data.len() as u64);
        assert_eq!(s.on_complete(1).unwrap(), hash_bytes(&data));
        assert_eq!(s.state(), SessionState::Completed);
    }

    #[test]
    fn flipped_byte_fails_integrity() {
        let data = three_chunk_file();
        let mut s = receiver(&data);
        let mut chunks: Vec<Vec<u8>> = data.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        chunks[1][10] ^= 0x01;
        for (seq, chunk) in chunks.iter().enumerate() {
            s.on_chunk(1, seq as u64, chunk).unwrap();
        }
        assert!(matches!(s.on_complete(1), Err(Error::Integrity { .. })));
        assert_eq!(s.state(), SessionState::Failed(FailureKind::Integrity));
    }

    #[test]
    fn out_of_order_chunks_rejected() {
        let data = three_chunk_file();
        let chunks: Vec<&[u8]> = data.chunks(CHUNK_SIZE).collect();
        let mut s = receiver(&data);
        s.on_chunk(1, 0, chunks[0]).unwrap();
        let err = s.on_chunk(1, 2, chunks[2]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::OutOfSequence {
                expected: 1,
                got: 2
            }
        ));
        assert_eq!(s.state(), SessionState::Failed(FailureKind::Protocol));
        assert!(s.on_chunk(1, 1, chunks[1]).is_err());
        assert!(s.on_complete(1).is_err());
        assert_ne!(s.state(), SessionState::Completed);
    }

    #[test]
    fn duplicate_sequence_rejected() {
        let data = three_chunk_file();
        let mut s = receiver(&data);
        s.on_chunk(1, 0, &data[..CHUNK_SIZE]).unwrap();
        assert!(matches!(
            s.on_chunk(1, 0, &data[..CHUNK_SIZE]),
            Err(ProtocolError::OutOfSequence { .. })
        ));
    }

    #[test]
    fn foreign_session_rejected() {
        let data = three_chunk_file();
        let mut s = receiver(&data);
        assert!(matches!(
            s.on_chunk(9, 0, &data[..CHUNK_SIZE]),
            Err(ProtocolError::SessionMismatch { expected: 1, got: 9 })
        ));
    }

    #[test]
    fn overrun_rejected() {
        let mut s = receiver(b"tiny");
        assert!(matches!(
            s.on_chunk(1, 0, b"much longer than advertised"),
            Err(ProtocolError::SizeExceeded { advertised: 4, .. })
        ));
    }

    #[test]
    fn short_transfer_fails_integrity() {
        let data = three_chunk_file();
        let mut s = receiver(&data);
        s.on_chunk(1, 0, &data[..CHUNK_SIZE]).unwrap();
        assert!(matches!(s.on_complete(1), Err(Error::Integrity { .. })));
    }

    #[test]
    fn chunk_before_info_rejected() {
        let mut s = TransferSession::receiving(1, "f".into(), 4, hash_bytes(b"abcd"));
        assert!(matches!(
            s.on_chunk(1, 0, b"abcd"),
            Err(ProtocolError::Unexpected { .. })
        ));
    }

    #[test]
    fn empty_file_completes_without_chunks() {
        let mut s = receiver(b"");
        assert!(s.on_complete(1).is_ok());
        assert_eq!(s.state(), SessionState::Completed);
    }

    #[test]
    fn sender_streams_sequential_chunks() {
        let data = three_chunk_file();
        let entry = SharedFileEntry {
            id: "f".into(),
            name: "f".into(),
            size: data.len() as u64,
            hash: hash_bytes(&data),
        };
        let mut tx = TransferSession::sending(4, &entry);
        assert_eq!(tx.state(), SessionState::Init);
        let info = tx.file_info();
        assert!(matches!(info, Message::FileInfo { session_id: 4, .. }));
        assert_eq!(tx.state(), SessionState::AwaitingInfoAck);

        let mut rx = TransferSession::receiving(4, "f".into(), entry.size, entry.hash);
        rx.await_chunks();
        for chunk in data.chunks(CHUNK_SIZE) {
            match tx.next_chunk(chunk.to_vec()).unwrap() {
                Message::FileChunk {
                    session_id,
                    seq,
                    data,
                } => rx.on_chunk(session_id, seq, &data).unwrap(),
                other => panic!("unexpected {other:?}"),
            }
        }
        let done = tx.finish_sending().unwrap();
        assert_eq!(done, Message::TransferComplete { session_id: 4 });
        assert_eq!(tx.state(), SessionState::Completed);
        rx.on_complete(4).unwrap();
    }

    #[test]
    fn sender_detects_changed_source() {
        let entry = SharedFileEntry {
            id: "f".into(),
            name: "f".into(),
            size: 4,
            hash: hash_bytes(b"abcd"),
        };
        let mut tx = TransferSession::sending(1, &entry);
        tx.file_info();
        tx.next_chunk(b"abcx".to_vec()).unwrap();
        assert!(matches!(tx.finish_sending(), Err(Error::Integrity { .. })));
        assert_eq!(tx.state(), SessionState::Failed(FailureKind::Integrity));

        let mut tx = TransferSession::sending(2, &entry);
        tx.file_info();
        assert!(tx.next_chunk(b"abcdef".to_vec()).is_err());
        assert!(tx.is_terminal());
    }

    #[test]
    fn fail_is_sticky_and_ignores_terminal() {
        let mut s = receiver(b"");
        s.fail(FailureKind::Timeout);
        s.fail(FailureKind::Transport);
        assert_eq!(s.state(), SessionState::Failed(FailureKind::Timeout));

        let mut done = receiver(b"");
        done.on_complete(1).unwrap();
        done.fail(FailureKind::Cancelled);
        assert_eq!(done.state(), SessionState::Completed);
    }
}
