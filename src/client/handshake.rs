//! The handshake is the first message on every connection and has its own
//! fixed layout:
//!
//! `<pstrlen=19><pstr="BitTorrent protocol"><reserved: 8><info_hash: 20><peer_id: 20>`
//!
//! It gets its own codec because it doesn't share the length prefixed framing
//! of the other messages. After both handshakes are exchanged the connection
//! is switched over to [`MessageCodec`](super::message::MessageCodec).

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::types::{InfoHash, PeerId, HASH_LEN};

/// Protocol identifier sent in every handshake.
pub const PSTR: &[u8; 19] = b"BitTorrent protocol";

/// Size of a handshake carrying [`PSTR`].
pub const HANDSHAKE_LEN: usize = 1 + PSTR.len() + RESERVED_LEN + HASH_LEN + HASH_LEN;

const RESERVED_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("handshake ended after {0} bytes")]
    Truncated(usize),

    #[error("peer speaks an unknown protocol {0:?}")]
    ProtocolMismatch(String),

    #[error("expected info hash {expected} but got {actual}")]
    InfoHashMismatch { expected: String, actual: String },

    #[error("io error during handshake")]
    Io(#[from] io::Error),
}

/// A parsed handshake. The protocol string is always [`PSTR`], anything else
/// is rejected while parsing, so only the variable fields are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; RESERVED_LEN],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Handshake {
            // no extensions supported
            reserved: [0; RESERVED_LEN],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PSTR.len() as u8);
        buf.put_slice(PSTR);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
    }

    /// Parses a complete handshake from the start of `buf`.
    ///
    /// The protocol string length is honoured as sent, so a peer announcing
    /// a different protocol is reported as a mismatch rather than as a
    /// truncated read.
    pub fn parse(buf: &[u8]) -> Result<Handshake, HandshakeError> {
        let pstr_len = *buf.first().ok_or(HandshakeError::Truncated(0))? as usize;
        let len = frame_len(pstr_len);
        if buf.len() < len {
            return Err(HandshakeError::Truncated(buf.len()));
        }

        let pstr = &buf[1..1 + pstr_len];
        if pstr != PSTR {
            return Err(HandshakeError::ProtocolMismatch(
                String::from_utf8_lossy(pstr).into_owned(),
            ));
        }

        let rest = &buf[1 + pstr_len..len];
        let mut handshake = Handshake::new([0; HASH_LEN], [0; HASH_LEN]);
        handshake.reserved.copy_from_slice(&rest[..RESERVED_LEN]);
        handshake
            .info_hash
            .copy_from_slice(&rest[RESERVED_LEN..RESERVED_LEN + HASH_LEN]);
        handshake
            .peer_id
            .copy_from_slice(&rest[RESERVED_LEN + HASH_LEN..]);

        Ok(handshake)
    }

    /// Checks the handshake a peer answered with against the torrent we
    /// asked for.
    pub fn validate(&self, expected: &InfoHash) -> Result<(), HandshakeError> {
        if &self.info_hash != expected {
            warn!("info_hash from receiving handshake does not match ours");
            return Err(HandshakeError::InfoHashMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(self.info_hash),
            });
        }
        Ok(())
    }
}

fn frame_len(pstr_len: usize) -> usize {
    1 + pstr_len + RESERVED_LEN + HASH_LEN + HASH_LEN
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = HandshakeError;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), HandshakeError> {
        buf.reserve(HANDSHAKE_LEN);
        handshake.encode(buf);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = HandshakeError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, HandshakeError> {
        let pstr_len = match buf.first() {
            Some(len) => *len as usize,
            None => return Ok(None),
        };

        // wait until the whole handshake is buffered, without consuming the
        // bytes that may already belong to the next message
        let len = frame_len(pstr_len);
        if buf.len() < len {
            buf.reserve(len - buf.len());
            return Ok(None);
        }

        let frame = buf.split_to(len);
        Handshake::parse(&frame).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, HandshakeError> {
        match self.decode(buf)? {
            Some(handshake) => Ok(Some(handshake)),
            None if buf.is_empty() => Ok(None),
            None => Err(HandshakeError::Truncated(buf.len())),
        }
    }
}
