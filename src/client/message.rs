use std::fmt;
use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num::FromPrimitive;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::bitfield::Bitfield;
use super::block::{Block, BlockInfo};

/// Largest frame accepted from a peer, not counting the length prefix. Leaves
/// room for the id and piece header around a 2 MiB block.
pub const MAX_MESSAGE_LENGTH: usize = 2 * 1024 * 1024 + 1 + Block::HEADER_LEN;

const LENGTH_PREFIX: usize = 4;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("message ended after {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },

    #[error("message of {0} bytes is larger than the allowed maximum")]
    Oversized(usize),

    #[error("payload of {len} bytes is not valid for message id {id}")]
    InvalidPayload { id: u8, len: usize },

    #[error("io error while exchanging messages")]
    Io(#[from] io::Error),
}

#[derive(Debug, FromPrimitive, Copy, Clone, PartialEq, Eq)]
pub enum MessageId {
    // Chokes the receiver
    Choke = 0,
    // Unchokes the receiver
    Unchoke = 1,
    // Whether or not we are interested in anything the peer has. Sent after
    // being unchoked, and requesting blocks.
    Interested = 2,
    // Sender is not interested.
    NotInterested = 3,
    // Have payload is zero indexed of a piece that has been downloaded and
    // verified by hash.
    Have = 4,
    // Sent immediately after handshaking,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    // DHT listen port, only sent by peers with DHT support.
    Port = 9,
}

/// A single framed message. Ids outside of [`MessageId`] are kept as they
/// came so the caller can decide to skip or reject them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u8,
    pub payload: Bytes,
}

/// The zero length frame, sent to keep an idle connection open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive;

impl Message {
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Message {
            id: id as u8,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> Option<MessageId> {
        MessageId::from_u8(self.id)
    }

    pub fn is(&self, id: MessageId) -> bool {
        self.id == id as u8
    }

    pub fn choke() -> Self {
        Message::new(MessageId::Choke, Bytes::new())
    }

    pub fn unchoke() -> Self {
        Message::new(MessageId::Unchoke, Bytes::new())
    }

    pub fn interested() -> Self {
        Message::new(MessageId::Interested, Bytes::new())
    }

    pub fn not_interested() -> Self {
        Message::new(MessageId::NotInterested, Bytes::new())
    }

    pub fn have(index: u32) -> Self {
        Message::new(MessageId::Have, Bytes::copy_from_slice(&index.to_be_bytes()))
    }

    pub fn bitfield(bitfield: &Bitfield) -> Self {
        Message::new(MessageId::Bitfield, bitfield.to_bytes())
    }

    pub fn request(info: BlockInfo) -> Self {
        let mut buf = BytesMut::with_capacity(BlockInfo::LEN);
        info.encode(&mut buf);
        Message::new(MessageId::Request, buf.freeze())
    }

    pub fn cancel(info: BlockInfo) -> Self {
        let mut buf = BytesMut::with_capacity(BlockInfo::LEN);
        info.encode(&mut buf);
        Message::new(MessageId::Cancel, buf.freeze())
    }

    pub fn piece(block: &Block) -> Self {
        let mut buf = BytesMut::new();
        block.encode(&mut buf);
        Message::new(MessageId::Piece, buf.freeze())
    }

    pub fn port(port: u16) -> Self {
        Message::new(MessageId::Port, Bytes::copy_from_slice(&port.to_be_bytes()))
    }

    fn invalid_payload(&self) -> MessageError {
        MessageError::InvalidPayload {
            id: self.id,
            len: self.payload.len(),
        }
    }

    /// Piece index announced by a have message.
    pub fn parse_have(&self) -> Result<u32, MessageError> {
        if !self.is(MessageId::Have) || self.payload.len() != 4 {
            return Err(self.invalid_payload());
        }
        Ok(BigEndian::read_u32(&self.payload))
    }

    /// Block described by a request or cancel message.
    pub fn parse_block_info(&self) -> Result<BlockInfo, MessageError> {
        if !self.is(MessageId::Request) && !self.is(MessageId::Cancel) {
            return Err(self.invalid_payload());
        }
        BlockInfo::decode(&self.payload).ok_or_else(|| self.invalid_payload())
    }

    pub fn parse_piece(&self) -> Result<Block, MessageError> {
        if !self.is(MessageId::Piece) {
            return Err(self.invalid_payload());
        }
        Block::decode(&self.payload).ok_or_else(|| self.invalid_payload())
    }

    pub fn parse_port(&self) -> Result<u16, MessageError> {
        if !self.is(MessageId::Port) || self.payload.len() != 2 {
            return Err(self.invalid_payload());
        }
        Ok(BigEndian::read_u16(&self.payload))
    }

    /// `<length prefix><id><payload>` where the prefix counts the id byte.
    pub fn serialize(&self) -> Result<Bytes, MessageError> {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + 1 + self.payload.len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), MessageError> {
        let length = self.payload.len() + 1;
        if length > MAX_MESSAGE_LENGTH {
            return Err(MessageError::Oversized(length));
        }
        buf.put_u32(length as u32);
        buf.put_u8(self.id);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Parses one frame from the start of `buf`. A keep-alive yields `None`.
    pub fn parse(buf: &[u8]) -> Result<Option<Message>, MessageError> {
        if buf.len() < LENGTH_PREFIX {
            return Err(MessageError::Truncated {
                expected: LENGTH_PREFIX,
                got: buf.len(),
            });
        }

        let length = BigEndian::read_u32(&buf[..LENGTH_PREFIX]) as usize;
        if length == 0 {
            return Ok(None);
        }

        let frame = &buf[LENGTH_PREFIX..];
        if frame.len() < length {
            return Err(MessageError::Truncated {
                expected: length,
                got: frame.len(),
            });
        }

        Ok(Some(Message {
            id: frame[0],
            payload: Bytes::copy_from_slice(&frame[1..length]),
        }))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind() {
            Some(id) => write!(f, "{:?} ({} bytes)", id, self.payload.len()),
            None => write!(f, "unknown id {} ({} bytes)", self.id, self.payload.len()),
        }
    }
}

/// Codec for the length prefixed messages that follow the handshake.
///
/// Decodes to `Option<Message>`, with `None` standing for a keep-alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = MessageError;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), MessageError> {
        buf.reserve(LENGTH_PREFIX + 1 + message.payload.len());
        message.encode(buf)
    }
}

impl Encoder<KeepAlive> for MessageCodec {
    type Error = MessageError;

    fn encode(&mut self, _: KeepAlive, buf: &mut BytesMut) -> Result<(), MessageError> {
        buf.put_u32(0);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Option<Message>;
    type Error = MessageError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Option<Message>>, MessageError> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // peek at the prefix, the frame may not be fully buffered yet
        let length = BigEndian::read_u32(&buf[..LENGTH_PREFIX]) as usize;
        if length > MAX_MESSAGE_LENGTH {
            return Err(MessageError::Oversized(length));
        }

        if length == 0 {
            buf.advance(LENGTH_PREFIX);
            debug!("< keep-alive");
            return Ok(Some(None));
        }

        if buf.len() < LENGTH_PREFIX + length {
            buf.reserve(LENGTH_PREFIX + length - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX);
        let mut frame = buf.split_to(length);
        let id = frame.get_u8();
        let message = Message {
            id,
            payload: frame.freeze(),
        };

        if message.kind().is_none() {
            debug!("< unknown message id {}", id);
        }

        Ok(Some(Some(message)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Option<Message>>, MessageError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                let expected = if buf.len() < LENGTH_PREFIX {
                    LENGTH_PREFIX
                } else {
                    BigEndian::read_u32(&buf[..LENGTH_PREFIX]) as usize
                };
                Err(MessageError::Truncated {
                    expected,
                    got: buf.len().saturating_sub(LENGTH_PREFIX),
                })
            }
        }
    }
}
