use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

/// `<index><begin><length>`, the payload of request and cancel messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub block_offset: u32,
    pub block_length: u32,
}

impl BlockInfo {
    pub const LEN: usize = 12;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.piece_index);
        buf.put_u32(self.block_offset);
        buf.put_u32(self.block_length);
    }

    /// Returns `None` unless `payload` is exactly [`BlockInfo::LEN`] bytes.
    pub fn decode(payload: &[u8]) -> Option<BlockInfo> {
        if payload.len() != Self::LEN {
            return None;
        }
        Some(BlockInfo {
            piece_index: BigEndian::read_u32(&payload[0..4]),
            block_offset: BigEndian::read_u32(&payload[4..8]),
            block_length: BigEndian::read_u32(&payload[8..12]),
        })
    }
}

/// `<index><begin><block>`, the payload of a piece message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub piece_index: u32,
    pub block_offset: u32,
    pub data: Bytes,
}

impl Block {
    pub const HEADER_LEN: usize = 8;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(Self::HEADER_LEN + self.data.len());
        buf.put_u32(self.piece_index);
        buf.put_u32(self.block_offset);
        buf.put_slice(&self.data);
    }

    /// Returns `None` when the payload is too short to hold the header.
    pub fn decode(payload: &Bytes) -> Option<Block> {
        if payload.len() < Self::HEADER_LEN {
            return None;
        }
        Some(Block {
            piece_index: BigEndian::read_u32(&payload[0..4]),
            block_offset: BigEndian::read_u32(&payload[4..8]),
            data: payload.slice(Self::HEADER_LEN..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_block_info() {
        let info = BlockInfo {
            piece_index: 1,
            block_offset: 0x4000,
            block_length: 0x4000,
        };
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]);
        assert_eq!(BlockInfo::decode(&buf), Some(info));
    }

    #[test]
    fn block_info_wrong_length() {
        assert_eq!(BlockInfo::decode(&[0; 11]), None);
        assert_eq!(BlockInfo::decode(&[0; 13]), None);
    }

    #[test]
    fn decode_block() {
        let payload = Bytes::from_static(&[0, 0, 0, 2, 0, 0, 0, 8, 0xde, 0xad]);
        let block = Block::decode(&payload).unwrap();
        assert_eq!(block.piece_index, 2);
        assert_eq!(block.block_offset, 8);
        assert_eq!(&block.data[..], &[0xde, 0xad]);

        assert_eq!(Block::decode(&Bytes::from_static(&[0; 7])), None);
    }
}
