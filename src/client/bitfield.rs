use bitvec::prelude::{BitVec, Msb0};
use bytes::Bytes;

use super::types::PieceIndex;

/// The set of pieces a peer claims to have, as sent in its bitfield message.
///
/// Piece `i` lives in byte `i / 8`, most significant bit first. Indexes past
/// the end read as missing and writes to them are ignored: the peer reports
/// its own state and we don't trust it enough to fail on it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// An empty bitfield large enough to hold `pieces` bits.
    pub fn with_pieces(pieces: usize) -> Self {
        let bytes = (pieces + 7) / 8;
        Self::from(vec![0u8; bytes])
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.bits.get(index).map_or(false, |bit| *bit)
    }

    pub fn set_piece(&mut self, index: PieceIndex) {
        if index < self.bits.len() {
            self.bits.set(index, true);
        }
    }

    /// Number of addressable pieces, always a multiple of 8.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Wire representation, used as the payload of a bitfield message.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.bits.as_raw_slice())
    }
}

impl From<Vec<u8>> for Bitfield {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bits: BitVec::from_vec(bytes),
        }
    }
}

impl From<&[u8]> for Bitfield {
    fn from(bytes: &[u8]) -> Self {
        Self::from(bytes.to_vec())
    }
}
