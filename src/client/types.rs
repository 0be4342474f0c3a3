pub type InfoHash = [u8; 20];
pub type PeerId = [u8; 20];
pub type PieceHash = [u8; 20];
pub type PieceHashes = Vec<PieceHash>;
pub type PieceIndex = usize;

// compact peer record: 4 bytes ipv4, 2 bytes big endian port
pub type PeerAddr = [u8; 6];

/// Length of a SHA-1 digest, used for info hashes, peer ids and piece hashes.
pub const HASH_LEN: usize = 20;
