use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use serde_derive::Deserialize;
use thiserror::Error;

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use super::types::{InfoHash, PieceHash, PieceHashes, PieceIndex, HASH_LEN};

#[derive(Error, Debug)]
pub enum MetainfoError {
    #[error("unable to read torrent file: {0}")]
    Io(#[from] io::Error),

    #[error("malformed torrent metadata: {0}")]
    MalformedMetadata(String),

    #[error("received malformed pieces: {0}")]
    MalformedPieces(String),
}

impl From<serde_bencode::Error> for MetainfoError {
    fn from(e: serde_bencode::Error) -> Self {
        MetainfoError::MalformedMetadata(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct BencodeInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u64,
    pieces: ByteBuf,
    length: u64,
}

impl BencodeInfo {
    fn split_piece_hashes(&self) -> Result<PieceHashes, MetainfoError> {
        split_piece_hashes(&self.pieces)
    }
}

#[derive(Debug, Deserialize)]
struct BencodeTorrent {
    announce: String,
    info: BencodeInfo,
}

// The info dictionary as it appeared in the file, unknown keys included.
// Hashing the typed struct would silently drop keys such as `private`.
#[derive(Debug, Deserialize)]
struct RawTorrent {
    info: Value,
}

/// Metadata of a single file torrent.
///
/// Built once from the descriptor; the info hash and piece hashes are
/// computed at parse time and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub announce: String,
    pub info_hash: InfoHash,
    pub piece_hashes: PieceHashes,
    pub piece_length: u64,
    pub length: u64,
    pub name: String,
}

impl TorrentFile {
    /// Reads and parses a `.torrent` file from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        let buffer = fs::read(path)?;
        Self::parse(&buffer)
    }

    // An intermediate representation is required because the sha1 hash of
    // the info dictionary has to be computed over its bencoded form, which
    // serde can't give us while deserializing into the typed struct.
    pub fn parse(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let torrent = serde_bencode::from_bytes::<BencodeTorrent>(bytes)?;
        let raw = serde_bencode::from_bytes::<RawTorrent>(bytes)?;

        let info = torrent.info;
        if info.piece_length == 0 {
            return Err(MetainfoError::MalformedMetadata(
                "piece length must be positive".into(),
            ));
        }
        if info.length == 0 {
            return Err(MetainfoError::MalformedMetadata(
                "length must be positive".into(),
            ));
        }

        let piece_hashes = info.split_piece_hashes()?;
        let expected = (info.length + info.piece_length - 1) / info.piece_length;
        if piece_hashes.len() as u64 != expected {
            return Err(MetainfoError::MalformedPieces(format!(
                "{} hashes for {} pieces",
                piece_hashes.len(),
                expected
            )));
        }

        Ok(TorrentFile {
            announce: torrent.announce,
            info_hash: info_hash(&raw.info)?,
            piece_hashes,
            piece_length: info.piece_length,
            length: info.length,
            name: info.name,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of the piece at `index`, the last one may be shorter than the
    /// piece length. Returns `None` for indexes outside of the torrent.
    pub fn piece_size(&self, index: PieceIndex) -> Option<u64> {
        if index >= self.piece_count() {
            return None;
        }
        let begin = index as u64 * self.piece_length;
        Some(self.piece_length.min(self.length - begin))
    }

    /// Checks downloaded piece data against its hash in the piece table.
    // This should only be executed on a thread pool and not the executor.
    pub fn verify_piece(&self, index: PieceIndex, data: &[u8]) -> bool {
        match self.piece_hashes.get(index) {
            Some(expected) => &sha1::Sha1::from(data).digest().bytes() == expected,
            None => false,
        }
    }
}

impl fmt::Display for TorrentFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "name:\t\t{}", self.name)?;
        writeln!(f, "announce:\t{}", self.announce)?;
        writeln!(f, "info hash:\t{}", hex::encode(self.info_hash))?;
        writeln!(f, "length:\t\t{}", self.length)?;
        writeln!(f, "piece length:\t{}", self.piece_length)?;
        write!(f, "pieces:\t\t{}", self.piece_count())
    }
}

/// SHA-1 of the canonical bencoding of an info dictionary.
///
/// serde_bencode writes dictionary keys sorted and integers without padding,
/// which reproduces the original bytes of any well formed descriptor.
pub fn info_hash(info: &Value) -> Result<InfoHash, MetainfoError> {
    match info {
        Value::Dict(_) => {}
        _ => {
            return Err(MetainfoError::MalformedMetadata(
                "info is not a dictionary".into(),
            ))
        }
    }
    let serialized = serde_bencode::to_bytes(info)?;
    Ok(sha1::Sha1::from(serialized).digest().bytes())
}

/// Splits the concatenated `pieces` blob into 20 byte hashes, in blob order.
pub fn split_piece_hashes(blob: &[u8]) -> Result<PieceHashes, MetainfoError> {
    if blob.len() % HASH_LEN != 0 {
        return Err(MetainfoError::MalformedPieces(format!(
            "length {} is not a multiple of {}",
            blob.len(),
            HASH_LEN
        )));
    }
    Ok(blob
        .chunks_exact(HASH_LEN)
        .map(|chunk| {
            let mut hash: PieceHash = [0; HASH_LEN];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}
