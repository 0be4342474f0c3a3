use super::types::PeerAddr;

use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

/// Size of one record in a compact peer list.
pub const COMPACT_PEER_LEN: usize = 6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PeerListError {
    #[error("received malformed peers of length {0}, expected a multiple of 6")]
    MalformedPeerList(usize),
}

/// Address of a remote peer as handed out by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        PeerAddress { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<PeerAddr> for PeerAddress {
    // Peers are given as chunks of 6 bytes in compact mode, like so:
    // [192, 0, 2, 123, 26, 225].  The first four bytes are the IP, and the
    // last two are the port in BigEndian format.
    // Eg: [26, 225] or [0x1A, 0xE1] -> 6881
    fn from(peer_addr: PeerAddr) -> Self {
        let ip = Ipv4Addr::new(peer_addr[0], peer_addr[1], peer_addr[2], peer_addr[3]);
        let port = BigEndian::read_u16(&peer_addr[4..6]);

        PeerAddress { ip, port }
    }
}

/// Decodes a compact peer list, keeping the tracker's ordering.
pub fn decode_peers(blob: &[u8]) -> Result<Vec<PeerAddress>, PeerListError> {
    if blob.len() % COMPACT_PEER_LEN != 0 {
        return Err(PeerListError::MalformedPeerList(blob.len()));
    }

    Ok(blob
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let mut record: PeerAddr = [0; COMPACT_PEER_LEN];
            record.copy_from_slice(chunk);
            PeerAddress::from(record)
        })
        .collect())
}
