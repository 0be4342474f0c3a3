//! Peer wire protocol: torrent metadata, compact peer lists, handshakes,
//! length prefixed messages and the per-peer connection built on them.

pub mod bitfield;
pub mod block;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod peerclient;
pub mod torrent;
pub mod tracker;
pub mod types;

pub use bitfield::Bitfield;
pub use block::{Block, BlockInfo};
pub use handshake::{Handshake, HandshakeCodec, HandshakeError};
pub use message::{KeepAlive, Message, MessageCodec, MessageError, MessageId};
pub use peer::{decode_peers, PeerAddress, PeerListError};
pub use peerclient::{PeerConnection, PeerError, PeerErrorKind, PeerState};
pub use torrent::{MetainfoError, TorrentFile};
pub use tracker::{build_tracker_url, TrackerError, TrackerRequest, TrackerResponse};
pub use types::{InfoHash, PeerId};

use rand::Rng;

/// Prefix identifying this client in the peer id, Azureus style.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-PW0100-";

/// A fresh peer id: the client prefix followed by random bytes.
pub fn generate_peer_id() -> PeerId {
    let mut peer_id: PeerId = rand::thread_rng().gen();
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_prefix() {
        let first = generate_peer_id();
        let second = generate_peer_id();
        assert_eq!(&first[..8], b"-PW0100-");
        assert_eq!(&second[..8], b"-PW0100-");
        assert_ne!(first, second);
    }
}
