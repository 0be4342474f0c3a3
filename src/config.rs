use std::time::Duration;

use crate::client::types::PeerId;

/// Deadlines applied while bringing a peer connection up to the ready state.
///
/// Each deadline bounds exactly one setup step and is dropped as soon as the
/// step finishes, so none of them applies to traffic after the initial
/// bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConfig {
    /// Time allowed to establish the transport connection.
    pub connect_timeout: Duration,
    /// Time allowed for writing our handshake and reading the peer's.
    pub handshake_timeout: Duration,
    /// Time allowed for the first frame after the handshake.
    pub bitfield_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            bitfield_timeout: Duration::from_secs(5),
        }
    }
}

/// Settings of the local client, shared by every peer connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub port: u16,
    pub peer_id: PeerId,
    pub peer: PeerConfig,
}

impl ClientConfig {
    pub const DEFAULT_PORT: u16 = 6881;

    pub fn new(peer_id: PeerId) -> Self {
        Self {
            port: Self::DEFAULT_PORT,
            peer_id,
            peer: PeerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deadlines() {
        let config = PeerConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.bitfield_timeout, Duration::from_secs(5));
    }

    #[test]
    fn client_defaults_to_standard_port() {
        let config = ClientConfig::new([1; 20]);
        assert_eq!(config.port, 6881);
        assert_eq!(config.peer, PeerConfig::default());
    }
}
