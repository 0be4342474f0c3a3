use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};
use tracing::debug;

use super::bitfield::Bitfield;
use super::handshake::{Handshake, HandshakeCodec, HandshakeError};
use super::message::{KeepAlive, Message, MessageCodec, MessageError, MessageId};
use super::peer::PeerAddress;
use super::types::{InfoHash, PeerId};
use crate::config::PeerConfig;

/// Lifecycle of a connection. `Ready` is the only state in which messages
/// can be exchanged; `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    AwaitingBitfield,
    Ready,
    Closed,
    Failed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stage = match self {
            PeerState::Connecting => "connecting",
            PeerState::Handshaking => "handshaking",
            PeerState::AwaitingBitfield => "awaiting bitfield",
            PeerState::Ready => "ready",
            PeerState::Closed => "closed",
            PeerState::Failed => "failed",
        };
        f.write_str(stage)
    }
}

#[derive(Error, Debug)]
pub enum PeerErrorKind {
    #[error("could not connect: {0}")]
    Connect(#[source] io::Error),

    #[error("peer took too long to complete the handshake")]
    HandshakeTimeout,

    #[error("peer took too long to send a message")]
    ReceiveTimeout,

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("expected {expected:?} but got {got}")]
    UnexpectedMessage { expected: MessageId, got: String },

    #[error("peer closed the connection")]
    Disconnected,

    #[error("connection is no longer usable")]
    Closed,
}

/// A failure on a peer connection, with the peer and the stage it happened
/// in. The connection it came from is gone and must not be retried as is.
#[derive(Error, Debug)]
#[error("peer {addr} failed while {stage}: {kind}")]
pub struct PeerError {
    pub addr: PeerAddress,
    pub stage: PeerState,
    #[source]
    pub kind: PeerErrorKind,
}

impl PeerError {
    fn new(addr: PeerAddress, stage: PeerState, kind: PeerErrorKind) -> Self {
        debug!(peer = %addr, %stage, "{}", kind);
        PeerError { addr, stage, kind }
    }
}

/// Session with a single peer, owning its transport exclusively.
///
/// Created through [`PeerConnection::connect`] (or [`PeerConnection::establish`]
/// for an already open transport), which only returns once the handshake is
/// validated and the peer's bitfield has arrived.
#[derive(Debug)]
pub struct PeerConnection<T = TcpStream> {
    addr: PeerAddress,
    info_hash: InfoHash,
    remote_id: PeerId,
    state: PeerState,
    socket: Option<Framed<T, MessageCodec>>,
    pub bitfield: Bitfield,
    /// Peers start out choking us until they send an unchoke.
    pub choked: bool,
}

impl PeerConnection<TcpStream> {
    pub async fn connect(
        addr: PeerAddress,
        info_hash: InfoHash,
        peer_id: PeerId,
        config: &PeerConfig,
    ) -> Result<Self, PeerError> {
        let connecting = TcpStream::connect(addr.socket_addr());
        Self::open(addr, connecting, info_hash, peer_id, config).await
    }
}

impl<T> PeerConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Waits for `connecting` to produce a transport within the connect
    /// timeout, then sets the session up over it.
    pub async fn open<F>(
        addr: PeerAddress,
        connecting: F,
        info_hash: InfoHash,
        peer_id: PeerId,
        config: &PeerConfig,
    ) -> Result<Self, PeerError>
    where
        F: Future<Output = io::Result<T>>,
    {
        debug!(peer = %addr, "connecting");
        let stream = dial(config.connect_timeout, connecting)
            .await
            .map_err(|kind| PeerError::new(addr, PeerState::Connecting, kind))?;

        Self::establish(addr, stream, info_hash, peer_id, config).await
    }

    /// Runs the handshake and waits for the initial bitfield over an
    /// already connected transport.
    pub async fn establish(
        addr: PeerAddress,
        stream: T,
        info_hash: InfoHash,
        peer_id: PeerId,
        config: &PeerConfig,
    ) -> Result<Self, PeerError> {
        debug!(peer = %addr, "handshaking");
        let mut socket = Framed::new(stream, HandshakeCodec);
        let handshake = with_deadline(
            config.handshake_timeout,
            PeerErrorKind::HandshakeTimeout,
            initial_handshake(&mut socket, info_hash, peer_id),
        )
        .await
        .map_err(|kind| PeerError::new(addr, PeerState::Handshaking, kind))?;

        // keep whatever was read past the handshake, the bitfield often
        // arrives in the same segment
        let parts = socket.into_parts();
        let mut new_parts = FramedParts::new::<Message>(parts.io, MessageCodec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        debug!(peer = %addr, "awaiting bitfield");
        let bitfield = with_deadline(
            config.bitfield_timeout,
            PeerErrorKind::ReceiveTimeout,
            receive_bitfield(&mut socket),
        )
        .await
        .map_err(|kind| PeerError::new(addr, PeerState::AwaitingBitfield, kind))?;

        debug!(peer = %addr, pieces = bitfield.count(), "ready");

        Ok(PeerConnection {
            addr,
            info_hash,
            remote_id: handshake.peer_id,
            state: PeerState::Ready,
            socket: Some(socket),
            bitfield,
            choked: true,
        })
    }

    pub fn addr(&self) -> PeerAddress {
        self.addr
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    /// Peer id the remote announced in its handshake.
    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    fn socket(&mut self) -> Result<&mut Framed<T, MessageCodec>, PeerError> {
        let (addr, state) = (self.addr, self.state);
        self.socket
            .as_mut()
            .ok_or_else(|| PeerError::new(addr, state, PeerErrorKind::Closed))
    }

    fn fail(&mut self, kind: PeerErrorKind) -> PeerError {
        self.socket = None;
        self.state = PeerState::Failed;
        PeerError::new(self.addr, PeerState::Ready, kind)
    }

    pub async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        debug!(peer = %self.addr, "> {}", message);
        let res = self.socket()?.send(message).await;
        res.map_err(|e| self.fail(e.into()))
    }

    pub async fn send_keep_alive(&mut self) -> Result<(), PeerError> {
        let res = self.socket()?.send(KeepAlive).await;
        res.map_err(|e| self.fail(e.into()))
    }

    /// Waits for the next message, `None` being a keep-alive.
    ///
    /// Choke, unchoke and have messages are applied to the session before
    /// being handed back. There is no deadline here; the caller decides how
    /// long an idle peer is tolerated.
    pub async fn recv(&mut self) -> Result<Option<Message>, PeerError> {
        let next = self.socket()?.next().await;
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(self.fail(e.into())),
            None => return Err(self.fail(PeerErrorKind::Disconnected)),
        };

        let message = match frame {
            Some(message) => message,
            None => return Ok(None),
        };
        debug!(peer = %self.addr, "< {}", message);

        match message.kind() {
            Some(MessageId::Choke) => self.choked = true,
            Some(MessageId::Unchoke) => self.choked = false,
            Some(MessageId::Have) => match message.parse_have() {
                Ok(index) => self.bitfield.set_piece(index as usize),
                Err(e) => return Err(self.fail(e.into())),
            },
            _ => {}
        }

        Ok(Some(message))
    }

    /// Shuts the transport down. Any further I/O fails.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = SinkExt::<Message>::close(&mut socket).await {
                debug!(peer = %self.addr, "error while closing: {}", e);
            }
        }
        if self.state != PeerState::Failed {
            self.state = PeerState::Closed;
        }
        debug!(peer = %self.addr, "closed");
    }
}

/// Runs one setup step under its own deadline. The deadline only lives as
/// long as this call, so it never applies to later reads or writes.
async fn with_deadline<F, R>(
    limit: Duration,
    expired: PeerErrorKind,
    step: F,
) -> Result<R, PeerErrorKind>
where
    F: Future<Output = Result<R, PeerErrorKind>>,
{
    match timeout(limit, step).await {
        Ok(res) => res,
        Err(_) => Err(expired),
    }
}

async fn dial<F, T>(limit: Duration, connecting: F) -> Result<T, PeerErrorKind>
where
    F: Future<Output = io::Result<T>>,
{
    let expired = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
    let step = async { connecting.await.map_err(PeerErrorKind::Connect) };
    with_deadline(limit, PeerErrorKind::Connect(expired), step).await
}

async fn initial_handshake<T>(
    socket: &mut Framed<T, HandshakeCodec>,
    info_hash: InfoHash,
    peer_id: PeerId,
) -> Result<Handshake, PeerErrorKind>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    socket.send(Handshake::new(info_hash, peer_id)).await?;

    let peer_handshake = socket.next().await.ok_or(HandshakeError::Truncated(0))??;
    peer_handshake.validate(&info_hash)?;

    Ok(peer_handshake)
}

async fn receive_bitfield<T>(
    socket: &mut Framed<T, MessageCodec>,
) -> Result<Bitfield, PeerErrorKind>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = socket
        .next()
        .await
        .ok_or(MessageError::Truncated {
            expected: 4,
            got: 0,
        })??;

    match frame {
        Some(message) if message.is(MessageId::Bitfield) => {
            Ok(Bitfield::from(message.payload.to_vec()))
        }
        Some(message) => Err(PeerErrorKind::UnexpectedMessage {
            expected: MessageId::Bitfield,
            got: message.to_string(),
        }),
        None => Err(PeerErrorKind::UnexpectedMessage {
            expected: MessageId::Bitfield,
            got: "keep-alive".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    const INFO_HASH: InfoHash = [0x11; 20];
    const LOCAL_ID: PeerId = *b"-PW0100-local-peer-1";
    const REMOTE_ID: PeerId = *b"-XX0001-remote-peer1";

    fn addr() -> PeerAddress {
        PeerAddress::new(Ipv4Addr::LOCALHOST, 6881)
    }

    fn fast_config() -> PeerConfig {
        PeerConfig {
            connect_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_millis(200),
            bitfield_timeout: Duration::from_millis(200),
        }
    }

    // Reads our handshake, then answers with `reply`, keeping the stream open.
    async fn answer(mut remote: DuplexStream, reply: Vec<u8>) -> DuplexStream {
        let mut buf = [0u8; 68];
        remote.read_exact(&mut buf).await.unwrap();
        let ours = Handshake::parse(&buf).unwrap();
        assert_eq!(ours.info_hash, INFO_HASH);
        assert_eq!(ours.peer_id, LOCAL_ID);

        remote.write_all(&reply).await.unwrap();
        remote
    }

    fn frame(message: Message) -> Vec<u8> {
        message.serialize().unwrap().to_vec()
    }

    fn handshake_reply(info_hash: InfoHash) -> Vec<u8> {
        Handshake::new(info_hash, REMOTE_ID).serialize().to_vec()
    }

    type Established = Result<PeerConnection<DuplexStream>, PeerError>;

    async fn establish(reply: Vec<u8>) -> (Established, DuplexStream) {
        let (local, remote) = duplex(4096);
        let remote = tokio::spawn(answer(remote, reply));
        let res =
            PeerConnection::establish(addr(), local, INFO_HASH, LOCAL_ID, &fast_config()).await;
        (res, remote.await.unwrap())
    }

    #[tokio::test]
    async fn reaches_ready() {
        let mut reply = handshake_reply(INFO_HASH);
        reply.extend_from_slice(&frame(Message::new(MessageId::Bitfield, vec![0b1010_0000])));

        let (res, _remote) = establish(reply).await;
        let conn = res.unwrap();

        assert_eq!(conn.state(), PeerState::Ready);
        assert_eq!(conn.remote_id(), &REMOTE_ID);
        assert_eq!(conn.info_hash(), &INFO_HASH);
        assert!(conn.choked);
        assert!(conn.bitfield.has_piece(0));
        assert!(!conn.bitfield.has_piece(1));
        assert!(conn.bitfield.has_piece(2));
        assert_eq!(conn.bitfield.len(), 8);
    }

    #[tokio::test]
    async fn info_hash_mismatch() {
        let (res, _remote) = establish(handshake_reply([0x22; 20])).await;
        let err = res.unwrap_err();

        assert_eq!(err.stage, PeerState::Handshaking);
        assert_eq!(err.addr, addr());
        assert!(matches!(
            err.kind,
            PeerErrorKind::Handshake(HandshakeError::InfoHashMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn choke_instead_of_bitfield() {
        let mut reply = handshake_reply(INFO_HASH);
        reply.extend_from_slice(&frame(Message::choke()));

        let (res, _remote) = establish(reply).await;
        let err = res.unwrap_err();

        assert_eq!(err.stage, PeerState::AwaitingBitfield);
        assert!(matches!(
            err.kind,
            PeerErrorKind::UnexpectedMessage {
                expected: MessageId::Bitfield,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn keep_alive_instead_of_bitfield() {
        let mut reply = handshake_reply(INFO_HASH);
        reply.extend_from_slice(&[0, 0, 0, 0]);

        let (res, _remote) = establish(reply).await;
        assert!(matches!(
            res.unwrap_err().kind,
            PeerErrorKind::UnexpectedMessage { .. }
        ));
    }

    #[tokio::test]
    async fn connect_timeout() {
        let config = PeerConfig {
            connect_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let never = std::future::pending::<io::Result<DuplexStream>>();

        let err = PeerConnection::open(addr(), never, INFO_HASH, LOCAL_ID, &config)
            .await
            .unwrap_err();

        assert_eq!(err.stage, PeerState::Connecting);
        match err.kind {
            PeerErrorKind::Connect(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn open_over_ready_transport() {
        let (local, remote) = duplex(4096);
        let mut reply = handshake_reply(INFO_HASH);
        reply.extend_from_slice(&frame(Message::new(MessageId::Bitfield, vec![0x40])));
        let _remote = tokio::spawn(answer(remote, reply));

        let connecting = async { Ok(local) };
        let conn = PeerConnection::open(addr(), connecting, INFO_HASH, LOCAL_ID, &fast_config())
            .await
            .unwrap();
        assert_eq!(conn.state(), PeerState::Ready);
        assert!(conn.bitfield.has_piece(1));
    }

    #[tokio::test]
    async fn handshake_timeout() {
        let (local, _remote) = duplex(4096);
        let err = PeerConnection::establish(addr(), local, INFO_HASH, LOCAL_ID, &fast_config())
            .await
            .unwrap_err();

        assert_eq!(err.stage, PeerState::Handshaking);
        assert!(matches!(err.kind, PeerErrorKind::HandshakeTimeout));
    }

    #[tokio::test]
    async fn bitfield_timeout() {
        let (res, _remote) = establish(handshake_reply(INFO_HASH)).await;
        let err = res.unwrap_err();

        assert_eq!(err.stage, PeerState::AwaitingBitfield);
        assert!(matches!(err.kind, PeerErrorKind::ReceiveTimeout));
    }

    #[tokio::test]
    async fn truncated_handshake() {
        let (local, remote) = duplex(4096);
        tokio::spawn(async move {
            let mut remote = answer(remote, handshake_reply(INFO_HASH)[..30].to_vec()).await;
            remote.shutdown().await.unwrap();
        });

        let err = PeerConnection::establish(addr(), local, INFO_HASH, LOCAL_ID, &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            PeerErrorKind::Handshake(HandshakeError::Truncated(30))
        ));
    }

    #[tokio::test]
    async fn ready_session() {
        let mut reply = handshake_reply(INFO_HASH);
        reply.extend_from_slice(&frame(Message::new(MessageId::Bitfield, vec![0, 0])));

        let (res, mut remote) = establish(reply).await;
        let mut conn = res.unwrap();

        // no setup deadline left over: this arrives well after it would expire
        tokio::time::sleep(Duration::from_millis(300)).await;
        remote.write_all(&frame(Message::unchoke())).await.unwrap();
        remote.write_all(&[0, 0, 0, 0]).await.unwrap();
        remote.write_all(&frame(Message::have(9))).await.unwrap();

        assert_eq!(conn.recv().await.unwrap(), Some(Message::unchoke()));
        assert!(!conn.choked);
        assert_eq!(conn.recv().await.unwrap(), None);
        assert_eq!(conn.recv().await.unwrap(), Some(Message::have(9)));
        assert!(conn.bitfield.has_piece(9));

        conn.send(Message::interested()).await.unwrap();
        conn.send_keep_alive().await.unwrap();
        let mut buf = [0u8; 9];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 2, 0, 0, 0, 0]);

        conn.close().await;
        assert_eq!(conn.state(), PeerState::Closed);
        assert!(matches!(
            conn.send(Message::interested()).await.unwrap_err().kind,
            PeerErrorKind::Closed
        ));
        assert!(matches!(
            conn.recv().await.unwrap_err().kind,
            PeerErrorKind::Closed
        ));
    }

    #[tokio::test]
    async fn remote_disconnect_fails_session() {
        let mut reply = handshake_reply(INFO_HASH);
        reply.extend_from_slice(&frame(Message::new(MessageId::Bitfield, vec![0xff])));

        let (res, remote) = establish(reply).await;
        let mut conn = res.unwrap();
        drop(remote);

        assert!(matches!(
            conn.recv().await.unwrap_err().kind,
            PeerErrorKind::Disconnected
        ));
        assert_eq!(conn.state(), PeerState::Failed);
        conn.close().await;
        assert_eq!(conn.state(), PeerState::Failed);
    }

    #[tokio::test]
    async fn connect_over_tcp() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            stream.read_exact(&mut buf).await.unwrap();
            let mut reply = handshake_reply(INFO_HASH);
            reply.extend_from_slice(&frame(Message::new(MessageId::Bitfield, vec![0x80])));
            stream.write_all(&reply).await.unwrap();
            // hold the connection open until the client is done
            let _ = stream.read(&mut buf).await;
        });

        let peer = PeerAddress::new(Ipv4Addr::LOCALHOST, port);
        let mut conn = PeerConnection::connect(peer, INFO_HASH, LOCAL_ID, &fast_config())
            .await
            .unwrap();
        assert_eq!(conn.addr(), peer);
        assert!(conn.bitfield.has_piece(0));
        conn.close().await;
    }

    #[tokio::test]
    async fn connect_refused() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let peer = PeerAddress::new(Ipv4Addr::LOCALHOST, port);
        let err = PeerConnection::connect(peer, INFO_HASH, LOCAL_ID, &fast_config())
            .await
            .unwrap_err();
        assert_eq!(err.stage, PeerState::Connecting);
        assert!(matches!(err.kind, PeerErrorKind::Connect(_)));
    }
}
