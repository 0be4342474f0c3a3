use super::peer::{decode_peers, PeerAddress, PeerListError};
use super::torrent::TorrentFile;
use super::types::{InfoHash, PeerId};

use reqwest::Url;
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("invalid announce url {url:?}: {reason}")]
    InvalidAnnounceUrl { url: String, reason: String },

    #[error("tracker request failed")]
    Http(#[from] reqwest::Error),

    #[error("malformed tracker response: {0}")]
    MalformedResponse(String),

    #[error("tracker refused the announce: {0}")]
    Failure(String),

    #[error(transparent)]
    Peers(#[from] PeerListError),
}

/// Parameters of an announce request.
#[derive(Debug, Clone)]
pub struct TrackerRequest {
    pub announce: String,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

// The plain numeric parameters; the two raw hashes are percent encoded by hand
// since urlencoded serializers only accept utf-8 text.
#[derive(Serialize)]
struct Counters {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
}

impl TrackerRequest {
    /// A first announce: nothing transferred, the whole torrent left.
    pub fn new(torrent: &TorrentFile, peer_id: PeerId, port: u16) -> Self {
        Self {
            announce: torrent.announce.clone(),
            info_hash: torrent.info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left: torrent.length,
        }
    }

    pub fn url(&self) -> Result<Url, TrackerError> {
        let invalid = |reason: String| TrackerError::InvalidAnnounceUrl {
            url: self.announce.clone(),
            reason,
        };

        let mut url = Url::parse(&self.announce).map_err(|e| invalid(e.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(invalid("not a hierarchical url".into()));
        }

        let counters = serde_urlencoded::to_string(Counters {
            port: self.port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.left,
            compact: 1,
        })
        .map_err(|e| invalid(e.to_string()))?;

        let params = format!(
            "info_hash={}&peer_id={}&{}",
            urlencoding::encode_binary(&self.info_hash),
            urlencoding::encode_binary(&self.peer_id),
            counters
        );

        // keep whatever the tracker put in its own query string
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{}&{}", existing, params),
            _ => params,
        };
        url.set_query(Some(&query));

        Ok(url)
    }
}

/// Builds the announce url for a torrent, with `info_hash` and `peer_id`
/// percent encoded as raw bytes.
pub fn build_tracker_url(
    announce: &str,
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
) -> Result<String, TrackerError> {
    let request = TrackerRequest {
        announce: announce.to_owned(),
        info_hash,
        peer_id,
        port,
        uploaded,
        downloaded,
        left,
    };
    Ok(request.url()?.to_string())
}

#[derive(Debug, Deserialize)]
struct BencodeResponse {
    #[serde(default)]
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u32>,
    #[serde(default)]
    peers: Option<ByteBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    /// Seconds the tracker wants us to wait before the next announce.
    pub interval: u32,
    pub peers: Vec<PeerAddress>,
}

impl TrackerResponse {
    /// Decodes a bencoded announce response carrying a compact peer list.
    pub fn parse(body: &[u8]) -> Result<Self, TrackerError> {
        let res = serde_bencode::from_bytes::<BencodeResponse>(body)
            .map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;

        if let Some(reason) = res.failure_reason {
            return Err(TrackerError::Failure(reason));
        }

        let interval = res
            .interval
            .ok_or_else(|| TrackerError::MalformedResponse("missing interval".into()))?;
        let peers = res
            .peers
            .ok_or_else(|| TrackerError::MalformedResponse("missing peers".into()))?;

        Ok(TrackerResponse {
            interval,
            peers: decode_peers(&peers)?,
        })
    }
}

/// Sends a single announce. Retrying and re-announcing on `interval` is left
/// to the caller.
pub async fn announce(request: &TrackerRequest) -> Result<TrackerResponse, TrackerError> {
    let url = request.url()?;
    debug!("announcing to {}", request.announce);

    let body = reqwest::get(url).await?.error_for_status()?.bytes().await?;
    let res = TrackerResponse::parse(&body)?;

    info!(
        "tracker returned {} peers, interval {}s",
        res.peers.len(),
        res.interval
    );
    Ok(res)
}
