use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use tracing::{info, warn};

use peerwire::client::{generate_peer_id, tracker, PeerConnection, TorrentFile, TrackerRequest};
use peerwire::config::{ClientConfig, PeerConfig};

/// Inspect a torrent and bring up connections to its peers.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Port reported to the tracker
    #[arg(short, long, default_value_t = ClientConfig::DEFAULT_PORT)]
    port: u16,

    /// Announce to the tracker and connect to the peers it returns
    #[arg(short, long)]
    announce: bool,

    /// Seconds allowed to open a connection to a peer
    #[arg(long, default_value_t = 3)]
    connect_timeout: u64,

    /// Seconds allowed to complete the handshake
    #[arg(long, default_value_t = 3)]
    handshake_timeout: u64,

    /// Seconds allowed for the peer's bitfield to arrive
    #[arg(long, default_value_t = 5)]
    bitfield_timeout: u64,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(generate_peer_id());
        config.port = self.port;
        config.peer = PeerConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            bitfield_timeout: Duration::from_secs(self.bitfield_timeout),
        };
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = args.client_config();

    let torrent = TorrentFile::open(&args.torrent)
        .with_context(|| format!("open torrent {}", args.torrent.display()))?;
    println!("{}", torrent);

    let request = TrackerRequest::new(&torrent, config.peer_id, config.port);
    println!("tracker url:\t{}", request.url()?);

    if !args.announce {
        return Ok(());
    }

    let res = tracker::announce(&request).await.context("announce")?;

    // every peer gets its own connection, nothing is shared between them
    let handles = res.peers.into_iter().map(|addr| {
        let info_hash = torrent.info_hash;
        let config = config.clone();
        tokio::spawn(async move {
            let mut conn =
                PeerConnection::connect(addr, info_hash, config.peer_id, &config.peer).await?;
            let pieces = conn.bitfield.count();
            conn.close().await;
            Ok::<_, peerwire::client::PeerError>((addr, pieces))
        })
    });

    let mut ready = 0;
    for result in join_all(handles).await {
        match result.context("peer task panicked")? {
            Ok((addr, pieces)) => {
                ready += 1;
                info!(peer = %addr, pieces, "peer ready");
            }
            Err(e) => warn!("{}", e),
        }
    }
    info!("{} peers reached the ready state", ready);

    Ok(())
}
