use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::metainfo::{InfoHash, TorrentInfo};

use super::error::{FailureKind, PeerError, SessionFailure};
use super::extension::{ExtensionHandshake, EXTENSION_HANDSHAKE_ID, UT_METADATA_LOCAL_ID};
use super::message::{Handshake, Message};
use super::metadata::{MetadataBuffer, MetadataMessage};
use super::peer_id::PeerId;
use super::transport::PeerTransport;

/// Tunables for metadata fetching.
#[derive(Debug, Clone)]
pub struct LeechConfig {
    /// TCP connect timeout per peer.
    pub connect_timeout: Duration,
    /// Deadline for each read operation.
    pub read_timeout: Duration,
    /// Wall budget for one peer session.
    pub session_budget: Duration,
    /// Wall budget for the whole per-infohash fetch.
    pub fetch_budget: Duration,
    /// Maximum peers attempted per infohash.
    pub max_peers: usize,
    /// Peer sessions raced in parallel per infohash.
    pub parallelism: usize,
    /// Safety cap on advertised metadata size.
    pub max_metadata_size: i64,
}

impl Default for LeechConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            session_budget: Duration::from_secs(60),
            fetch_budget: Duration::from_secs(120),
            max_peers: 20,
            parallelism: 3,
            max_metadata_size: 10 * 1024 * 1024,
        }
    }
}

/// Why a whole per-infohash fetch gave up.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Every candidate peer failed, or the attempt cap was reached.
    #[error("all {attempts} peer attempts failed")]
    Exhausted { attempts: usize },
    /// The per-infohash wall budget expired.
    #[error("fetch budget exhausted")]
    Budget,
}

/// Session progress, used to classify errors into the failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connecting,
    Handshaking,
    ExtHandshaking,
    Fetching,
}

/// Fetches metadata for one infohash, racing candidate peers.
///
/// Candidates arrive on `peers`: the sink seeds it with the observing
/// peer and keeps feeding addresses as more observations come in. Up to
/// `parallelism` sessions run at once; the first success aborts the
/// siblings, which closes their sockets. Gives up when the attempt cap is
/// reached with nothing in flight, when the candidate feed closes dry, or
/// when the fetch budget expires.
pub async fn fetch_metadata(
    info_hash: InfoHash,
    mut peers: mpsc::Receiver<SocketAddr>,
    config: Arc<LeechConfig>,
) -> Result<TorrentInfo, FetchError> {
    let deadline = Instant::now() + config.fetch_budget;
    let mut seen: HashSet<SocketAddr> = HashSet::new();
    let mut queue: VecDeque<SocketAddr> = VecDeque::new();
    let mut sessions: JoinSet<(SocketAddr, Result<TorrentInfo, SessionFailure>)> = JoinSet::new();
    let mut attempts = 0usize;
    let mut feed_open = true;

    loop {
        while sessions.len() < config.parallelism && attempts < config.max_peers {
            let Some(addr) = queue.pop_front() else { break };
            attempts += 1;
            let config = Arc::clone(&config);
            sessions.spawn(async move { (addr, fetch_from_peer(addr, info_hash, config).await) });
        }

        if sessions.is_empty() && (attempts >= config.max_peers || (queue.is_empty() && !feed_open))
        {
            return Err(FetchError::Exhausted { attempts });
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                sessions.abort_all();
                return Err(FetchError::Budget);
            }
            candidate = peers.recv(), if feed_open => {
                match candidate {
                    Some(addr) => {
                        if seen.insert(addr) {
                            queue.push_back(addr);
                        }
                    }
                    None => feed_open = false,
                }
            }
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                match joined {
                    Ok((addr, Ok(info))) => {
                        debug!(%info_hash, peer = %addr, "metadata fetched");
                        sessions.abort_all();
                        return Ok(info);
                    }
                    Ok((addr, Err(failure))) => match failure.kind {
                        // The peer spoke the protocol and still produced
                        // garbage; that is worth surfacing.
                        FailureKind::Sha1Mismatch
                        | FailureKind::BencodeInvalid
                        | FailureKind::MetadataTooLarge => {
                            info!(%info_hash, peer = %addr, reason = %failure.kind, "session discarded");
                        }
                        _ => {
                            debug!(%info_hash, peer = %addr, reason = %failure.kind, error = %failure.error, "peer failed");
                        }
                    },
                    // Aborted sibling; nothing to record.
                    Err(_) => {}
                }
            }
        }
    }
}

/// Runs one complete peer session:
/// connect, handshake, extension handshake, fetch, verify, decode.
pub async fn fetch_from_peer(
    addr: SocketAddr,
    info_hash: InfoHash,
    config: Arc<LeechConfig>,
) -> Result<TorrentInfo, SessionFailure> {
    match timeout(config.session_budget, session(addr, info_hash, &config)).await {
        Ok(result) => result,
        Err(_) => Err(SessionFailure {
            kind: FailureKind::PieceTimeout,
            error: PeerError::Timeout,
        }),
    }
}

async fn session(
    addr: SocketAddr,
    info_hash: InfoHash,
    config: &LeechConfig,
) -> Result<TorrentInfo, SessionFailure> {
    // Connecting.
    let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| classify(Stage::Connecting, PeerError::Timeout))?
        .map_err(|e| classify(Stage::Connecting, e.into()))?;
    let mut transport = PeerTransport::new(stream, config.read_timeout);

    // Handshaking.
    let ours = Handshake::new(info_hash, PeerId::generate());
    transport
        .send_handshake(&ours)
        .await
        .map_err(|e| classify(Stage::Handshaking, e))?;
    let theirs = transport
        .read_handshake()
        .await
        .map_err(|e| classify(Stage::Handshaking, e))?;

    if theirs.info_hash != info_hash {
        return Err(classify(Stage::Handshaking, PeerError::InfoHashMismatch));
    }
    if !theirs.supports_extension_protocol() {
        return Err(classify(Stage::Handshaking, PeerError::ExtensionBitMissing));
    }

    // Extension handshaking.
    let (ut_metadata_id, metadata_size) = ext_handshake(&mut transport, config)
        .await
        .map_err(|e| classify(Stage::ExtHandshaking, e))?;

    // Fetching.
    let raw = fetch_pieces(&mut transport, ut_metadata_id, metadata_size)
        .await
        .map_err(|e| classify(Stage::Fetching, e))?;

    // Verifying.
    if InfoHash::from_info_bytes(&raw) != info_hash {
        return Err(SessionFailure {
            kind: FailureKind::Sha1Mismatch,
            error: PeerError::Sha1Mismatch,
        });
    }

    // Done: decode and normalize.
    TorrentInfo::from_info_dict(&info_hash, &raw).map_err(|e| SessionFailure {
        kind: FailureKind::BencodeInvalid,
        error: e.into(),
    })
}

/// Exchanges extension handshakes and validates the `ut_metadata` offer.
async fn ext_handshake(
    transport: &mut PeerTransport,
    config: &LeechConfig,
) -> Result<(u8, usize), PeerError> {
    let payload = ExtensionHandshake::ours().encode();
    transport
        .send_raw(&Message::extended(EXTENSION_HANDSHAKE_ID, &payload))
        .await?;

    // Peers may front-run the extension handshake with bitfield or have
    // messages; skip until extended id 0 arrives.
    let theirs = loop {
        match transport.read_message().await? {
            Message::Extended { id, payload } if id == EXTENSION_HANDSHAKE_ID => {
                break ExtensionHandshake::decode(&payload)?;
            }
            Message::Extended { .. } | Message::KeepAlive | Message::Other { .. } => continue,
        }
    };

    let ut_metadata_id = theirs
        .ut_metadata_id()
        .ok_or(PeerError::MetadataUnsupported)?;

    let metadata_size = match theirs.metadata_size {
        None | Some(0) => return Err(PeerError::MetadataUnsupported),
        Some(size) if size < 0 => return Err(PeerError::MetadataUnsupported),
        Some(size) if size > config.max_metadata_size => {
            return Err(PeerError::MetadataTooLarge(size))
        }
        Some(size) => size as usize,
    };

    Ok((ut_metadata_id, metadata_size))
}

/// Requests every metadata piece, then collects data messages until the
/// buffer is complete. Requests are pipelined; arrival order is irrelevant.
async fn fetch_pieces(
    transport: &mut PeerTransport,
    ut_metadata_id: u8,
    metadata_size: usize,
) -> Result<Vec<u8>, PeerError> {
    let mut buffer = MetadataBuffer::new(metadata_size);

    for piece in 0..buffer.piece_count() as u32 {
        let request = MetadataMessage::request(piece).encode();
        transport
            .send_raw(&Message::extended(ut_metadata_id, &request))
            .await?;
    }

    while !buffer.is_complete() {
        match transport.read_message().await? {
            Message::Extended { id, payload } if id == UT_METADATA_LOCAL_ID => match MetadataMessage::decode(&payload)? {
                MetadataMessage::Data { piece, data, .. } => buffer.insert(piece, &data)?,
                MetadataMessage::Reject { piece } => {
                    return Err(PeerError::PieceRejected(piece));
                }
                // We advertise no metadata; requests to us are noise.
                MetadataMessage::Request { .. } => continue,
            },
            Message::Extended { .. } | Message::KeepAlive | Message::Other { .. } => continue,
        }
    }

    Ok(buffer.into_bytes())
}

fn classify(stage: Stage, error: PeerError) -> SessionFailure {
    let kind = match &error {
        PeerError::InvalidHandshake
        | PeerError::InfoHashMismatch
        | PeerError::ExtensionBitMissing => FailureKind::HandshakeMismatch,
        PeerError::MetadataUnsupported => FailureKind::ExtUnsupported,
        PeerError::MetadataTooLarge(_) => FailureKind::MetadataTooLarge,
        PeerError::Sha1Mismatch => FailureKind::Sha1Mismatch,
        PeerError::PieceRejected(_) | PeerError::ConnectionClosed => FailureKind::PeerDropped,
        PeerError::Bencode(_) | PeerError::Metainfo(_) | PeerError::InvalidMessage(_) => {
            FailureKind::BencodeInvalid
        }
        PeerError::Timeout | PeerError::Io(_) => match stage {
            Stage::Connecting | Stage::Handshaking => FailureKind::ConnectFail,
            Stage::ExtHandshaking | Stage::Fetching => FailureKind::PieceTimeout,
        },
    };
    SessionFailure { kind, error }
}
