use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::bencode::{encode, Value};
use crate::metainfo::InfoHash;

use super::extension::UT_METADATA_LOCAL_ID;
use super::*;

/// The ut_metadata id the mock peer advertises for itself.
const MOCK_UT_METADATA_ID: u8 = 3;

fn fast_config() -> Arc<LeechConfig> {
    Arc::new(LeechConfig {
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(5),
        session_budget: Duration::from_secs(10),
        fetch_budget: Duration::from_secs(10),
        max_peers: 5,
        parallelism: 2,
        ..LeechConfig::default()
    })
}

/// Builds a valid single-file info dictionary of exactly `total` bytes by
/// sizing the name padding.
fn info_dict_of_size(total: usize) -> Vec<u8> {
    // d6:lengthi10e4:name<K>:<padding>e
    for padding in total.saturating_sub(40)..total {
        let dict = format!(
            "d6:lengthi10e4:name{}:{}e",
            padding,
            "a".repeat(padding)
        );
        if dict.len() == total {
            return dict.into_bytes();
        }
    }
    panic!("no info dict of size {}", total);
}

#[derive(Clone)]
struct MockPeer {
    metadata: Vec<u8>,
    advertised_size: i64,
    echo_info_hash: Option<InfoHash>,
    set_ext_bit: bool,
    reject_requests: bool,
    stall_after_ext: bool,
    corrupt: bool,
}

impl MockPeer {
    fn serving(metadata: Vec<u8>) -> Self {
        let advertised_size = metadata.len() as i64;
        Self {
            metadata,
            advertised_size,
            echo_info_hash: None,
            set_ext_bit: true,
            reject_requests: false,
            stall_after_ext: false,
            corrupt: false,
        }
    }

    async fn spawn(self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let _ = self.serve(stream).await;
            }
        });
        addr
    }

    async fn serve(self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut handshake = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut handshake).await?;
        let theirs = Handshake::decode(&handshake).expect("leech sent invalid handshake");

        let info_hash = self.echo_info_hash.unwrap_or(theirs.info_hash);
        let mut reserved = [0u8; 8];
        if self.set_ext_bit {
            reserved[5] |= 0x10;
        }
        stream.write_all(&[19]).await?;
        stream.write_all(b"BitTorrent protocol").await?;
        stream.write_all(&reserved).await?;
        stream.write_all(info_hash.as_bytes()).await?;
        stream.write_all(&[0x7F; 20]).await?;

        loop {
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len == 0 {
                continue;
            }
            let mut frame = vec![0u8; len];
            stream.read_exact(&mut frame).await?;

            if frame[0] != 20 {
                continue;
            }
            let ext_id = frame[1];
            let payload = &frame[2..];

            if ext_id == 0 {
                let mut m = BTreeMap::new();
                m.insert(
                    Bytes::from_static(b"ut_metadata"),
                    Value::Integer(i64::from(MOCK_UT_METADATA_ID)),
                );
                let mut dict = BTreeMap::new();
                dict.insert(Bytes::from_static(b"m"), Value::Dict(m));
                dict.insert(
                    Bytes::from_static(b"metadata_size"),
                    Value::Integer(self.advertised_size),
                );
                let body = encode(&Value::Dict(dict));
                stream.write_all(&Message::extended(0, &body)).await?;

                if self.stall_after_ext {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
            } else if ext_id == MOCK_UT_METADATA_ID {
                let request = MetadataMessage::decode(payload).expect("bad request");
                let MetadataMessage::Request { piece } = request else {
                    continue;
                };

                if self.reject_requests {
                    let reject = MetadataMessage::Reject { piece }.encode();
                    stream
                        .write_all(&Message::extended(UT_METADATA_LOCAL_ID, &reject))
                        .await?;
                    continue;
                }

                let offset = piece as usize * METADATA_PIECE_SIZE;
                let end = (offset + METADATA_PIECE_SIZE).min(self.metadata.len());
                let mut chunk = self.metadata[offset..end].to_vec();
                if self.corrupt && piece == 0 {
                    chunk[0] ^= 0xFF;
                }

                let data = MetadataMessage::Data {
                    piece,
                    total_size: self.metadata.len() as i64,
                    data: Bytes::from(chunk),
                }
                .encode();
                stream
                    .write_all(&Message::extended(UT_METADATA_LOCAL_ID, &data))
                    .await?;
            }
        }
    }
}

#[test]
fn test_metadata_buffer_boundaries() {
    let single = MetadataBuffer::new(16384);
    assert_eq!(single.piece_count(), 1);
    assert_eq!(single.piece_len(0), 16384);

    let two = MetadataBuffer::new(16385);
    assert_eq!(two.piece_count(), 2);
    assert_eq!(two.piece_len(0), 16384);
    assert_eq!(two.piece_len(1), 1);
}

#[test]
fn test_metadata_buffer_rejects_bad_pieces() {
    let mut buffer = MetadataBuffer::new(100);
    assert!(buffer.insert(1, &[0u8; 100]).is_err());
    assert!(buffer.insert(0, &[0u8; 99]).is_err());
    assert!(buffer.insert(0, &[0u8; 100]).is_ok());
    assert!(buffer.is_complete());
}

#[test]
fn test_metadata_buffer_out_of_order_assembly() {
    let mut buffer = MetadataBuffer::new(16385);
    buffer.insert(1, &[0xBB; 1]).unwrap();
    buffer.insert(0, &[0xAA; 16384]).unwrap();
    assert!(buffer.is_complete());

    let bytes = buffer.into_bytes();
    assert_eq!(bytes[0], 0xAA);
    assert_eq!(bytes[16384], 0xBB);
}

#[test]
fn test_metadata_message_roundtrip() {
    let data = MetadataMessage::Data {
        piece: 2,
        total_size: 42,
        data: Bytes::from_static(b"hello"),
    };
    let encoded = data.encode();
    assert_eq!(MetadataMessage::decode(&encoded).unwrap(), data);

    let request = MetadataMessage::request(7);
    let encoded = request.encode();
    assert_eq!(MetadataMessage::decode(&encoded).unwrap(), request);
}

#[test]
fn test_handshake_roundtrip() {
    let handshake = Handshake::new(InfoHash([0x42; 20]), PeerId::generate());
    let decoded = Handshake::decode(&handshake.encode()).unwrap();
    assert_eq!(decoded.info_hash, InfoHash([0x42; 20]));
    assert!(decoded.supports_extension_protocol());
}

#[tokio::test]
async fn test_metadata_happy_path() {
    // Scenario: peer advertises ut_metadata with a 42-byte dict whose
    // SHA-1 equals the requested infohash; fetch must decode it.
    let metadata = info_dict_of_size(42);
    let info_hash = InfoHash::from_info_bytes(&metadata);
    let addr = MockPeer::serving(metadata).spawn().await;

    let info = fetch_from_peer(addr, info_hash, fast_config())
        .await
        .expect("fetch should succeed");

    assert_eq!(info.total_size, 10);
    assert_eq!(info.files.len(), 1);
    assert!(info.name.starts_with('a'));
}

#[tokio::test]
async fn test_metadata_single_full_piece() {
    let metadata = info_dict_of_size(16384);
    let info_hash = InfoHash::from_info_bytes(&metadata);
    let addr = MockPeer::serving(metadata).spawn().await;

    assert!(fetch_from_peer(addr, info_hash, fast_config()).await.is_ok());
}

#[tokio::test]
async fn test_metadata_two_pieces_short_tail() {
    let metadata = info_dict_of_size(16385);
    let info_hash = InfoHash::from_info_bytes(&metadata);
    let addr = MockPeer::serving(metadata).spawn().await;

    assert!(fetch_from_peer(addr, info_hash, fast_config()).await.is_ok());
}

#[tokio::test]
async fn test_sha1_mismatch_discards_session() {
    let metadata = info_dict_of_size(42);
    let info_hash = InfoHash::from_info_bytes(&metadata);
    let mut mock = MockPeer::serving(metadata);
    mock.corrupt = true;
    let addr = mock.spawn().await;

    let failure = fetch_from_peer(addr, info_hash, fast_config())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Sha1Mismatch);
}

#[tokio::test]
async fn test_zero_metadata_size_rejected() {
    let metadata = info_dict_of_size(42);
    let info_hash = InfoHash::from_info_bytes(&metadata);
    let mut mock = MockPeer::serving(metadata);
    mock.advertised_size = 0;
    let addr = mock.spawn().await;

    let failure = fetch_from_peer(addr, info_hash, fast_config())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::ExtUnsupported);
}

#[tokio::test]
async fn test_oversized_metadata_rejected() {
    let metadata = info_dict_of_size(42);
    let info_hash = InfoHash::from_info_bytes(&metadata);
    let mut mock = MockPeer::serving(metadata);
    mock.advertised_size = 64 * 1024 * 1024;
    let addr = mock.spawn().await;

    let failure = fetch_from_peer(addr, info_hash, fast_config())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::MetadataTooLarge);
}

#[tokio::test]
async fn test_info_hash_mismatch_fails_handshake() {
    let metadata = info_dict_of_size(42);
    let info_hash = InfoHash::from_info_bytes(&metadata);
    let mut mock = MockPeer::serving(metadata);
    mock.echo_info_hash = Some(InfoHash([0x01; 20]));
    let addr = mock.spawn().await;

    let failure = fetch_from_peer(addr, info_hash, fast_config())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::HandshakeMismatch);
}

#[tokio::test]
async fn test_missing_extension_bit_fails_handshake() {
    let metadata = info_dict_of_size(42);
    let info_hash = InfoHash::from_info_bytes(&metadata);
    let mut mock = MockPeer::serving(metadata);
    mock.set_ext_bit = false;
    let addr = mock.spawn().await;

    let failure = fetch_from_peer(addr, info_hash, fast_config())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::HandshakeMismatch);
}

#[tokio::test]
async fn test_reject_marks_peer_dropped() {
    let metadata = info_dict_of_size(42);
    let info_hash = InfoHash::from_info_bytes(&metadata);
    let mut mock = MockPeer::serving(metadata);
    mock.reject_requests = true;
    let addr = mock.spawn().await;

    let failure = fetch_from_peer(addr, info_hash, fast_config())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::PeerDropped);
}

#[tokio::test]
async fn test_first_success_cancels_sibling() {
    // Scenario: two peers race; the stalled one must not delay or
    // duplicate the result once the fast one succeeds.
    let metadata = info_dict_of_size(42);
    let info_hash = InfoHash::from_info_bytes(&metadata);

    let mut stalling = MockPeer::serving(metadata.clone());
    stalling.stall_after_ext = true;
    let stall_addr = stalling.spawn().await;
    let fast_addr = MockPeer::serving(metadata).spawn().await;

    let (tx, rx) = mpsc::channel(8);
    tx.send(stall_addr).await.unwrap();
    tx.send(fast_addr).await.unwrap();
    drop(tx);

    let started = std::time::Instant::now();
    let info = fetch_metadata(info_hash, rx, fast_config())
        .await
        .expect("fast peer should win");
    assert_eq!(info.total_size, 10);
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[tokio::test]
async fn test_fetch_exhausts_dead_peers() {
    // A listener that is immediately dropped leaves a port with nothing
    // accepting; connects fail fast.
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (tx, rx) = mpsc::channel(8);
    tx.send(dead_addr).await.unwrap();
    drop(tx);

    let result = fetch_metadata(InfoHash([0x99; 20]), rx, fast_config()).await;
    assert!(matches!(
        result,
        Err(FetchError::Exhausted { attempts: 1 })
    ));
}
