use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::bencode::{encode, Value};
use crate::dht::{Observation, ObservationQueue};
use crate::metainfo::{InfoHash, TorrentFile};
use crate::peer::LeechConfig;
use crate::persistence::{Database, PersistenceError};

use super::*;

#[derive(Default)]
struct MemoryDb {
    torrents: Mutex<HashMap<InfoHash, String>>,
    exists_calls: AtomicUsize,
    adds: AtomicUsize,
}

impl Database for MemoryDb {
    fn exists(&self, info_hash: &InfoHash) -> Result<bool, PersistenceError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.torrents.lock().contains_key(info_hash))
    }

    fn add_new_torrent(
        &self,
        info_hash: &InfoHash,
        name: &str,
        files: &[TorrentFile],
    ) -> Result<(), PersistenceError> {
        if files.iter().map(|f| f.size).sum::<u64>() == 0 {
            return Err(PersistenceError::ZeroSize);
        }
        let mut torrents = self.torrents.lock();
        if !torrents.contains_key(info_hash) {
            self.adds.fetch_add(1, Ordering::SeqCst);
            torrents.insert(*info_hash, name.to_string());
        }
        Ok(())
    }

    fn close(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

fn quick_leech_config() -> LeechConfig {
    LeechConfig {
        connect_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_secs(5),
        session_budget: Duration::from_secs(8),
        fetch_budget: Duration::from_millis(1500),
        max_peers: 4,
        parallelism: 2,
        ..LeechConfig::default()
    }
}

fn quick_sink_config() -> SinkConfig {
    SinkConfig {
        max_in_flight: 8,
        failure_cooldown: Duration::from_secs(60),
        ..SinkConfig::default()
    }
}

fn observation(info_hash: InfoHash, peer: SocketAddr) -> Observation {
    Observation {
        info_hash,
        peer,
        observed_at: Instant::now(),
    }
}

/// An address nothing listens on; connects fail fast with ECONNREFUSED.
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Minimal scripted peer: completes both handshakes and serves a valid
/// info dictionary over ut_metadata.
async fn serve_metadata_once(metadata: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };

        let mut handshake = [0u8; 68];
        if stream.read_exact(&mut handshake).await.is_err() {
            return;
        }
        let mut reply = handshake[..28].to_vec();
        reply[25] |= 0x10;
        reply.extend_from_slice(&handshake[28..48]);
        reply.extend_from_slice(&[0x7E; 20]);
        let _ = stream.write_all(&reply).await;

        loop {
            let mut len_buf = [0u8; 4];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len == 0 {
                continue;
            }
            let mut frame = vec![0u8; len];
            if stream.read_exact(&mut frame).await.is_err() {
                return;
            }
            if frame[0] != 20 {
                continue;
            }

            if frame[1] == 0 {
                let mut m = BTreeMap::new();
                m.insert(Bytes::from_static(b"ut_metadata"), Value::Integer(2));
                let mut dict = BTreeMap::new();
                dict.insert(Bytes::from_static(b"m"), Value::Dict(m));
                dict.insert(
                    Bytes::from_static(b"metadata_size"),
                    Value::Integer(metadata.len() as i64),
                );
                let body = encode(&Value::Dict(dict));
                let mut out = Vec::new();
                out.extend_from_slice(&(2 + body.len() as u32).to_be_bytes());
                out.push(20);
                out.push(0);
                out.extend_from_slice(&body);
                let _ = stream.write_all(&out).await;
            } else if frame[1] == 2 {
                // Single-piece metadata in these tests.
                let mut header = BTreeMap::new();
                header.insert(Bytes::from_static(b"msg_type"), Value::Integer(1));
                header.insert(Bytes::from_static(b"piece"), Value::Integer(0));
                header.insert(
                    Bytes::from_static(b"total_size"),
                    Value::Integer(metadata.len() as i64),
                );
                let mut body = encode(&Value::Dict(header));
                body.extend_from_slice(&metadata);
                let mut out = Vec::new();
                out.extend_from_slice(&(2 + body.len() as u32).to_be_bytes());
                out.push(20);
                out.push(1);
                out.extend_from_slice(&body);
                let _ = stream.write_all(&out).await;
            }
        }
    });

    addr
}

#[tokio::test]
async fn test_known_infohash_admits_no_fetch() {
    // Scenario: the database already holds X; observations for X must be
    // dropped after one exists check, spawning nothing.
    let db = Arc::new(MemoryDb::default());
    db.torrents.lock().insert(InfoHash([0xAB; 20]), "known".into());

    let observations = Arc::new(ObservationQueue::new(64));
    let sink = Sink::new(db.clone(), quick_leech_config(), quick_sink_config());
    let queue = Arc::clone(&observations);
    let task = tokio::spawn(async move { sink.run(queue).await });

    let peer = dead_addr().await;
    observations.push(observation(InfoHash([0xAB; 20]), peer));

    wait_for(|| db.exists_calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(db.adds.load(Ordering::SeqCst), 0);
    assert_eq!(db.exists_calls.load(Ordering::SeqCst), 1);
    task.abort();
}

#[tokio::test]
async fn test_duplicate_observation_feeds_existing_fetch() {
    // A second observation for an in-flight infohash must not spawn a
    // second fetch: no second exists check.
    let db = Arc::new(MemoryDb::default());
    let observations = Arc::new(ObservationQueue::new(64));
    let sink = Sink::new(db.clone(), quick_leech_config(), quick_sink_config());
    let queue = Arc::clone(&observations);
    let task = tokio::spawn(async move { sink.run(queue).await });

    let info_hash = InfoHash([0xCD; 20]);
    observations.push(observation(info_hash, dead_addr().await));
    wait_for(|| db.exists_calls.load(Ordering::SeqCst) == 1).await;

    observations.push(observation(info_hash, dead_addr().await));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(db.exists_calls.load(Ordering::SeqCst), 1);
    task.abort();
}

#[tokio::test]
async fn test_failed_fetch_enters_cooldown() {
    let db = Arc::new(MemoryDb::default());
    let observations = Arc::new(ObservationQueue::new(64));
    let sink = Sink::new(db.clone(), quick_leech_config(), quick_sink_config());
    let queue = Arc::clone(&observations);
    let task = tokio::spawn(async move { sink.run(queue).await });

    let info_hash = InfoHash([0xEF; 20]);
    observations.push(observation(info_hash, dead_addr().await));
    wait_for(|| db.exists_calls.load(Ordering::SeqCst) == 1).await;

    // The fetch budget is 1.5s; wait for the failure to land, then some.
    tokio::time::sleep(Duration::from_millis(2200)).await;

    // Within the cooldown the observation is dropped before any database
    // traffic.
    observations.push(observation(info_hash, dead_addr().await));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(db.exists_calls.load(Ordering::SeqCst), 1);
    assert_eq!(db.adds.load(Ordering::SeqCst), 0);
    task.abort();
}

#[tokio::test]
async fn test_observation_to_store_pipeline() {
    // Full path: observation, admission, fetch, verify, store.
    let metadata = {
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"length"), Value::Integer(77));
        dict.insert(Bytes::from_static(b"name"), Value::string("pipe.test"));
        encode(&Value::Dict(dict))
    };
    let info_hash = InfoHash::from_info_bytes(&metadata);
    let peer = serve_metadata_once(metadata).await;

    let db = Arc::new(MemoryDb::default());
    let observations = Arc::new(ObservationQueue::new(64));
    let sink = Sink::new(db.clone(), quick_leech_config(), quick_sink_config());
    let queue = Arc::clone(&observations);
    let task = tokio::spawn(async move { sink.run(queue).await });

    observations.push(observation(info_hash, peer));
    wait_for(|| db.adds.load(Ordering::SeqCst) == 1).await;

    assert_eq!(
        db.torrents.lock().get(&info_hash).map(String::as_str),
        Some("pipe.test")
    );

    // Once stored, further observations admit nothing new.
    observations.push(observation(info_hash, dead_addr().await));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(db.adds.load(Ordering::SeqCst), 1);

    task.abort();
}
