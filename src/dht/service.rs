use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::bencode::BencodeError;
use crate::metainfo::InfoHash;

use super::error::DhtError;
use super::identity::{IdentityPool, NodeCache, NodeId};
use super::message::{Krpc, KrpcBody, Query, Reply, Response, TransactionId};

/// Well-known entry points, used only until the node cache has live entries.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(15);
const IDENTITY_ROTATE_PERIOD: Duration = Duration::from_secs(10 * 60);
const NEIGHBOUR_COUNT: usize = 8;
const MAX_TRAVERSAL_DEPTH: u8 = 3;
const MAX_SAMPLES_PER_RESPONSE: usize = 16;
const SAMPLE_FANOUT: usize = 3;
const STATS_LOG_EVERY_TICKS: u64 = 60;

/// Tunables for one DHT service (one UDP socket).
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Pacing tick for outbound probe rounds.
    pub tick_interval: Duration,
    /// Outbound query budget, per second.
    pub rate_limit: u32,
    /// Transaction table capacity; oldest entries are evicted beyond this.
    pub max_pending: usize,
    /// Recently-seen node cache capacity.
    pub node_cache_capacity: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            rate_limit: 2000,
            max_pending: 8192,
            node_cache_capacity: 2048,
        }
    }
}

/// A discovered `(infohash, peer)` pair.
///
/// Observations are ephemeral: they exist only on the queue between the DHT
/// service and the sink, and duplicates are expected and frequent.
#[derive(Debug, Clone)]
pub struct Observation {
    pub info_hash: InfoHash,
    pub peer: SocketAddr,
    pub observed_at: Instant,
}

/// Bounded, lossy, oldest-dropping observation stream.
///
/// The DHT side pushes without ever blocking; when the sink falls behind,
/// the oldest observations are overwritten. Duplicates dominate the stream,
/// so consumers must tolerate loss.
pub struct ObservationQueue {
    queue: ArrayQueue<Observation>,
    notify: Notify,
    dropped: AtomicU64,
}

impl ObservationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes an observation, displacing the oldest when full.
    pub fn push(&self, observation: Observation) {
        if self.queue.force_push(observation).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    /// Waits for and removes the next observation.
    pub async fn pop(&self) -> Observation {
        loop {
            if let Some(observation) = self.queue.pop() {
                return observation;
            }
            self.notify.notified().await;
        }
    }

    /// Removes the next observation if one is ready.
    pub fn try_pop(&self) -> Option<Observation> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Observations displaced since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Per-packet counters. The service never fails on network input; it counts.
#[derive(Debug, Default)]
pub struct DhtStats {
    pub queries_rx: AtomicU64,
    pub queries_tx: AtomicU64,
    pub responses_rx: AtomicU64,
    pub observations: AtomicU64,
    pub malformed: AtomicU64,
    pub truncated: AtomicU64,
    pub unknown_tid: AtomicU64,
    pub send_fail: AtomicU64,
}

impl DhtStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
enum PendingKind {
    Ping,
    FindNode,
    GetPeers { info_hash: InfoHash },
    SampleInfohashes,
}

struct Pending {
    kind: PendingKind,
    deadline: Instant,
    depth: u8,
}

/// The DHT harvesting service: one UDP socket, many virtual identities.
///
/// The service sustains outbound `find_node`/`sample_infohashes` probing to
/// keep itself visible, answers inbound queries with fabricated
/// neighbourhoods, and extracts an [`Observation`] from every `get_peers`
/// and `announce_peer` it receives.
pub struct DhtService {
    socket: UdpSocket,
    local_addr: SocketAddr,
    identities: IdentityPool,
    cache: NodeCache,
    pending: DashMap<(TransactionId, SocketAddr), Pending>,
    pending_order: Mutex<VecDeque<(TransactionId, SocketAddr, Instant)>>,
    limiter: Mutex<TokenBucket>,
    observations: Arc<ObservationQueue>,
    stats: Arc<DhtStats>,
    config: DhtConfig,
}

impl DhtService {
    /// Binds a UDP socket and prepares the service. Bind failures are
    /// startup-fatal and surface to the caller.
    pub async fn bind(
        addr: SocketAddr,
        config: DhtConfig,
        observations: Arc<ObservationQueue>,
    ) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "dht service bound");

        Ok(Self {
            socket,
            local_addr,
            identities: IdentityPool::new(),
            cache: NodeCache::new(config.node_cache_capacity),
            pending: DashMap::new(),
            pending_order: Mutex::new(VecDeque::new()),
            limiter: Mutex::new(TokenBucket::new(config.rate_limit)),
            observations,
            stats: Arc::new(DhtStats::default()),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<DhtStats> {
        Arc::clone(&self.stats)
    }

    /// Services the socket until the task is dropped.
    ///
    /// Never returns on network errors; per-packet failures are counted and
    /// the loop keeps going.
    pub async fn run(&self) {
        let mut buf = vec![0u8; 65535];
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rotate = tokio::time::interval(IDENTITY_ROTATE_PERIOD);
        rotate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        rotate.tick().await;

        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, addr)) => self.handle_datagram(&buf[..n], addr).await,
                        Err(e) => debug!(error = %e, "udp receive failed"),
                    }
                }
                _ = tick.tick() => {
                    self.outbound_round().await;
                    self.prune_pending();
                    ticks += 1;
                    if ticks % STATS_LOG_EVERY_TICKS == 0 {
                        self.log_stats();
                    }
                }
                _ = rotate.tick() => {
                    self.identities.rotate();
                    debug!("identity pool rotated");
                }
            }
        }
    }

    pub(crate) async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let message = match Krpc::parse(data) {
            Ok(message) => message,
            Err(DhtError::Bencode(BencodeError::UnexpectedEof)) => {
                DhtStats::bump(&self.stats.truncated);
                return;
            }
            Err(_) => {
                DhtStats::bump(&self.stats.malformed);
                return;
            }
        };

        match message.body {
            KrpcBody::Query(query) => {
                DhtStats::bump(&self.stats.queries_rx);
                self.handle_query(message.transaction_id, query, addr).await;
            }
            KrpcBody::Response(response) => {
                self.handle_response(message.transaction_id, response, addr)
                    .await;
            }
            KrpcBody::Error { code, message: m } => {
                debug!(code, message = %m, %addr, "krpc error response");
                self.pending.remove(&(message.transaction_id, addr));
            }
        }
    }

    async fn handle_query(&self, tid: TransactionId, query: Query, addr: SocketAddr) {
        if let SocketAddr::V4(v4) = addr {
            self.cache.insert(query_sender(&query), v4);
        }

        let reply = match &query {
            Query::Ping { .. } => Reply::Ping {
                id: self.identities.outbound(),
            },
            Query::FindNode { target, .. } => Reply::FindNode {
                id: self.identities.respond_as(target.as_bytes()),
                nodes: self
                    .cache
                    .fabricate_neighbours(target.as_bytes(), NEIGHBOUR_COUNT),
            },
            Query::GetPeers { info_hash, .. } => {
                // The asker wants peers for this infohash, which makes the
                // asker itself a likely peer.
                self.observe(*info_hash, addr);

                let token: [u8; 8] = rand::rng().random();
                Reply::GetPeers {
                    id: self.identities.respond_as(info_hash.as_bytes()),
                    token: Bytes::copy_from_slice(&token),
                    nodes: self
                        .cache
                        .fabricate_neighbours(info_hash.as_bytes(), NEIGHBOUR_COUNT),
                }
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                ..
            } => {
                let peer_port = if *implied_port { addr.port() } else { *port };
                self.observe(*info_hash, SocketAddr::new(addr.ip(), peer_port));

                Reply::AnnouncePeer {
                    id: self.identities.respond_as(info_hash.as_bytes()),
                }
            }
            Query::SampleInfohashes { target, .. } => Reply::SampleInfohashes {
                id: self.identities.respond_as(target.as_bytes()),
                nodes: self
                    .cache
                    .fabricate_neighbours(target.as_bytes(), NEIGHBOUR_COUNT),
                interval: 21600,
            },
            Query::Unknown { name, .. } => {
                debug!(query = %name, %addr, "unserved query");
                Reply::Error {
                    code: 204,
                    message: "Method Unknown".to_string(),
                }
            }
        };

        self.send_reply(reply, &tid, addr).await;
    }

    async fn handle_response(&self, tid: TransactionId, response: Response, addr: SocketAddr) {
        let Some((_, pending)) = self.pending.remove(&(tid, addr)) else {
            DhtStats::bump(&self.stats.unknown_tid);
            return;
        };
        DhtStats::bump(&self.stats.responses_rx);

        if let (SocketAddr::V4(v4), Some(id)) = (addr, response.id) {
            self.cache.insert(id, v4);
        }
        for node in &response.nodes {
            self.cache.insert(node.id, node.addr);
        }

        match pending.kind {
            PendingKind::GetPeers { info_hash } => {
                for peer in &response.values {
                    self.observe(info_hash, *peer);
                }

                // No peers yet: walk toward the target through the closer
                // nodes the remote handed back, up to a bounded hop count.
                if response.values.is_empty() && pending.depth < MAX_TRAVERSAL_DEPTH {
                    for node in response.nodes.iter().take(NEIGHBOUR_COUNT) {
                        self.send_query(
                            Query::GetPeers {
                                id: self.identities.outbound(),
                                info_hash,
                            },
                            SocketAddr::V4(node.addr),
                            PendingKind::GetPeers { info_hash },
                            pending.depth + 1,
                        )
                        .await;
                    }
                }
            }
            PendingKind::SampleInfohashes => {
                for info_hash in response.samples.iter().take(MAX_SAMPLES_PER_RESPONSE) {
                    self.send_query(
                        Query::GetPeers {
                            id: self.identities.outbound(),
                            info_hash: *info_hash,
                        },
                        addr,
                        PendingKind::GetPeers {
                            info_hash: *info_hash,
                        },
                        0,
                    )
                    .await;

                    for node in response.nodes.iter().take(SAMPLE_FANOUT) {
                        self.send_query(
                            Query::GetPeers {
                                id: self.identities.outbound(),
                                info_hash: *info_hash,
                            },
                            SocketAddr::V4(node.addr),
                            PendingKind::GetPeers {
                                info_hash: *info_hash,
                            },
                            0,
                        )
                        .await;
                    }
                }
            }
            PendingKind::Ping | PendingKind::FindNode => {}
        }
    }

    /// One probe round: refill the budget, then spend it expanding reach.
    async fn outbound_round(&self) {
        self.limiter.lock().refill();

        if self.cache.is_empty() {
            self.bootstrap().await;
            return;
        }

        let budget = self.limiter.lock().available();
        let targets = self.cache.sample(budget);

        for (i, node) in targets.into_iter().enumerate() {
            let query = if i % 4 == 0 {
                Query::SampleInfohashes {
                    id: self.identities.outbound(),
                    target: NodeId::random(),
                }
            } else {
                Query::FindNode {
                    id: self.identities.outbound(),
                    target: NodeId::random(),
                }
            };
            let kind = match &query {
                Query::SampleInfohashes { .. } => PendingKind::SampleInfohashes,
                _ => PendingKind::FindNode,
            };
            self.send_query(query, SocketAddr::V4(node.addr), kind, 0)
                .await;
        }
    }

    async fn bootstrap(&self) {
        for host in BOOTSTRAP_NODES {
            match tokio::net::lookup_host(*host).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.find(SocketAddr::is_ipv4) {
                        debug!(%addr, host = *host, "probing bootstrap node");
                        self.send_query(
                            Query::FindNode {
                                id: self.identities.outbound(),
                                target: NodeId::random(),
                            },
                            addr,
                            PendingKind::FindNode,
                            0,
                        )
                        .await;
                    }
                }
                Err(e) => warn!(host = *host, error = %e, "bootstrap resolution failed"),
            }
        }
    }

    async fn send_query(
        &self,
        query: Query,
        addr: SocketAddr,
        kind: PendingKind,
        depth: u8,
    ) {
        if !self.limiter.lock().try_take() {
            return;
        }

        let tid_bytes: [u8; 2] = rand::rng().random();
        let tid = Bytes::copy_from_slice(&tid_bytes);

        if self.pending.len() >= self.config.max_pending {
            self.evict_oldest_pending();
        }

        let deadline = Instant::now() + TRANSACTION_TIMEOUT;
        self.pending
            .insert((tid.clone(), addr), Pending { kind, deadline, depth });
        self.pending_order
            .lock()
            .push_back((tid.clone(), addr, deadline));

        let datagram = match query.encode(&tid) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!(error = %e, "query encode failed");
                self.pending.remove(&(tid, addr));
                return;
            }
        };

        match self.socket.send_to(&datagram, addr).await {
            Ok(_) => DhtStats::bump(&self.stats.queries_tx),
            Err(e) => {
                debug!(%addr, error = %e, "udp send failed");
                DhtStats::bump(&self.stats.send_fail);
                self.pending.remove(&(tid, addr));
            }
        }
    }

    async fn send_reply(&self, reply: Reply, tid: &TransactionId, addr: SocketAddr) {
        let datagram = reply.encode(tid);
        if let Err(e) = self.socket.send_to(&datagram, addr).await {
            debug!(%addr, error = %e, "udp send failed");
            DhtStats::bump(&self.stats.send_fail);
        }
    }

    fn observe(&self, info_hash: InfoHash, peer: SocketAddr) {
        DhtStats::bump(&self.stats.observations);
        self.observations.push(Observation {
            info_hash,
            peer,
            observed_at: Instant::now(),
        });
    }

    /// Drops timed-out transactions from the front of the order queue.
    fn prune_pending(&self) {
        let now = Instant::now();
        let mut order = self.pending_order.lock();

        while let Some((_, _, deadline)) = order.front() {
            if *deadline > now {
                break;
            }
            if let Some((tid, addr, deadline)) = order.pop_front() {
                // Only remove the entry this queue record belongs to; the
                // same (tid, addr) key may have been reissued since.
                self.pending
                    .remove_if(&(tid, addr), |_, p| p.deadline == deadline);
            }
        }
    }

    fn evict_oldest_pending(&self) {
        let mut order = self.pending_order.lock();
        while let Some((tid, addr, deadline)) = order.pop_front() {
            if self
                .pending
                .remove_if(&(tid, addr), |_, p| p.deadline == deadline)
                .is_some()
            {
                break;
            }
        }
    }

    fn log_stats(&self) {
        let stats = &self.stats;
        info!(
            local_addr = %self.local_addr,
            queries_rx = stats.queries_rx.load(Ordering::Relaxed),
            queries_tx = stats.queries_tx.load(Ordering::Relaxed),
            responses_rx = stats.responses_rx.load(Ordering::Relaxed),
            observations = stats.observations.load(Ordering::Relaxed),
            malformed = stats.malformed.load(Ordering::Relaxed),
            truncated = stats.truncated.load(Ordering::Relaxed),
            unknown_tid = stats.unknown_tid.load(Ordering::Relaxed),
            send_fail = stats.send_fail.load(Ordering::Relaxed),
            cached_nodes = self.cache.len(),
            pending = self.pending.len(),
            dropped_observations = self.observations.dropped(),
            "dht stats",
        );
    }

    #[cfg(test)]
    pub(crate) fn insert_pending_for_test(
        &self,
        tid: TransactionId,
        addr: SocketAddr,
        info_hash: InfoHash,
    ) {
        let deadline = Instant::now() + TRANSACTION_TIMEOUT;
        self.pending.insert(
            (tid.clone(), addr),
            Pending {
                kind: PendingKind::GetPeers { info_hash },
                deadline,
                depth: MAX_TRAVERSAL_DEPTH,
            },
        );
        self.pending_order.lock().push_back((tid, addr, deadline));
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn query_sender(query: &Query) -> NodeId {
    match query {
        Query::Ping { id }
        | Query::FindNode { id, .. }
        | Query::GetPeers { id, .. }
        | Query::AnnouncePeer { id, .. }
        | Query::SampleInfohashes { id, .. }
        | Query::Unknown { id, .. } => *id,
    }
}

/// Leaky outbound budget: refilled continuously, spent one query at a time.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    fill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32) -> Self {
        let rate = f64::from(rate_per_sec.max(1));
        Self {
            capacity: rate,
            tokens: rate,
            fill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn available(&self) -> usize {
        self.tokens as usize
    }
}
