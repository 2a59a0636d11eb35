use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddrV4;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng as _;

use super::message::CompactNode;

/// Number of leading bytes a fabricated identity shares with its target.
///
/// Fifteen of twenty bytes puts the identity deep inside the target's
/// keyspace neighbourhood while leaving 40 bits of entropy, enough that the
/// crawler's identities do not collide with each other.
pub const ID_PREFIX_LEN: usize = 15;

/// Size of the rotating set of long-lived outbound identities.
const POOL_SIZE: usize = 8;

/// A 20-byte DHT node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Generates a uniformly random identifier.
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    /// Generates an identifier adjacent to `target`: the first
    /// [`ID_PREFIX_LEN`] bytes are copied, the rest are random.
    pub fn near(target: &[u8; 20]) -> Self {
        let mut id = [0u8; 20];
        id[..ID_PREFIX_LEN].copy_from_slice(&target[..ID_PREFIX_LEN]);
        rand::rng().fill(&mut id[ID_PREFIX_LEN..]);
        Self(id)
    }

    /// Creates an identifier from a slice, rejecting wrong lengths.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 20 {
            return None;
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Some(Self(id))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Length in bytes of the common prefix with `other`.
    pub fn shared_prefix_len(&self, other: &[u8; 20]) -> usize {
        self.0
            .iter()
            .zip(other.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The crawler's rotating set of virtual identities.
///
/// Outbound probes are signed with one of a small number of long-lived
/// random IDs; inbound queries are answered with a throwaway identity
/// fabricated next to whatever the remote asked about. None of these
/// persist: the pool regenerates on every [`rotate`](Self::rotate).
pub struct IdentityPool {
    ids: RwLock<[NodeId; POOL_SIZE]>,
}

impl IdentityPool {
    pub fn new() -> Self {
        Self {
            ids: RwLock::new(std::array::from_fn(|_| NodeId::random())),
        }
    }

    /// Picks an identity for an outbound probe.
    pub fn outbound(&self) -> NodeId {
        let ids = self.ids.read();
        ids[rand::rng().random_range(0..POOL_SIZE)]
    }

    /// The identity used to answer a query concerning `target`.
    pub fn respond_as(&self, target: &[u8; 20]) -> NodeId {
        NodeId::near(target)
    }

    /// Regenerates the whole pool.
    pub fn rotate(&self) {
        let mut ids = self.ids.write();
        *ids = std::array::from_fn(|_| NodeId::random());
    }
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded FIFO cache of recently-seen live DHT nodes.
///
/// Feeds two consumers: outbound probe rounds pick targets from it, and
/// fabricated `find_node`/`get_peers` answers borrow its addresses so the
/// injected neighbours are routable. Eviction is oldest-first.
pub struct NodeCache {
    entries: DashMap<SocketAddrV4, NodeId>,
    order: Mutex<VecDeque<SocketAddrV4>>,
    capacity: usize,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Records a live node, evicting the oldest entry at capacity.
    pub fn insert(&self, id: NodeId, addr: SocketAddrV4) {
        if self.entries.insert(addr, id).is_some() {
            return;
        }

        let mut order = self.order.lock();
        order.push_back(addr);
        while order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    /// Samples up to `n` cached nodes, round-robin over insertion order.
    pub fn sample(&self, n: usize) -> Vec<CompactNode> {
        let order = self.order.lock();
        if order.is_empty() {
            return Vec::new();
        }

        let start = rand::rng().random_range(0..order.len());
        order
            .iter()
            .cycle()
            .skip(start)
            .take(order.len().min(n))
            .filter_map(|addr| {
                self.entries
                    .get(addr)
                    .map(|id| CompactNode { id: *id, addr: *addr })
            })
            .collect()
    }

    /// Fabricates `n` neighbours of `target`: IDs adjacent to the target,
    /// addresses borrowed from cached live nodes.
    pub fn fabricate_neighbours(&self, target: &[u8; 20], n: usize) -> Vec<CompactNode> {
        self.sample(n)
            .into_iter()
            .map(|node| CompactNode {
                id: NodeId::near(target),
                addr: node.addr,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
