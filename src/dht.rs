//! DHT harvesting engine (BEP-5, BEP-51)
//!
//! The crawler joins the Mainline DHT as a *sink*: it keeps no Kademlia
//! routing table and never serves correct lookups. Instead it floods the
//! keyspace with short-lived virtual identities whose IDs sit next to
//! whatever infohash a remote asks about, so that `get_peers` and
//! `announce_peer` traffic is steered toward it. Every such query is an
//! [`Observation`] of a live `(infohash, peer)` pair.
//!
//! - [`message`](self) - typed KRPC messages over bencode
//! - [`identity`](self) - virtual node identities and the seen-node cache
//! - [`service`](self) - the UDP state machine

mod error;
mod identity;
mod message;
mod service;

pub use error::DhtError;
pub use identity::{IdentityPool, NodeCache, NodeId, ID_PREFIX_LEN};
pub use message::{CompactNode, Krpc, KrpcBody, Query, Reply, Response, TransactionId};
pub use service::{DhtConfig, DhtService, DhtStats, Observation, ObservationQueue, BOOTSTRAP_NODES};
