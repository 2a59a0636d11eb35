use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::Bytes;

use crate::bencode::{decode, encode, Value};
use crate::metainfo::InfoHash;

use super::error::DhtError;
use super::identity::NodeId;

/// An opaque KRPC transaction identifier. The crawler always issues 2-byte
/// random IDs but accepts any length from remotes.
pub type TransactionId = Bytes;

/// A `(node id, IPv4 endpoint)` pair in the 26-byte compact encoding used by
/// `nodes` fields. IPv6 entries are not carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

impl CompactNode {
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != 26 {
            return None;
        }
        let id = NodeId::from_bytes(&data[..20])?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);
        Some(Self {
            id,
            addr: SocketAddrV4::new(ip, port),
        })
    }

    pub fn to_compact(&self) -> [u8; 26] {
        let mut out = [0u8; 26];
        out[..20].copy_from_slice(self.id.as_bytes());
        out[20..24].copy_from_slice(&self.addr.ip().octets());
        out[24..26].copy_from_slice(&self.addr.port().to_be_bytes());
        out
    }
}

/// Packs nodes into a single compact byte string.
pub fn pack_nodes(nodes: &[CompactNode]) -> Bytes {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        out.extend_from_slice(&node.to_compact());
    }
    Bytes::from(out)
}

/// Unpacks a compact `nodes` byte string, skipping any trailing partial entry.
pub fn unpack_nodes(data: &[u8]) -> Vec<CompactNode> {
    data.chunks_exact(26)
        .filter_map(CompactNode::from_compact)
        .collect()
}

/// A KRPC query, as sent or received.
#[derive(Debug, Clone)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
    /// BEP-51 infohash sampling.
    SampleInfohashes {
        id: NodeId,
        target: NodeId,
    },
    /// A well-formed query the crawler does not serve; answered with
    /// KRPC error 204.
    Unknown {
        id: NodeId,
        name: String,
    },
}

impl Query {
    pub fn name(&self) -> &str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
            Query::SampleInfohashes { .. } => "sample_infohashes",
            Query::Unknown { name, .. } => name,
        }
    }

    /// Encodes the query as a complete KRPC datagram.
    pub fn encode(&self, transaction_id: &TransactionId) -> Result<Vec<u8>, DhtError> {
        let mut args = BTreeMap::new();
        match self {
            Query::Ping { id } => {
                args.insert(key("id"), id_value(id));
            }
            Query::FindNode { id, target } => {
                args.insert(key("id"), id_value(id));
                args.insert(key("target"), id_value(target));
            }
            Query::GetPeers { id, info_hash } => {
                args.insert(key("id"), id_value(id));
                args.insert(
                    key("info_hash"),
                    Value::Bytes(Bytes::copy_from_slice(info_hash.as_bytes())),
                );
            }
            Query::AnnouncePeer {
                id,
                info_hash,
                port,
                token,
                implied_port,
            } => {
                args.insert(key("id"), id_value(id));
                args.insert(
                    key("info_hash"),
                    Value::Bytes(Bytes::copy_from_slice(info_hash.as_bytes())),
                );
                args.insert(key("port"), Value::Integer(i64::from(*port)));
                args.insert(key("token"), Value::Bytes(token.clone()));
                if *implied_port {
                    args.insert(key("implied_port"), Value::Integer(1));
                }
            }
            Query::SampleInfohashes { id, target } => {
                args.insert(key("id"), id_value(id));
                args.insert(key("target"), id_value(target));
            }
            Query::Unknown { .. } => {
                return Err(DhtError::Malformed("cannot encode unknown query".into()))
            }
        }

        let mut dict = BTreeMap::new();
        dict.insert(key("t"), Value::Bytes(transaction_id.clone()));
        dict.insert(key("y"), Value::string("q"));
        dict.insert(key("q"), Value::string(self.name()));
        dict.insert(key("a"), Value::Dict(args));

        Ok(encode(&Value::Dict(dict)))
    }
}

/// A KRPC response, parsed field-wise.
///
/// Responses carry no message name; which fields are meaningful depends on
/// the query the transaction ID correlates to, so parsing keeps every field
/// the wire had and lets the service interpret them.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub id: Option<NodeId>,
    pub nodes: Vec<CompactNode>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Bytes>,
    /// BEP-51: concatenated 20-byte infohash samples.
    pub samples: Vec<InfoHash>,
    pub interval: Option<i64>,
    pub num: Option<i64>,
}

/// Replies the crawler sends to inbound queries.
///
/// This is narrower than [`Response`]: the crawler only ever answers with
/// fabricated neighbourhoods, tokens, and acks.
#[derive(Debug, Clone)]
pub enum Reply {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        nodes: Vec<CompactNode>,
    },
    /// Carries an empty `values` list: the asker keeps looking through the
    /// fabricated nodes while the crawler keeps its infohash.
    GetPeers {
        id: NodeId,
        token: Bytes,
        nodes: Vec<CompactNode>,
    },
    AnnouncePeer {
        id: NodeId,
    },
    SampleInfohashes {
        id: NodeId,
        nodes: Vec<CompactNode>,
        interval: i64,
    },
    Error {
        code: i64,
        message: String,
    },
}

impl Reply {
    /// Encodes the reply as a complete KRPC datagram.
    pub fn encode(&self, transaction_id: &TransactionId) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(key("t"), Value::Bytes(transaction_id.clone()));

        if let Reply::Error { code, message } = self {
            dict.insert(key("y"), Value::string("e"));
            dict.insert(
                key("e"),
                Value::List(vec![Value::Integer(*code), Value::string(message)]),
            );
            return encode(&Value::Dict(dict));
        }

        let mut body = BTreeMap::new();
        match self {
            Reply::Ping { id } | Reply::AnnouncePeer { id } => {
                body.insert(key("id"), id_value(id));
            }
            Reply::FindNode { id, nodes } => {
                body.insert(key("id"), id_value(id));
                body.insert(key("nodes"), Value::Bytes(pack_nodes(nodes)));
            }
            Reply::GetPeers { id, token, nodes } => {
                body.insert(key("id"), id_value(id));
                body.insert(key("token"), Value::Bytes(token.clone()));
                body.insert(key("nodes"), Value::Bytes(pack_nodes(nodes)));
                body.insert(key("values"), Value::List(Vec::new()));
            }
            Reply::SampleInfohashes {
                id,
                nodes,
                interval,
            } => {
                body.insert(key("id"), id_value(id));
                body.insert(key("nodes"), Value::Bytes(pack_nodes(nodes)));
                body.insert(key("interval"), Value::Integer(*interval));
                body.insert(key("num"), Value::Integer(0));
                body.insert(key("samples"), Value::Bytes(Bytes::new()));
            }
            Reply::Error { .. } => unreachable!(),
        }

        dict.insert(key("y"), Value::string("r"));
        dict.insert(key("r"), Value::Dict(body));
        encode(&Value::Dict(dict))
    }
}

/// The body of a parsed KRPC message.
#[derive(Debug, Clone)]
pub enum KrpcBody {
    Query(Query),
    Response(Response),
    Error { code: i64, message: String },
}

/// A parsed inbound KRPC message.
#[derive(Debug, Clone)]
pub struct Krpc {
    pub transaction_id: TransactionId,
    pub body: KrpcBody,
}

impl Krpc {
    /// Parses a raw UDP datagram.
    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::Malformed("root is not a dict".into()))?;

        let transaction_id = dict
            .get(b"t".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| DhtError::Malformed("missing transaction id".into()))?;

        let kind = dict
            .get(b"y".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::Malformed("missing message type".into()))?;

        let body = match kind {
            "q" => KrpcBody::Query(parse_query(dict)?),
            "r" => KrpcBody::Response(parse_response(dict)?),
            "e" => parse_error(dict)?,
            other => {
                return Err(DhtError::Malformed(format!(
                    "unknown message type {:?}",
                    other
                )))
            }
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }
}

fn parse_query(dict: &BTreeMap<Bytes, Value>) -> Result<Query, DhtError> {
    let name = dict
        .get(b"q".as_slice())
        .and_then(|v| v.as_str())
        .ok_or_else(|| DhtError::Malformed("missing query name".into()))?;

    let args = dict
        .get(b"a".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| DhtError::Malformed("missing query args".into()))?;

    let id = args
        .get(b"id".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| NodeId::from_bytes(b))
        .ok_or_else(|| DhtError::Malformed("missing sender id".into()))?;

    match name {
        "ping" => Ok(Query::Ping { id }),
        "find_node" => {
            let target = node_id_arg(args, b"target")?;
            Ok(Query::FindNode { id, target })
        }
        "get_peers" => {
            let info_hash = info_hash_arg(args)?;
            Ok(Query::GetPeers { id, info_hash })
        }
        "announce_peer" => {
            let info_hash = info_hash_arg(args)?;
            let port = args
                .get(b"port".as_slice())
                .and_then(|v| v.as_integer())
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| DhtError::Malformed("missing announce port".into()))?;
            let token = args
                .get(b"token".as_slice())
                .and_then(|v| v.as_bytes())
                .cloned()
                .unwrap_or_default();
            let implied_port = args
                .get(b"implied_port".as_slice())
                .and_then(|v| v.as_integer())
                .is_some_and(|v| v != 0);
            Ok(Query::AnnouncePeer {
                id,
                info_hash,
                port,
                token,
                implied_port,
            })
        }
        "sample_infohashes" => {
            let target = node_id_arg(args, b"target")?;
            Ok(Query::SampleInfohashes { id, target })
        }
        other => Ok(Query::Unknown {
            id,
            name: other.to_string(),
        }),
    }
}

fn parse_response(dict: &BTreeMap<Bytes, Value>) -> Result<Response, DhtError> {
    let body = dict
        .get(b"r".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| DhtError::Malformed("missing response body".into()))?;

    let id = body
        .get(b"id".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| NodeId::from_bytes(b));

    let nodes = body
        .get(b"nodes".as_slice())
        .and_then(|v| v.as_bytes())
        .map(|b| unpack_nodes(b))
        .unwrap_or_default();

    let values = body
        .get(b"values".as_slice())
        .and_then(|v| v.as_list())
        .map(unpack_peers)
        .unwrap_or_default();

    let token = body
        .get(b"token".as_slice())
        .and_then(|v| v.as_bytes())
        .cloned();

    let samples = body
        .get(b"samples".as_slice())
        .and_then(|v| v.as_bytes())
        .map(|b| {
            b.chunks_exact(20)
                .filter_map(|chunk| InfoHash::from_bytes(chunk).ok())
                .collect()
        })
        .unwrap_or_default();

    let interval = body
        .get(b"interval".as_slice())
        .and_then(|v| v.as_integer());
    let num = body.get(b"num".as_slice()).and_then(|v| v.as_integer());

    Ok(Response {
        id,
        nodes,
        values,
        token,
        samples,
        interval,
        num,
    })
}

fn parse_error(dict: &BTreeMap<Bytes, Value>) -> Result<KrpcBody, DhtError> {
    let list = dict
        .get(b"e".as_slice())
        .and_then(|v| v.as_list())
        .ok_or_else(|| DhtError::Malformed("missing error list".into()))?;

    let code = list.first().and_then(|v| v.as_integer()).unwrap_or(0);
    let message = list
        .get(1)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string();

    Ok(KrpcBody::Error { code, message })
}

fn unpack_peers(values: &[Value]) -> Vec<SocketAddr> {
    values
        .iter()
        .filter_map(|v| v.as_bytes())
        .filter(|b| b.len() == 6)
        .map(|b| {
            let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
            let port = u16::from_be_bytes([b[4], b[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

fn node_id_arg(args: &BTreeMap<Bytes, Value>, name: &[u8]) -> Result<NodeId, DhtError> {
    args.get(name)
        .and_then(|v| v.as_bytes())
        .and_then(|b| NodeId::from_bytes(b))
        .ok_or_else(|| DhtError::Malformed("missing target".into()))
}

fn info_hash_arg(args: &BTreeMap<Bytes, Value>) -> Result<InfoHash, DhtError> {
    args.get(b"info_hash".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| InfoHash::from_bytes(b).ok())
        .ok_or_else(|| DhtError::Malformed("missing info_hash".into()))
}

fn key(name: &'static str) -> Bytes {
    Bytes::from_static(name.as_bytes())
}

fn id_value(id: &NodeId) -> Value {
    Value::Bytes(Bytes::copy_from_slice(id.as_bytes()))
}
