use crate::{booleans, node_info, Addr, NodeID};
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Opaque transaction id matching outbound queries to inbound responses
/// (BEP-5's `t`). Queries fired outside a searcher use a fresh 2-byte id;
/// a searcher's fan-out uses its own counter instead.
pub type TransactionId = Vec<u8>;

pub fn random_transaction_id() -> TransactionId {
    rand::random::<[u8; 2]>().to_vec()
}

/// Envelope holding information common to queries, responses, and errors.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Transaction id generated by the querying node and echoed back.
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: TransactionId,

    /// Client version string.
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ByteBuf>,

    #[serde(flatten)]
    pub message: MessageType,
}

impl Envelope {
    pub fn decode(bytes: &[u8]) -> Result<Envelope, serde_bencode::Error> {
        serde_bencode::de::from_bytes(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::ser::to_bytes(self)
    }

    pub fn query(transaction_id: TransactionId, query: Query) -> Envelope {
        Envelope {
            transaction_id,
            version: None,
            message: MessageType::Query { query },
        }
    }

    pub fn response(transaction_id: TransactionId, response: Response) -> Envelope {
        Envelope {
            transaction_id,
            version: None,
            message: MessageType::Response { response },
        }
    }

    pub fn error(transaction_id: TransactionId, error: KRPCError) -> Envelope {
        Envelope {
            transaction_id,
            version: None,
            message: MessageType::Error { error },
        }
    }
}

/// Messages sent and received by nodes, tagged by BEP-5's `y` field.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "y")]
pub enum MessageType {
    #[serde(rename = "q")]
    Query {
        #[serde(flatten)]
        query: Query,
    },

    #[serde(rename = "r")]
    Response {
        #[serde(rename = "r")]
        response: Response,
    },

    #[serde(rename = "e")]
    Error {
        #[serde(rename = "e")]
        error: KRPCError,
    },
}

/// Error sent when a query cannot be fulfilled. This crawler only ever
/// sends `[202, "Server Error"]`, but the pair is decoded generically.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct KRPCError(pub u32, pub String);

impl KRPCError {
    pub fn server_error() -> KRPCError {
        KRPCError(202, "Server Error".to_string())
    }
}

impl fmt::Display for KRPCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KRPC error {}: {}", self.0, self.1)
    }
}

/// The four BEP-5 queries this crawler speaks.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "q", content = "a")]
pub enum Query {
    #[serde(rename = "ping")]
    Ping { id: NodeID },

    #[serde(rename = "find_node")]
    FindNode { id: NodeID, target: NodeID },

    #[serde(rename = "get_peers")]
    GetPeers { id: NodeID, info_hash: NodeID },

    #[serde(rename = "announce_peer")]
    AnnouncePeer {
        id: NodeID,

        #[serde(default, deserialize_with = "booleans::deserialize")]
        implied_port: bool,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,

        info_hash: NodeID,

        /// Token received in a prior `get_peers` response. The crawler
        /// never validates it.
        #[serde(with = "serde_bytes")]
        token: Vec<u8>,
    },
}

/// Responses to the four queries above. `serde(untagged)` mirrors BEP-5:
/// the shape alone (which fields are present) disambiguates the variant.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Response {
    /// Response to `find_node`, and to `get_peers` when the responder has
    /// no peers for the info hash.
    NextHop {
        id: NodeID,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<ByteBuf>,

        #[serde(with = "node_info")]
        nodes: Vec<crate::NodeInfo>,
    },

    /// Response to `get_peers` when the responder claims to know peers.
    GetPeers {
        id: NodeID,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<ByteBuf>,

        #[serde(rename = "values", with = "crate::addr::compact_peer_list")]
        peers: Vec<Addr>,
    },

    /// Response to `ping` and `announce_peer`.
    OnlyID { id: NodeID },
}
