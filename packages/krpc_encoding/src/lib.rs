//! Bencoded KRPC (BEP-5) wire types: node/info-hash identifiers, compact
//! node and peer packing, and the query/response/error envelope.

mod addr;
mod booleans;
mod messages;
mod node_id;
mod node_info;

pub use addr::Addr;
pub use messages::{
    random_transaction_id, Envelope, KRPCError, MessageType, Query, Response, TransactionId,
};
pub use node_id::{InfoHash, NodeID, ID_LEN};
pub use node_info::{decode_compact_nodes, encode_compact_nodes, NodeInfo};
