//! Tokio-backed KRPC transport: a UDP socket that speaks bencoded BEP-5
//! envelopes, split into a fire-and-forget sending half and two inbound
//! streams (queries, and responses nobody explicitly awaited).

mod active_transactions;
mod node;
mod request_transport;
mod response_future;
mod send_transport;
mod socket;

pub use active_transactions::{ActiveTransactions, TransactionError};
pub use node::{InboundQuery, InboundResponse, KRPCNode};
pub use request_transport::{FindNodeResult, RequestError, RequestTransport};
pub use send_transport::SendTransport;
pub use socket::{KRPCSocket, EXPECTED_DATAGRAM_SIZE, MAX_DATAGRAM_SIZE};
