use crate::active_transactions::{ActiveTransactions, TransactionError};
use crate::response_future::ResponseFuture;
use crate::send_transport::SendTransport;
use krpc_encoding::{MessageType, NodeID, NodeInfo, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("request timed out")]
    Timeout,
    #[error("response did not contain a find_node result")]
    UnexpectedResponse,
}

pub struct FindNodeResult {
    pub id: NodeID,
    pub nodes: Vec<NodeInfo>,
}

/// Convenience wrapper pairing `SendTransport::find_node` with a
/// `ResponseFuture` and a timeout -- the one place in this system that
/// genuinely awaits a specific reply rather than handling it generically
/// (the bootstrap path; see `Dht::bootstrap`). Grounded on
/// `examples/other_examples/e19cc6b6_..._dht-mod.rs.rs`'s
/// `discover_nodes_of`.
pub struct RequestTransport {
    id: NodeID,
    send: Arc<SendTransport>,
    transactions: ActiveTransactions,
}

impl RequestTransport {
    pub fn new(id: NodeID, send: Arc<SendTransport>, transactions: ActiveTransactions) -> RequestTransport {
        RequestTransport {
            id,
            send,
            transactions,
        }
    }

    pub async fn find_node(&self, addr: SocketAddr, target: NodeID) -> Result<FindNodeResult, RequestError> {
        let transaction_id = krpc_encoding::random_transaction_id();

        let wait = ResponseFuture::wait_for(transaction_id.clone(), self.transactions.clone());
        self.send
            .find_node(transaction_id, self.id, addr, target)
            .await;

        let envelope = tokio::time::timeout(BOOTSTRAP_TIMEOUT, wait)
            .await
            .map_err(|_| RequestError::Timeout)??;

        match envelope.message {
            MessageType::Response {
                response: Response::NextHop { id, nodes, .. },
            } => Ok(FindNodeResult { id, nodes }),
            _ => Err(RequestError::UnexpectedResponse),
        }
    }
}
