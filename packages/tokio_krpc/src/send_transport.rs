use crate::socket::KRPCSocket;
use krpc_encoding::{random_transaction_id, Envelope, KRPCError, NodeID, Query, Response, TransactionId};
use std::net::SocketAddr;
use std::sync::Arc;

/// Fire-and-forget KRPC sending, used by everything except the bootstrap
/// path: the dig loop, searcher fan-out, routing-table health-check
/// probes, and query replies. Grounded on `src/transport/send.rs`'s
/// `ping`/`find_node`/`get_peers`/`announce_peer` builders and
/// `crawler.py`/`spyder.py`'s `send_message`/`find_node`/`get_peers`.
pub struct SendTransport {
    socket: Arc<KRPCSocket>,
}

impl SendTransport {
    pub fn new(socket: Arc<KRPCSocket>) -> SendTransport {
        SendTransport { socket }
    }

    async fn send_query(&self, transaction_id: TransactionId, query: Query, addr: SocketAddr) {
        let envelope = Envelope::query(transaction_id, query);
        if let Err(err) = self.socket.send(&envelope, addr).await {
            log::debug!("send to {} failed: {}", addr, err);
        }
    }

    pub async fn ping(&self, self_id: NodeID, addr: SocketAddr) {
        self.send_query(random_transaction_id(), Query::Ping { id: self_id }, addr)
            .await;
    }

    /// Sends `find_node`. `transaction_id` is caller-supplied so the dig
    /// loop, the health-check probe, and the awaited bootstrap call can
    /// each pick the id shape that matches their needs.
    pub async fn find_node(
        &self,
        transaction_id: TransactionId,
        self_id: NodeID,
        addr: SocketAddr,
        target: NodeID,
    ) {
        self.send_query(transaction_id, Query::FindNode { id: self_id, target }, addr)
            .await;
    }

    pub async fn get_peers(
        &self,
        transaction_id: TransactionId,
        self_id: NodeID,
        addr: SocketAddr,
        info_hash: NodeID,
    ) {
        self.send_query(transaction_id, Query::GetPeers { id: self_id, info_hash }, addr)
            .await;
    }

    pub async fn respond(&self, transaction_id: TransactionId, response: Response, addr: SocketAddr) {
        let envelope = Envelope::response(transaction_id, response);
        if let Err(err) = self.socket.send(&envelope, addr).await {
            log::debug!("send to {} failed: {}", addr, err);
        }
    }

    pub async fn respond_error(&self, transaction_id: TransactionId, addr: SocketAddr) {
        let envelope = Envelope::error(transaction_id, KRPCError::server_error());
        if let Err(err) = self.socket.send(&envelope, addr).await {
            log::debug!("send to {} failed: {}", addr, err);
        }
    }
}
