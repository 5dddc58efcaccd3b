use crate::active_transactions::ActiveTransactions;
use crate::send_transport::SendTransport;
use crate::socket::KRPCSocket;
use krpc_encoding::{Envelope, MessageType};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An inbound KRPC query, handed to whatever owns the DHT engine.
pub struct InboundQuery {
    pub envelope: Envelope,
    pub addr: SocketAddr,
}

/// An inbound KRPC response that nobody in `ActiveTransactions` was
/// waiting for -- routed to the engine's generic response handling
/// (searcher matching, candidate pool sampling).
pub struct InboundResponse {
    pub envelope: Envelope,
    pub addr: SocketAddr,
}

/// Binds a UDP socket and splits it into a `SendTransport` plus two
/// receive streams: queries (always handled generically) and responses
/// that no pending `RequestTransport::find_node` claimed. Grounded on
/// `examples/other_examples/e19cc6b6_..._dht-mod.rs.rs`'s
/// `KRPCNode::new(socket).serve()`.
pub struct KRPCNode {
    socket: Arc<KRPCSocket>,
}

impl KRPCNode {
    pub fn new(socket: KRPCSocket) -> KRPCNode {
        KRPCNode {
            socket: Arc::new(socket),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns the receive loop and returns the sending half plus the two
    /// inbound channels. `transactions` is shared with any
    /// `RequestTransport` built from the returned `SendTransport` so
    /// awaited calls intercept their own responses first.
    pub fn serve(
        self,
        transactions: ActiveTransactions,
    ) -> (
        Arc<SendTransport>,
        mpsc::UnboundedReceiver<InboundQuery>,
        mpsc::UnboundedReceiver<InboundResponse>,
    ) {
        let send_transport = Arc::new(SendTransport::new(self.socket.clone()));
        let (query_tx, query_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let socket = self.socket;
        tokio::spawn(async move {
            loop {
                let (envelope, addr) = match socket.recv().await {
                    Ok(Some(pair)) => pair,
                    Ok(None) => continue, // malformed datagram: dropped silently
                    Err(err) => {
                        log::warn!("krpc socket closed: {}", err);
                        break;
                    }
                };

                match &envelope.message {
                    MessageType::Query { .. } => {
                        let _ = query_tx.send(InboundQuery { envelope, addr });
                    }
                    MessageType::Response { .. } => {
                        let transaction_id = envelope.transaction_id.clone();
                        match transactions.fulfill(&transaction_id, envelope) {
                            Ok(Some(unclaimed)) => {
                                let _ = response_tx.send(InboundResponse {
                                    envelope: unclaimed,
                                    addr,
                                });
                            }
                            Ok(None) => {}
                            Err(err) => log::warn!("transaction table error: {}", err),
                        }
                    }
                    MessageType::Error { .. } => {}
                }
            }
        });

        (send_transport, query_rx, response_rx)
    }
}
