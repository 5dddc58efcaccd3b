//! The DHT engine: bootstrap, the periodic dig loop, inbound query/response
//! dispatch, the searcher registry and its sweeper. Grounded
//! operation-for-operation on `original_source/crawler.py` and
//! `original_source/spyder.py` (the latter adds the candidate pool and
//! sweeper the former lacks), restructured around `tokio::spawn`-driven
//! loops in the idiom of
//! `examples/other_examples/e19cc6b6_..._dht-mod.rs.rs`'s `Dht::start`.

mod searcher;

use crate::errors::{Error, Result};
use krpc_encoding::{Addr, InfoHash, MessageType, NodeID, NodeInfo, Query, Response, TransactionId};
use routing_table::{CandidatePool, Node, RoutingTable};
use searcher::{Searcher, SearcherUpdate};
use serde_bytes::ByteBuf;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_krpc::{ActiveTransactions, InboundQuery, InboundResponse, KRPCNode, KRPCSocket, RequestTransport, SendTransport};

/// How many nodes the dig loop draws from the candidate pool each tick, on
/// top of the routing table's own closest-8.
const DIG_CANDIDATE_TOPUP: usize = 7;

/// How many nodes of an un-awaited response get folded into the candidate
/// pool (rather than all of them -- the candidate pool is a diversified
/// sample, not a dumping ground).
const CANDIDATE_SAMPLE_SIZE: usize = 8;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Events the engine publishes for the orchestrator to react to. The
/// engine never holds an orchestrator reference directly.
#[derive(Debug)]
pub enum DhtEvent {
    Ping { node_id: NodeID, addr: SocketAddr },
    FindNode { node_id: NodeID, target: NodeID, addr: SocketAddr },
    GetPeers { node_id: NodeID, info_hash: InfoHash, addr: SocketAddr },
    AnnouncePeer { node_id: NodeID, info_hash: InfoHash, port: u16, addr: SocketAddr },
    PeersFound { info_hash: InfoHash, peers: HashSet<Addr> },
}

struct Shared {
    id: NodeID,
    routing_table: Mutex<RoutingTable>,
    candidates: Mutex<CandidatePool>,
    searchers: Mutex<HashMap<TransactionId, Searcher>>,
    searchers_seq: Mutex<u32>,
    send: Arc<SendTransport>,
    request: RequestTransport,
    events: mpsc::UnboundedSender<DhtEvent>,
    dig_interval: Duration,
}

/// A running DHT node. Cheap to clone -- every clone shares the same
/// routing table, candidate pool, and searcher registry.
#[derive(Clone)]
pub struct Dht {
    shared: Arc<Shared>,
}

impl Dht {
    /// Binds `bind_addr`, spawns the inbound dispatch loops, the dig loop,
    /// and the searcher sweeper, and returns the handle plus the channel
    /// `DhtEvent`s arrive on.
    pub async fn start(bind_addr: SocketAddr, dig_interval: Duration) -> Result<(Dht, mpsc::UnboundedReceiver<DhtEvent>)> {
        let socket = KRPCSocket::bind(bind_addr).await.map_err(|cause| Error::Bind { addr: bind_addr, cause })?;
        let node = KRPCNode::new(socket);

        let id = NodeID::random();
        let transactions = ActiveTransactions::new();
        let (send, query_rx, response_rx) = node.serve(transactions.clone());
        let request = RequestTransport::new(id, send.clone(), transactions);
        let (events, events_rx) = mpsc::unbounded_channel();

        let dht = Dht {
            shared: Arc::new(Shared {
                id,
                routing_table: Mutex::new(RoutingTable::new(id)),
                candidates: Mutex::new(CandidatePool::new()),
                searchers: Mutex::new(HashMap::new()),
                searchers_seq: Mutex::new(0),
                send,
                request,
                events,
                dig_interval,
            }),
        };

        dht.clone().spawn_query_loop(query_rx);
        dht.clone().spawn_response_loop(response_rx);
        dht.clone().spawn_dig_loop();
        dht.clone().spawn_sweeper();

        Ok((dht, events_rx))
    }

    pub fn id(&self) -> NodeID {
        self.shared.id
    }

    pub fn routing_table_len(&self) -> usize {
        self.shared.routing_table.lock().unwrap().len()
    }

    /// Sends `find_node(target=self_id)` to each bootstrap address and
    /// waits for a reply, seeding the routing table with the responder and
    /// the nodes it returns. Bootstrap addresses that don't answer within
    /// the request timeout are skipped; one failure doesn't block the
    /// others (`futures::future::join_all` over independent awaits).
    pub async fn bootstrap(&self, addrs: Vec<SocketAddr>) {
        let futures = addrs.into_iter().map(|addr| self.bootstrap_one(addr));
        futures::future::join_all(futures).await;
    }

    async fn bootstrap_one(&self, addr: SocketAddr) {
        let self_id = self.shared.id;
        match self.shared.request.find_node(addr, self_id).await {
            Ok(result) => {
                self.add_node(Node::new(result.id, addr_of(addr)));
                for node in result.nodes {
                    self.add_node(Node::new(node.id, node.addr));
                }
            }
            Err(err) => log::warn!("bootstrap against {} failed: {}", addr, err),
        }
    }

    fn add_node(&self, node: Node) {
        let probe = self.shared.routing_table.lock().unwrap().add_node(node);
        if let Some(probe) = probe {
            let dht = self.clone();
            tokio::spawn(async move {
                let tid = krpc_encoding::random_transaction_id();
                let self_id = dht.shared.id;
                dht.shared.send.find_node(tid, self_id, probe.addr.into(), self_id).await;
            });
        }
    }

    fn closest(&self, target: &NodeID, k: usize) -> Vec<Node> {
        self.shared.routing_table.lock().unwrap().closest(target, k)
    }

    fn spawn_query_loop(self, mut query_rx: mpsc::UnboundedReceiver<InboundQuery>) {
        tokio::spawn(async move {
            while let Some(InboundQuery { envelope, addr }) = query_rx.recv().await {
                if let Err((transaction_id, err)) = self.handle_query(envelope, addr).await {
                    self.shared.send.respond_error(transaction_id, addr).await;
                    log::warn!("query from {} failed: {}", addr, err);
                }
            }
        });
    }

    fn spawn_response_loop(self, mut response_rx: mpsc::UnboundedReceiver<InboundResponse>) {
        tokio::spawn(async move {
            while let Some(InboundResponse { envelope, addr }) = response_rx.recv().await {
                self.handle_response(envelope, addr).await;
            }
        });
    }

    fn spawn_dig_loop(self) {
        tokio::spawn(async move {
            loop {
                self.dig_once().await;
                tokio::time::sleep(self.shared.dig_interval).await;
            }
        });
    }

    fn spawn_sweeper(self) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                self.sweep_searchers();
            }
        });
    }

    async fn dig_once(&self) {
        let target = NodeID::random();
        let mut targets = self.closest(&target, 8);

        let topped_up = {
            let mut candidates = self.shared.candidates.lock().unwrap();
            let n = candidates.len().min(DIG_CANDIDATE_TOPUP);
            candidates.drain_random(n)
        };
        targets.extend(topped_up);

        for node in targets {
            let tid = krpc_encoding::random_transaction_id();
            self.shared.send.find_node(tid, self.shared.id, node.addr.into(), target).await;
        }
    }

    /// Handles one inbound query, echoing its transaction id back to the
    /// caller on failure so the query loop can send the `{y:"e",
    /// e:[202,"Server Error"]}` envelope `crawler.py::handle_message`'s
    /// try/except sends on any handler failure.
    async fn handle_query(
        &self,
        envelope: krpc_encoding::Envelope,
        addr: SocketAddr,
    ) -> std::result::Result<(), (TransactionId, Error)> {
        let transaction_id = envelope.transaction_id.clone();
        let query = match envelope.message {
            MessageType::Query { query } => query,
            _ => return Err((transaction_id, Error::MalformedMessage("expected a query envelope".into()))),
        };
        let self_id = self.shared.id;

        let (responder_id, event) = match query {
            Query::Ping { id } => {
                self.shared.send.respond(transaction_id, Response::OnlyID { id: self_id }, addr).await;
                (id, DhtEvent::Ping { node_id: id, addr })
            }
            Query::FindNode { id, target } => {
                let nodes = to_node_info(self.closest(&target, 8));
                self.shared
                    .send
                    .respond(transaction_id, Response::NextHop { id: self_id, token: None, nodes }, addr)
                    .await;
                (id, DhtEvent::FindNode { node_id: id, target, addr })
            }
            Query::GetPeers { id, info_hash } => {
                let nodes = to_node_info(self.closest(&info_hash, 8));
                let token = Some(ByteBuf::from(NodeID::random().to_vec()));
                self.shared
                    .send
                    .respond(transaction_id, Response::NextHop { id: self_id, token, nodes }, addr)
                    .await;
                (id, DhtEvent::GetPeers { node_id: id, info_hash, addr })
            }
            Query::AnnouncePeer { id, implied_port, port, info_hash, token: _ } => {
                let port = match (implied_port, port) {
                    (true, _) => addr.port(),
                    (false, Some(port)) => port,
                    (false, None) => {
                        return Err((
                            transaction_id,
                            Error::MalformedMessage("announce_peer without implied_port needs an explicit port".into()),
                        ));
                    }
                };
                self.shared.send.respond(transaction_id, Response::OnlyID { id: self_id }, addr).await;
                (id, DhtEvent::AnnouncePeer { node_id: id, info_hash, port, addr })
            }
        };

        let _ = self.shared.events.send(event);
        self.add_node(Node::new(responder_id, addr_of(addr)));

        let tid = krpc_encoding::random_transaction_id();
        self.shared.send.find_node(tid, self_id, addr, NodeID::random()).await;
        Ok(())
    }

    async fn handle_response(&self, envelope: krpc_encoding::Envelope, addr: SocketAddr) {
        let response = match envelope.message {
            MessageType::Response { response } => response,
            _ => return,
        };
        let transaction_id = envelope.transaction_id;
        let (responder_id, nodes, values) = response_parts(&response);

        let existing = self.shared.searchers.lock().unwrap().remove(&transaction_id);
        match existing {
            Some(mut searcher) => {
                let new_nodes: HashSet<Node> = nodes.iter().map(|n| Node::new(n.id, n.addr)).collect();
                let new_values: HashSet<Addr> = values.iter().copied().collect();
                match searcher.update(new_nodes, new_values) {
                    SearcherUpdate::Continue(next) => {
                        let info_hash = searcher.info_hash;
                        self.shared.searchers.lock().unwrap().insert(transaction_id.clone(), searcher);
                        for node in next {
                            self.shared
                                .send
                                .get_peers(transaction_id.clone(), self.shared.id, node.addr.into(), info_hash)
                                .await;
                        }
                    }
                    SearcherUpdate::Terminated(values) => {
                        if let Some(values) = values {
                            let _ = self.shared.events.send(DhtEvent::PeersFound {
                                info_hash: searcher.info_hash,
                                peers: values,
                            });
                        }
                    }
                }
            }
            None => {
                let mut rng = rand::thread_rng();
                use rand::seq::SliceRandom;
                let mut shuffled = nodes.clone();
                shuffled.shuffle(&mut rng);
                shuffled.truncate(CANDIDATE_SAMPLE_SIZE);
                let sample = shuffled.into_iter().map(|n| Node::new(n.id, n.addr));
                self.shared.candidates.lock().unwrap().extend(sample);
            }
        }

        self.add_node(Node::new(responder_id, addr_of(addr)));
    }

    /// Starts an iterative `get_peers` walk for `info_hash`: allocates the
    /// next 4-byte counter transaction id, registers the searcher, and
    /// fans the initial query out to the routing table's closest 16.
    pub async fn start_searcher(&self, info_hash: InfoHash) {
        let transaction_id = {
            let mut seq = self.shared.searchers_seq.lock().unwrap();
            let current = *seq;
            *seq = seq.wrapping_add(1);
            current.to_be_bytes().to_vec()
        };

        let seed = self.closest(&info_hash, searcher::FANOUT);
        let mut searcher = Searcher::new(info_hash);
        searcher.seed(seed.clone());
        self.shared.searchers.lock().unwrap().insert(transaction_id.clone(), searcher);

        for node in seed {
            self.shared
                .send
                .get_peers(transaction_id.clone(), self.shared.id, node.addr.into(), info_hash)
                .await;
        }
    }

    fn sweep_searchers(&self) {
        let expired: Vec<(TransactionId, Searcher)> = {
            let mut searchers = self.shared.searchers.lock().unwrap();
            let expired_ids: Vec<TransactionId> = searchers
                .iter()
                .filter(|(_, s)| s.is_expired())
                .map(|(tid, _)| tid.clone())
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|tid| searchers.remove(&tid).map(|s| (tid, s)))
                .collect()
        };

        for (_, searcher) in expired {
            let info_hash = searcher.info_hash;
            if let Some(values) = searcher.terminate() {
                let _ = self.shared.events.send(DhtEvent::PeersFound { info_hash, peers: values });
            }
        }
    }
}

fn addr_of(addr: SocketAddr) -> Addr {
    match addr {
        SocketAddr::V4(v4) => Addr::new(*v4.ip(), v4.port()),
        SocketAddr::V6(_) => Addr::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
    }
}

fn to_node_info(nodes: Vec<Node>) -> Vec<NodeInfo> {
    nodes.into_iter().map(|n| NodeInfo::new(n.id, n.addr)).collect()
}

fn response_parts(response: &Response) -> (NodeID, Vec<NodeInfo>, Vec<Addr>) {
    match response {
        Response::NextHop { id, nodes, .. } => (*id, nodes.clone(), Vec::new()),
        Response::GetPeers { id, peers, .. } => (*id, Vec::new(), peers.clone()),
        Response::OnlyID { id } => (*id, Vec::new(), Vec::new()),
    }
}
