use krpc_encoding::{Addr, InfoHash};
use routing_table::{Node, RoutingTable};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Attempt budget a fresh searcher starts with.
pub const INITIAL_ATTEMPTS: u8 = 8;

/// How long a searcher is allowed to live before the sweeper kills it
/// regardless of convergence.
pub const TTL: Duration = Duration::from_secs(120);

/// How many nodes a searcher's `get_peers` fan-out targets per round --
/// twice the routing table's default `closest` fan-out, since a searcher
/// wants to converge fast.
pub const FANOUT: usize = 16;

/// Bookkeeping for one info hash's iterative `get_peers` walk. Grounded on
/// `original_source/spyder.py`'s `Searcher` namedtuple and
/// `update_peers_searcher`.
pub struct Searcher {
    pub info_hash: InfoHash,
    nodes: HashSet<Node>,
    values: HashSet<Addr>,
    attempts_remaining: u8,
    created_at: Instant,
}

/// What the DHT engine should do after feeding a response into a
/// searcher.
pub enum SearcherUpdate {
    /// The searcher is still alive; fan `get_peers` out to these nodes.
    Continue(Vec<Node>),
    /// The searcher has reached its attempt budget; it has been
    /// consumed. If it gathered any peers, publish them.
    Terminated(Option<HashSet<Addr>>),
}

impl Searcher {
    pub fn new(info_hash: InfoHash) -> Searcher {
        Searcher {
            info_hash,
            nodes: HashSet::new(),
            values: HashSet::new(),
            attempts_remaining: INITIAL_ATTEMPTS,
            created_at: Instant::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= TTL
    }

    pub fn attempts_remaining(&self) -> u8 {
        self.attempts_remaining
    }

    /// Nodes worth sending the *initial* `get_peers` fan-out to, i.e. the
    /// `closest(info_hash, 16)` computed by the caller before this
    /// searcher exists in the registry.
    pub fn seed(&mut self, nodes: Vec<Node>) {
        self.nodes.extend(nodes);
    }

    /// Merges a response's nodes/values into the searcher and decides
    /// whether to continue or terminate: if the new closest-16 set
    /// equals the old one (a fixed point), the attempt budget is spent
    /// down by one regardless of whether new nodes were actually added.
    pub fn update(&mut self, new_nodes: HashSet<Node>, new_values: HashSet<Addr>) -> SearcherUpdate {
        let old_closest: HashSet<Node> =
            RoutingTable::rank_closest(&self.info_hash, self.nodes.iter().copied(), FANOUT)
                .into_iter()
                .collect();

        self.nodes.extend(new_nodes);
        self.values.extend(new_values);

        let new_closest: HashSet<Node> =
            RoutingTable::rank_closest(&self.info_hash, self.nodes.iter().copied(), FANOUT)
                .into_iter()
                .collect();

        if new_closest == old_closest {
            self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
        }

        if self.attempts_remaining > 0 {
            SearcherUpdate::Continue(new_closest.into_iter().collect())
        } else {
            SearcherUpdate::Terminated(self.take_values())
        }
    }

    /// Consumes the searcher at sweeper discretion, returning its values
    /// if any were found.
    pub fn terminate(mut self) -> Option<HashSet<Addr>> {
        self.take_values()
    }

    fn take_values(&mut self) -> Option<HashSet<Addr>> {
        if self.values.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.values))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_encoding::NodeID;
    use std::net::Ipv4Addr;

    fn info_hash() -> InfoHash {
        NodeID::new([0xff; 20])
    }

    fn node(last_byte: u8) -> Node {
        let mut bytes = [0u8; 20];
        bytes[19] = last_byte;
        Node::new(NodeID::new(bytes), Addr::new(Ipv4Addr::new(1, 2, 3, 4), 6881))
    }

    #[test]
    fn fresh_searcher_has_full_attempt_budget_and_is_not_expired() {
        let searcher = Searcher::new(info_hash());
        assert_eq!(searcher.attempts_remaining(), INITIAL_ATTEMPTS);
        assert!(!searcher.is_expired());
    }

    #[test]
    fn fixed_point_responses_spend_the_attempt_budget_to_termination() {
        let mut searcher = Searcher::new(info_hash());
        let same_nodes: HashSet<Node> = (0..4).map(node).collect();
        searcher.seed(same_nodes.iter().copied().collect());

        for _ in 0..INITIAL_ATTEMPTS - 1 {
            match searcher.update(same_nodes.clone(), HashSet::new()) {
                SearcherUpdate::Continue(_) => {}
                SearcherUpdate::Terminated(_) => panic!("terminated before budget exhausted"),
            }
        }

        match searcher.update(same_nodes, HashSet::new()) {
            SearcherUpdate::Continue(_) => panic!("expected termination"),
            SearcherUpdate::Terminated(values) => assert!(values.is_none()),
        }
    }

    #[test]
    fn fresh_nodes_each_round_reset_the_fixed_point_but_still_terminate_eventually() {
        let mut searcher = Searcher::new(info_hash());
        searcher.seed(vec![node(0)]);

        let mut terminated = false;
        for i in 1..=INITIAL_ATTEMPTS {
            let fresh: HashSet<Node> = std::iter::once(node(i)).collect();
            match searcher.update(fresh, HashSet::new()) {
                SearcherUpdate::Continue(_) => {}
                SearcherUpdate::Terminated(_) => {
                    terminated = true;
                    break;
                }
            }
        }
        assert!(terminated, "searcher must terminate within its attempt budget");
    }

    #[test]
    fn terminate_surfaces_accumulated_values() {
        let mut searcher = Searcher::new(info_hash());
        let peer = Addr::new(Ipv4Addr::new(9, 9, 9, 9), 6881);
        searcher.update(HashSet::new(), std::iter::once(peer).collect());
        assert_eq!(searcher.terminate(), Some(std::iter::once(peer).collect()));
    }
}
