use crate::Node;
use rand::seq::IteratorRandom;
use std::collections::HashSet;

/// The candidate pool never grows the routing table itself, it just
/// diversifies what the dig loop queries next.
pub const CAPACITY: usize = 160_000;

/// Nodes seen in responses but not (yet) worth a routing-table slot --
/// bootstrap material for the dig loop. Bounded, with uniform-random
/// eviction when over capacity.
#[derive(Default)]
pub struct CandidatePool {
    nodes: HashSet<Node>,
}

impl CandidatePool {
    pub fn new() -> CandidatePool {
        CandidatePool {
            nodes: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds `nodes`, evicting uniformly-at-random as many existing entries
    /// as needed to stay within `CAPACITY`.
    pub fn extend(&mut self, nodes: impl IntoIterator<Item = Node>) {
        for node in nodes {
            self.nodes.insert(node);
        }

        while self.nodes.len() > CAPACITY {
            if let Some(&victim) = self.nodes.iter().choose(&mut rand::thread_rng()) {
                self.nodes.remove(&victim);
            } else {
                break;
            }
        }
    }

    /// Removes and returns up to `n` uniformly-random candidates, used by
    /// the dig loop to round out its `find_node` fan-out.
    pub fn drain_random(&mut self, n: usize) -> Vec<Node> {
        let chosen: Vec<Node> = self
            .nodes
            .iter()
            .copied()
            .choose_multiple(&mut rand::thread_rng(), n);

        for node in &chosen {
            self.nodes.remove(node);
        }

        chosen
    }
}
