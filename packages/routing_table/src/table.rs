use crate::bucket::{Bucket, InsertOutcome};
use crate::Node;
use krpc_encoding::NodeID;
use num_bigint::BigUint;

/// Number of fixed buckets: one per bit of the 160-bit key space.
pub const NUM_BUCKETS: usize = 160;

/// A node worth sending a health-check probe to: when a bucket is full
/// and the coin flip goes against replacement, the caller should
/// `find_node` the incoming node's address instead of dropping it
/// silently.
pub struct ProbeTarget {
    pub addr: krpc_encoding::Addr,
}

/// 160 fixed XOR-distance buckets around `id`. Bucket `i` holds nodes
/// whose distance to `id` lies in `[2^i, 2^(i+1))`.
pub struct RoutingTable {
    id: NodeID,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(id: NodeID) -> RoutingTable {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        buckets.resize_with(NUM_BUCKETS, Bucket::new);
        RoutingTable { id, buckets }
    }

    pub fn id(&self) -> NodeID {
        self.id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_index(&self, other: &NodeID) -> usize {
        self.id.bucket_index(other)
    }

    /// Adds `node` to its home bucket. Returns a probe target when the
    /// bucket was full and the random replacement didn't happen -- the
    /// caller (the DHT engine) is expected to fire a `find_node` at that
    /// address.
    pub fn add_node(&mut self, node: Node) -> Option<ProbeTarget> {
        let idx = self.bucket_index(&node.id);
        match self.buckets[idx].insert(node) {
            InsertOutcome::Inserted | InsertOutcome::Replaced => None,
            InsertOutcome::Probe => Some(ProbeTarget { addr: node.addr }),
        }
    }

    /// The `k` nodes closest to `target`, found by scanning outward from
    /// `target`'s home bucket -- first down toward bucket 0, then up
    /// toward bucket 159 -- and re-ranking the union by XOR distance.
    /// Returns fewer than `k` nodes when the table is sparse, and none
    /// when it's empty.
    pub fn closest(&self, target: &NodeID, k: usize) -> Vec<Node> {
        let home = self.bucket_index(target);

        let mut candidates: Vec<Node> = Vec::new();

        let mut idx = home as isize;
        while idx >= 0 && candidates.len() < k {
            candidates.extend(self.buckets[idx as usize].iter().copied());
            idx -= 1;
        }

        let mut idx = home + 1;
        while idx < NUM_BUCKETS && candidates.len() < k {
            candidates.extend(self.buckets[idx].iter().copied());
            idx += 1;
        }

        candidates.sort_by(|a, b| {
            let da = target.distance(&a.id);
            let db = target.distance(&b.id);
            da.cmp(&db).then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(k);
        candidates
    }

    /// Ranks an arbitrary set of nodes (e.g. a searcher's accumulated set)
    /// by XOR distance to `target`, keeping the closest `k`. Used by the
    /// searcher's fixed-point convergence check.
    pub fn rank_closest(target: &NodeID, nodes: impl IntoIterator<Item = Node>, k: usize) -> Vec<Node> {
        let mut ranked: Vec<(BigUint, Node)> = nodes
            .into_iter()
            .map(|node| (target.distance(&node.id), node))
            .collect();
        ranked.sort_by(|(da, a), (db, b)| da.cmp(db).then_with(|| a.id.cmp(&b.id)));
        ranked.truncate(k);
        ranked.into_iter().map(|(_, node)| node).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_encoding::Addr;
    use std::net::Ipv4Addr;

    fn id(last_byte: u8) -> NodeID {
        let mut bytes = [0u8; 20];
        bytes[19] = last_byte;
        NodeID::new(bytes)
    }

    #[test]
    fn empty_table_returns_no_closest_nodes() {
        let table = RoutingTable::new(id(0));
        assert!(table.closest(&id(1), 8).is_empty());
    }

    #[test]
    fn example_scenario_one_insert_and_lookup() {
        let mut table = RoutingTable::new(id(0));
        let node = Node::new(id(1), Addr::new(Ipv4Addr::new(1, 2, 3, 4), 6881));
        table.add_node(node);

        let closest = table.closest(&id(1), 8);
        assert_eq!(closest, vec![node]);
    }

    #[test]
    fn closest_returns_fewer_than_k_when_sparse() {
        let mut table = RoutingTable::new(id(0));
        table.add_node(Node::new(id(1), Addr::new(Ipv4Addr::new(1, 2, 3, 4), 6881)));
        table.add_node(Node::new(id(2), Addr::new(Ipv4Addr::new(1, 2, 3, 5), 6881)));

        assert_eq!(table.closest(&id(1), 8).len(), 2);
    }

    #[test]
    fn no_duplicates_within_a_bucket() {
        let mut table = RoutingTable::new(id(0));
        let node = Node::new(id(1), Addr::new(Ipv4Addr::new(1, 2, 3, 4), 6881));
        table.add_node(node);
        table.add_node(node);
        assert_eq!(table.len(), 1);
    }
}
