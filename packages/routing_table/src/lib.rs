//! Kademlia-flavored routing table for a wide-coverage DHT crawler: fixed
//! XOR-distance buckets (no splitting), plus a bounded pool of
//! not-yet-tabled candidates used to diversify crawling.

mod bucket;
mod candidate_pool;
mod node;
mod table;

pub use bucket::{Bucket, InsertOutcome, K_BUCKET};
pub use candidate_pool::{CandidatePool, CAPACITY as CANDIDATE_POOL_CAPACITY};
pub use node::Node;
pub use table::{ProbeTarget, RoutingTable, NUM_BUCKETS};
