use num_bigint::BigUint;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::fmt;

/// Width in bytes of a node id / info hash: both live in the same 160-bit
/// key space.
pub const ID_LEN: usize = 20;

/// Opaque 20-byte identifier. Used both as a DHT node id and as a torrent
/// info hash -- the two share a key space by design (BEP-5).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeID([u8; ID_LEN]);

/// `InfoHash` is the same 160-bit key space as `NodeID`, used where the
/// spec's intent (a torrent identifier, not a node identifier) matters to
/// the reader.
pub type InfoHash = NodeID;

impl NodeID {
    pub fn new(bytes: [u8; ID_LEN]) -> NodeID {
        NodeID(bytes)
    }

    /// Generates a fresh id from 20 cryptographically random bytes.
    pub fn random() -> NodeID {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeID(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// XOR distance to `other`, interpreted as a 160-bit big-endian integer.
    pub fn distance(&self, other: &NodeID) -> BigUint {
        let mut xored = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            xored[i] = self.0[i] ^ other.0[i];
        }
        BigUint::from_bytes_be(&xored)
    }

    /// Routing table bucket index for a given XOR distance: the position of
    /// its highest set bit, or 0 when the distance is 0.
    pub fn bucket_index_for(distance: &BigUint) -> usize {
        let bits = distance.bits();
        if bits == 0 {
            0
        } else {
            (bits - 1) as usize
        }
    }

    pub fn bucket_index(&self, other: &NodeID) -> usize {
        Self::bucket_index_for(&self.distance(other))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<NodeID> {
        if bytes.len() != ID_LEN {
            return None;
        }
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(bytes);
        Some(NodeID(out))
    }
}

impl fmt::Debug for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for NodeID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes::Bytes::new(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeID {
    fn deserialize<D>(deserializer: D) -> Result<NodeID, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let buf = ByteBuf::deserialize(deserializer)?;
        NodeID::from_slice(buf.as_ref())
            .ok_or_else(|| serde::de::Error::custom("node id must be 20 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_with_self_is_zero() {
        let id = NodeID::random();
        assert_eq!(id.distance(&id), BigUint::from(0u32));
    }

    #[test]
    fn bucket_index_of_zero_distance_is_zero() {
        assert_eq!(NodeID::bucket_index_for(&BigUint::from(0u32)), 0);
    }

    #[test]
    fn bucket_index_is_highest_set_bit() {
        assert_eq!(NodeID::bucket_index_for(&BigUint::from(1u32)), 0);
        assert_eq!(NodeID::bucket_index_for(&BigUint::from(2u32)), 1);
        assert_eq!(NodeID::bucket_index_for(&BigUint::from(3u32)), 1);
        assert_eq!(NodeID::bucket_index_for(&BigUint::from(4u32)), 2);
    }

    #[test]
    fn example_scenario_one_distance_and_bucket() {
        let zero = [0u8; ID_LEN];
        let mut one = [0u8; ID_LEN];
        one[ID_LEN - 1] = 1;

        let a = NodeID::new(zero);
        let b = NodeID::new(one);

        assert_eq!(a.distance(&b), BigUint::from(1u32));
        assert_eq!(a.bucket_index(&b), 0);
    }
}
