use crate::{Addr, NodeID};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// A node identity paired with its contact address. The compact wire form
/// is the 26-byte record `id[20] | ip[4] | port[2]` from BEP-5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub id: NodeID,
    pub addr: Addr,
}

impl NodeInfo {
    pub fn new(id: NodeID, addr: Addr) -> NodeInfo {
        NodeInfo { id, addr }
    }

    pub fn to_compact(&self) -> [u8; 26] {
        let mut out = [0u8; 26];
        out[..20].copy_from_slice(self.id.as_bytes());
        out[20..].copy_from_slice(&self.addr.to_compact());
        out
    }

    pub fn from_compact(bytes: &[u8]) -> Option<NodeInfo> {
        if bytes.len() != 26 {
            return None;
        }
        let id = NodeID::from_slice(&bytes[..20])?;
        let addr = Addr::from_compact(&bytes[20..])?;
        Some(NodeInfo::new(id, addr))
    }
}

/// `serde(with = "node_info")` for `Vec<NodeInfo>` fields: a single
/// bencoded byte-string of concatenated 26-byte records (compact node
/// list). Records with a sub-1024 port are dropped silently on decode.
pub fn serialize<S>(nodes: &[NodeInfo], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let mut buf = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        buf.extend_from_slice(&node.to_compact());
    }
    serde_bytes::Bytes::new(&buf).serialize(serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<NodeInfo>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let buf = ByteBuf::deserialize(deserializer)?;
    Ok(decode_compact_nodes(buf.as_ref()))
}

/// Decodes a compact node list, silently discarding truncated trailing
/// bytes and sub-1024-port entries.
pub fn decode_compact_nodes(bytes: &[u8]) -> Vec<NodeInfo> {
    bytes
        .chunks_exact(26)
        .filter_map(NodeInfo::from_compact)
        .filter(|node| node.addr.is_plausible())
        .collect()
}

pub fn encode_compact_nodes(nodes: &[NodeInfo]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        buf.extend_from_slice(&node.to_compact());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn example_scenario_two_compact_node_encoding() {
        let id = NodeID::from_slice(&[
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2,
        ])
        .unwrap();
        let node = NodeInfo::new(id, Addr::new(Ipv4Addr::new(5, 6, 7, 8), 6881));

        let encoded = encode_compact_nodes(&[node]);
        assert_eq!(encoded.len(), 26);
        assert_eq!(&encoded[20..24], &[5, 6, 7, 8]);
        assert_eq!(&encoded[24..26], &[0x1A, 0xE1]);

        let decoded = decode_compact_nodes(&encoded);
        assert_eq!(decoded, vec![node]);
    }

    #[test]
    fn low_port_nodes_are_dropped() {
        let id = NodeID::random();
        let node = NodeInfo::new(id, Addr::new(Ipv4Addr::new(1, 1, 1, 1), 80));
        let encoded = encode_compact_nodes(&[node]);
        assert!(decode_compact_nodes(&encoded).is_empty());
    }

    #[test]
    fn truncated_trailing_bytes_are_ignored() {
        let id = NodeID::random();
        let node = NodeInfo::new(id, Addr::new(Ipv4Addr::new(1, 1, 1, 1), 6881));
        let mut encoded = encode_compact_nodes(&[node]);
        encoded.extend_from_slice(&[1, 2, 3]);
        assert_eq!(decode_compact_nodes(&encoded), vec![node]);
    }
}
