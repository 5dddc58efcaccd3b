use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// An IPv4 host/port pair, compact-encoded on the wire as 6 bytes
/// (`ipv4[4] | port[2]`, network byte order) per BEP-5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Addr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Addr {
        Addr { ip, port }
    }

    /// Anti-garbage heuristic: real BitTorrent ports never live in the
    /// well-known range.
    pub fn is_plausible(&self) -> bool {
        self.port >= 1024
    }

    pub fn to_compact(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[..4].copy_from_slice(&self.ip.octets());
        (&mut out[4..]).write_u16::<NetworkEndian>(self.port).unwrap();
        out
    }

    pub fn from_compact(bytes: &[u8]) -> Option<Addr> {
        if bytes.len() != 6 {
            return None;
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = (&bytes[4..6]).read_u16::<NetworkEndian>().ok()?;
        Some(Addr::new(ip, port))
    }
}

impl From<Addr> for SocketAddr {
    fn from(addr: Addr) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(addr.ip, addr.port))
    }
}

impl From<SocketAddrV4> for Addr {
    fn from(addr: SocketAddrV4) -> Addr {
        Addr::new(*addr.ip(), addr.port())
    }
}

impl Serialize for Addr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes::Bytes::new(&self.to_compact()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D>(deserializer: D) -> Result<Addr, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let buf = ByteBuf::deserialize(deserializer)?;
        Addr::from_compact(buf.as_ref())
            .ok_or_else(|| serde::de::Error::custom("peer address must be 6 bytes"))
    }
}

/// Compact list of peer addresses (BEP-5 `values`): a bencoded list of
/// 6-byte strings, one per peer. Entries with a sub-1024 port are dropped
/// silently.
pub mod compact_peer_list {
    use super::Addr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_bytes::ByteBuf;

    pub fn serialize<S>(peers: &[Addr], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bufs: Vec<ByteBuf> = peers
            .iter()
            .map(|addr| ByteBuf::from(addr.to_compact().to_vec()))
            .collect();
        bufs.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Addr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bufs: Vec<ByteBuf> = Vec::deserialize(deserializer)?;
        Ok(bufs
            .into_iter()
            .filter_map(|buf| Addr::from_compact(buf.as_ref()))
            .filter(Addr::is_plausible)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_round_trip() {
        let addr = Addr::new(Ipv4Addr::new(1, 2, 3, 4), 6881);
        let bytes = addr.to_compact();
        assert_eq!(bytes, [1, 2, 3, 4, 0x1A, 0xE1]);
        assert_eq!(Addr::from_compact(&bytes), Some(addr));
    }

    #[test]
    fn sub_1024_ports_are_not_plausible() {
        let addr = Addr::new(Ipv4Addr::new(1, 2, 3, 4), 80);
        assert!(!addr.is_plausible());
    }
}
