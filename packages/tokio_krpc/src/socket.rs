use krpc_encoding::Envelope;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Max datagram size KRPC messages are expected to fit in; UDP's own
/// ceiling is what we actually allocate for.
pub const EXPECTED_DATAGRAM_SIZE: usize = 1500;
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Thin async wrapper over a UDP socket that speaks bencoded KRPC
/// envelopes. Grounded on `src/transport/send.rs`'s direct
/// `socket.send_to`/`bencode` pairing, moved onto `tokio::net::UdpSocket`.
pub struct KRPCSocket {
    socket: UdpSocket,
}

impl KRPCSocket {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<KRPCSocket> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(KRPCSocket { socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send(&self, envelope: &Envelope, addr: SocketAddr) -> std::io::Result<()> {
        let bytes = envelope
            .encode()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Receives one datagram and decodes it. Decode failures are not
    /// errors the caller needs to react to -- they're silently dropped
    /// datagrams -- so this returns `None` for them rather than an
    /// `Err`, and only surfaces genuine socket errors.
    pub async fn recv(&self) -> std::io::Result<Option<(Envelope, SocketAddr)>> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        match Envelope::decode(&buf[..len]) {
            Ok(envelope) => Ok(Some((envelope, addr))),
            Err(_) => Ok(None),
        }
    }
}
