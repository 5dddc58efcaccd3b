//! BEP-29 micro transport protocol. A packet codec plus a minimal
//! connection state machine -- no congestion control, retransmission, or
//! reordering, just enough to race a single metadata fetch over UDP when
//! a peer's TCP session fails (and, for completeness, to accept the
//! occasional inbound connection). Grounded directly on
//! `original_source/bt_utp.py`'s `decode_packet`/`encode_packet` and
//! `MicroTransportProtocol`.

use crate::errors::{Error, Result};
use rand::Rng;
use std::convert::TryInto;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const STALL_TIMEOUT: Duration = Duration::from_secs(3);
const WINDOW_SIZE: u32 = 0xf000;
const EXTENSION_BITS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    fn from_nibble(n: u8) -> Result<PacketType> {
        match n {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Fin),
            2 => Ok(PacketType::State),
            3 => Ok(PacketType::Reset),
            4 => Ok(PacketType::Syn),
            other => Err(Error::MalformedMessage(format!("unknown uTP packet type {}", other))),
        }
    }
}

/// A decoded uTP packet: 20-byte header, zero or more chained extensions,
/// then the payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub version: u8,
    pub connection_id: u16,
    pub timestamp: u32,
    pub timestamp_diff: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub extensions: Vec<(u8, Vec<u8>)>,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + self.data.len());
        out.push((self.packet_type as u8) << 4 | (self.version & 0x0f));
        out.push(self.extensions.first().map(|(t, _)| *t).unwrap_or(0));
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.timestamp_diff.to_be_bytes());
        out.extend_from_slice(&self.wnd_size.to_be_bytes());
        out.extend_from_slice(&self.seq_nr.to_be_bytes());
        out.extend_from_slice(&self.ack_nr.to_be_bytes());

        for (idx, (_, data)) in self.extensions.iter().enumerate() {
            let next = self.extensions.get(idx + 1).map(|(t, _)| *t).unwrap_or(0);
            out.push(next);
            out.push(data.len() as u8);
            out.extend_from_slice(data);
        }

        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        if bytes.len() < 20 {
            return Err(Error::MalformedMessage("uTP packet shorter than the 20-byte header".into()));
        }

        let packet_type = PacketType::from_nibble(bytes[0] >> 4)?;
        let version = bytes[0] & 0x0f;
        let mut next_ext = bytes[1];
        let connection_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        let timestamp = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let timestamp_diff = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let wnd_size = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let seq_nr = u16::from_be_bytes([bytes[16], bytes[17]]);
        let ack_nr = u16::from_be_bytes([bytes[18], bytes[19]]);

        let mut rest = &bytes[20..];
        let mut extensions = Vec::new();
        while next_ext != 0 {
            if rest.len() < 2 {
                return Err(Error::MalformedMessage("truncated uTP extension header".into()));
            }
            let ext_len = rest[1] as usize;
            if rest.len() < 2 + ext_len {
                return Err(Error::MalformedMessage("truncated uTP extension data".into()));
            }
            extensions.push((next_ext, rest[2..2 + ext_len].to_vec()));
            next_ext = rest[0];
            rest = &rest[2 + ext_len..];
        }

        Ok(Packet {
            packet_type,
            version,
            connection_id,
            timestamp,
            timestamp_diff,
            wnd_size,
            seq_nr,
            ack_nr,
            extensions,
            data: rest.to_vec(),
        })
    }
}

fn now_micros() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_micros() as u32
}

/// `bt_utp.py::get_tms_diff`: not a function of any received packet's
/// timestamp, just this side's clock plus jitter, masked to 32 bits by
/// the `u32` wrap.
fn jittered_timestamp_diff() -> u32 {
    now_micros().wrapping_add(rand::thread_rng().gen_range(0..10000))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    SynSent,
    SynRecv,
    Connected,
    Disconnected,
}

/// A uTP connection. Implements `AsyncRead`/`AsyncWrite` so it can be
/// handed to the same metadata exchange that drives a TCP session; each
/// `poll_write` call maps one write to one `ST_DATA` datagram and each
/// `poll_read` call drains one received datagram, acking it before
/// returning the payload. `connect` dials out; `accept` takes the
/// `ST_SYN` branch of `bt_utp.py::datagram_received` for the inbound
/// side, which this crawler never drives (it only ever fetches metadata,
/// never serves it) but which the state machine isn't complete without.
pub struct UtpStream {
    socket: UdpSocket,
    state: ConnectionState,
    seq_nr: u16,
    ack_nr: u16,
    conn_id_send: u16,
    recv_buf: Vec<u8>,
    recv_pos: usize,
}

impl UtpStream {
    pub async fn connect(peer: SocketAddr) -> Result<UtpStream> {
        let bind_addr: SocketAddr = if peer.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;

        let conn_id_recv: u16 = rand::thread_rng().gen_range(0..0xffffu32) as u16;
        let mut stream = UtpStream {
            socket,
            state: ConnectionState::SynSent,
            seq_nr: 1,
            ack_nr: 0,
            conn_id_send: conn_id_recv.wrapping_add(1),
            recv_buf: Vec::new(),
            recv_pos: 0,
        };

        let syn = Packet {
            packet_type: PacketType::Syn,
            version: 1,
            connection_id: conn_id_recv,
            timestamp: now_micros(),
            timestamp_diff: 0,
            wnd_size: WINDOW_SIZE,
            seq_nr: stream.seq_nr,
            ack_nr: 0,
            extensions: vec![(EXTENSION_BITS, vec![0u8; 8])],
            data: Vec::new(),
        };
        stream.seq_nr = stream.seq_nr.wrapping_add(1);
        stream.socket.send(&syn.encode()).await?;

        timeout(STALL_TIMEOUT, stream.await_syn_ack())
            .await
            .map_err(|_| Error::Timeout)??;

        Ok(stream)
    }

    async fn await_syn_ack(&mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let n = self.socket.recv(&mut buf).await?;
            let packet = Packet::decode(&buf[..n])?;
            if packet.packet_type == PacketType::State {
                self.ack_nr = packet.seq_nr;
                self.state = ConnectionState::Connected;
                return Ok(());
            }
        }
    }

    /// Waits on an unconnected, bound `socket` for an inbound `ST_SYN` and
    /// accepts it, mirroring `bt_utp.py::datagram_received`'s
    /// `Type.ST_SYN` branch: derive the send/recv connection ids from the
    /// peer's, pick a random `seq_nr`, ack the peer's `seq_nr`, and reply
    /// `ST_STATE`. The connection stays in `SynRecv` until the first
    /// `ST_DATA` arrives (see `poll_read`), matching the Python original's
    /// `connection_made` callback firing only once data shows up.
    pub async fn accept(socket: UdpSocket) -> Result<UtpStream> {
        let mut buf = [0u8; 4096];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            let packet = match Packet::decode(&buf[..n]) {
                Ok(packet) => packet,
                Err(_) => continue,
            };
            if packet.packet_type != PacketType::Syn {
                continue;
            }

            socket.connect(from).await?;

            let mut stream = UtpStream {
                socket,
                state: ConnectionState::SynRecv,
                seq_nr: rand::thread_rng().gen_range(0..0xffffu32) as u16,
                ack_nr: packet.seq_nr,
                conn_id_send: packet.connection_id,
                recv_buf: Vec::new(),
                recv_pos: 0,
            };

            let reply = Packet {
                packet_type: PacketType::State,
                version: 1,
                connection_id: stream.conn_id_send,
                timestamp: now_micros(),
                timestamp_diff: jittered_timestamp_diff(),
                wnd_size: WINDOW_SIZE,
                seq_nr: stream.seq_nr,
                ack_nr: stream.ack_nr,
                extensions: vec![(EXTENSION_BITS, vec![0u8; 8])],
                data: Vec::new(),
            };
            stream.seq_nr = stream.seq_nr.wrapping_add(1);
            stream.socket.send(&reply.encode()).await?;

            return Ok(stream);
        }
    }
}

impl AsyncWrite for UtpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let packet = Packet {
            packet_type: PacketType::Data,
            version: 1,
            connection_id: this.conn_id_send,
            timestamp: now_micros(),
            timestamp_diff: jittered_timestamp_diff(),
            wnd_size: WINDOW_SIZE,
            seq_nr: this.seq_nr,
            ack_nr: this.ack_nr,
            extensions: Vec::new(),
            data: buf.to_vec(),
        };

        match this.socket.poll_send(cx, &packet.encode()) {
            Poll::Ready(Ok(_)) => {
                this.seq_nr = this.seq_nr.wrapping_add(1);
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state == ConnectionState::Connected {
            let fin = Packet {
                packet_type: PacketType::Fin,
                version: 1,
                connection_id: this.conn_id_send,
                timestamp: now_micros(),
                timestamp_diff: jittered_timestamp_diff(),
                wnd_size: WINDOW_SIZE,
                seq_nr: this.seq_nr,
                ack_nr: this.ack_nr,
                extensions: Vec::new(),
                data: Vec::new(),
            };
            let _ = this.socket.poll_send(cx, &fin.encode());
            this.state = ConnectionState::Disconnected;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for UtpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.recv_pos < this.recv_buf.len() {
                let n = std::cmp::min(buf.remaining(), this.recv_buf.len() - this.recv_pos);
                buf.put_slice(&this.recv_buf[this.recv_pos..this.recv_pos + n]);
                this.recv_pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.state == ConnectionState::Disconnected {
                return Poll::Ready(Ok(()));
            }

            let mut datagram = [0u8; 4096];
            let mut read_buf = ReadBuf::new(&mut datagram);
            match this.socket.poll_recv(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let packet = match Packet::decode(read_buf.filled()) {
                        Ok(packet) => packet,
                        Err(_) => continue,
                    };
                    this.ack_nr = packet.seq_nr;

                    match packet.packet_type {
                        PacketType::Data => {
                            if this.state == ConnectionState::SynRecv {
                                this.state = ConnectionState::Connected;
                            }

                            let ack = Packet {
                                packet_type: PacketType::State,
                                version: 1,
                                connection_id: this.conn_id_send,
                                timestamp: now_micros(),
                                timestamp_diff: jittered_timestamp_diff(),
                                wnd_size: WINDOW_SIZE,
                                seq_nr: this.seq_nr,
                                ack_nr: this.ack_nr,
                                extensions: Vec::new(),
                                data: Vec::new(),
                            };
                            let _ = this.socket.poll_send(cx, &ack.encode());

                            this.recv_buf = packet.data;
                            this.recv_pos = 0;
                            if this.recv_buf.is_empty() {
                                continue;
                            }
                        }
                        PacketType::Fin => {
                            let reply = Packet {
                                packet_type: PacketType::Fin,
                                version: 1,
                                connection_id: this.conn_id_send,
                                timestamp: now_micros(),
                                timestamp_diff: jittered_timestamp_diff(),
                                wnd_size: WINDOW_SIZE,
                                seq_nr: this.seq_nr,
                                ack_nr: this.ack_nr,
                                extensions: Vec::new(),
                                data: Vec::new(),
                            };
                            let _ = this.socket.poll_send(cx, &reply.encode());
                            this.state = ConnectionState::Disconnected;
                            return Poll::Ready(Ok(()));
                        }
                        PacketType::Reset => {
                            this.state = ConnectionState::Disconnected;
                            return Poll::Ready(Ok(()));
                        }
                        PacketType::State | PacketType::Syn => continue,
                    }
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn packet_round_trips_through_encode_and_decode() {
        let packet = Packet {
            packet_type: PacketType::Data,
            version: 1,
            connection_id: 42,
            timestamp: 123456,
            timestamp_diff: 99,
            wnd_size: WINDOW_SIZE,
            seq_nr: 7,
            ack_nr: 6,
            extensions: Vec::new(),
            data: b"hello".to_vec(),
        };
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.connection_id, 42);
        assert_eq!(decoded.seq_nr, 7);
        assert_eq!(decoded.data, b"hello");
    }

    #[test]
    fn extensions_chain_decodes_back_to_the_same_pairs() {
        let packet = Packet {
            packet_type: PacketType::Syn,
            version: 1,
            connection_id: 1,
            timestamp: 0,
            timestamp_diff: 0,
            wnd_size: WINDOW_SIZE,
            seq_nr: 1,
            ack_nr: 0,
            extensions: vec![(2, vec![0u8; 8])],
            data: Vec::new(),
        };
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.extensions, vec![(2, vec![0u8; 8])]);
    }

    #[test]
    fn short_buffer_fails_to_decode() {
        assert!(Packet::decode(&[0u8; 10]).is_err());
    }

    #[tokio::test]
    async fn connect_completes_the_syn_state_handshake() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let responder_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (n, from) = responder.recv_from(&mut buf).await.unwrap();
            let syn = Packet::decode(&buf[..n]).unwrap();
            assert_eq!(syn.packet_type, PacketType::Syn);

            let ack = Packet {
                packet_type: PacketType::State,
                version: 1,
                connection_id: syn.connection_id,
                timestamp: now_micros(),
                timestamp_diff: 0,
                wnd_size: WINDOW_SIZE,
                seq_nr: 1,
                ack_nr: syn.seq_nr,
                extensions: Vec::new(),
                data: Vec::new(),
            };
            responder.send_to(&ack.encode(), from).await.unwrap();
        });

        let stream = UtpStream::connect(responder_addr).await.unwrap();
        assert_eq!(stream.state, ConnectionState::Connected);
        responder_task.await.unwrap();
    }

    #[tokio::test]
    async fn write_then_read_delivers_the_payload_and_acks_it() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let responder_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (n, from) = responder.recv_from(&mut buf).await.unwrap();
            let syn = Packet::decode(&buf[..n]).unwrap();

            let ack = Packet {
                packet_type: PacketType::State,
                version: 1,
                connection_id: syn.connection_id,
                timestamp: now_micros(),
                timestamp_diff: 0,
                wnd_size: WINDOW_SIZE,
                seq_nr: 1,
                ack_nr: syn.seq_nr,
                extensions: Vec::new(),
                data: Vec::new(),
            };
            responder.send_to(&ack.encode(), from).await.unwrap();

            let (n, from) = responder.recv_from(&mut buf).await.unwrap();
            let data_packet = Packet::decode(&buf[..n]).unwrap();
            assert_eq!(data_packet.data, b"ping");

            let data_ack = Packet {
                packet_type: PacketType::Data,
                version: 1,
                connection_id: syn.connection_id,
                timestamp: now_micros(),
                timestamp_diff: 0,
                wnd_size: WINDOW_SIZE,
                seq_nr: 2,
                ack_nr: data_packet.seq_nr,
                extensions: Vec::new(),
                data: b"pong".to_vec(),
            };
            responder.send_to(&data_ack.encode(), from).await.unwrap();
        });

        let mut stream = UtpStream::connect(responder_addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        responder_task.await.unwrap();
    }

    #[tokio::test]
    async fn accept_answers_a_syn_with_state_and_parks_in_syn_recv() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = listener.local_addr().unwrap();
        let dialer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        dialer.connect(listener_addr).await.unwrap();

        let syn = Packet {
            packet_type: PacketType::Syn,
            version: 1,
            connection_id: 7,
            timestamp: now_micros(),
            timestamp_diff: 0,
            wnd_size: WINDOW_SIZE,
            seq_nr: 1,
            ack_nr: 0,
            extensions: vec![(EXTENSION_BITS, vec![0u8; 8])],
            data: Vec::new(),
        };
        dialer.send(&syn.encode()).await.unwrap();

        let stream = UtpStream::accept(listener).await.unwrap();
        assert_eq!(stream.state, ConnectionState::SynRecv);
        assert_eq!(stream.conn_id_send, 7);
        assert_eq!(stream.ack_nr, 1);

        let mut buf = [0u8; 4096];
        let n = dialer.recv(&mut buf).await.unwrap();
        let reply = Packet::decode(&buf[..n]).unwrap();
        assert_eq!(reply.packet_type, PacketType::State);
        assert_eq!(reply.ack_nr, 1);
    }

    #[tokio::test]
    async fn first_data_after_accept_moves_syn_recv_to_connected() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = listener.local_addr().unwrap();
        let dialer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        dialer.connect(listener_addr).await.unwrap();

        let syn = Packet {
            packet_type: PacketType::Syn,
            version: 1,
            connection_id: 7,
            timestamp: now_micros(),
            timestamp_diff: 0,
            wnd_size: WINDOW_SIZE,
            seq_nr: 1,
            ack_nr: 0,
            extensions: vec![(EXTENSION_BITS, vec![0u8; 8])],
            data: Vec::new(),
        };
        dialer.send(&syn.encode()).await.unwrap();

        let mut stream = UtpStream::accept(listener).await.unwrap();
        let mut ack_buf = [0u8; 4096];
        dialer.recv(&mut ack_buf).await.unwrap();

        let data = Packet {
            packet_type: PacketType::Data,
            version: 1,
            connection_id: 7,
            timestamp: now_micros(),
            timestamp_diff: 0,
            wnd_size: WINDOW_SIZE,
            seq_nr: 2,
            ack_nr: stream.seq_nr,
            extensions: Vec::new(),
            data: b"hi".to_vec(),
        };
        dialer.send(&data.encode()).await.unwrap();

        let mut out = [0u8; 2];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hi");
        assert_eq!(stream.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn shutdown_sends_fin_when_connected() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let responder_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (n, from) = responder.recv_from(&mut buf).await.unwrap();
            let syn = Packet::decode(&buf[..n]).unwrap();

            let ack = Packet {
                packet_type: PacketType::State,
                version: 1,
                connection_id: syn.connection_id,
                timestamp: now_micros(),
                timestamp_diff: 0,
                wnd_size: WINDOW_SIZE,
                seq_nr: 1,
                ack_nr: syn.seq_nr,
                extensions: Vec::new(),
                data: Vec::new(),
            };
            responder.send_to(&ack.encode(), from).await.unwrap();

            let (n, _from) = responder.recv_from(&mut buf).await.unwrap();
            let fin = Packet::decode(&buf[..n]).unwrap();
            assert_eq!(fin.packet_type, PacketType::Fin);
        });

        let mut stream = UtpStream::connect(responder_addr).await.unwrap();
        stream.shutdown().await.unwrap();

        responder_task.await.unwrap();
    }

    #[tokio::test]
    async fn fin_is_answered_with_a_fin_before_disconnecting() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let responder_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (n, from) = responder.recv_from(&mut buf).await.unwrap();
            let syn = Packet::decode(&buf[..n]).unwrap();

            let ack = Packet {
                packet_type: PacketType::State,
                version: 1,
                connection_id: syn.connection_id,
                timestamp: now_micros(),
                timestamp_diff: 0,
                wnd_size: WINDOW_SIZE,
                seq_nr: 1,
                ack_nr: syn.seq_nr,
                extensions: Vec::new(),
                data: Vec::new(),
            };
            responder.send_to(&ack.encode(), from).await.unwrap();

            let fin = Packet {
                packet_type: PacketType::Fin,
                version: 1,
                connection_id: syn.connection_id,
                timestamp: now_micros(),
                timestamp_diff: 0,
                wnd_size: WINDOW_SIZE,
                seq_nr: 2,
                ack_nr: syn.seq_nr,
                extensions: Vec::new(),
                data: Vec::new(),
            };
            responder.send_to(&fin.encode(), from).await.unwrap();

            let (n, _from) = responder.recv_from(&mut buf).await.unwrap();
            let reply = Packet::decode(&buf[..n]).unwrap();
            assert_eq!(reply.packet_type, PacketType::Fin);
        });

        let mut stream = UtpStream::connect(responder_addr).await.unwrap();
        let mut out = [0u8; 1];
        let n = stream.read(&mut out).await.unwrap();
        assert_eq!(n, 0);

        responder_task.await.unwrap();
    }
}
