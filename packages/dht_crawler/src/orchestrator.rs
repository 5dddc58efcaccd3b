//! Turns `DhtEvent`s into metadata fetches. The hook names
//! (`on_get_peers`/`on_announce_peer`/`peers_values_received`) come from
//! `original_source/crawler.py`'s callback shape, but that crawler never
//! fetches metadata itself -- the in-flight dedup and batched peer race
//! below are new, built the way `tokio_krpc`'s request/response layer
//! races a single attempt: spawn, await first success, drop the rest.

use crate::dht::{Dht, DhtEvent};
use crate::errors::Error;
use crate::peer_wire;
use crate::sink::Sink;
use crate::utp::UtpStream;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use krpc_encoding::{Addr, InfoHash};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

const BATCH_SIZE: usize = 20;
const BATCH_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

type FetchFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, Error>> + Send>>;

/// Dedups concurrent fetches of the same info hash and races candidate
/// peers once the engine reports some.
pub struct Orchestrator {
    dht: Dht,
    sink: Arc<dyn Sink>,
    in_flight: Mutex<HashSet<InfoHash>>,
    enable_utp: bool,
}

impl Orchestrator {
    pub fn new(dht: Dht, sink: Arc<dyn Sink>, enable_utp: bool) -> Orchestrator {
        Orchestrator {
            dht,
            sink,
            in_flight: Mutex::new(HashSet::new()),
            enable_utp,
        }
    }

    /// Drains `events` until the channel closes. Runs for the lifetime of
    /// the process.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<DhtEvent>) {
        while let Some(event) = events.recv().await {
            let this = self.clone();
            tokio::spawn(async move { this.handle_event(event).await });
        }
    }

    async fn handle_event(&self, event: DhtEvent) {
        match event {
            DhtEvent::GetPeers { info_hash, .. } | DhtEvent::AnnouncePeer { info_hash, .. } => {
                self.note_interest(info_hash).await;
            }
            DhtEvent::PeersFound { info_hash, peers } => {
                self.fetch(info_hash, peers).await;
            }
            DhtEvent::Ping { .. } | DhtEvent::FindNode { .. } => {}
        }
    }

    async fn note_interest(&self, info_hash: InfoHash) {
        if self.sink.exists(&info_hash) {
            return;
        }

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(info_hash) {
                return;
            }
        }

        self.dht.start_searcher(info_hash).await;
    }

    async fn fetch(&self, info_hash: InfoHash, peers: HashSet<Addr>) {
        let candidates: Vec<SocketAddr> = peers.into_iter().filter(Addr::is_plausible).map(SocketAddr::from).collect();

        let mut fetched = None;
        for batch in candidates.chunks(BATCH_SIZE) {
            if let Some(info_dict) = self.race_batch(info_hash, batch).await {
                fetched = Some(info_dict);
                break;
            }
        }

        if let Some(info_dict) = fetched {
            match self.sink.save(&info_hash, &info_dict) {
                Ok(()) => log::info!("fetched metadata for {} ({} bytes)", info_hash, info_dict.len()),
                Err(err) => log::error!("failed to save metadata for {}: {}", info_hash, err),
            }
        }

        self.in_flight.lock().unwrap().remove(&info_hash);
    }

    async fn race_batch(&self, info_hash: InfoHash, batch: &[SocketAddr]) -> Option<Vec<u8>> {
        let mut sessions: FuturesUnordered<FetchFuture> = FuturesUnordered::new();
        for &addr in batch {
            sessions.push(Box::pin(fetch_over_tcp(addr, info_hash)));
            if self.enable_utp {
                sessions.push(Box::pin(fetch_over_utp(addr, info_hash)));
            }
        }

        let race = async {
            while let Some(result) = sessions.next().await {
                match result {
                    Ok(info_dict) => return Some(info_dict),
                    Err(err) => log::debug!("peer session for {} failed: {}", info_hash, err),
                }
            }
            None
        };

        timeout(BATCH_TIMEOUT, race).await.unwrap_or(None)
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

async fn fetch_over_tcp(addr: SocketAddr, info_hash: InfoHash) -> Result<Vec<u8>, Error> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await.map_err(|_| Error::Timeout)??;
    peer_wire::fetch_metadata(stream, info_hash).await
}

async fn fetch_over_utp(addr: SocketAddr, info_hash: InfoHash) -> Result<Vec<u8>, Error> {
    let stream = timeout(CONNECT_TIMEOUT, UtpStream::connect(addr)).await.map_err(|_| Error::Timeout)??;
    peer_wire::fetch_metadata(stream, info_hash).await
}
