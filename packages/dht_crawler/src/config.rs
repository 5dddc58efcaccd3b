//! CLI / environment configuration. Grounded on
//! `jsondevers-bobby-bit/src/main.rs`'s `clap::Parser` derive, extended
//! with `env` fallbacks (`original_source/app.py`'s module-level knobs --
//! bootstrap list, listen port, sink folder) since this crawler is meant
//! to run unattended under a process supervisor, not invoked by hand each
//! time.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

fn default_bootstrap_nodes() -> Vec<String> {
    vec![
        "router.bittorrent.com:6881".to_string(),
        "router.utorrent.com:6881".to_string(),
        "dht.transmissionbt.com:6881".to_string(),
    ]
}

#[derive(Parser, Debug, Clone)]
#[command(name = "dht_crawler", about = "BitTorrent Mainline DHT crawler and metadata harvester")]
pub struct Config {
    /// UDP address the DHT node listens on.
    #[arg(long = "listen", env = "DHT_LISTEN_ADDR", default_value = "0.0.0.0:6881")]
    pub listen_addr: SocketAddr,

    /// Bootstrap router to seed the routing table from. Repeat the flag
    /// for more than one.
    #[arg(long = "bootstrap", env = "DHT_BOOTSTRAP_NODES", value_delimiter = ',', default_values_t = default_bootstrap_nodes())]
    pub bootstrap_nodes: Vec<String>,

    /// Interval between dig-loop ticks, in milliseconds.
    #[arg(long = "dig-interval-ms", env = "DHT_DIG_INTERVAL_MS", default_value_t = 100)]
    pub dig_interval_ms: u64,

    /// Try a µTP connection when a peer's TCP session fails.
    #[arg(long = "enable-utp", env = "DHT_ENABLE_UTP", default_value_t = false)]
    pub enable_utp: bool,

    /// Directory fetched metadata is written to, one file per info hash.
    #[arg(long = "sink-dir", env = "DHT_SINK_DIR", default_value = "./metadata")]
    pub sink_dir: PathBuf,
}

impl Config {
    /// Resolves `bootstrap_nodes` hostnames to addresses, dropping any
    /// that fail to resolve (logged, not fatal -- the remaining routers
    /// are enough to bootstrap from).
    pub fn bootstrap_addrs(&self) -> Vec<SocketAddr> {
        use std::net::ToSocketAddrs;

        self.bootstrap_nodes
            .iter()
            .filter_map(|host| match host.to_socket_addrs() {
                Ok(mut addrs) => addrs.next(),
                Err(err) => {
                    log::warn!("could not resolve bootstrap node {}: {}", host, err);
                    None
                }
            })
            .collect()
    }

    pub fn dig_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.dig_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults_with_no_arguments() {
        let config = Config::parse_from(["dht_crawler"]);
        assert_eq!(config.listen_addr, "0.0.0.0:6881".parse::<SocketAddr>().unwrap());
        assert_eq!(config.bootstrap_nodes, default_bootstrap_nodes());
        assert_eq!(config.dig_interval_ms, 100);
        assert!(!config.enable_utp);
        assert_eq!(config.sink_dir, PathBuf::from("./metadata"));
    }

    #[test]
    fn overrides_apply() {
        let config = Config::parse_from([
            "dht_crawler",
            "--listen",
            "127.0.0.1:7000",
            "--dig-interval-ms",
            "250",
            "--enable-utp",
        ]);
        assert_eq!(config.listen_addr, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.dig_interval_ms, 250);
        assert!(config.enable_utp);
    }
}
