pub mod config;
pub mod dht;
pub mod errors;
pub mod orchestrator;
pub mod peer_wire;
pub mod sink;
pub mod utp;

pub use config::Config;
pub use dht::{Dht, DhtEvent};
pub use orchestrator::Orchestrator;
pub use sink::{FileSink, Sink};
