use anyhow::Context;
use clap::Parser;
use dht_crawler::{Config, Dht, FileSink, Orchestrator};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();

    let sink = Arc::new(FileSink::new(&config.sink_dir).with_context(|| format!("creating sink dir {}", config.sink_dir.display()))?);

    let (dht, events) = Dht::start(config.listen_addr, config.dig_interval())
        .await
        .with_context(|| format!("binding DHT socket on {}", config.listen_addr))?;
    log::info!("node {} listening on {}", dht.id(), config.listen_addr);

    let bootstrap_addrs = config.bootstrap_addrs();
    if bootstrap_addrs.is_empty() {
        log::warn!("no bootstrap addresses resolved, routing table will stay empty until peers find us");
    }
    dht.bootstrap(bootstrap_addrs).await;
    log::info!("bootstrap complete, routing table has {} nodes", dht.routing_table_len());

    let orchestrator = Arc::new(Orchestrator::new(dht, sink, config.enable_utp));
    orchestrator.run(events).await;

    Ok(())
}
