//! Node orchestration
//!
//! Wires the subsystems together in deterministic startup order: state store,
//! chain (genesis or recovery), peer hydration, P2P listener, headers-first
//! bootstrap sync, then the administrative API. Store-open and bind failures
//! are fatal; everything after startup is logged and survivable.

use crate::api;
use crate::blockchain::Chain;
use crate::config::Config;
use crate::mempool::Mempool;
use crate::network::NetworkNode;
use crate::persistence::Database;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct Node {
    pub config: Config,
    pub chain: Arc<Chain>,
    pub network: Arc<NetworkNode>,
    cancel_rx: Option<mpsc::Receiver<bool>>,
}

impl Node {
    pub fn init(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let store = Arc::new(Database::open(&config.dsn)?);
        info!(dsn = %config.dsn, sqlite = %store.version()?, "state store opened");

        let mempool = Arc::new(Mempool::new(0));
        let chain = Arc::new(Chain::new(store, mempool, 0));
        chain.load_from_store()?;

        let (network, cancel_rx) = NetworkNode::new(config.p2p_address(), chain.clone());
        network.load_peers_from_store()?;

        if config.tls_enabled {
            info!("TLS material found (cert.pem/key.pem)");
        } else {
            info!("TLS disabled: cert.pem/key.pem not present");
        }

        Ok(Self {
            config,
            chain,
            network,
            cancel_rx: Some(cancel_rx),
        })
    }

    /// Runs the node until the API server exits.
    pub async fn start(mut self) -> Result<(), Box<dyn std::error::Error>> {
        // P2P listener first so seed peers can reach us during bootstrap.
        self.network.clone().start(self.config.node_port).await?;

        let seeds = self.config.seed_nodes.clone();
        if seeds.is_empty() {
            info!("no seed nodes configured; skipping bootstrap sync");
        } else {
            info!(count = seeds.len(), "bootstrapping from seed nodes");
            self.network.sync_with_peers(&seeds).await;
        }

        info!(height = self.chain.height(), "node ready");

        let cancel_rx = self
            .cancel_rx
            .take()
            .ok_or("cancel channel already taken")?;
        let api_node = Arc::new(api::Node::new_shared(
            self.chain.clone(),
            self.network.clone(),
            cancel_rx,
        ));

        if let Err(e) = api::run_api_server(api_node, self.config.http_port).await {
            warn!("API server stopped: {}", e);
            return Err(Box::new(e));
        }
        Ok(())
    }
}
