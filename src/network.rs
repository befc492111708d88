//! P2P networking
//!
//! Every message is a single JSON envelope over a fresh TCP connection:
//! the sender dials, writes the framed bytes, and closes; the receiver reads
//! to EOF and dispatches on the `type` field. Responses to `request_headers`
//! and `request_block` come back the same way and are forwarded to the
//! awaiting sync task through the payload channel.

use crate::block::{verify_header_chain, Block, BlockHeader};
use crate::blockchain::Chain;
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{info, warn};

pub const REQUEST_HEADERS_MSG: &str = "request_headers";
pub const SEND_HEADERS_MSG: &str = "send_headers";
pub const REQUEST_BLOCK_MSG: &str = "request_block";
pub const SEND_BLOCK_MSG: &str = "send_block";
pub const BLOCK_BROADCAST_MSG: &str = "block_broadcast";
pub const MEMPOOL_BROADCAST_MSG: &str = "mempool_broadcast";
pub const CANCEL_MINING_MSG: &str = "cancel_mining";

/// Deadline for awaiting a sync reply on the payload channel.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for a single outbound send.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender_address: String,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(kind: &str, sender_address: &str, payload: Value) -> Self {
        Message {
            kind: kind.to_string(),
            sender_address: sender_address.to_string(),
            payload,
        }
    }
}

pub struct NetworkNode {
    /// Our own `host:port` as peers should dial it.
    address: String,
    chain: Arc<Chain>,
    peers: RwLock<Vec<String>>,
    payload_tx: mpsc::Sender<Value>,
    /// Receiver side of the payload channel; one sync task holds it at a time.
    payload_rx: Mutex<mpsc::Receiver<Value>>,
    cancel_tx: mpsc::Sender<bool>,
}

impl NetworkNode {
    /// Returns the node and the receiving end of the cancel-mining channel,
    /// which the mining loop polls.
    pub fn new(address: String, chain: Arc<Chain>) -> (Arc<Self>, mpsc::Receiver<bool>) {
        let (payload_tx, payload_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = mpsc::channel(8);

        let node = Arc::new(NetworkNode {
            address,
            chain,
            peers: RwLock::new(Vec::new()),
            payload_tx,
            payload_rx: Mutex::new(payload_rx),
            cancel_tx,
        });

        (node, cancel_rx)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// Binds the TCP listener and spawns the accept loop. A bind failure is
    /// fatal and propagates to the caller.
    pub async fn start(self: Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "P2P listener started");

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let node = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = node.handle_connection(stream).await {
                                warn!("connection from {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        });

        Ok(())
    }

    /// One message per connection: read to EOF, then dispatch.
    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        self.parse_message(&raw).await
    }

    pub async fn parse_message(&self, raw: &[u8]) -> Result<()> {
        let msg: Message = serde_json::from_slice(raw)?;

        if msg.sender_address.is_empty() {
            return Err(ChainError::NetworkError(
                "Message sender_address is empty".to_string(),
            ));
        }

        match msg.kind.as_str() {
            REQUEST_HEADERS_MSG => self.handle_request_headers(&msg.sender_address).await,
            SEND_HEADERS_MSG | SEND_BLOCK_MSG => self
                .payload_tx
                .send(msg.payload)
                .await
                .map_err(|_| ChainError::NetworkError("Payload channel closed".to_string())),
            REQUEST_BLOCK_MSG => {
                let block_id: i64 = serde_json::from_value(msg.payload)?;
                self.handle_request_block(&msg.sender_address, block_id).await
            }
            BLOCK_BROADCAST_MSG => self.handle_block_broadcast(msg.payload),
            MEMPOOL_BROADCAST_MSG => {
                let snapshot: HashMap<String, Transaction> = serde_json::from_value(msg.payload)?;
                self.chain.mempool().merge(snapshot);
                Ok(())
            }
            CANCEL_MINING_MSG => {
                // Signals coalesce; a full channel already carries one.
                let _ = self.cancel_tx.try_send(true);
                Ok(())
            }
            other => {
                warn!("ignoring unknown message type: {}", other);
                Ok(())
            }
        }
    }

    /// Replies with every header we hold. The requester is also registered
    /// as a peer so a bootstrapping node becomes reachable for broadcasts.
    async fn handle_request_headers(&self, requestor: &str) -> Result<()> {
        if let Err(e) = self.add_peer(requestor) {
            warn!("failed to register peer {}: {}", requestor, e);
        }

        let headers = self.chain.headers();
        let msg = Message::new(
            SEND_HEADERS_MSG,
            &self.address,
            serde_json::to_value(headers)?,
        );
        self.send_message(requestor, &msg, SEND_TIMEOUT).await
    }

    async fn handle_request_block(&self, requestor: &str, block_id: i64) -> Result<()> {
        let block = self
            .chain
            .get_block_by_id(block_id)?
            .ok_or(ChainError::BlockNotFound(block_id))?;

        let msg = Message::new(SEND_BLOCK_MSG, &self.address, serde_json::to_value(block)?);
        self.send_message(requestor, &msg, SEND_TIMEOUT).await
    }

    /// An unsolicited block from a peer: full verification, per-transaction
    /// signature re-checks, then the same commit path a local miner uses.
    fn handle_block_broadcast(&self, payload: Value) -> Result<()> {
        let block: Block = serde_json::from_value(payload)?;

        self.chain.verify_block(&block)?;

        for tx in &block.transactions {
            if tx.is_coinbase {
                continue;
            }
            tx.check_well_formed()?;
            if !tx.verify() {
                return Err(ChainError::InvalidTransaction(format!(
                    "Broadcast block carries an invalid signature from {}",
                    tx.from
                )));
            }
        }

        if self.chain.get_block_by_id(block.id)?.is_some() {
            return Ok(());
        }

        match self
            .chain
            .store()
            .with_tx(|sql_tx| self.chain.add_block(sql_tx, &block))
        {
            Ok(()) | Err(ChainError::BlockAlreadyExists) => {}
            Err(e) => return Err(e),
        }

        self.chain.add_block_to_memory(block.clone());
        self.chain.mempool().delete_mined(&block.transactions);

        info!(id = block.id, "accepted broadcast block");
        Ok(())
    }

    /// Headers-first bootstrap against each seed, isolating failures per peer.
    pub async fn sync_with_peers(&self, seeds: &[String]) {
        for seed in seeds {
            let seed = seed.trim();
            if seed.is_empty() || seed == self.address {
                continue;
            }

            match self.sync_from_peer(seed).await {
                Ok(added) => info!(peer = seed, added, "chain sync complete"),
                Err(e) => warn!("sync from {} failed: {}", seed, e),
            }
        }
    }

    async fn sync_from_peer(&self, peer: &str) -> Result<usize> {
        let mut payload_rx = self.payload_rx.lock().await;

        // A previously failed sync may have left a late reply behind.
        while payload_rx.try_recv().is_ok() {}

        let request = Message::new(REQUEST_HEADERS_MSG, &self.address, Value::Null);
        self.send_message(peer, &request, SEND_TIMEOUT).await?;

        let payload = timeout(SYNC_TIMEOUT, payload_rx.recv())
            .await
            .map_err(|_| ChainError::NetworkError(format!("Headers from {} timed out", peer)))?
            .ok_or_else(|| ChainError::NetworkError("Payload channel closed".to_string()))?;

        let headers: Vec<BlockHeader> = serde_json::from_value(payload)?;
        verify_header_chain(&headers, self.chain.difficulty())?;

        let known: HashSet<i64> = self.chain.known_ids().into_iter().collect();
        let mut added = 0;

        for header in &headers {
            if known.contains(&header.id) {
                continue;
            }

            let request = Message::new(
                REQUEST_BLOCK_MSG,
                &self.address,
                serde_json::to_value(header.id)?,
            );
            self.send_message(peer, &request, SEND_TIMEOUT).await?;

            let payload = timeout(SYNC_TIMEOUT, payload_rx.recv())
                .await
                .map_err(|_| {
                    ChainError::NetworkError(format!("Block {} from {} timed out", header.id, peer))
                })?
                .ok_or_else(|| ChainError::NetworkError("Payload channel closed".to_string()))?;

            let block: Block = serde_json::from_value(payload)?;
            if block.id != header.id {
                return Err(ChainError::NetworkError(format!(
                    "Requested block {} but peer sent {}",
                    header.id, block.id
                )));
            }

            self.chain.verify_block(&block)?;

            match self
                .chain
                .store()
                .with_tx(|sql_tx| self.chain.add_block(sql_tx, &block))
            {
                Ok(()) | Err(ChainError::BlockAlreadyExists) => {}
                Err(e) => return Err(e),
            }

            self.chain.add_block_to_memory(block);
            added += 1;
        }

        self.add_peer(peer)?;
        Ok(added)
    }

    pub async fn broadcast_block(&self, block: &Block) -> Result<()> {
        self.broadcast(BLOCK_BROADCAST_MSG, serde_json::to_value(block)?);
        Ok(())
    }

    pub async fn broadcast_mempool(&self) -> Result<()> {
        let snapshot = self.chain.mempool().snapshot();
        self.broadcast(MEMPOOL_BROADCAST_MSG, serde_json::to_value(snapshot)?);
        Ok(())
    }

    pub async fn broadcast_cancel_mining(&self) {
        self.broadcast(CANCEL_MINING_MSG, Value::Null);
    }

    /// Fan-out: one concurrent send per peer, each with its own deadline.
    /// Individual failures are logged and never abort the broadcast.
    fn broadcast(&self, kind: &str, payload: Value) {
        let msg = Message::new(kind, &self.address, payload);
        let data = match serde_json::to_vec(&msg) {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to encode {} broadcast: {}", kind, e);
                return;
            }
        };

        for peer in self.peers() {
            if peer == self.address {
                continue;
            }
            let data = data.clone();
            tokio::spawn(async move {
                if let Err(e) = send_raw(&peer, &data, SEND_TIMEOUT).await {
                    warn!("broadcast to {} failed: {}", peer, e);
                }
            });
        }
    }

    pub async fn send_message(
        &self,
        address: &str,
        msg: &Message,
        deadline: Duration,
    ) -> Result<()> {
        let data = serde_json::to_vec(msg)?;
        send_raw(address, &data, deadline).await
    }

    /// Registers a peer: store row committed first, then the in-memory
    /// append. Already-known addresses are left untouched.
    pub fn add_peer(&self, address: &str) -> Result<()> {
        let mut peers = self.peers.write().expect("peer lock poisoned");
        if peers.iter().any(|p| p == address) {
            return Ok(());
        }

        let store = self.chain.store();
        store.with_tx(|sql_tx| store.insert_peer(sql_tx, address))?;

        peers.push(address.to_string());
        Ok(())
    }

    pub fn load_peers_from_store(&self) -> Result<()> {
        let stored = self.chain.store().list_peers()?;
        let mut peers = self.peers.write().expect("peer lock poisoned");
        for addr in stored {
            if !peers.contains(&addr) {
                peers.push(addr);
            }
        }
        Ok(())
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.read().expect("peer lock poisoned").clone()
    }
}

/// Dials a fresh connection, writes the framed message, and closes. The
/// whole exchange is bounded by the caller's deadline.
async fn send_raw(address: &str, data: &[u8], deadline: Duration) -> Result<()> {
    timeout(deadline, async {
        let mut stream = TcpStream::connect(address).await?;
        stream.write_all(data).await?;
        stream.shutdown().await?;
        Ok::<(), ChainError>(())
    })
    .await
    .map_err(|_| ChainError::NetworkError(format!("Send to {} timed out", address)))?
}
