//! Administrative REST API
//!
//! HTTP endpoints for chain inspection, transaction submission, mining
//! control, balances, and key generation. The API observes the same chain,
//! mempool, and network the P2P node drives.

use axum::{
    extract::{Query, State},
    http::{self, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use crate::block::Block;
use crate::blockchain::Chain;
use crate::crypto::{self, KeyPair};
use crate::error::ChainError;
use crate::miner::{self, MineOutcome};
use crate::network::NetworkNode;
use crate::transaction::{now_millis, Transaction};

/// Ed25519 signatures are 64 bytes; used to price a transaction before it
/// is signed.
const SIGNATURE_LEN: usize = 64;

/// Shared API state observing the node's authoritative chain and network.
pub struct Node {
    pub chain: Arc<Chain>,
    pub network: Arc<NetworkNode>,
    /// Receiver of the cancel-mining channel; one mining round holds it at
    /// a time.
    cancel_rx: Mutex<mpsc::Receiver<bool>>,
}

impl Node {
    pub fn new_shared(
        chain: Arc<Chain>,
        network: Arc<NetworkNode>,
        cancel_rx: mpsc::Receiver<bool>,
    ) -> Self {
        Self {
            chain,
            network,
            cancel_rx: Mutex::new(cancel_rx),
        }
    }
}

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    ChainError(ChainError),
    InvalidInput(String),
    NotFound(String),
    Conflict(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::ChainError(e) => match e {
                ChainError::DatabaseError(_) | ChainError::IoError(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                }
                other => (StatusCode::BAD_REQUEST, other.to_string()),
            },
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::ChainError(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct SendTransactionRequest {
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub private_key: String,
    pub public_key: String,
}

#[derive(Serialize)]
pub struct SendTransactionResponse {
    pub message: String,
    pub hash: String,
    pub fee: u64,
    pub status: String,
}

#[derive(Deserialize)]
pub struct MineRequest {
    pub miner_address: String,
}

#[derive(Deserialize)]
struct BalanceQuery {
    address: String,
}

#[derive(Serialize)]
struct BalanceResponse {
    address: String,
    balance: u64,
}

#[derive(Serialize)]
struct WalletResponse {
    address: String,
    public_key: String,
    private_key: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

// ============================================================================
// API Server
// ============================================================================

/// Builds the router with all endpoints (also used by tests).
pub fn build_api_router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE])
        .allow_credentials(true);

    let api_routes = Router::new()
        .route("/chain", get(get_chain))
        .route("/blocks", get(get_blocks))
        .route("/mempool", get(get_mempool))
        .route("/txs", get(get_txs))
        .route("/tx/fee", get(get_fee))
        .route("/tx/send", post(send_transaction))
        .route("/mine", post(mine))
        .route("/balance", get(get_balance))
        .route("/keys", post(create_keys))
        .route("/clear", delete(clear_store))
        .with_state(node)
        .layer(cors);

    Router::new().nest("/api", api_routes)
}

/// Runs the API server until shutdown. A bind failure is fatal.
pub async fn run_api_server(node: Arc<Node>, port: u16) -> Result<(), ChainError> {
    let app = build_api_router(node);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "API server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| ChainError::IoError(e.to_string()))
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn get_chain(State(node): State<Arc<Node>>) -> Json<Vec<Block>> {
    Json(node.chain.blocks())
}

async fn get_blocks(State(node): State<Arc<Node>>) -> Result<Json<Vec<Block>>, ApiError> {
    Ok(Json(node.chain.store().list_blocks()?))
}

async fn get_mempool(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let transactions = node.chain.mempool().snapshot();
    Json(serde_json::json!({
        "count": transactions.len(),
        "transactions": transactions
    }))
}

async fn get_txs(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let transactions = node.chain.mempool().transactions_by_fee();
    Json(serde_json::json!({
        "count": transactions.len(),
        "transactions": transactions
    }))
}

async fn get_fee(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let mempool = node.chain.mempool();
    Json(serde_json::json!({
        "fee_rate": mempool.fee_rate(),
        "congestion": mempool.congestion_level().as_str()
    }))
}

/// Validates, prices, signs, and injects a transfer, then rebroadcasts the
/// mempool so peers pick it up.
async fn send_transaction(
    State(node): State<Arc<Node>>,
    Json(req): Json<SendTransactionRequest>,
) -> Result<Json<SendTransactionResponse>, ApiError> {
    if req.amount == 0 {
        return Err(ApiError::InvalidInput(
            "Transaction amount must be greater than zero".to_string(),
        ));
    }

    let derived = crypto::derive_address(&req.public_key)
        .map_err(|_| ApiError::InvalidInput("Invalid public key format".to_string()))?;
    if derived != req.from {
        return Err(ApiError::InvalidInput(
            "From address does not match the provided public key".to_string(),
        ));
    }

    let mempool = node.chain.mempool();

    let mut tx = Transaction::new(&req.from, &req.to, req.amount, now_millis());
    // Price against the final wire size: the public key is set by signing,
    // the signature is a fixed 64 bytes.
    tx.public_key = req.public_key.clone();
    tx.fee = mempool.fee_for_size(tx.size() + SIGNATURE_LEN);

    tx.sign_with_hex_keys(&req.private_key, &req.public_key)
        .map_err(|e| ApiError::InvalidInput(format!("Failed to sign transaction: {}", e)))?;

    if !tx.verify() {
        return Err(ApiError::InvalidInput("Invalid signature".to_string()));
    }

    if !node.chain.validate_transaction(&tx)? {
        return Err(ApiError::InvalidInput("Insufficient balance".to_string()));
    }

    if mempool.will_exceed_capacity(&tx) {
        return Err(ApiError::ChainError(ChainError::MempoolFull));
    }

    let hash = tx.hash_hex();
    let fee = tx.fee;
    mempool.add_transaction(tx);

    node.network.broadcast_mempool().await?;

    Ok(Json(SendTransactionResponse {
        message: "Transaction added to mempool".to_string(),
        hash,
        fee,
        status: "pending".to_string(),
    }))
}

/// Runs one mining round. A mined block is broadcast and peers are told to
/// cancel their own rounds; a stale or cancelled round returns 409.
async fn mine(
    State(node): State<Arc<Node>>,
    Json(req): Json<MineRequest>,
) -> Result<Json<Block>, ApiError> {
    if req.miner_address.is_empty() {
        return Err(ApiError::InvalidInput(
            "Miner address cannot be empty".to_string(),
        ));
    }

    let mut cancel_rx = node.cancel_rx.lock().await;
    match miner::mine_one(&node.chain, &req.miner_address, &mut cancel_rx).await? {
        MineOutcome::Mined(block) => {
            node.network.broadcast_block(&block).await?;
            node.network.broadcast_cancel_mining().await;
            Ok(Json(block))
        }
        MineOutcome::Stale => Err(ApiError::Conflict(
            "Candidate went stale: another block took the tip".to_string(),
        )),
        MineOutcome::Cancelled => Err(ApiError::Conflict(
            "Mining round was cancelled".to_string(),
        )),
    }
}

async fn get_balance(
    State(node): State<Arc<Node>>,
    Query(query): Query<BalanceQuery>,
) -> Result<Json<BalanceResponse>, ApiError> {
    if query.address.is_empty() {
        return Err(ApiError::InvalidInput("Address is required".to_string()));
    }

    let balance = node.chain.get_balance(&query.address)?;
    Ok(Json(BalanceResponse {
        address: query.address,
        balance,
    }))
}

async fn create_keys() -> Json<WalletResponse> {
    let keypair = KeyPair::generate();
    Json(WalletResponse {
        address: keypair.address(),
        public_key: keypair.public_key_hex(),
        private_key: keypair.private_key_hex(),
    })
}

async fn clear_store(State(node): State<Arc<Node>>) -> Result<Json<SuccessResponse>, ApiError> {
    node.chain.reset()?;
    Ok(Json(SuccessResponse {
        message: "State store cleared".to_string(),
    }))
}
