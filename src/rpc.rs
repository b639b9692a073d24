//! Peer RPC surface.
//!
//! One inbound JSON endpoint serves header queries; `HttpPeer` speaks the
//! same wire shape outbound. Block gossip rides a separate POST carrying the
//! sender's RPC URL so the receiver can query back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::block::ParentBlock;
use crate::engine::EngineEvent;
use crate::errors::{NodeResult, ProtocolError};
use crate::storage::{keys, Store};

/// Largest inclusive header range a single call may request.
pub const MAX_HEADER_RANGE: u64 = 100_000;

/// Fixed JSON-RPC id used on this wire.
pub const RPC_ID: u64 = 42;

const PEER_HTTP_TIMEOUT: Duration = Duration::from_secs(8);

/// Parameters of the `query` method used during backward sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerQuery {
    pub query_hash: String,
    pub query_height: u64,
    pub low: u64,
    pub high: u64,
}

/// Outbound view of a peer. The engine only ever talks to peers through
/// this trait.
#[async_trait]
pub trait PeerConn: Send + Sync {
    fn address(&self) -> &str;

    /// `query` RPC; transport failures and timeouts surface as errors that
    /// callers treat as empty responses.
    async fn query(&self, req: PeerQuery) -> NodeResult<Vec<ParentBlock>>;
}

/// A peer reachable over HTTP.
pub struct HttpPeer {
    url: String,
    http: reqwest::Client,
}

impl HttpPeer {
    pub fn new(url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PEER_HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            url: url.trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn call(&self, method: &str, params: Value) -> NodeResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": RPC_ID,
            "method": method,
            "params": params,
        });
        let resp = self
            .http
            .post(format!("{}/rpc", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        if let Some(err) = json.get("error") {
            if !err.is_null() {
                return Err(ProtocolError::Transport(err.to_string()).into());
            }
        }
        Ok(json.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PeerConn for HttpPeer {
    fn address(&self) -> &str {
        &self.url
    }

    async fn query(&self, req: PeerQuery) -> NodeResult<Vec<ParentBlock>> {
        let result = self.call("query", serde_json::to_value(&req)?).await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Gossip payload: a freshly integrated block plus the sender's RPC URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipBlock {
    pub from: String,
    pub block: ParentBlock,
}

/// Fan a block out to the static peer set. Failures are logged and ignored.
pub async fn broadcast_block(peers: Vec<String>, from: String, block: ParentBlock) {
    let http = reqwest::Client::builder()
        .timeout(PEER_HTTP_TIMEOUT)
        .build()
        .unwrap_or_default();
    for peer in peers {
        let payload = GossipBlock {
            from: from.clone(),
            block: block.clone(),
        };
        match http
            .post(format!("{}/gossip", peer))
            .json(&payload)
            .send()
            .await
        {
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(peer = %peer, err = %e, "[GOSSIP] delivery failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound side
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RpcState {
    pub store: Store,
    pub engine: mpsc::UnboundedSender<EngineEvent>,
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

fn rpc_ok(id: Option<Value>, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id.unwrap_or(json!(RPC_ID)), "result": result })
}

fn rpc_err(id: Option<Value>, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": id.unwrap_or(json!(RPC_ID)), "error": { "code": -32600, "message": message } })
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/gossip", post(handle_gossip))
        .route("/rover", post(handle_rover))
        .with_state(state)
}

async fn handle_rpc(State(state): State<RpcState>, Json(req): Json<RpcRequest>) -> Json<Value> {
    let id = req.id.clone();
    let out = dispatch(&state, req).await;
    match out {
        Ok(result) => Json(rpc_ok(id, result)),
        Err(e) => Json(rpc_err(id, e.to_string())),
    }
}

async fn dispatch(state: &RpcState, req: RpcRequest) -> NodeResult<Value> {
    match req.method.as_str() {
        "getHeaders" => get_headers(&state.store, &req.params),
        "getLatestHeader" => get_latest_header(&state.store),
        "getLatestHeaders" => get_latest_headers(&state.store, &req.params),
        "getMultiverse" => get_multiverse(state).await,
        "query" => run_query(&state.store, &req.params),
        other => Err(ProtocolError::UnknownMethod(other.to_string()).into()),
    }
}

fn endpoint(param: &Value) -> NodeResult<(u64, String)> {
    let pair = param
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| ProtocolError::BadParams("expected [height, hash]".into()))?;
    let height = pair[0]
        .as_u64()
        .ok_or_else(|| ProtocolError::BadParams("height must be a number".into()))?;
    let hash = pair[1]
        .as_str()
        .ok_or_else(|| ProtocolError::BadParams("hash must be a string".into()))?
        .to_string();
    Ok((height, hash))
}

/// `getHeaders([from_height, from_hash], [to_height, to_hash])`
fn get_headers(store: &Store, params: &Value) -> NodeResult<Value> {
    let args = params
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| ProtocolError::BadParams("expected two endpoints".into()))?;
    let (from_height, from_hash) = endpoint(&args[0])?;
    let (to_height, to_hash) = endpoint(&args[1])?;

    if to_height < from_height {
        return Err(ProtocolError::BadParams("inverted range".into()).into());
    }
    let span = to_height - from_height;
    if span > MAX_HEADER_RANGE {
        return Err(ProtocolError::RangeTooLarge {
            span,
            max: MAX_HEADER_RANGE,
        }
        .into());
    }

    let mut blocks = Vec::with_capacity(span as usize + 1);
    for height in from_height..=to_height {
        match store.get::<ParentBlock>(&keys::block_at(height))? {
            Some(b) => blocks.push(b),
            None => break,
        }
    }
    let from_ok = blocks.first().map(|b| b.hash == from_hash).unwrap_or(false);
    let to_ok = blocks
        .last()
        .map(|b| b.height == to_height && b.hash == to_hash)
        .unwrap_or(false);
    if !from_ok {
        return Err(ProtocolError::EndpointMismatch {
            height: from_height,
        }
        .into());
    }
    if !to_ok {
        return Err(ProtocolError::EndpointMismatch { height: to_height }.into());
    }
    Ok(serde_json::to_value(blocks)?)
}

/// `getLatestHeader()`
fn get_latest_header(store: &Store) -> NodeResult<Value> {
    let latest: ParentBlock = store.get_required(keys::BLOCK_LATEST)?;
    Ok(serde_json::to_value(vec![latest])?)
}

/// `getLatestHeaders(count)`
fn get_latest_headers(store: &Store, params: &Value) -> NodeResult<Value> {
    let count = params
        .as_array()
        .and_then(|a| a.first())
        .and_then(|v| v.as_u64())
        .or_else(|| params.as_u64())
        .ok_or_else(|| ProtocolError::BadParams("expected a count".into()))?;
    let latest: ParentBlock = store.get_required(keys::BLOCK_LATEST)?;
    let take = count.min(latest.height).min(MAX_HEADER_RANGE);

    let mut blocks = Vec::with_capacity(take as usize);
    let mut height = latest.height;
    while blocks.len() < take as usize {
        if let Some(b) = store.get::<ParentBlock>(&keys::block_at(height))? {
            blocks.push(b);
        }
        if height <= 1 {
            break;
        }
        height -= 1;
    }
    Ok(serde_json::to_value(blocks)?)
}

/// `getMultiverse()` — up to 7 most recent blocks of the live fork graph.
async fn get_multiverse(state: &RpcState) -> NodeResult<Value> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .engine
        .send(EngineEvent::MultiverseSnapshot { reply: reply_tx })
        .map_err(|_| ProtocolError::Transport("engine unavailable".into()))?;
    let blocks = reply_rx
        .await
        .map_err(|_| ProtocolError::Transport("engine dropped request".into()))?;
    Ok(serde_json::to_value(blocks)?)
}

/// `query({queryHash, queryHeight, low, high})`
fn run_query(store: &Store, params: &Value) -> NodeResult<Value> {
    let req: PeerQuery = serde_json::from_value(params.clone())
        .map_err(|e| ProtocolError::BadParams(e.to_string()))?;
    let latest: ParentBlock = store.get_required(keys::BLOCK_LATEST)?;

    // The range is only served when the anchoring block checks out.
    let anchored = store
        .get::<ParentBlock>(&keys::block_at(req.query_height))?
        .map(|b| b.hash == req.query_hash)
        .unwrap_or(false);
    if !anchored {
        return Ok(json!([]));
    }

    let low = req.low.max(1);
    let high = req.high.min(latest.height);
    let mut blocks = Vec::new();
    for height in low..=high {
        if let Some(b) = store.get::<ParentBlock>(&keys::block_at(height))? {
            blocks.push(b);
        }
    }
    Ok(serde_json::to_value(blocks)?)
}

async fn handle_gossip(
    State(state): State<RpcState>,
    Json(msg): Json<GossipBlock>,
) -> Json<Value> {
    let peer: Arc<dyn PeerConn> = Arc::new(HttpPeer::new(&msg.from));
    let accepted = state
        .engine
        .send(EngineEvent::PeerBlock {
            block: msg.block,
            peer,
        })
        .is_ok();
    Json(json!({ "ok": accepted }))
}

/// Rover adapters deliver observed child tips here.
async fn handle_rover(
    State(state): State<RpcState>,
    Json(header): Json<crate::chains::ChildHeader>,
) -> Json<Value> {
    let accepted = state
        .engine
        .send(EngineEvent::RoverTip { header })
        .is_ok();
    Json(json!({ "ok": accepted }))
}
