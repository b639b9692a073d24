use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

use bc_node::clock::Clock;
use bc_node::engine::{Engine, EngineConfig};
use bc_node::genesis;
use bc_node::mining::worker::run_worker;
use bc_node::rpc::{self, RpcState};
use bc_node::storage::{Store, EXIT_DB_VERSION};
use bc_node::{config, ChildChain};

const EXIT_GENESIS_WRITE: i32 = 1;
const EXIT_BOOTSTRAP_FETCH: i32 = 64;

fn main() -> Result<()> {
    // Worker mode: no runtime, no logging setup, one job on stdin.
    if std::env::args().nth(1).as_deref() == Some("miner") {
        std::process::exit(run_worker());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build runtime")?
        .block_on(run_node())
}

async fn run_node() -> Result<()> {
    let data_dir = config::data_dir();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir,
        monitor = config::monitor_enabled(),
        passive = config::p2p_passive(),
        "starting node"
    );

    let store = Store::open(&data_dir).context("open persistence")?;
    match store.check_db_version() {
        Ok(true) => {}
        Ok(false) => std::process::exit(EXIT_DB_VERSION),
        Err(e) => return Err(anyhow!(e)).context("read appversion"),
    }

    genesis::validate_genesis_hash()
        .map_err(|e| anyhow!(e))
        .context("genesis identity check")?;

    if let Err(e) = genesis::bootstrap(&store) {
        tracing::error!(err = %e, "genesis write failed");
        std::process::exit(EXIT_GENESIS_WRITE);
    }

    if let Some(boot_peer) = config::boot_peer() {
        if let Err(e) = fetch_bootstrap_headers(&boot_peer).await {
            tracing::error!(peer = %boot_peer, err = %e, "bootstrap fetch failed");
            std::process::exit(EXIT_BOOTSTRAP_FETCH);
        }
    }

    let clock = Clock::new();
    clock.start();

    let (engine, engine_tx, engine_rx) =
        Engine::new(store.clone(), clock.clone(), EngineConfig::from_env())
            .map_err(|e| anyhow!(e))?;
    tokio::spawn(engine.run(engine_rx));

    let app = rpc::router(RpcState {
        store,
        engine: engine_tx,
    });
    let addr = format!("0.0.0.0:{}", config::port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    tracing::info!(
        addr = %addr,
        rovers = ?ChildChain::ALL.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        "rpc surface up"
    );
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(err = %e, "rpc server stopped");
        }
    });

    tokio::signal::ctrl_c().await.context("wait for shutdown")?;
    clock.stop();
    tracing::info!("shutting down");
    Ok(())
}

/// Ask the bootstrap peer for its most recent headers so the first backward
/// sync has something to anchor on. A reachable peer with an empty answer is
/// fine; an unreachable one is fatal.
async fn fetch_bootstrap_headers(peer: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(8))
        .build()?;
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": rpc::RPC_ID,
        "method": "getLatestHeaders",
        "params": [7],
    });
    let resp = client
        .post(format!("{}/rpc", peer))
        .json(&body)
        .send()
        .await
        .context("bootstrap peer unreachable")?;
    let json: serde_json::Value = resp.json().await.context("bootstrap reply undecodable")?;
    let count = json
        .get("result")
        .and_then(|r| r.as_array())
        .map(|a| a.len())
        .unwrap_or(0);
    tracing::info!(peer = %peer, headers = count, "bootstrap headers fetched");
    Ok(())
}
