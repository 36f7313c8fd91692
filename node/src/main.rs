// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # PoD Node
//!
//! Entry point for the `pod-node` binary. Takes the path of a TOML config
//! file, opens the chain, joins the network and runs the consensus, block
//! pool, transaction pool and sync services until SIGINT or SIGTERM.
//!
//! ```text
//! net dispatcher ─┬─ newblock        ──► BlockPool::run
//!                 ├─ newtx           ──► TxPool::run
//!                 ├─ witness         ──► PodEngine::run (+ mint ticks)
//!                 └─ sync/chunk*     ──► SyncService::run
//! ```

mod cli;
mod logging;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use pod_protocol::chain::{BlockPool, Blockchain, Executor};
use pod_protocol::config::{NodeConfig, DISPATCHER_QUEUE_CAPACITY};
use pod_protocol::consensus::PodEngine;
use pod_protocol::crypto::Keypair;
use pod_protocol::network::{Broadcaster, NetService, NEW_BLOCK, NEW_TX, WITNESS};
use pod_protocol::storage::{CachedStorage, SledStorage, Storage};
use pod_protocol::sync::SyncService;
use pod_protocol::transaction::{AccountNonces, TxPool};

use cli::PodNodeCli;
use metrics::NodeMetrics;

/// Entries kept in the read cache in front of sled.
const STORAGE_CACHE_ENTRIES: usize = 65_536;

/// How long the initial sync waits for a first peer.
const INITIAL_SYNC_PEER_WAIT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = PodNodeCli::parse();
    let config = NodeConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    logging::init_logging(&config.log);
    run_node(config).await
}

async fn run_node(config: NodeConfig) -> Result<()> {
    tracing::info!(
        chain_id = config.chain.chain_id,
        datadir = %config.chain.datadir.display(),
        "starting pod-node"
    );

    // --- Storage and chain ---
    let sled = SledStorage::open(&config.chain.datadir)
        .with_context(|| format!("failed to open database at {}", config.chain.datadir.display()))?;
    let storage: Arc<dyn Storage> = Arc::new(CachedStorage::new(sled, STORAGE_CACHE_ENTRIES));
    let chain = Arc::new(Blockchain::open(storage, &config.genesis).context("failed to open chain")?);
    tracing::info!(
        tail = %chain.tail().hash(),
        height = chain.tail().height(),
        lib = chain.lib().height(),
        "chain opened"
    );

    // --- Network ---
    let net = Arc::new(
        NetService::from_config(config.chain.chain_id, config.network.clone())
            .context("failed to create network service")?,
    );
    let broadcaster: Arc<dyn Broadcaster> = net.clone();

    // --- Consensus ---
    let journal_dir = config
        .consensus
        .mint_journal_dir
        .clone()
        .unwrap_or_else(|| journal_dir_for(&config.chain.datadir));
    let mut engine = PodEngine::new(config.consensus.clone(), &chain)
        .with_broadcaster(broadcaster.clone())
        .with_journal(&journal_dir)
        .context("failed to open mint journal")?;
    if let Some(key) = &config.chain.miner_key {
        let keypair = Keypair::from_hex(key).context("invalid chain.miner_key")?;
        tracing::info!(miner = %keypair.address(), "mining key loaded");
        engine = engine.with_miner(keypair, config.chain.coinbase);
    }
    let engine = Arc::new(engine);
    if config.chain.enable_mint {
        engine.enable_mint();
    }
    let miner = engine.miner_address();

    // --- Pools ---
    let nonces: Arc<dyn AccountNonces> = chain.clone();
    let tx_pool = Arc::new(
        TxPool::new(config.chain.chain_id, config.chain.tx_pool_size, nonces)
            .with_broadcaster(broadcaster.clone()),
    );
    let executor = Executor::new(
        config.chain.execution_concurrency,
        config.chain.block_reward().context("invalid chain.block_reward")?,
    );
    let pool = Arc::new(
        BlockPool::new(chain.clone(), engine.clone(), executor, tx_pool.clone())
            .with_broadcaster(broadcaster),
    );
    let sync = Arc::new(SyncService::new(pool.clone(), net.clone()));

    // --- Services ---
    let (quit_tx, quit_rx) = watch::channel(false);
    let dispatcher = net.dispatcher();
    let blocks_rx = dispatcher.subscribe(&[NEW_BLOCK], DISPATCHER_QUEUE_CAPACITY);
    let txs_rx = dispatcher.subscribe(&[NEW_TX], DISPATCHER_QUEUE_CAPACITY);
    let witness_rx = dispatcher.subscribe(&[WITNESS], DISPATCHER_QUEUE_CAPACITY);
    let sync_rx = dispatcher.subscribe(&SyncService::NAMES, DISPATCHER_QUEUE_CAPACITY);

    let mut tasks = vec![
        tokio::spawn(pool.clone().run(blocks_rx, quit_rx.clone())),
        tokio::spawn(tx_pool.run(txs_rx, quit_rx.clone())),
        tokio::spawn(engine.clone().run(pool.clone(), Some(witness_rx), quit_rx.clone())),
        tokio::spawn(sync.clone().run(sync_rx, quit_rx.clone())),
    ];

    net.start().await.context("failed to start network")?;
    tracing::info!(peer_id = %net.local_peer_id(), listen = ?net.listen_addrs(), "network started");

    let initial_sync = {
        let net = net.clone();
        let sync = sync.clone();
        tokio::spawn(async move {
            if !net.wait_for_peers(1, INITIAL_SYNC_PEER_WAIT).await {
                tracing::warn!("no peers for initial sync, continuing from local tail");
                return;
            }
            match sync.sync().await {
                Ok(applied) => tracing::info!(applied, "initial sync finished"),
                Err(e) => tracing::warn!(error = %e, "initial sync failed"),
            }
        })
    };

    // --- Metrics ---
    if let Some(listen) = &config.stats.metrics_listen {
        let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
        tasks.push(tokio::spawn(node_metrics.clone().run(
            chain.clone(),
            net.clone(),
            miner,
            quit_rx.clone(),
        )));
        let router = axum::Router::new()
            .route("/metrics", axum::routing::get(metrics::metrics_handler))
            .with_state(node_metrics);
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind metrics listener on {listen}"))?;
        tracing::info!(addr = %listen, "metrics server listening");
        let mut quit = quit_rx.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = quit.changed().await;
            };
            if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
                tracing::error!(error = %e, "metrics server error");
            }
        }));
    }

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping services");

    let _ = quit_tx.send(true);
    initial_sync.abort();
    net.stop();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "service task ended abnormally");
        }
    }
    tracing::info!(height = chain.tail().height(), "pod-node stopped");
    Ok(())
}

fn journal_dir_for(datadir: &std::path::Path) -> PathBuf {
    datadir.join("mint.journal")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. A handler that cannot
/// be installed is logged and treated as never firing.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
