mod api;
mod config;
mod db;
mod detector;
mod error;
mod feed;
mod ledger;
mod settlement;
mod sync;
mod types;

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{router, ApiState};
use crate::config::{Config, Mode, CHANNEL_CAPACITY, NOTIFY_CAPACITY};
use crate::db::Store;
use crate::detector::CandleMonitor;
use crate::error::{AppError, Result};
use crate::feed::LivePriceFeed;
use crate::ledger::{LedgerClient, PriceFeed, RpcLedger};
use crate::settlement::{SettlementEngine, SettlementSettings};
use crate::sync::{EventSynchronizer, PoolEventHandler, Reconciler, SyncSettings, TokenTransferHandler};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

/// Everything both modes share.
struct Pipeline {
    store: Store,
    ledger: Arc<dyn LedgerClient>,
    health: Arc<HealthState>,
    latency: Arc<LatencyStats>,
    engine: SettlementEngine,
    reconciler: Reconciler,
    pool_sync: EventSynchronizer<PoolEventHandler>,
    token_sync: EventSynchronizer<TokenTransferHandler>,
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let (notify_tx, notify_rx) = mpsc::channel::<()>(NOTIFY_CAPACITY);
    let mut store = Store::connect(&cfg.db_path).await?;
    if cfg.mode == Mode::Live {
        store = store.with_candle_notifier(notify_tx);
    }

    // --- Ledger ---
    let rpc = RpcLedger::connect(&cfg.rpc_url, cfg.oracle_key.signer())?;
    match rpc.chain_id().await {
        Ok(id) => info!(chain_id = id, rpc = %cfg.rpc_url, signer = %rpc.signer(), "ledger connected"),
        Err(e) => warn!(rpc = %cfg.rpc_url, "ledger not reachable at startup: {e}"),
    }
    let ledger: Arc<dyn LedgerClient> = Arc::new(rpc);

    let pipeline = build(&cfg, store, ledger);
    pipeline.engine.verify_oracle().await?;

    match cfg.mode {
        Mode::Replay => run_replay(&cfg, pipeline).await,
        Mode::Live => run_live(&cfg, pipeline, notify_rx).await,
    }
}

fn build(cfg: &Config, store: Store, ledger: Arc<dyn LedgerClient>) -> Pipeline {
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new());

    let engine = SettlementEngine::new(
        store.clone(),
        Arc::clone(&ledger),
        cfg.pool_address,
        cfg.oracle_address,
        SettlementSettings {
            gas_limit: cfg.payout_gas_limit,
            confirm_timeout: cfg.confirm_timeout,
            retry_every: cfg.settle_retry,
            token_decimals: cfg.token_decimals,
        },
        Arc::clone(&latency),
        Arc::clone(&health),
    );

    let reconciler = Reconciler::new(
        store.clone(),
        Arc::clone(&ledger),
        cfg.pool_address,
        cfg.token_address,
        cfg.token_decimals,
    );

    let sync_settings = SyncSettings {
        chunk_size: cfg.sync_chunk_size,
        lookback: cfg.sync_lookback,
        interval: cfg.sync_interval,
    };
    let pool_sync = EventSynchronizer::new(
        store.clone(),
        Arc::clone(&ledger),
        cfg.pool_address,
        PoolEventHandler::new(store.clone(), Arc::clone(&ledger), cfg.token_decimals),
        sync_settings.clone(),
        Arc::clone(&health),
    );
    let token_sync = EventSynchronizer::new(
        store.clone(),
        Arc::clone(&ledger),
        cfg.token_address,
        TokenTransferHandler::new(reconciler.clone()),
        sync_settings,
        Arc::clone(&health),
    );

    Pipeline {
        store,
        ledger,
        health,
        latency,
        engine,
        reconciler,
        pool_sync,
        token_sync,
    }
}

/// Load the CSV, settle every anomaly it produces, then bring the local
/// mirror up to date once and exit.
async fn run_replay(cfg: &Config, p: Pipeline) -> Result<()> {
    let path = cfg
        .replay_csv
        .as_deref()
        .ok_or_else(|| AppError::Config("REPLAY_CSV is required in replay mode".to_string()))?;
    let stats = feed::load_csv(&p.store, path, &cfg.symbol).await?;
    info!(loaded = stats.loaded, skipped = stats.skipped, "replay input ready");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (settle_tx, settle_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let worker = tokio::spawn(p.engine.clone().run(settle_rx, shutdown_rx));

    let monitor = CandleMonitor::new(
        p.store.clone(),
        cfg.strategy,
        cfg.symbol.clone(),
        cfg.candle_secs,
        settle_tx,
    );
    let created = monitor.scan_all().await?;
    // Closing the queue lets the worker drain and return.
    drop(monitor);
    if let Err(e) = worker.await {
        error!("settlement worker panicked: {e}");
    }

    for (name, res) in [
        ("pool", p.pool_sync.sync_once().await),
        ("token", p.token_sync.sync_once().await),
    ] {
        match res {
            Ok(r) => info!(watcher = name, handled = r.logs_handled, checkpoint = r.checkpoint, "replay sync done"),
            Err(e) => warn!(watcher = name, "replay sync failed: {e}"),
        }
    }

    let summary = p.store.stats(types::now_secs()).await?;
    info!(
        anomalies_created = created,
        payouts = summary.total_payouts,
        paid_out = summary.total_paid_out,
        sent = p.health.payouts_sent(),
        failed = p.health.payouts_failed(),
        "replay complete"
    );
    Ok(())
}

async fn run_live(cfg: &Config, p: Pipeline, notify_rx: mpsc::Receiver<()>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let (settle_tx, settle_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // --- Spawn tasks ---

    // Settlement worker (sole user of the signing identity)
    tasks.push(tokio::spawn(p.engine.clone().run(settle_rx, shutdown_rx.clone())));

    // Detection monitor
    let monitor = CandleMonitor::new(
        p.store.clone(),
        cfg.strategy,
        cfg.symbol.clone(),
        cfg.candle_secs,
        settle_tx,
    );
    tasks.push(tokio::spawn(monitor.run(cfg.detect_interval, notify_rx, shutdown_rx.clone())));

    // Ledger watchers, one checkpoint each
    tasks.push(tokio::spawn(p.pool_sync.run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(p.token_sync.run(shutdown_rx.clone())));

    // Full reconciliation fallback
    tasks.push(tokio::spawn(
        p.reconciler.clone().run(cfg.reconcile_interval, shutdown_rx.clone()),
    ));

    // Live price poller
    match cfg.price_feed_address {
        Some(addr) => {
            let poller = LivePriceFeed::new(
                PriceFeed::new(Arc::clone(&p.ledger), addr),
                p.store.clone(),
                cfg.symbol.clone(),
                cfg.candle_secs,
            );
            tasks.push(tokio::spawn(poller.run(cfg.price_poll, shutdown_rx.clone())));
        }
        None => warn!("PRICE_FEED_ADDRESS not set, live price polling disabled"),
    }

    // HTTP API server
    let app = router(ApiState {
        store: p.store.clone(),
        health: Arc::clone(&p.health),
        latency: Arc::clone(&p.latency),
        reconciler: p.reconciler.clone(),
        token_address: cfg.token_address,
    });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    let mut api_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = api_shutdown.changed().await;
        })
        .await?;

    for res in join_all(tasks).await {
        if let Err(e) = res {
            error!("task panicked: {e}");
        }
    }
    info!("wickguard stopped");
    Ok(())
}
