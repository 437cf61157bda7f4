// =============================================================================
// TVBridge — TradingView Futures Gateway — Main Entry Point
// =============================================================================
//
// Bridges TradingView strategy alerts to the TX futures gateway and Binance
// USDT-M perpetuals: webhook intake, order lifecycle tracking, contract
// rollover, connection supervision, scheduled statistics and reports.
//
// A market only goes live when its env file has LOGIN=1 and no blank
// required credentials; the webhook server runs regardless so misconfigured
// markets fail loudly instead of silently dropping signals.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod brokers;
mod config;
mod error;
mod journal;
mod lifecycle;
mod notifier;
mod pipeline;
mod registry;
mod report;
mod rollover;
mod scheduler;
mod signal;
mod supervisor;
mod types;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{ConnState, Core};
use crate::brokers::btc::BtcClient;
use crate::brokers::tx::TxClient;
use crate::brokers::{btc_stream, BrokerAdapter, EventQueue};
use crate::config::calendar::TradingCalendar;
use crate::config::{BtcSettings, EnvFile, ServerSettings, TxSettings};
use crate::journal::TradeJournal;
use crate::notifier::Notifier;
use crate::pipeline::DedupWindow;
use crate::registry::OrderRegistry;
use crate::rollover::RolloverEngine;
use crate::types::Market;

/// `config/<name>` when the config directory exists, else the repo root.
fn env_path(name: &str) -> PathBuf {
    let nested = PathBuf::from("config").join(name);
    if nested.exists() {
        nested
    } else {
        PathBuf::from(name)
    }
}

fn load_env(name: &str) -> EnvFile {
    let path = env_path(name);
    EnvFile::load(&path).unwrap_or_else(|e| {
        warn!(file = %path.display(), error = %e, "env file missing — login stays off");
        EnvFile::empty(&path)
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let server = ServerSettings::load("port.txt");
    let default_level = if server.log_console { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        TVBridge — TradingView Futures Gateway            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let tx_settings = TxSettings::from_env(&load_env("tx.env"));
    let btc_settings = BtcSettings::from_env(&load_env("btc.env"));
    let calendar = TradingCalendar::load("holiday");

    info!(
        port = server.port,
        tx_login = tx_settings.login_enabled(),
        btc_login = btc_settings.login_enabled(),
        "configuration loaded"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (mark_price_tx, mark_price_rx) = watch::channel(0.0f64);

    let tx_client = Arc::new(TxClient::new(tx_settings.clone()));
    let btc_client = Arc::new(BtcClient::new(btc_settings.clone()));

    let registry = Arc::new(OrderRegistry::load("order_mapping.json"));
    let tx_journal = Arc::new(TradeJournal::new(Market::Tx, "TXtransdata"));
    let btc_journal = Arc::new(TradeJournal::new(Market::Btc, "BTCtransdata"));
    registry.prune_terminal(&tx_journal);
    registry.prune_terminal(&btc_journal);

    let core = Arc::new(Core {
        server,
        calendar,
        tx_client: tx_client.clone(),
        btc_client: btc_client.clone(),
        tx_journal,
        btc_journal,
        registry: registry.clone(),
        rollover: Arc::new(RolloverEngine::new()),
        dedup: DedupWindow::default(),
        tx_notifier: Arc::new(Notifier::new(tx_settings.telegram.clone())),
        btc_notifier: Arc::new(Notifier::new(btc_settings.telegram.clone())),
        events: Arc::new(EventQueue::default()),
        mark_price: mark_price_rx,
        tx_contracts: parking_lot::RwLock::new(HashMap::new()),
        tx_conn: parking_lot::RwLock::new(ConnState::default()),
        btc_conn: parking_lot::RwLock::new(ConnState::default()),
        shutdown: shutdown_rx.clone(),
        start_time: std::time::Instant::now(),
    });

    // ── 3. Broker logins ─────────────────────────────────────────────────
    if tx_settings.login_enabled() {
        match tx_client.login().await {
            Ok(()) => {
                let mut conn = core.tx_conn.write();
                conn.logged_in = true;
                conn.session_started_at = Some(std::time::Instant::now());
                drop(conn);
                if let Err(e) = core.refresh_tx_contracts().await {
                    warn!(error = %e, "initial TX contract refresh failed");
                }
            }
            Err(e) => error!(error = %e, "TX login failed — supervisor will retry"),
        }
    } else if !tx_settings.blank_fields().is_empty() {
        warn!(fields = ?tx_settings.blank_fields(), "TX credentials incomplete");
    }

    if btc_settings.login_enabled() {
        match btc_client.login().await {
            Ok(()) => {
                let mut conn = core.btc_conn.write();
                conn.logged_in = true;
                conn.session_started_at = Some(std::time::Instant::now());
            }
            Err(e) => error!(error = %e, "BTC login failed — supervisor will retry"),
        }
    } else if !btc_settings.blank_fields().is_empty() {
        warn!(fields = ?btc_settings.blank_fields(), "BTC credentials incomplete");
    }

    // ── 4. Webhook server ────────────────────────────────────────────────
    let bind_addr = format!("0.0.0.0:{}", core.server.port);
    let api_core = core.clone();
    let api_addr = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::webhook::router(api_core);
        let listener = tokio::net::TcpListener::bind(&api_addr)
            .await
            .expect("failed to bind webhook server");
        info!(addr = %api_addr, "webhook server listening");
        axum::serve(listener, app).await.expect("webhook server failed");
    });

    // ── 5. Lifecycle tracker ─────────────────────────────────────────────
    let lifecycle_task = tokio::spawn(lifecycle::run_lifecycle_tracker(core.clone()));

    // ── 6. TX tasks: event stream, supervisor, 12 h re-login ─────────────
    if tx_settings.login_enabled() {
        let stream_client = tx_client.clone();
        let stream_queue = core.events.clone();
        let mut stream_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *stream_shutdown.borrow() {
                    break;
                }
                if let Err(e) =
                    brokers::tx::run_event_stream(stream_client.clone(), stream_queue.clone()).await
                {
                    error!(error = %e, "TX event stream error — reconnecting in 5s");
                }
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                    _ = stream_shutdown.changed() => {}
                }
            }
        });

        tokio::spawn(supervisor::run_supervisor(
            core.clone(),
            tx_client.clone() as Arc<dyn BrokerAdapter>,
        ));
        tokio::spawn(supervisor::run_tx_relogin_timer(core.clone()));
    }

    // ── 7. BTC tasks: user stream, ticker, poll fallback, supervisor ─────
    if btc_settings.login_enabled() {
        let user_client = btc_client.clone();
        let user_queue = core.events.clone();
        let mut user_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *user_shutdown.borrow() {
                    break;
                }
                if let Err(e) =
                    btc_stream::run_user_stream(user_client.clone(), user_queue.clone()).await
                {
                    error!(error = %e, "BTC user stream error — reconnecting in 5s");
                }
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                    _ = user_shutdown.changed() => {}
                }
            }
        });

        let ticker_symbol = btc_settings.symbol.clone();
        let mut ticker_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *ticker_shutdown.borrow() {
                    break;
                }
                if let Err(e) =
                    btc_stream::run_mark_price_stream(&ticker_symbol, &mark_price_tx).await
                {
                    error!(error = %e, "mark-price stream error — reconnecting in 5s");
                }
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                    _ = ticker_shutdown.changed() => {}
                }
            }
        });

        tokio::spawn(lifecycle::run_btc_poll_fallback(core.clone()));
        tokio::spawn(supervisor::run_supervisor(
            core.clone(),
            btc_client.clone() as Arc<dyn BrokerAdapter>,
        ));
    }

    // ── 8. Scheduler ─────────────────────────────────────────────────────
    tokio::spawn(scheduler::run_scheduler(core.clone()));

    info!("all subsystems running — Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);

    // Let the lifecycle tracker drain its queue, then persist the registry.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), lifecycle_task).await;
    registry.persist();

    if tx_settings.login_enabled() {
        tx_client.logout().await;
    }
    if btc_settings.login_enabled() {
        btc_client.logout().await;
    }

    info!("TVBridge shut down complete");
    Ok(())
}
