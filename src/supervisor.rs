// =============================================================================
// Connection Supervisor — health probing, reconnection, scheduled re-login
// =============================================================================
//
// One supervisor loop per market. The probe interval is dynamic: 60 s while
// the market is open, 600 s otherwise, 30 s while reconnecting (crypto is
// always "open"). On a failed probe the supervisor emits a single
// "connection lost" notice, then cycles logout → wait(attempt × 2 s) →
// login up to three times per tick, forever, until the link returns — no
// duplicate notices during the retry storm. `AuthFailed` halts retrying;
// that needs an operator.
//
// TX sessions expire: a 12-hour timer forces logout + re-login, retrying
// every 30 s until the broker accepts.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::app_state::Core;
use crate::brokers::BrokerAdapter;
use crate::error::CoreError;
use crate::types::Market;

const PROBE_OPEN: Duration = Duration::from_secs(60);
const PROBE_CLOSED: Duration = Duration::from_secs(600);
const PROBE_RECONNECTING: Duration = Duration::from_secs(30);
const ATTEMPTS_PER_CYCLE: u32 = 3;

const RELOGIN_PERIOD: Duration = Duration::from_secs(12 * 60 * 60);
const RELOGIN_RETRY: Duration = Duration::from_secs(30);

/// Probe interval for the current connection and market state.
fn probe_interval(core: &Core, market: Market, reconnecting: bool) -> Duration {
    if reconnecting {
        return PROBE_RECONNECTING;
    }
    match market {
        // Crypto trades around the clock.
        Market::Btc => PROBE_OPEN,
        Market::Tx => {
            if core.calendar.is_market_open_now() {
                PROBE_OPEN
            } else {
                PROBE_CLOSED
            }
        }
    }
}

/// Supervise one broker connection until shutdown.
pub async fn run_supervisor(core: Arc<Core>, adapter: Arc<dyn BrokerAdapter>) {
    let market = adapter.market();
    info!(market = %market, "connection supervisor started");
    let mut shutdown = core.shutdown.clone();

    loop {
        let wait = {
            let conn = core.conn(market).read();
            probe_interval(&core, market, conn.reconnecting)
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        if core.is_shutting_down() {
            break;
        }

        let healthy = adapter.probe().await;
        {
            let mut conn = core.conn(market).write();
            conn.last_probe_at = Some(std::time::Instant::now());
            if healthy {
                conn.logged_in = true;
            }
        }
        if healthy {
            continue;
        }

        // First failure of this outage gets the one notification.
        let first_failure = {
            let mut conn = core.conn(market).write();
            let first = !conn.reconnecting;
            conn.reconnecting = true;
            conn.logged_in = false;
            if first {
                conn.reconnect_attempts = 0;
            }
            first
        };
        if first_failure {
            warn!(market = %market, "probe failed — connection lost");
            core.notifier(market)
                .send_text(
                    "conn-lost",
                    &format!("<b>🔌 {market} 連線中斷</b>\n開始自動重連"),
                )
                .await;
        }

        if !reconnect_cycle(&core, &adapter).await {
            // AuthFailed: retrying is pointless without operator action.
            error!(market = %market, "authentication failed — supervisor halted");
            return;
        }
    }

    info!(market = %market, "connection supervisor stopped");
}

/// One reconnect cycle: up to three logout → wait → login attempts. Returns
/// `false` only for `AuthFailed`; transient failures leave the reconnecting
/// flag set so the next 30 s tick tries again.
async fn reconnect_cycle(core: &Arc<Core>, adapter: &Arc<dyn BrokerAdapter>) -> bool {
    let market = adapter.market();

    for attempt in 1..=ATTEMPTS_PER_CYCLE {
        if core.is_shutting_down() {
            return true;
        }

        adapter.logout().await;
        tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;

        match adapter.login().await {
            Ok(()) => {
                {
                    let mut conn = core.conn(market).write();
                    conn.reconnecting = false;
                    conn.logged_in = true;
                    conn.session_started_at = Some(std::time::Instant::now());
                }
                info!(market = %market, attempt, "reconnected");
                core.notifier(market)
                    .send_text("conn-restored", &format!("<b>✅ {market} 連線已恢復</b>"))
                    .await;
                return true;
            }
            Err(CoreError::AuthFailed(reason)) => {
                core.notifier(market)
                    .send_text(
                        "conn-auth-fail",
                        &format!("<b>🚫 {market} 登入遭拒</b>\n原因: {reason}\n請檢查憑證後重新啟動"),
                    )
                    .await;
                return false;
            }
            Err(e) => {
                let mut conn = core.conn(market).write();
                conn.reconnect_attempts += 1;
                warn!(market = %market, attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
    true
}

/// TX only: force a re-login every 12 hours before the broker session
/// expires. Logout, 1 s pause, then login retried every 30 s until accepted.
pub async fn run_tx_relogin_timer(core: Arc<Core>) {
    info!("TX 12-hour re-login timer started");
    let mut shutdown = core.shutdown.clone();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(RELOGIN_PERIOD) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        if core.is_shutting_down() {
            break;
        }

        info!("scheduled TX re-login");
        core.tx_client.logout().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        loop {
            if core.is_shutting_down() {
                return;
            }
            match core.tx_client.login().await {
                Ok(()) => {
                    let mut conn = core.tx_conn.write();
                    conn.logged_in = true;
                    conn.session_started_at = Some(std::time::Instant::now());
                    info!("scheduled TX re-login complete");
                    break;
                }
                Err(CoreError::AuthFailed(reason)) => {
                    error!(reason = %reason, "TX re-login rejected — operator action required");
                    core.tx_notifier
                        .send_text(
                            "conn-auth-fail",
                            &format!("<b>🚫 TX 重新登入遭拒</b>\n原因: {reason}"),
                        )
                        .await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "TX re-login failed — retrying in 30s");
                    tokio::time::sleep(RELOGIN_RETRY).await;
                }
            }
        }
    }

    info!("TX re-login timer stopped");
}
