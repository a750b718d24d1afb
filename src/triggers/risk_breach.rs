//! Risk-Breach engine — §4.7.
//!
//! Holds no independent copy of account balances (§9's resolved open
//! question): every recomputation reads straight through the Account
//! Manager, which remains the single source of truth. Runs a 1 s heartbeat
//! over every monitored account; on breach, batch-closes all open positions
//! and removes the account from further monitoring.

use crate::account::{AccountManager, AccountStatus};
use crate::amount::ratio;
use crate::audit::{AuditEventType, AuditLog};
use crate::execution::close::batch_close_for_breach;
use crate::execution::{CloseReason, TradeRecord};
use crate::ids::AccountId;
use crate::persistence::{PersistenceQueue, PersistenceTask};
use crate::position::PositionManager;
use crate::price::PriceEngine;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Serialize)]
struct BreachAuditPayload<'a> {
    reason: &'static str,
    closed: u32,
    skipped_stale: u32,
    total_pnl: crate::amount::Amount,
    trades: &'a [TradeRecord],
}

/// Fires once per account when it crosses into `breached`.
#[derive(Debug, Clone)]
pub struct BreachEvent {
    pub account_id: AccountId,
    pub reason: &'static str,
}

/// Fires once per account per axis (daily-loss, drawdown) at 80% of the
/// configured limit.
#[derive(Debug, Clone)]
pub struct RiskWarningEvent {
    pub account_id: AccountId,
    pub axis: &'static str,
    pub ratio_of_limit: f64,
}

const WARNING_THRESHOLD: f64 = 0.8;
const BREACH_THRESHOLD: f64 = 1.0;

pub struct RiskBreachEngine {
    account_manager: Arc<AccountManager>,
    position_manager: Arc<PositionManager>,
    price_engine: Arc<PriceEngine>,
    monitored: RwLock<HashSet<AccountId>>,
    warned_daily_loss: Mutex<HashSet<AccountId>>,
    warned_drawdown: Mutex<HashSet<AccountId>>,
    breach_tx: broadcast::Sender<BreachEvent>,
    warning_tx: broadcast::Sender<RiskWarningEvent>,
    closed_tx: broadcast::Sender<TradeRecord>,
    persistence: Arc<PersistenceQueue>,
    audit: Arc<AuditLog>,
}

impl RiskBreachEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_manager: Arc<AccountManager>,
        position_manager: Arc<PositionManager>,
        price_engine: Arc<PriceEngine>,
        closed_tx: broadcast::Sender<TradeRecord>,
        persistence: Arc<PersistenceQueue>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let (breach_tx, _) = broadcast::channel(256);
        let (warning_tx, _) = broadcast::channel(256);
        Self {
            account_manager,
            position_manager,
            price_engine,
            monitored: RwLock::new(HashSet::new()),
            warned_daily_loss: Mutex::new(HashSet::new()),
            warned_drawdown: Mutex::new(HashSet::new()),
            breach_tx,
            warning_tx,
            closed_tx,
            persistence,
            audit,
        }
    }

    pub fn subscribe_breaches(&self) -> broadcast::Receiver<BreachEvent> {
        self.breach_tx.subscribe()
    }

    pub fn subscribe_warnings(&self) -> broadcast::Receiver<RiskWarningEvent> {
        self.warning_tx.subscribe()
    }

    pub fn register(&self, account_id: AccountId) {
        self.monitored.write().insert(account_id);
    }

    fn stop_monitoring(&self, account_id: AccountId) {
        self.monitored.write().remove(&account_id);
        self.warned_daily_loss.lock().remove(&account_id);
        self.warned_drawdown.lock().remove(&account_id);
    }

    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("risk-breach engine shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn sweep(&self) {
        let ids: Vec<AccountId> = self.monitored.read().iter().copied().collect();
        for account_id in ids {
            self.check_account(account_id).await;
        }
    }

    async fn check_account(&self, account_id: AccountId) {
        let Ok(mut account) = self.account_manager.lock(account_id).await else { return };
        if !account.is_active() {
            self.stop_monitoring(account_id);
            return;
        }

        account.roll_daily_baseline_if_needed(chrono::Utc::now());

        // Equity must reflect this account's open positions before either
        // axis is evaluated, per §4.7 (`equity = current_balance +
        // unrealised`) — otherwise a position losing money only trips a
        // breach once it's realized, defeating the point of recomputing on
        // every tick.
        let unrealised = self.position_manager.account_unrealised_pnl(account_id);
        account.recompute(unrealised);

        let daily_loss_ratio = if account.daily_loss_limit.is_zero() {
            0.0
        } else {
            ratio(account.daily_loss(), account.daily_loss_limit).to_f64()
        };
        let drawdown_ratio = if account.max_drawdown_limit.is_zero() {
            0.0
        } else {
            ratio(account.drawdown(), account.max_drawdown_limit).to_f64()
        };

        if daily_loss_ratio >= BREACH_THRESHOLD {
            self.breach(&mut account, "daily_loss_limit").await;
            return;
        }
        if drawdown_ratio >= BREACH_THRESHOLD {
            self.breach(&mut account, "max_drawdown_limit").await;
            return;
        }

        self.maybe_warn(&self.warned_daily_loss, account_id, "daily_loss", daily_loss_ratio);
        self.maybe_warn(&self.warned_drawdown, account_id, "drawdown", drawdown_ratio);
    }

    fn maybe_warn(&self, tracker: &Mutex<HashSet<AccountId>>, account_id: AccountId, axis: &'static str, ratio_of_limit: f64) {
        let mut warned = tracker.lock();
        if ratio_of_limit >= WARNING_THRESHOLD {
            if warned.insert(account_id) {
                let _ = self.warning_tx.send(RiskWarningEvent { account_id, axis, ratio_of_limit });
            }
        } else {
            warned.remove(&account_id);
        }
    }

    async fn breach(&self, account: &mut crate::account::AccountState, reason: &'static str) {
        account.status = AccountStatus::Liquidated;
        account.dirty = true;

        let now = chrono::Utc::now();
        let price_engine = &self.price_engine;
        let outcome = batch_close_for_breach(
            account,
            &self.position_manager,
            CloseReason::Breach,
            |symbol| {
                price_engine.get(symbol).map(|record| {
                    let mark = (record.internal_bid + record.internal_ask) / 2;
                    (mark, record.is_stale(now))
                })
            },
            now,
        );

        self.stop_monitoring(account.id);
        tracing::error!(
            account_id = %account.id,
            reason,
            closed = outcome.closed_count,
            skipped_stale = outcome.skipped_stale_count,
            "account breached"
        );

        self.persistence.enqueue(PersistenceTask::UpsertAccount(account.clone()));
        for trade in &outcome.trades {
            self.persistence.enqueue(PersistenceTask::InsertTrade(trade.clone()));
            self.persistence.enqueue(PersistenceTask::DeletePosition(trade.position_id));
        }

        let event_type = match reason {
            "daily_loss_limit" => AuditEventType::DailyLossBreach,
            _ => AuditEventType::DrawdownBreach,
        };
        let payload = BreachAuditPayload {
            reason,
            closed: outcome.closed_count,
            skipped_stale: outcome.skipped_stale_count,
            total_pnl: outcome.total_pnl,
            trades: &outcome.trades,
        };
        let audit_event = self.audit.record(Some(account.id), event_type, &payload, now);
        self.persistence.enqueue(PersistenceTask::InsertAuditLog(audit_event));

        let _ = self.breach_tx.send(BreachEvent { account_id: account.id, reason });
        for trade in outcome.trades {
            let _ = self.closed_tx.send(trade);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountType;
    use crate::amount::Amount;
    use crate::ids::OwnerId;
    use crate::persistence::{PersistenceQueue, SqliteStore};

    fn test_persistence() -> Arc<PersistenceQueue> {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let store: Arc<dyn crate::persistence::Store> = Arc::new(SqliteStore::open(path.to_str().unwrap()).unwrap());
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(PersistenceQueue::spawn(store, shutdown.subscribe()))
    }

    #[tokio::test]
    async fn daily_loss_breach_matches_scenario_4() {
        let account_manager = Arc::new(AccountManager::new());
        let position_manager = Arc::new(PositionManager::new());
        let account_id = AccountId::new();
        let mut account = crate::account::AccountState::new(
            account_id,
            OwnerId::new(),
            AccountType::Evaluation,
            Amount::from_f64(10_000.0),
            Amount::from_f64(400.0),
            Amount::from_f64(1_000.0),
        );
        account.current_balance = Amount::from_f64(9_590.0); // daily loss 410
        account_manager.insert(account);

        let (closed_tx, _) = broadcast::channel(16);
        let engine = RiskBreachEngine::new(
            account_manager.clone(),
            position_manager,
            Arc::new(PriceEngine::new()),
            closed_tx,
            test_persistence(),
            Arc::new(AuditLog::new()),
        );
        engine.register(account_id);

        let mut breaches = engine.subscribe_breaches();
        engine.check_account(account_id).await;

        let snapshot = account_manager.snapshot(account_id).await.unwrap();
        assert_eq!(snapshot.status, AccountStatus::Liquidated);
        assert!(!engine.monitored.read().contains(&account_id));
        assert!(breaches.try_recv().is_ok());
    }

    #[tokio::test]
    async fn warning_fires_once_at_eighty_percent() {
        let account_manager = Arc::new(AccountManager::new());
        let position_manager = Arc::new(PositionManager::new());
        let account_id = AccountId::new();
        let mut account = crate::account::AccountState::new(
            account_id,
            OwnerId::new(),
            AccountType::Evaluation,
            Amount::from_f64(10_000.0),
            Amount::from_f64(400.0),
            Amount::from_f64(1_000.0),
        );
        account.current_balance = Amount::from_f64(9_650.0); // daily loss 350, 87.5% of 400
        account_manager.insert(account);

        let (closed_tx, _) = broadcast::channel(16);
        let engine = RiskBreachEngine::new(
            account_manager,
            position_manager,
            Arc::new(PriceEngine::new()),
            closed_tx,
            test_persistence(),
            Arc::new(AuditLog::new()),
        );
        engine.register(account_id);
        let mut warnings = engine.subscribe_warnings();

        engine.check_account(account_id).await;
        assert!(warnings.try_recv().is_ok());
        engine.check_account(account_id).await;
        assert!(warnings.try_recv().is_err());
    }
}
