//! Account Manager — §4.3.
//!
//! The single source of truth for account state. Every mutation to an
//! account's balance, margin, or counters happens while holding that
//! account's slot lock, so two concurrent operations on the same account
//! (e.g. an open and a breach-close racing) serialize instead of
//! interleaving. Locks are per-account, not global: operations on two
//! different accounts never wait on each other.
//!
//! The slot table itself is grounded in the gateway's per-IP rate limiter
//! (`middleware::rate_limit`): a `HashMap` behind a lock, each entry
//! carrying an acquired-at stamp, reaped on a timer.

use crate::amount::Amount;
use crate::error::{EngineError, EngineResult};
use crate::ids::{AccountId, OwnerId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A slot lock older than this is flagged at `error` level by the reaper.
/// Tokio mutexes cannot be force-released, so this is an observability
/// signal (something is stuck holding an account open far longer than any
/// legitimate operation should) rather than an automatic unlock.
pub const STALE_LOCK_THRESHOLD_MS: i64 = 5_000;

/// Maximum time a caller waits to acquire an account's slot before giving up
/// with `AccountBusy`. Applied uniformly to user commands and system
/// triggers alike — a single budget rather than the two-tier split, since
/// every legitimate holder releases in well under a millisecond and a 100 ms
/// wait is already generous for either caller.
pub const LOCK_ACQUIRE_BUDGET_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Suspended,
    Liquidated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    Evaluation,
    Funded,
    Demo,
}

#[derive(Debug, Clone)]
pub struct AccountState {
    pub id: AccountId,
    pub owner_id: OwnerId,
    pub account_type: AccountType,
    pub status: AccountStatus,

    pub starting_balance: Amount,
    pub current_balance: Amount,
    pub equity: Amount,
    pub used_margin: Amount,
    pub available_margin: Amount,
    pub peak_balance: Amount,

    pub daily_loss_limit: Amount,
    pub max_drawdown_limit: Amount,
    pub daily_loss_baseline: Amount,
    pub daily_loss_baseline_date: DateTime<Utc>,
    pub daily_pnl: Amount,
    pub current_profit: Amount,

    pub open_position_count: u32,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,

    pub dirty: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AccountState {
    pub fn new(
        id: AccountId,
        owner_id: OwnerId,
        account_type: AccountType,
        starting_balance: Amount,
        daily_loss_limit: Amount,
        max_drawdown_limit: Amount,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            account_type,
            status: AccountStatus::Active,
            starting_balance,
            current_balance: starting_balance,
            equity: starting_balance,
            used_margin: Amount::ZERO,
            available_margin: starting_balance,
            peak_balance: starting_balance,
            daily_loss_limit,
            max_drawdown_limit,
            daily_loss_baseline: starting_balance,
            daily_loss_baseline_date: now,
            daily_pnl: Amount::ZERO,
            current_profit: Amount::ZERO,
            open_position_count: 0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            dirty: true,
            last_synced_at: None,
            updated_at: now,
        }
    }

    /// Recompute `equity`/`available_margin` after a balance or margin change,
    /// and bump `peak_balance` if we have a new high — the invariant that
    /// `peak_balance` is monotonic non-decreasing lives entirely here.
    pub fn recompute(&mut self, unrealised_pnl: Amount) {
        self.equity = self.current_balance + unrealised_pnl;
        self.available_margin = (self.current_balance - self.used_margin).non_negative();
        if self.current_balance > self.peak_balance {
            self.peak_balance = self.current_balance;
        }
        self.updated_at = Utc::now();
        self.dirty = true;
    }

    /// Roll the daily-loss baseline forward if we've crossed into a new UTC
    /// day since it was last set.
    pub fn roll_daily_baseline_if_needed(&mut self, now: DateTime<Utc>) {
        if now.date_naive() != self.daily_loss_baseline_date.date_naive() {
            self.daily_loss_baseline = self.current_balance;
            self.daily_loss_baseline_date = now;
            self.daily_pnl = Amount::ZERO;
            self.dirty = true;
        }
    }

    /// Today's loss against the daily starting balance, equity-based so an
    /// open position's unrealised loss counts before it's ever closed.
    pub fn daily_loss(&self) -> Amount {
        (self.daily_loss_baseline - self.equity).non_negative()
    }

    /// Drawdown from the account's starting balance, equity-based per §4.7
    /// (`max(0, starting_balance - equity)`) rather than off realised
    /// peak-to-current balance, for the same reason as `daily_loss`.
    pub fn drawdown(&self) -> Amount {
        (self.starting_balance - self.equity).non_negative()
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

#[derive(Clone)]
struct AccountSlot {
    state: Arc<AsyncMutex<AccountState>>,
    locked_at_millis: Arc<AtomicI64>,
}

/// Guard returned while an account's slot lock is held; clears the
/// staleness stamp on drop so the reaper stops flagging it.
pub struct AccountGuard {
    inner: OwnedMutexGuard<AccountState>,
    locked_at_millis: Arc<AtomicI64>,
}

impl std::ops::Deref for AccountGuard {
    type Target = AccountState;
    fn deref(&self) -> &AccountState {
        &self.inner
    }
}

impl std::ops::DerefMut for AccountGuard {
    fn deref_mut(&mut self) -> &mut AccountState {
        &mut self.inner
    }
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        self.locked_at_millis.store(0, Ordering::Release);
    }
}

pub struct AccountManager {
    slots: RwLock<HashMap<AccountId, AccountSlot>>,
}

impl AccountManager {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn slot_for(&self, account_id: AccountId) -> Option<AccountSlot> {
        self.slots.read().get(&account_id).cloned()
    }

    /// Insert a freshly constructed account. A no-op if one already exists
    /// with this id — accounts are created once, never re-inserted.
    pub fn insert(&self, state: AccountState) {
        let mut slots = self.slots.write();
        slots.entry(state.id).or_insert_with(|| AccountSlot {
            state: Arc::new(AsyncMutex::new(state)),
            locked_at_millis: Arc::new(AtomicI64::new(0)),
        });
    }

    /// Acquire exclusive access to `account_id` for the duration of the
    /// returned guard. Every execution-kernel operation on an account goes
    /// through this.
    pub async fn lock(&self, account_id: AccountId) -> EngineResult<AccountGuard> {
        let slot = self
            .slot_for(account_id)
            .ok_or(EngineError::AccountNotFound { account_id })?;
        let locked_at_millis = slot.locked_at_millis.clone();
        let inner = tokio::time::timeout(
            Duration::from_millis(LOCK_ACQUIRE_BUDGET_MS),
            slot.state.lock_owned(),
        )
        .await
        .map_err(|_| EngineError::AccountBusy { account_id })?;
        locked_at_millis.store(Utc::now().timestamp_millis(), Ordering::Release);
        Ok(AccountGuard {
            inner,
            locked_at_millis,
        })
    }

    pub fn exists(&self, account_id: AccountId) -> bool {
        self.slots.read().contains_key(&account_id)
    }

    /// Snapshot an account's state without taking the exclusive lock; used
    /// by read-only status queries where a momentarily stale view is fine.
    pub async fn snapshot(&self, account_id: AccountId) -> EngineResult<AccountState> {
        let slot = self
            .slot_for(account_id)
            .ok_or(EngineError::AccountNotFound { account_id })?;
        Ok(slot.state.lock().await.clone())
    }

    pub fn all_ids(&self) -> Vec<AccountId> {
        self.slots.read().keys().copied().collect()
    }

    /// Background task: every second, log any slot that has been held
    /// continuously for longer than [`STALE_LOCK_THRESHOLD_MS`].
    pub async fn run_stale_lock_reaper(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    let now = Utc::now().timestamp_millis();
                    let slots = self.slots.read();
                    for (id, slot) in slots.iter() {
                        let locked_at = slot.locked_at_millis.load(Ordering::Acquire);
                        if locked_at != 0 && now - locked_at > STALE_LOCK_THRESHOLD_MS {
                            tracing::error!(account_id = %id, held_ms = now - locked_at, "account slot lock held unusually long");
                        }
                    }
                }
            }
        }
    }
}

impl Default for AccountManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account() -> AccountState {
        AccountState::new(
            AccountId::new(),
            OwnerId::new(),
            AccountType::Evaluation,
            Amount::from_f64(100_000.0),
            Amount::from_f64(5_000.0),
            Amount::from_f64(10_000.0),
        )
    }

    #[tokio::test]
    async fn lock_grants_exclusive_mutable_access() {
        let manager = AccountManager::new();
        let account = sample_account();
        let id = account.id;
        manager.insert(account);

        {
            let mut guard = manager.lock(id).await.unwrap();
            guard.current_balance -= Amount::from_f64(100.0);
            guard.recompute(Amount::ZERO);
        }

        let snapshot = manager.snapshot(id).await.unwrap();
        assert!((snapshot.current_balance.to_f64() - 99_900.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn lock_on_unknown_account_errors() {
        let manager = AccountManager::new();
        let result = manager.lock(AccountId::new()).await;
        assert!(matches!(result, Err(EngineError::AccountNotFound { .. })));
    }

    #[tokio::test]
    async fn lock_times_out_as_busy_when_already_held() {
        let manager = AccountManager::new();
        let account = sample_account();
        let id = account.id;
        manager.insert(account);

        let held = manager.lock(id).await.unwrap();

        let result = manager.lock(id).await;
        assert!(matches!(result, Err(EngineError::AccountBusy { .. })));

        drop(held);
        assert!(manager.lock(id).await.is_ok());
    }

    #[test]
    fn recompute_tracks_peak_balance_monotonically() {
        let mut account = sample_account();
        account.current_balance = Amount::from_f64(105_000.0);
        account.recompute(Amount::ZERO);
        assert_eq!(account.peak_balance, Amount::from_f64(105_000.0));

        account.current_balance = Amount::from_f64(95_000.0);
        account.recompute(Amount::ZERO);
        assert_eq!(account.peak_balance, Amount::from_f64(105_000.0));
    }

    #[test]
    fn daily_loss_is_relative_to_baseline() {
        let mut account = sample_account();
        account.current_balance = Amount::from_f64(97_000.0);
        account.recompute(Amount::ZERO);
        assert!((account.daily_loss().to_f64() - 3_000.0).abs() < 1e-9);
    }

    #[test]
    fn daily_loss_counts_unrealised_pnl_before_its_closed() {
        let mut account = sample_account();
        // Balance untouched, but a large open loss should already show up.
        account.recompute(Amount::from_f64(-6_000.0));
        assert!((account.daily_loss().to_f64() - 6_000.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_is_relative_to_starting_balance_via_equity() {
        let mut account = sample_account();
        account.current_balance = Amount::from_f64(95_000.0);
        account.recompute(Amount::from_f64(-2_000.0));
        assert!((account.drawdown().to_f64() - 7_000.0).abs() < 1e-9);
    }
}
