//! Durable Store — §6, §2 item 12.
//!
//! An embedded-database-backed implementation of the engine's write/read
//! contract, behind a [`Store`] trait so a production PostgreSQL-class
//! store is a drop-in replacement — same trait, different connection.

use crate::account::{AccountState, AccountStatus, AccountType};
use crate::execution::TradeRecord;
use crate::ids::{AccountId, OwnerId};
use crate::order::PendingOrder;
use crate::position::{Position, Side};
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// The write/read contract the Execution Kernel and Account Manager rely on.
/// Payments, payouts, market pairs, price snapshots and daily snapshots are
/// part of the schema for completeness but are never written by this engine
/// (out of scope — they belong to the admin/payment surfaces).
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn load_account(&self, id: AccountId) -> Result<Option<AccountState>>;
    async fn list_active_accounts(&self) -> Result<Vec<AccountState>>;
    async fn upsert_account(&self, account: &AccountState) -> Result<()>;

    async fn upsert_position(&self, position: &Position) -> Result<()>;
    /// Before deleting a position, callers must have already nullified any
    /// `orders.position_id` references to it (FK contract, §6).
    async fn delete_position(&self, id: crate::ids::PositionId) -> Result<()>;

    async fn insert_order(&self, order: &PendingOrder) -> Result<()>;
    async fn delete_order(&self, id: crate::ids::OrderId) -> Result<()>;

    async fn insert_trade(&self, trade: &TradeRecord) -> Result<()>;
    async fn insert_audit_log(&self, event: &crate::audit::AuditEvent) -> Result<()>;
}

/// SQLite-backed `Store`. A single connection behind an async mutex: this
/// engine's write volume does not justify a connection pool, and rusqlite's
/// `Connection` is `!Sync`.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(database_url: &str) -> Result<Self> {
        let conn = Connection::open(database_url).context("opening sqlite database")?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.migrate_sync()?;
        Ok(store)
    }

    fn migrate_sync(&self) -> Result<()> {
        // `open` is synchronous and runs before any subsystem starts, so a
        // blocking lock here is fine.
        let conn = self.conn.blocking_lock();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    issued_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evaluation_plans (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    max_leverage INTEGER NOT NULL,
    maintenance_margin_rate REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS trading_accounts (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    account_type TEXT NOT NULL,
    status TEXT NOT NULL,
    starting_balance INTEGER NOT NULL,
    current_balance INTEGER NOT NULL,
    used_margin INTEGER NOT NULL,
    peak_balance INTEGER NOT NULL,
    daily_loss_limit INTEGER NOT NULL,
    max_drawdown_limit INTEGER NOT NULL,
    daily_loss_baseline INTEGER NOT NULL,
    daily_loss_baseline_date TEXT NOT NULL,
    daily_pnl INTEGER NOT NULL,
    current_profit INTEGER NOT NULL,
    open_position_count INTEGER NOT NULL,
    total_trades INTEGER NOT NULL,
    winning_trades INTEGER NOT NULL,
    losing_trades INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS positions (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    entry_price INTEGER NOT NULL,
    leverage INTEGER NOT NULL,
    margin_reserved INTEGER NOT NULL,
    entry_fee INTEGER NOT NULL,
    take_profit INTEGER,
    stop_loss INTEGER,
    opened_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    position_id TEXT,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    limit_price INTEGER NOT NULL,
    leverage INTEGER NOT NULL,
    client_order_id TEXT,
    margin_reserved INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT
);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    position_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity_closed INTEGER NOT NULL,
    entry_price INTEGER NOT NULL,
    exit_price INTEGER NOT NULL,
    close_reason TEXT NOT NULL,
    gross_pnl INTEGER NOT NULL,
    total_fees INTEGER NOT NULL,
    net_pnl INTEGER NOT NULL,
    closed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trade_events (
    id TEXT PRIMARY KEY,
    trade_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id TEXT PRIMARY KEY,
    account_id TEXT,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    previous_hash TEXT NOT NULL,
    event_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payments (id TEXT PRIMARY KEY);
CREATE TABLE IF NOT EXISTS payouts (id TEXT PRIMARY KEY);
CREATE TABLE IF NOT EXISTS market_pairs (id TEXT PRIMARY KEY);
CREATE TABLE IF NOT EXISTS price_snapshots (id TEXT PRIMARY KEY);
CREATE TABLE IF NOT EXISTS daily_snapshots (id TEXT PRIMARY KEY);
"#;

fn side_to_str(side: Side) -> &'static str {
    match side {
        Side::Long => "LONG",
        Side::Short => "SHORT",
    }
}

fn side_from_str(value: &str) -> Side {
    match value {
        "SHORT" => Side::Short,
        _ => Side::Long,
    }
}

fn status_to_str(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Active => "active",
        AccountStatus::Suspended => "suspended",
        AccountStatus::Liquidated => "breached",
        AccountStatus::Closed => "closed",
    }
}

fn status_from_str(value: &str) -> AccountStatus {
    match value {
        "suspended" => AccountStatus::Suspended,
        "breached" => AccountStatus::Liquidated,
        "closed" => AccountStatus::Closed,
        _ => AccountStatus::Active,
    }
}

fn account_type_to_str(account_type: AccountType) -> &'static str {
    match account_type {
        AccountType::Evaluation => "evaluation",
        AccountType::Funded => "funded",
        AccountType::Demo => "demo",
    }
}

fn account_type_from_str(value: &str) -> AccountType {
    match value {
        "funded" => AccountType::Funded,
        "demo" => AccountType::Demo,
        _ => AccountType::Evaluation,
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn load_account(&self, id: AccountId) -> Result<Option<AccountState>> {
        let conn = self.conn.lock().await;
        let result = conn.query_row(
            "SELECT owner_id, account_type, status, starting_balance, current_balance, used_margin, \
             peak_balance, daily_loss_limit, max_drawdown_limit, daily_loss_baseline, \
             daily_loss_baseline_date, daily_pnl, current_profit, open_position_count, total_trades, \
             winning_trades, losing_trades \
             FROM trading_accounts WHERE id = ?1",
            params![id.0.to_string()],
            |row| {
                let owner_id: String = row.get(0)?;
                let account_type: String = row.get(1)?;
                let status: String = row.get(2)?;
                let starting_balance: i64 = row.get(3)?;
                let current_balance: i64 = row.get(4)?;
                let used_margin: i64 = row.get(5)?;
                let peak_balance: i64 = row.get(6)?;
                let daily_loss_limit: i64 = row.get(7)?;
                let max_drawdown_limit: i64 = row.get(8)?;
                let daily_loss_baseline: i64 = row.get(9)?;
                let daily_loss_baseline_date: String = row.get(10)?;
                let daily_pnl: i64 = row.get(11)?;
                let current_profit: i64 = row.get(12)?;
                let open_position_count: i64 = row.get(13)?;
                let total_trades: i64 = row.get(14)?;
                let winning_trades: i64 = row.get(15)?;
                let losing_trades: i64 = row.get(16)?;
                Ok((
                    owner_id,
                    account_type,
                    status,
                    starting_balance,
                    current_balance,
                    used_margin,
                    peak_balance,
                    daily_loss_limit,
                    max_drawdown_limit,
                    daily_loss_baseline,
                    daily_loss_baseline_date,
                    daily_pnl,
                    current_profit,
                    open_position_count,
                    total_trades,
                    winning_trades,
                    losing_trades,
                ))
            },
        );

        match result {
            Ok((
                owner_id,
                account_type,
                status,
                starting_balance,
                current_balance,
                used_margin,
                peak_balance,
                daily_loss_limit,
                max_drawdown_limit,
                daily_loss_baseline,
                daily_loss_baseline_date,
                daily_pnl,
                current_profit,
                open_position_count,
                total_trades,
                winning_trades,
                losing_trades,
            )) => {
                use crate::amount::Amount;
                let mut account = AccountState::new(
                    id,
                    OwnerId(Uuid::parse_str(&owner_id).context("invalid owner_id in store")?),
                    account_type_from_str(&account_type),
                    Amount::from_raw(starting_balance as i128),
                    Amount::from_raw(daily_loss_limit as i128),
                    Amount::from_raw(max_drawdown_limit as i128),
                );
                account.status = status_from_str(&status);
                account.current_balance = Amount::from_raw(current_balance as i128);
                account.used_margin = Amount::from_raw(used_margin as i128);
                account.peak_balance = Amount::from_raw(peak_balance as i128);
                account.daily_loss_baseline = Amount::from_raw(daily_loss_baseline as i128);
                account.daily_loss_baseline_date = daily_loss_baseline_date
                    .parse()
                    .context("invalid daily_loss_baseline_date in store")?;
                account.daily_pnl = Amount::from_raw(daily_pnl as i128);
                account.current_profit = Amount::from_raw(current_profit as i128);
                account.open_position_count = open_position_count as u32;
                account.total_trades = total_trades as u64;
                account.winning_trades = winning_trades as u64;
                account.losing_trades = losing_trades as u64;
                account.dirty = false;
                account.last_synced_at = Some(chrono::Utc::now());
                Ok(Some(account))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err).context("loading account from store"),
        }
    }

    async fn list_active_accounts(&self) -> Result<Vec<AccountState>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id FROM trading_accounts WHERE status = 'active'")?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        let mut accounts = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(uuid) = Uuid::parse_str(&id) else { continue };
            if let Some(account) = self.load_account(AccountId(uuid)).await? {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    async fn upsert_account(&self, account: &AccountState) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trading_accounts (id, owner_id, account_type, status, starting_balance, \
             current_balance, used_margin, peak_balance, daily_loss_limit, max_drawdown_limit, \
             daily_loss_baseline, daily_loss_baseline_date, daily_pnl, current_profit, \
             open_position_count, total_trades, winning_trades, losing_trades, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19) \
             ON CONFLICT(id) DO UPDATE SET \
             status=excluded.status, current_balance=excluded.current_balance, used_margin=excluded.used_margin, \
             peak_balance=excluded.peak_balance, daily_loss_baseline=excluded.daily_loss_baseline, \
             daily_loss_baseline_date=excluded.daily_loss_baseline_date, \
             daily_pnl=excluded.daily_pnl, current_profit=excluded.current_profit, \
             open_position_count=excluded.open_position_count, total_trades=excluded.total_trades, \
             winning_trades=excluded.winning_trades, losing_trades=excluded.losing_trades, \
             updated_at=excluded.updated_at",
            params![
                account.id.0.to_string(),
                account.owner_id.0.to_string(),
                account_type_to_str(account.account_type),
                status_to_str(account.status),
                account.starting_balance.raw() as i64,
                account.current_balance.raw() as i64,
                account.used_margin.raw() as i64,
                account.peak_balance.raw() as i64,
                account.daily_loss_limit.raw() as i64,
                account.max_drawdown_limit.raw() as i64,
                account.daily_loss_baseline.raw() as i64,
                account.daily_loss_baseline_date.to_rfc3339(),
                account.daily_pnl.raw() as i64,
                account.current_profit.raw() as i64,
                account.open_position_count as i64,
                account.total_trades as i64,
                account.winning_trades as i64,
                account.losing_trades as i64,
                account.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn upsert_position(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions (id, account_id, symbol, side, quantity, entry_price, leverage, \
             margin_reserved, entry_fee, take_profit, stop_loss, opened_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13) \
             ON CONFLICT(id) DO UPDATE SET \
             quantity=excluded.quantity, margin_reserved=excluded.margin_reserved, entry_fee=excluded.entry_fee, \
             take_profit=excluded.take_profit, stop_loss=excluded.stop_loss, updated_at=excluded.updated_at",
            params![
                position.id.0.to_string(),
                position.account_id.0.to_string(),
                position.symbol,
                side_to_str(position.side),
                position.quantity.raw() as i64,
                position.entry_price.raw() as i64,
                position.leverage,
                position.margin_reserved.raw() as i64,
                position.entry_fee.raw() as i64,
                position.take_profit.map(|a| a.raw() as i64),
                position.stop_loss.map(|a| a.raw() as i64),
                position.opened_at.to_rfc3339(),
                position.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn delete_position(&self, id: crate::ids::PositionId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE orders SET position_id = NULL WHERE position_id = ?1",
            params![id.0.to_string()],
        )?;
        conn.execute("DELETE FROM positions WHERE id = ?1", params![id.0.to_string()])?;
        Ok(())
    }

    async fn insert_order(&self, order: &PendingOrder) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO orders (id, account_id, position_id, symbol, side, quantity, limit_price, \
             leverage, client_order_id, margin_reserved, created_at, expires_at) \
             VALUES (?1,?2,NULL,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                order.id.0.to_string(),
                order.account_id.0.to_string(),
                order.symbol,
                side_to_str(order.side),
                order.quantity.raw() as i64,
                order.limit_price.raw() as i64,
                order.leverage,
                order.client_order_id,
                order.margin_reserved.raw() as i64,
                order.created_at.to_rfc3339(),
                order.expires_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    async fn delete_order(&self, id: crate::ids::OrderId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM orders WHERE id = ?1", params![id.0.to_string()])?;
        Ok(())
    }

    async fn insert_trade(&self, trade: &TradeRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trades (id, account_id, position_id, symbol, side, quantity_closed, \
             entry_price, exit_price, close_reason, gross_pnl, total_fees, net_pnl, closed_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                trade.trade_id.0.to_string(),
                trade.account_id.0.to_string(),
                trade.position_id.0.to_string(),
                trade.symbol,
                side_to_str(trade.side),
                trade.quantity_closed.raw() as i64,
                trade.entry_price.raw() as i64,
                trade.exit_price.raw() as i64,
                trade.close_reason.as_str(),
                trade.gross_pnl.raw() as i64,
                trade.total_fees.raw() as i64,
                trade.net_pnl.raw() as i64,
                trade.closed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn insert_audit_log(&self, event: &crate::audit::AuditEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_logs (id, account_id, event_type, payload, previous_hash, event_hash, created_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                Uuid::new_v4().to_string(),
                event.account_id.map(|id| id.0.to_string()),
                event.event_type.as_str(),
                event.payload,
                event.previous_hash,
                event.event_hash,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;

    fn temp_store() -> SqliteStore {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        SqliteStore::open(path.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn round_trips_an_account() {
        let store = temp_store();
        let account = AccountState::new(
            AccountId::new(),
            OwnerId::new(),
            AccountType::Evaluation,
            Amount::from_f64(10_000.0),
            Amount::from_f64(400.0),
            Amount::from_f64(1_000.0),
        );

        store.upsert_account(&account).await.unwrap();
        let loaded = store.load_account(account.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, account.id);
        assert_eq!(loaded.owner_id, account.owner_id);
        assert_eq!(loaded.current_balance, account.current_balance);
    }

    #[tokio::test]
    async fn missing_account_returns_none() {
        let store = temp_store();
        assert!(store.load_account(AccountId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn position_delete_nullifies_order_references() {
        let store = temp_store();
        let account_id = AccountId::new();
        let position = Position {
            id: crate::ids::PositionId::new(),
            account_id,
            symbol: "BTC-USD".into(),
            side: Side::Long,
            quantity: Amount::from_f64(0.1),
            entry_price: Amount::from_f64(30_000.0),
            leverage: 10,
            margin_reserved: Amount::from_f64(300.0),
            entry_fee: Amount::from_f64(1.5),
            take_profit: None,
            stop_loss: None,
            unrealised_pnl: Amount::ZERO,
            opened_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        store.upsert_position(&position).await.unwrap();
        store.delete_position(position.id).await.unwrap();
        // No panic / FK violation is the assertion here.
    }
}
