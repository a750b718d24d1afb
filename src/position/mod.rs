//! Position Manager — §4.4.
//!
//! Tracks every open position, indexed both by account and by symbol so the
//! trigger engines (which scan "all positions on symbol X") and the account
//! views (which scan "all positions on account Y") are both O(matching set)
//! rather than a full table scan.

use crate::amount::{notional, Amount};
use crate::ids::{AccountId, PositionId, Symbol};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(self) -> i128 {
        match self {
            Side::Long => 1,
            Side::Short => -1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: PositionId,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Amount,
    pub entry_price: Amount,
    pub leverage: u32,
    pub margin_reserved: Amount,
    pub entry_fee: Amount,
    pub take_profit: Option<Amount>,
    pub stop_loss: Option<Amount>,
    pub unrealised_pnl: Amount,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Mark-to-market unrealised P&L at `mark_price`: `(mark - entry) * qty`
    /// for longs, negated for shorts.
    pub fn pnl_at(&self, mark_price: Amount) -> Amount {
        let diff = mark_price - self.entry_price;
        notional(self.quantity, diff) * self.side.sign()
    }

    /// Liquidation price per the resolved liquidation-price formula
    /// (SPEC_FULL §9): `entry * (1 - 1/leverage + maintenance_rate)` for
    /// LONG, mirrored for SHORT. Recomputed from `entry_price`/`leverage`
    /// rather than cached, since neither ever changes after open.
    pub fn liquidation_price(&self, maintenance_margin_rate: f64) -> Amount {
        let entry = self.entry_price.to_f64();
        let inv_leverage = 1.0 / self.leverage.max(1) as f64;
        let price = match self.side {
            Side::Long => entry * (1.0 - inv_leverage + maintenance_margin_rate),
            Side::Short => entry * (1.0 + inv_leverage - maintenance_margin_rate),
        };
        Amount::from_f64(price.max(0.0))
    }
}

#[derive(Default)]
struct Indexes {
    by_account: HashMap<AccountId, HashSet<PositionId>>,
    by_symbol: HashMap<Symbol, HashSet<PositionId>>,
}

pub struct PositionManager {
    positions: RwLock<HashMap<PositionId, Position>>,
    indexes: RwLock<Indexes>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            indexes: RwLock::new(Indexes::default()),
        }
    }

    pub fn insert(&self, position: Position) {
        let id = position.id;
        let account_id = position.account_id;
        let symbol = position.symbol.clone();

        self.positions.write().insert(id, position);

        let mut indexes = self.indexes.write();
        indexes.by_account.entry(account_id).or_default().insert(id);
        indexes.by_symbol.entry(symbol).or_default().insert(id);
    }

    pub fn get(&self, id: PositionId) -> Option<Position> {
        self.positions.read().get(&id).cloned()
    }

    pub fn remove(&self, id: PositionId) -> Option<Position> {
        let removed = self.positions.write().remove(&id)?;
        let mut indexes = self.indexes.write();
        if let Some(set) = indexes.by_account.get_mut(&removed.account_id) {
            set.remove(&id);
        }
        if let Some(set) = indexes.by_symbol.get_mut(&removed.symbol) {
            set.remove(&id);
        }
        Some(removed)
    }

    /// Replace a position's stored state wholesale after a partial close or
    /// TP/SL edit. Indexes are unaffected since account/symbol never change.
    pub fn update(&self, position: Position) {
        self.positions.write().insert(position.id, position);
    }

    pub fn by_account(&self, account_id: AccountId) -> Vec<Position> {
        let positions = self.positions.read();
        self.indexes
            .read()
            .by_account
            .get(&account_id)
            .map(|ids| ids.iter().filter_map(|id| positions.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn by_symbol(&self, symbol: &str) -> Vec<Position> {
        let positions = self.positions.read();
        self.indexes
            .read()
            .by_symbol
            .get(symbol)
            .map(|ids| ids.iter().filter_map(|id| positions.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    /// Recompute and persist `unrealised_pnl` for every open position on
    /// `symbol` at the given mark price. Called by the trigger engines on
    /// every price tick, before they evaluate TP/SL/liquidation/breach.
    pub fn mark_to_market(&self, symbol: &str, mark_price: Amount) {
        let ids: Vec<PositionId> = self
            .indexes
            .read()
            .by_symbol
            .get(symbol)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        let mut positions = self.positions.write();
        for id in ids {
            if let Some(position) = positions.get_mut(&id) {
                position.unrealised_pnl = position.pnl_at(mark_price);
                position.updated_at = Utc::now();
            }
        }
    }

    pub fn account_unrealised_pnl(&self, account_id: AccountId) -> Amount {
        self.by_account(account_id)
            .into_iter()
            .map(|p| p.unrealised_pnl)
            .sum()
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position(account_id: AccountId, symbol: &str, side: Side) -> Position {
        let now = Utc::now();
        Position {
            id: PositionId::new(),
            account_id,
            symbol: symbol.to_string(),
            side,
            quantity: Amount::from_f64(0.1),
            entry_price: Amount::from_f64(30_000.0),
            leverage: 10,
            margin_reserved: Amount::from_f64(300.0),
            entry_fee: Amount::from_f64(1.5),
            take_profit: None,
            stop_loss: None,
            unrealised_pnl: Amount::ZERO,
            opened_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn pnl_at_is_positive_for_long_on_price_rise() {
        let position = sample_position(AccountId::new(), "BTC-USD", Side::Long);
        let pnl = position.pnl_at(Amount::from_f64(31_000.0));
        assert!((pnl.to_f64() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn pnl_at_is_positive_for_short_on_price_fall() {
        let position = sample_position(AccountId::new(), "BTC-USD", Side::Short);
        let pnl = position.pnl_at(Amount::from_f64(29_000.0));
        assert!((pnl.to_f64() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn mark_to_market_updates_all_positions_on_symbol() {
        let manager = PositionManager::new();
        let account = AccountId::new();
        manager.insert(sample_position(account, "BTC-USD", Side::Long));
        manager.insert(sample_position(account, "BTC-USD", Side::Short));

        manager.mark_to_market("BTC-USD", Amount::from_f64(30_100.0));

        let positions = manager.by_symbol("BTC-USD");
        assert_eq!(positions.len(), 2);
        for position in positions {
            assert!(!position.unrealised_pnl.is_zero());
        }
    }

    #[test]
    fn remove_clears_both_indexes() {
        let manager = PositionManager::new();
        let account = AccountId::new();
        let position = sample_position(account, "BTC-USD", Side::Long);
        let id = position.id;
        manager.insert(position);

        manager.remove(id);

        assert!(manager.by_account(account).is_empty());
        assert!(manager.by_symbol("BTC-USD").is_empty());
        assert!(manager.get(id).is_none());
    }

    #[test]
    fn liquidation_price_is_below_entry_for_long() {
        let position = sample_position(AccountId::new(), "BTC-USD", Side::Long);
        let liq = position.liquidation_price(0.004);
        assert!(liq < position.entry_price);
    }

    #[test]
    fn liquidation_price_is_above_entry_for_short() {
        let position = sample_position(AccountId::new(), "BTC-USD", Side::Short);
        let liq = position.liquidation_price(0.004);
        assert!(liq > position.entry_price);
    }
}
