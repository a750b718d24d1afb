//! Pending Order book — §4.5.
//!
//! Holds resting limit orders (entries not yet filled) until the Limit-Fill
//! trigger engine marks them filled, they're cancelled by the owner, or they
//! expire. Indexed the same way as [`crate::position::PositionManager`]: by
//! account and by symbol.

use crate::amount::Amount;
use crate::ids::{AccountId, OrderId, Symbol};
use crate::position::Side;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderStatus {
    Resting,
    Filled,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingOrder {
    pub id: OrderId,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Amount,
    pub limit_price: Amount,
    pub leverage: u32,
    pub client_order_id: Option<String>,
    pub margin_reserved: Amount,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PendingOrder {
    /// A buy limit fills once the internal ask drops to/through the limit;
    /// a sell limit fills once the internal bid rises to/through it.
    pub fn is_triggered(&self, internal_bid: Amount, internal_ask: Amount) -> bool {
        match self.side {
            Side::Long => internal_ask <= self.limit_price,
            Side::Short => internal_bid >= self.limit_price,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

#[derive(Default)]
struct Indexes {
    by_account: HashMap<AccountId, HashSet<OrderId>>,
    by_symbol: HashMap<Symbol, HashSet<OrderId>>,
}

pub struct OrderManager {
    orders: RwLock<HashMap<OrderId, PendingOrder>>,
    indexes: RwLock<Indexes>,
}

impl OrderManager {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            indexes: RwLock::new(Indexes::default()),
        }
    }

    pub fn place(&self, order: PendingOrder) {
        let id = order.id;
        let account_id = order.account_id;
        let symbol = order.symbol.clone();

        self.orders.write().insert(id, order);

        let mut indexes = self.indexes.write();
        indexes.by_account.entry(account_id).or_default().insert(id);
        indexes.by_symbol.entry(symbol).or_default().insert(id);
    }

    pub fn get(&self, id: OrderId) -> Option<PendingOrder> {
        self.orders.read().get(&id).cloned()
    }

    /// Remove the order from the book, whatever the final status, and
    /// return it so the caller can release its reserved margin.
    fn remove(&self, id: OrderId) -> Option<PendingOrder> {
        let removed = self.orders.write().remove(&id)?;
        let mut indexes = self.indexes.write();
        if let Some(set) = indexes.by_account.get_mut(&removed.account_id) {
            set.remove(&id);
        }
        if let Some(set) = indexes.by_symbol.get_mut(&removed.symbol) {
            set.remove(&id);
        }
        Some(removed)
    }

    pub fn cancel(&self, id: OrderId) -> Option<PendingOrder> {
        self.remove(id)
    }

    pub fn mark_filled(&self, id: OrderId) -> Option<PendingOrder> {
        self.remove(id)
    }

    pub fn expire(&self, id: OrderId) -> Option<PendingOrder> {
        self.remove(id)
    }

    pub fn by_account(&self, account_id: AccountId) -> Vec<PendingOrder> {
        let orders = self.orders.read();
        self.indexes
            .read()
            .by_account
            .get(&account_id)
            .map(|ids| ids.iter().filter_map(|id| orders.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn by_symbol(&self, symbol: &str) -> Vec<PendingOrder> {
        let orders = self.orders.read();
        self.indexes
            .read()
            .by_symbol
            .get(symbol)
            .map(|ids| ids.iter().filter_map(|id| orders.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Every order already resting on `account_id` with this client-supplied
    /// id; a non-empty result is a duplicate-submission rejection upstream.
    pub fn has_client_order_id(&self, account_id: AccountId, client_order_id: &str) -> bool {
        self.by_account(account_id)
            .iter()
            .any(|o| o.client_order_id.as_deref() == Some(client_order_id))
    }

    pub fn all(&self) -> Vec<PendingOrder> {
        self.orders.read().values().cloned().collect()
    }
}

impl Default for OrderManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order(account_id: AccountId, side: Side, limit_price: f64) -> PendingOrder {
        PendingOrder {
            id: OrderId::new(),
            account_id,
            symbol: "BTC-USD".to_string(),
            side,
            quantity: Amount::from_f64(0.1),
            limit_price: Amount::from_f64(limit_price),
            leverage: 10,
            client_order_id: None,
            margin_reserved: Amount::from_f64(300.0),
            status: OrderStatus::Resting,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn buy_limit_triggers_when_ask_drops_to_or_through_limit() {
        let order = sample_order(AccountId::new(), Side::Long, 29_900.0);
        assert!(!order.is_triggered(Amount::from_f64(29_950.0), Amount::from_f64(29_955.0)));
        assert!(order.is_triggered(Amount::from_f64(29_895.0), Amount::from_f64(29_900.0)));
    }

    #[test]
    fn sell_limit_triggers_when_bid_rises_to_or_through_limit() {
        let order = sample_order(AccountId::new(), Side::Short, 30_100.0);
        assert!(!order.is_triggered(Amount::from_f64(30_050.0), Amount::from_f64(30_055.0)));
        assert!(order.is_triggered(Amount::from_f64(30_100.0), Amount::from_f64(30_105.0)));
    }

    #[test]
    fn cancel_removes_from_both_indexes() {
        let manager = OrderManager::new();
        let account = AccountId::new();
        let order = sample_order(account, Side::Long, 29_000.0);
        let id = order.id;
        manager.place(order);

        manager.cancel(id);

        assert!(manager.get(id).is_none());
        assert!(manager.by_account(account).is_empty());
        assert!(manager.by_symbol("BTC-USD").is_empty());
    }

    #[test]
    fn duplicate_client_order_id_is_detected_per_account() {
        let manager = OrderManager::new();
        let account = AccountId::new();
        let mut order = sample_order(account, Side::Long, 29_000.0);
        order.client_order_id = Some("my-order-1".to_string());
        manager.place(order);

        assert!(manager.has_client_order_id(account, "my-order-1"));
        assert!(!manager.has_client_order_id(account, "my-order-2"));
        assert!(!manager.has_client_order_id(AccountId::new(), "my-order-1"));
    }
}
