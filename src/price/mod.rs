//! Price Engine — §4.1.
//!
//! Holds the latest bid/ask/mid per symbol, applies a per-symbol spread
//! markup, and fans updates out to subscribers synchronously in registration
//! order. Publishing one symbol never blocks publishing another: each
//! symbol's record lives behind its own `RwLock` inside a sharded map.

use crate::amount::Amount;
use crate::ids::Symbol;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A price is stale after this many milliseconds. Consumers (triggers,
/// closers) enforce this; the engine itself only stamps.
pub const STALE_AFTER_MS: i64 = 5_000;

#[derive(Debug, Clone)]
pub struct PriceRecord {
    pub symbol: Symbol,
    pub external_bid: Amount,
    pub external_ask: Amount,
    pub external_mid: Amount,
    pub internal_bid: Amount,
    pub internal_ask: Amount,
    pub change_24h_pct: f64,
    pub high_24h: Amount,
    pub low_24h: Amount,
    pub volume_24h: Amount,
    pub funding_rate: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceRecord {
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_milliseconds()
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age_ms(now) > STALE_AFTER_MS
    }
}

/// Auxiliary fields published alongside a bid/ask tick, typically refreshed
/// on a slower cadence than the spot quote itself (see Market Feed, §4.2).
#[derive(Debug, Clone, Default)]
pub struct PriceAux {
    pub change_24h_pct: Option<f64>,
    pub high_24h: Option<Amount>,
    pub low_24h: Option<Amount>,
    pub volume_24h: Option<Amount>,
    pub funding_rate: Option<f64>,
}

type SubscriberFn = Box<dyn Fn(&PriceRecord) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: SubscriberFn,
}

pub struct SubscriptionHandle(u64);

struct SymbolSlot {
    record: RwLock<Option<PriceRecord>>,
    spread_bps: RwLock<u32>,
}

/// Default spread markup applied when a symbol has no explicit configuration.
const DEFAULT_SPREAD_BPS: u32 = 5;

pub struct PriceEngine {
    symbols: RwLock<HashMap<Symbol, Arc<SymbolSlot>>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
}

impl PriceEngine {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    pub fn set_spread_bps(&self, symbol: &str, bps: u32) {
        let slot = self.slot_for(symbol);
        *slot.spread_bps.write() = bps;
    }

    fn slot_for(&self, symbol: &str) -> Arc<SymbolSlot> {
        if let Some(slot) = self.symbols.read().get(symbol) {
            return slot.clone();
        }
        let mut symbols = self.symbols.write();
        symbols
            .entry(symbol.to_string())
            .or_insert_with(|| {
                Arc::new(SymbolSlot {
                    record: RwLock::new(None),
                    spread_bps: RwLock::new(DEFAULT_SPREAD_BPS),
                })
            })
            .clone()
    }

    /// Overwrite the record for `symbol`, recompute the internal bid/ask by
    /// applying the symbol's spread split symmetrically around the mid, stamp
    /// the wall-clock time, and fan out to subscribers synchronously.
    pub fn publish(&self, symbol: &str, external_bid: Amount, external_ask: Amount, aux: PriceAux) {
        let slot = self.slot_for(symbol);
        let spread_bps = *slot.spread_bps.read();
        let mid = (external_bid + external_ask) / 2;
        let half_spread = mid.bps(spread_bps as i64) / 2;

        let previous = slot.record.read().clone();
        let record = PriceRecord {
            symbol: symbol.to_string(),
            external_bid,
            external_ask,
            external_mid: mid,
            internal_bid: mid - half_spread,
            internal_ask: mid + half_spread,
            change_24h_pct: aux
                .change_24h_pct
                .unwrap_or_else(|| previous.as_ref().map(|p| p.change_24h_pct).unwrap_or(0.0)),
            high_24h: aux
                .high_24h
                .unwrap_or_else(|| previous.as_ref().map(|p| p.high_24h).unwrap_or(external_ask)),
            low_24h: aux
                .low_24h
                .unwrap_or_else(|| previous.as_ref().map(|p| p.low_24h).unwrap_or(external_bid)),
            volume_24h: aux
                .volume_24h
                .unwrap_or_else(|| previous.as_ref().map(|p| p.volume_24h).unwrap_or(Amount::ZERO)),
            funding_rate: aux
                .funding_rate
                .unwrap_or_else(|| previous.as_ref().map(|p| p.funding_rate).unwrap_or(0.0)),
            timestamp: Utc::now(),
        };

        debug_assert!(record.internal_ask >= record.internal_bid);

        *slot.record.write() = Some(record.clone());

        // Fan out outside the slot's own lock so a slow subscriber only
        // delays this symbol's own fan-out, never another publisher.
        for subscriber in self.subscribers.read().iter() {
            (subscriber.callback)(&record);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<PriceRecord> {
        self.symbols.read().get(symbol)?.record.read().clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&PriceRecord) + Send + Sync + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Subscriber {
            id,
            callback: Box::new(callback),
        });
        SubscriptionHandle(id)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers.write().retain(|s| s.id != handle.0);
    }
}

impl Default for PriceEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_computes_symmetric_internal_spread() {
        let engine = PriceEngine::new();
        engine.set_spread_bps("BTC-USD", 10); // 0.1%
        engine.publish(
            "BTC-USD",
            Amount::from_f64(29_997.0),
            Amount::from_f64(30_003.0),
            PriceAux::default(),
        );

        let record = engine.get("BTC-USD").unwrap();
        assert!(record.internal_ask >= record.internal_bid);
        let mid = record.external_mid.to_f64();
        assert!((record.internal_bid.to_f64() - mid).abs() < mid * 0.001 + 1e-6);
    }

    #[test]
    fn get_returns_none_before_first_publish() {
        let engine = PriceEngine::new();
        assert!(engine.get("ETH-USD").is_none());
    }

    #[test]
    fn subscribers_are_notified_in_registration_order() {
        let engine = PriceEngine::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o1 = order.clone();
        engine.subscribe(move |_| o1.lock().push(1));
        let o2 = order.clone();
        engine.subscribe(move |_| o2.lock().push(2));

        engine.publish(
            "BTC-USD",
            Amount::from_f64(100.0),
            Amount::from_f64(101.0),
            PriceAux::default(),
        );

        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_stops_future_notifications() {
        let engine = PriceEngine::new();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        let handle = engine.subscribe(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        engine.publish(
            "BTC-USD",
            Amount::from_f64(100.0),
            Amount::from_f64(101.0),
            PriceAux::default(),
        );
        engine.unsubscribe(handle);
        engine.publish(
            "BTC-USD",
            Amount::from_f64(100.0),
            Amount::from_f64(101.0),
            PriceAux::default(),
        );

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn staleness_is_judged_by_consumers_not_the_engine() {
        let engine = PriceEngine::new();
        engine.publish(
            "BTC-USD",
            Amount::from_f64(100.0),
            Amount::from_f64(101.0),
            PriceAux::default(),
        );
        let record = engine.get("BTC-USD").unwrap();
        assert!(!record.is_stale(Utc::now()));
        let long_ago = Utc::now() + chrono::Duration::seconds(10);
        assert!(record.is_stale(long_ago));
    }
}
