//! Market Feed — §4.2.
//!
//! Feeds the Price Engine from a pluggable [`QuoteSource`]. Production
//! deployments would point this at a real exchange websocket; this crate
//! ships a simulated random-walk source so the engine is runnable and
//! testable with no external dependency.

use crate::amount::Amount;
use crate::price::{PriceAux, PriceEngine};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// One tick of external market data for a symbol.
#[derive(Debug, Clone)]
pub struct Quote {
    pub symbol: String,
    pub bid: Amount,
    pub ask: Amount,
}

/// Source of external quotes. Implementations push ticks at whatever cadence
/// is natural for them; the feed loop just drains them into the Price Engine.
#[async_trait::async_trait]
pub trait QuoteSource: Send + Sync {
    /// Block until the next quote is available, or the source is exhausted.
    async fn next_quote(&mut self) -> Option<Quote>;
}

/// Seed price and volatility for a symbol driven by the simulated source.
#[derive(Debug, Clone)]
pub struct SimulatedSymbol {
    pub symbol: String,
    pub start_price: f64,
    pub volatility_bps: f64,
}

/// Random-walk quote generator, ticking roughly once a second per symbol.
/// No real exchange dependency: used as the engine's default quote source.
pub struct SimulatedQuoteSource {
    symbols: Vec<SimulatedSymbol>,
    last_price: HashMap<String, f64>,
    cursor: usize,
    tick_interval: Duration,
}

impl SimulatedQuoteSource {
    pub fn new(symbols: Vec<SimulatedSymbol>) -> Self {
        let last_price = symbols
            .iter()
            .map(|s| (s.symbol.clone(), s.start_price))
            .collect();
        Self {
            symbols,
            last_price,
            cursor: 0,
            tick_interval: Duration::from_millis(1_000),
        }
    }
}

#[async_trait::async_trait]
impl QuoteSource for SimulatedQuoteSource {
    async fn next_quote(&mut self) -> Option<Quote> {
        if self.symbols.is_empty() {
            return None;
        }
        tokio::time::sleep(self.tick_interval / self.symbols.len() as u32).await;

        let spec = &self.symbols[self.cursor];
        self.cursor = (self.cursor + 1) % self.symbols.len();

        let previous = *self.last_price.get(&spec.symbol).unwrap_or(&spec.start_price);
        let drift_bps = {
            let mut rng = rand::thread_rng();
            rng.gen_range(-spec.volatility_bps..=spec.volatility_bps)
        };
        let next_price = (previous * (1.0 + drift_bps / 10_000.0)).max(0.000_001);
        self.last_price.insert(spec.symbol.clone(), next_price);

        let half_spread = next_price * 0.0001;
        Some(Quote {
            symbol: spec.symbol.clone(),
            bid: Amount::from_f64(next_price - half_spread),
            ask: Amount::from_f64(next_price + half_spread),
        })
    }
}

/// Drives a [`QuoteSource`] into a [`PriceEngine`] until `shutdown` fires.
/// Runs as its own task under the root `Engine`; a source failure ends the
/// task rather than the process, logged at `error` level.
pub async fn run_feed(
    mut source: Box<dyn QuoteSource>,
    price_engine: Arc<PriceEngine>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("market feed shutting down");
                break;
            }
            quote = source.next_quote() => {
                match quote {
                    Some(quote) => {
                        price_engine.publish(&quote.symbol, quote.bid, quote.ask, PriceAux::default());
                    }
                    None => {
                        tracing::warn!("quote source exhausted, stopping market feed");
                        break;
                    }
                }
            }
        }
    }
}

/// Periodically refreshes the slower-moving auxiliary stats (24h change,
/// high/low, volume, funding rate) from the same simulated walk, on a ~30s
/// cadence independent of the spot-quote loop.
pub async fn run_stats_refresh(
    symbols: Vec<String>,
    price_engine: Arc<PriceEngine>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                for symbol in &symbols {
                    let Some(current) = price_engine.get(symbol) else { continue };
                    let mut rng = rand::thread_rng();
                    let change_pct: f64 = rng.gen_range(-5.0..=5.0);
                    let funding_rate: f64 = rng.gen_range(-0.0005..=0.0005);
                    price_engine.publish(
                        symbol,
                        current.external_bid,
                        current.external_ask,
                        PriceAux {
                            change_24h_pct: Some(change_pct),
                            high_24h: Some(current.high_24h.max(current.external_ask)),
                            low_24h: Some(current.low_24h.min(current.external_bid)),
                            volume_24h: Some(current.volume_24h),
                            funding_rate: Some(funding_rate),
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_source_produces_quotes_for_each_symbol() {
        let mut source = SimulatedQuoteSource::new(vec![
            SimulatedSymbol { symbol: "BTC-USD".into(), start_price: 30_000.0, volatility_bps: 5.0 },
            SimulatedSymbol { symbol: "ETH-USD".into(), start_price: 2_000.0, volatility_bps: 5.0 },
        ]);
        let q1 = source.next_quote().await.unwrap();
        let q2 = source.next_quote().await.unwrap();
        assert_ne!(q1.symbol, q2.symbol);
        assert!(q1.ask >= q1.bid);
        assert!(q2.ask >= q2.bid);
    }

    #[tokio::test]
    async fn empty_source_yields_none() {
        let mut source = SimulatedQuoteSource::new(vec![]);
        assert!(source.next_quote().await.is_none());
    }
}
