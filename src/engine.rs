//! Root wiring — §9 "Cyclic ownership".
//!
//! `Engine` is the one place that constructs every subsystem and owns the
//! `Arc`s that get handed out to the gateway and the background tasks.
//! Nothing downstream holds a strong reference back to `Engine` itself, so
//! there is no cycle: the root is the single point with full ownership,
//! everything else borrows a slice of it.

use crate::account::AccountManager;
use crate::audit::AuditLog;
use crate::config::Config;
use crate::execution::{OrderFilledEvent, PlanLimits, TradeRecord};
use crate::gateway::GatewayState;
use crate::market_feed::{self, SimulatedQuoteSource, SimulatedSymbol};
use crate::order::OrderManager;
use crate::persistence::{PersistenceQueue, SqliteStore, Store};
use crate::position::PositionManager;
use crate::price::{PriceEngine, PriceRecord};
use crate::triggers::{limit_fill, liquidation, risk_breach, tp_sl};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Symbols the simulated market feed drives when no real exchange feed is
/// configured. A production deployment would swap `SimulatedQuoteSource` for
/// a real one and this list would come from the evaluation-plan catalogue
/// instead of being hardcoded here.
const DEFAULT_SYMBOLS: &[(&str, f64, f64)] = &[
    ("BTC-USD", 60_000.0, 8.0),
    ("ETH-USD", 3_000.0, 10.0),
    ("SOL-USD", 150.0, 15.0),
];

/// Capacity for the broadcast channels fanned out to every connected
/// gateway client. A slow subscriber that falls this far behind starts
/// missing ticks (`broadcast::error::RecvError::Lagged`), which the
/// connection actor treats as a reason to keep going, not to disconnect.
const BROADCAST_CAPACITY: usize = 1_024;

pub struct Engine {
    pub account_manager: Arc<AccountManager>,
    pub position_manager: Arc<PositionManager>,
    pub order_manager: Arc<OrderManager>,
    pub price_engine: Arc<PriceEngine>,
    pub persistence: Arc<PersistenceQueue>,
    pub audit: Arc<AuditLog>,
    pub breach_engine: Arc<risk_breach::RiskBreachEngine>,
    pub shutdown: broadcast::Sender<()>,
    price_ticks: broadcast::Sender<PriceRecord>,
    closed_tx: broadcast::Sender<TradeRecord>,
    filled_tx: broadcast::Sender<OrderFilledEvent>,
}

impl Engine {
    /// Construct every subsystem, spawn the background tasks, and return the
    /// handle the gateway and the REST surface mount their state from.
    pub async fn start(config: &Config, plan: PlanLimits) -> anyhow::Result<Self> {
        let (shutdown, _) = broadcast::channel(1);

        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.database_url)?);
        let persistence = Arc::new(PersistenceQueue::spawn(store.clone(), shutdown.subscribe()));
        let audit = Arc::new(AuditLog::new());

        let price_engine = Arc::new(PriceEngine::new());
        let account_manager = Arc::new(AccountManager::new());
        let position_manager = Arc::new(PositionManager::new());
        let order_manager = Arc::new(OrderManager::new());

        for account in store.list_active_accounts().await? {
            account_manager.insert(account);
        }

        let (price_ticks, _) = broadcast::channel::<PriceRecord>(BROADCAST_CAPACITY);
        let (closed_tx, _) = broadcast::channel::<TradeRecord>(BROADCAST_CAPACITY);
        let (filled_tx, _) = broadcast::channel::<OrderFilledEvent>(BROADCAST_CAPACITY);

        {
            let price_ticks = price_ticks.clone();
            price_engine.subscribe(move |record| {
                let _ = price_ticks.send(record.clone());
            });
        }

        let breach_engine = Arc::new(risk_breach::RiskBreachEngine::new(
            account_manager.clone(),
            position_manager.clone(),
            price_engine.clone(),
            closed_tx.clone(),
            persistence.clone(),
            audit.clone(),
        ));
        for account_id in account_manager.all_ids() {
            breach_engine.register(account_id);
        }

        let symbols: Vec<SimulatedSymbol> = DEFAULT_SYMBOLS
            .iter()
            .map(|(symbol, start_price, volatility_bps)| SimulatedSymbol {
                symbol: symbol.to_string(),
                start_price: *start_price,
                volatility_bps: *volatility_bps,
            })
            .collect();
        let symbol_names: Vec<String> = symbols.iter().map(|s| s.symbol.clone()).collect();
        let quote_source = Box::new(SimulatedQuoteSource::new(symbols));

        tokio::spawn(market_feed::run_feed(quote_source, price_engine.clone(), shutdown.subscribe()));
        tokio::spawn(market_feed::run_stats_refresh(symbol_names, price_engine.clone(), shutdown.subscribe()));
        tokio::spawn(account_manager.clone().run_stale_lock_reaper(shutdown.subscribe()));
        tokio::spawn(breach_engine.clone().run_heartbeat(shutdown.subscribe()));

        tokio::spawn(tp_sl::run(
            account_manager.clone(),
            position_manager.clone(),
            persistence.clone(),
            audit.clone(),
            price_ticks.subscribe(),
            closed_tx.clone(),
            shutdown.subscribe(),
        ));
        tokio::spawn(liquidation::run(
            account_manager.clone(),
            position_manager.clone(),
            Arc::new(liquidation::WarningTracker::new()),
            plan.maintenance_margin_rate,
            persistence.clone(),
            audit.clone(),
            price_ticks.subscribe(),
            closed_tx.clone(),
            shutdown.subscribe(),
        ));
        tokio::spawn(limit_fill::run(
            order_manager.clone(),
            position_manager.clone(),
            account_manager.clone(),
            price_engine.clone(),
            plan,
            persistence.clone(),
            audit.clone(),
            filled_tx.clone(),
            shutdown.subscribe(),
        ));

        Ok(Self {
            account_manager,
            position_manager,
            order_manager,
            price_engine,
            persistence,
            audit,
            breach_engine,
            shutdown,
            price_ticks,
            closed_tx,
            filled_tx,
        })
    }

    /// Build the state handed to the gateway's Axum router. Cheap to call
    /// more than once — every field is an `Arc` clone or a broadcast sender.
    pub fn gateway_state(&self, jwt_handler: Arc<crate::auth::jwt::JwtHandler>, plan: PlanLimits) -> GatewayState {
        GatewayState {
            account_manager: self.account_manager.clone(),
            position_manager: self.position_manager.clone(),
            order_manager: self.order_manager.clone(),
            price_engine: self.price_engine.clone(),
            persistence: self.persistence.clone(),
            audit: self.audit.clone(),
            breach_engine: self.breach_engine.clone(),
            jwt_handler,
            plan,
            price_ticks: self.price_ticks.clone(),
            closed_tx: self.closed_tx.clone(),
            filled_tx: self.filled_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}
