//! Execution Kernel — §4.6.
//!
//! The synchronous open/close/partial-close paths. Every entry point here
//! runs while holding the account's slot (acquired by the caller), so the
//! compound balance/margin/position mutation sequence is atomic from any
//! observer's point of view. Nothing in this module performs I/O: callers
//! are responsible for emitting the resulting persistence tasks and audit
//! events once the in-memory mutation has committed.

pub mod close;
pub mod open;

use crate::amount::Amount;
use crate::ids::{AccountId, OrderId, OwnerId, PositionId, Symbol, TradeId};
use crate::position::Side;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use close::{close_position, CloseInput, CloseOutcome};
pub use open::{open_position, OpenInput, OpenOutcome};

/// Fee charged on notional at both open and close, in basis points.
pub const FEE_BPS: i64 = 5;

/// Default maintenance-margin rate baked into the liquidation-price formula
/// when a plan category doesn't override it (§9 resolution).
pub const DEFAULT_MAINTENANCE_MARGIN_RATE: f64 = 0.004;

/// The leverage/maintenance-margin bundle a plan category contributes to an
/// open. The full evaluation-plan lifecycle is out of scope; this is the
/// narrow slice of it the kernel actually consults.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub max_leverage: u32,
    pub maintenance_margin_rate: f64,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_leverage: 100,
            maintenance_margin_rate: DEFAULT_MAINTENANCE_MARGIN_RATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    Manual,
    TakeProfit,
    StopLoss,
    Liquidation,
    Breach,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Manual => "MANUAL",
            CloseReason::TakeProfit => "TAKE_PROFIT",
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::Liquidation => "LIQUIDATION",
            CloseReason::Breach => "BREACH",
        }
    }
}

/// The immutable receipt emitted on every full or partial close.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub trade_id: TradeId,
    pub account_id: AccountId,
    pub position_id: PositionId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity_closed: Amount,
    pub leverage: u32,
    pub entry_price: Amount,
    pub entry_value: Amount,
    pub entry_fee: Amount,
    pub exit_price: Amount,
    pub exit_value: Amount,
    pub exit_fee: Amount,
    pub close_reason: CloseReason,
    pub funding_fee: Amount,
    pub gross_pnl: Amount,
    pub total_fees: Amount,
    pub net_pnl: Amount,
    pub duration_seconds: i64,
    pub external_entry_price: Option<Amount>,
    pub external_exit_price: Option<Amount>,
    pub closed_at: DateTime<Utc>,
}

/// A request to open a new position or place a resting limit order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub owner_id: OwnerId,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Amount,
    pub requested_leverage: u32,
    pub limit_price: Option<Amount>,
    pub take_profit: Option<Amount>,
    pub stop_loss: Option<Amount>,
    pub client_order_id: Option<String>,
}

/// Outcome of releasing a pending order's reserved margin and re-running it
/// through the open path (Limit-Fill engine, §4.7).
#[derive(Debug, Clone, Copy)]
pub struct FillRequestId {
    pub order_id: OrderId,
}

/// Broadcast alongside a resting order's fill so the gateway can push
/// `ORDER_FILLED` to the owning connection without the Limit-Fill engine
/// knowing anything about websockets.
#[derive(Debug, Clone, Copy)]
pub struct OrderFilledEvent {
    pub account_id: AccountId,
    pub order_id: OrderId,
    pub position_id: PositionId,
    pub exec_price: Amount,
}
