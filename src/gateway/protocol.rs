//! Wire protocol — §6, §9 "Dynamic command dispatch".
//!
//! Every message carries a `type` field; inbound and outbound vocabularies
//! are closed enums rather than free-form strings, so an unrecognized
//! command is a deserialize error the connection actor turns into a clean
//! `ERROR{kind=unknown_command_type}` rather than silently falling through.

use crate::amount::Amount;
use crate::error::EngineError;
use crate::execution::CloseReason;
use crate::ids::{AccountId, OrderId, PositionId};
use crate::order::PendingOrder;
use crate::position::{Position, Side};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "AUTH")]
    Auth { token: String },
    #[serde(rename = "SUBSCRIBE")]
    Subscribe { symbols: Vec<String> },
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe { symbols: Vec<String> },
    #[serde(rename = "SUBSCRIBE_ORDER_BOOK")]
    SubscribeOrderBook { symbols: Vec<String> },
    #[serde(rename = "UNSUBSCRIBE_ORDER_BOOK")]
    UnsubscribeOrderBook { symbols: Vec<String> },
    #[serde(rename = "PLACE_ORDER")]
    PlaceOrder {
        account_id: AccountId,
        symbol: String,
        side: Side,
        order_type: PlaceOrderType,
        quantity: f64,
        leverage: u32,
        limit_price: Option<f64>,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
        client_order_id: Option<String>,
    },
    #[serde(rename = "CANCEL_ORDER")]
    CancelOrder { order_id: OrderId },
    #[serde(rename = "GET_PENDING_ORDERS")]
    GetPendingOrders { account_id: AccountId },
    #[serde(rename = "CLOSE_POSITION")]
    ClosePosition {
        position_id: PositionId,
        quantity: Option<f64>,
    },
    #[serde(rename = "MODIFY_POSITION")]
    ModifyPosition {
        position_id: PositionId,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
    },
    #[serde(rename = "GET_POSITIONS")]
    GetPositions { account_id: AccountId },
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlaceOrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "CONNECTED")]
    Connected {
        connection_id: String,
        server_time_ms: i64,
        heartbeat_interval_ms: u64,
    },
    #[serde(rename = "AUTHENTICATED")]
    Authenticated { user_id: String },
    #[serde(rename = "AUTH_FAILED")]
    AuthFailed { reason: String },
    #[serde(rename = "PRICE_UPDATE")]
    PriceUpdate {
        symbol: String,
        bid: Amount,
        ask: Amount,
        mid: Amount,
        timestamp_ms: i64,
    },
    #[serde(rename = "ORDER_BOOK_SNAPSHOT")]
    OrderBookSnapshot { symbol: String, bid: Amount, ask: Amount },
    #[serde(rename = "ORDER_BOOK_UPDATE")]
    OrderBookUpdate { symbol: String, bid: Amount, ask: Amount },
    #[serde(rename = "ORDER_FILLED")]
    OrderFilled {
        order_id: OrderId,
        position_id: PositionId,
        exec_price: Amount,
    },
    #[serde(rename = "POSITION_CLOSED")]
    PositionClosed {
        position_id: PositionId,
        close_reason: CloseReasonWire,
        net_pnl: Amount,
    },
    #[serde(rename = "ACCOUNT_BREACHED")]
    AccountBreached { account_id: AccountId, reason: String },
    #[serde(rename = "RISK_WARNING")]
    RiskWarning {
        account_id: AccountId,
        axis: String,
        ratio_of_limit: f64,
    },
    #[serde(rename = "EVALUATION_STEP_PASSED")]
    EvaluationStepPassed { account_id: AccountId, step: u32 },
    #[serde(rename = "EVALUATION_PASSED")]
    EvaluationPassed { account_id: AccountId },
    /// Answers `GET_POSITIONS`. Not part of the distilled wire vocabulary —
    /// added so that command has an actual response; see DESIGN.md.
    #[serde(rename = "POSITIONS_SNAPSHOT")]
    PositionsSnapshot {
        account_id: AccountId,
        positions: Vec<PositionSummary>,
    },
    /// Answers `GET_PENDING_ORDERS`, for the same reason.
    #[serde(rename = "PENDING_ORDERS_SNAPSHOT")]
    PendingOrdersSnapshot {
        account_id: AccountId,
        orders: Vec<OrderSummary>,
    },
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "ERROR")]
    Error {
        kind: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SideWire {
    Long,
    Short,
}

impl From<Side> for SideWire {
    fn from(side: Side) -> Self {
        match side {
            Side::Long => SideWire::Long,
            Side::Short => SideWire::Short,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub id: PositionId,
    pub symbol: String,
    pub side: SideWire,
    pub quantity: Amount,
    pub entry_price: Amount,
    pub leverage: u32,
    pub margin_reserved: Amount,
    pub take_profit: Option<Amount>,
    pub stop_loss: Option<Amount>,
    pub unrealised_pnl: Amount,
}

impl From<&Position> for PositionSummary {
    fn from(position: &Position) -> Self {
        Self {
            id: position.id,
            symbol: position.symbol.clone(),
            side: position.side.into(),
            quantity: position.quantity,
            entry_price: position.entry_price,
            leverage: position.leverage,
            margin_reserved: position.margin_reserved,
            take_profit: position.take_profit,
            stop_loss: position.stop_loss,
            unrealised_pnl: position.unrealised_pnl,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderSummary {
    pub id: OrderId,
    pub symbol: String,
    pub side: SideWire,
    pub quantity: Amount,
    pub limit_price: Amount,
    pub leverage: u32,
}

impl From<&PendingOrder> for OrderSummary {
    fn from(order: &PendingOrder) -> Self {
        Self {
            id: order.id,
            symbol: order.symbol.clone(),
            side: order.side.into(),
            quantity: order.quantity,
            limit_price: order.limit_price,
            leverage: order.leverage,
        }
    }
}

/// Serializable mirror of [`CloseReason`] for the outbound frame.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReasonWire {
    Manual,
    TakeProfit,
    StopLoss,
    Liquidation,
    Breach,
}

impl From<CloseReason> for CloseReasonWire {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Manual => CloseReasonWire::Manual,
            CloseReason::TakeProfit => CloseReasonWire::TakeProfit,
            CloseReason::StopLoss => CloseReasonWire::StopLoss,
            CloseReason::Liquidation => CloseReasonWire::Liquidation,
            CloseReason::Breach => CloseReasonWire::Breach,
        }
    }
}

impl ServerEvent {
    pub fn error(err: &EngineError) -> Self {
        ServerEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn unknown_command_type(raw: &str) -> Self {
        ServerEvent::Error {
            kind: "unknown_command_type".to_string(),
            message: format!("unrecognized message: {raw}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_command_parses_from_json() {
        let raw = r#"{"type":"AUTH","token":"abc"}"#;
        let parsed: ClientCommand = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, ClientCommand::Auth { token } if token == "abc"));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"TELEPORT"}"#;
        let parsed: Result<ClientCommand, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn connected_event_serializes_with_type_tag() {
        let event = ServerEvent::Connected {
            connection_id: "abc".into(),
            server_time_ms: 0,
            heartbeat_interval_ms: 30_000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"CONNECTED""#));
    }
}
