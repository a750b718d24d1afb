//! WebSocket client gateway — §4.8.
//!
//! Thin Axum layer: one upgrade handler that hands each accepted socket off
//! to [`connection::handle_socket`], plus the shared state every connection
//! reads from. No business logic lives here — it's all in the kernel and
//! trigger engines this module only subscribes to.

pub mod connection;
pub mod protocol;

use crate::account::AccountManager;
use crate::audit::AuditLog;
use crate::auth::jwt::JwtHandler;
use crate::execution::{OrderFilledEvent, PlanLimits, TradeRecord};
use crate::ids::ConnectionId;
use crate::order::OrderManager;
use crate::persistence::PersistenceQueue;
use crate::position::PositionManager;
use crate::price::{PriceEngine, PriceRecord};
use crate::triggers::risk_breach::RiskBreachEngine;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct GatewayState {
    pub account_manager: Arc<AccountManager>,
    pub position_manager: Arc<PositionManager>,
    pub order_manager: Arc<OrderManager>,
    pub price_engine: Arc<PriceEngine>,
    pub persistence: Arc<PersistenceQueue>,
    pub audit: Arc<AuditLog>,
    pub breach_engine: Arc<RiskBreachEngine>,
    pub jwt_handler: Arc<JwtHandler>,
    pub plan: PlanLimits,
    pub price_ticks: broadcast::Sender<PriceRecord>,
    pub closed_tx: broadcast::Sender<TradeRecord>,
    pub filled_tx: broadcast::Sender<OrderFilledEvent>,
    pub shutdown: broadcast::Sender<()>,
}

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    let connection_id = ConnectionId::new();
    ws.on_upgrade(move |socket| connection::handle_socket(socket, connection_id, state))
}
