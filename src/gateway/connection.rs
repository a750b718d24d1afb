//! Per-connection actor — §4.8.
//!
//! One task per upgraded socket, grounded in `main.rs`'s original
//! `handle_socket` signal-streaming loop: a single `tokio::select!` over the
//! inbound socket and however many broadcast feeds this connection cares
//! about, with timers for the heartbeat and the coalesced price flush.
//! Nothing here blocks: a slow client only ever delays its own frames.

use super::protocol::{ClientCommand, OrderSummary, PlaceOrderType, PositionSummary, ServerEvent};
use super::GatewayState;
use crate::audit::AuditEventType;
use crate::auth::models::Claims;
use crate::error::EngineError;
use crate::execution::close::CloseInput;
use crate::execution::open::{open_position, reserve_pending_order, OpenInput};
use crate::execution::{close_position, CloseReason, OrderRequest, OrderType};
use crate::ids::{AccountId, ConnectionId, OwnerId};
use crate::persistence::PersistenceTask;
use axum::extract::ws::{Message, WebSocket};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Interval on which the server pings the client.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A connection that hasn't answered a PING in this long is reaped.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);
/// How often the reap condition above is checked.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);
/// Coalesced price-update flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// Outbound frames queued for one connection beyond this many bytes per
/// flush tick are dropped rather than sent; the client is expected to
/// catch up on the next tick instead of the server buffering unboundedly.
const BACKPRESSURE_BYTES: usize = 64 * 1024;

struct ConnectionState {
    claims: Option<Claims>,
    bound_accounts: HashSet<AccountId>,
    price_symbols: HashSet<String>,
    order_book_symbols: HashSet<String>,
    pending_price: HashMap<String, crate::price::PriceRecord>,
    last_pong: std::time::Instant,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            claims: None,
            bound_accounts: HashSet::new(),
            price_symbols: HashSet::new(),
            order_book_symbols: HashSet::new(),
            pending_price: HashMap::new(),
            last_pong: std::time::Instant::now(),
        }
    }

    fn is_authenticated(&self) -> bool {
        self.claims.is_some()
    }

    fn owner_id(&self) -> Option<OwnerId> {
        let claims = self.claims.as_ref()?;
        Uuid::parse_str(&claims.sub).ok().map(OwnerId)
    }
}

pub async fn handle_socket(mut socket: WebSocket, connection_id: ConnectionId, state: GatewayState) {
    let mut shutdown = state.shutdown.subscribe();
    let mut price_ticks = state.price_ticks.subscribe();
    let mut closed_events = state.closed_tx.subscribe();
    let mut filled_events = state.filled_tx.subscribe();
    let mut breach_events = state.breach_engine.subscribe_breaches();
    let mut warning_events = state.breach_engine.subscribe_warnings();

    let mut conn = ConnectionState::new();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let mut sweep_interval = tokio::time::interval(SWEEP_INTERVAL);
    let mut flush_interval = tokio::time::interval(FLUSH_INTERVAL);

    let greeting = ServerEvent::Connected {
        connection_id: connection_id.to_string(),
        server_time_ms: chrono::Utc::now().timestamp_millis(),
        heartbeat_interval_ms: PING_INTERVAL.as_millis() as u64,
    };
    if send(&mut socket, &greeting).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ = ping_interval.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            _ = sweep_interval.tick() => {
                if conn.last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::info!(connection_id = %connection_id, "closing connection, no pong within timeout");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
            _ = flush_interval.tick() => {
                if flush_prices(&mut socket, &mut conn).await.is_err() {
                    break;
                }
            }
            tick = price_ticks.recv() => {
                if let Ok(record) = tick {
                    if conn.price_symbols.contains(&record.symbol) || conn.order_book_symbols.contains(&record.symbol) {
                        queue_price(&mut conn, record);
                    }
                }
            }
            trade = closed_events.recv() => {
                if let Ok(trade) = trade {
                    if conn.bound_accounts.contains(&trade.account_id) {
                        let event = ServerEvent::PositionClosed {
                            position_id: trade.position_id,
                            close_reason: trade.close_reason.into(),
                            net_pnl: trade.net_pnl,
                        };
                        if send(&mut socket, &event).await.is_err() { break; }
                    }
                }
            }
            fill = filled_events.recv() => {
                if let Ok(fill) = fill {
                    if conn.bound_accounts.contains(&fill.account_id) {
                        let event = ServerEvent::OrderFilled {
                            order_id: fill.order_id,
                            position_id: fill.position_id,
                            exec_price: fill.exec_price,
                        };
                        if send(&mut socket, &event).await.is_err() { break; }
                    }
                }
            }
            breach = breach_events.recv() => {
                if let Ok(breach) = breach {
                    if conn.bound_accounts.contains(&breach.account_id) {
                        let event = ServerEvent::AccountBreached { account_id: breach.account_id, reason: breach.reason.to_string() };
                        if send(&mut socket, &event).await.is_err() { break; }
                    }
                }
            }
            warning = warning_events.recv() => {
                if let Ok(warning) = warning {
                    if conn.bound_accounts.contains(&warning.account_id) {
                        let event = ServerEvent::RiskWarning {
                            account_id: warning.account_id,
                            axis: warning.axis.to_string(),
                            ratio_of_limit: warning.ratio_of_limit,
                        };
                        if send(&mut socket, &event).await.is_err() { break; }
                    }
                }
            }
            incoming = socket.recv() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Text(text)) => {
                        if handle_text(&mut socket, &mut conn, &state, &text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        conn.last_pong = std::time::Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    tracing::info!(connection_id = %connection_id, "connection closed");
}

async fn send(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}

fn queue_price(conn: &mut ConnectionState, record: crate::price::PriceRecord) {
    let already_pending_bytes: usize = conn
        .pending_price
        .values()
        .map(|r| r.symbol.len() + 96)
        .sum();
    if already_pending_bytes >= BACKPRESSURE_BYTES {
        tracing::warn!(symbol = %record.symbol, "dropping price tick, connection backpressured");
        return;
    }
    conn.pending_price.insert(record.symbol.clone(), record);
}

async fn flush_prices(socket: &mut WebSocket, conn: &mut ConnectionState) -> Result<(), axum::Error> {
    let pending = std::mem::take(&mut conn.pending_price);
    for (symbol, record) in pending {
        if conn.price_symbols.contains(&symbol) {
            let event = ServerEvent::PriceUpdate {
                symbol: symbol.clone(),
                bid: record.internal_bid,
                ask: record.internal_ask,
                mid: record.external_mid,
                timestamp_ms: record.timestamp.timestamp_millis(),
            };
            send(socket, &event).await?;
        }
        if conn.order_book_symbols.contains(&symbol) {
            let event = ServerEvent::OrderBookUpdate {
                symbol,
                bid: record.internal_bid,
                ask: record.internal_ask,
            };
            send(socket, &event).await?;
        }
    }
    Ok(())
}

async fn handle_text(
    socket: &mut WebSocket,
    conn: &mut ConnectionState,
    state: &GatewayState,
    text: &str,
) -> Result<(), axum::Error> {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(_) => return send(socket, &ServerEvent::unknown_command_type(text)).await,
    };

    match command {
        ClientCommand::Auth { token } => handle_auth(socket, conn, state, token).await,
        ClientCommand::Ping => send(socket, &ServerEvent::Pong).await,
        ClientCommand::Pong => {
            conn.last_pong = std::time::Instant::now();
            Ok(())
        }
        other => {
            if !conn.is_authenticated() {
                return send(socket, &ServerEvent::AuthFailed { reason: "not authenticated".into() }).await;
            }
            handle_authenticated_command(socket, conn, state, other).await
        }
    }
}

async fn handle_auth(
    socket: &mut WebSocket,
    conn: &mut ConnectionState,
    state: &GatewayState,
    token: String,
) -> Result<(), axum::Error> {
    match state.jwt_handler.validate_token(&token) {
        Ok(claims) => {
            let user_id = claims.sub.clone();
            conn.claims = Some(claims);
            send(socket, &ServerEvent::Authenticated { user_id }).await
        }
        Err(err) => send(socket, &ServerEvent::AuthFailed { reason: err.to_string() }).await,
    }
}

async fn handle_authenticated_command(
    socket: &mut WebSocket,
    conn: &mut ConnectionState,
    state: &GatewayState,
    command: ClientCommand,
) -> Result<(), axum::Error> {
    match command {
        ClientCommand::Subscribe { symbols } => {
            for symbol in symbols {
                conn.price_symbols.insert(symbol.clone());
                if let Some(record) = state.price_engine.get(&symbol) {
                    queue_price(conn, record);
                }
            }
            Ok(())
        }
        ClientCommand::Unsubscribe { symbols } => {
            for symbol in symbols {
                conn.price_symbols.remove(&symbol);
            }
            Ok(())
        }
        ClientCommand::SubscribeOrderBook { symbols } => {
            for symbol in symbols {
                conn.order_book_symbols.insert(symbol.clone());
                if let Some(record) = state.price_engine.get(&symbol) {
                    let event = ServerEvent::OrderBookSnapshot {
                        symbol,
                        bid: record.internal_bid,
                        ask: record.internal_ask,
                    };
                    send(socket, &event).await?;
                }
            }
            Ok(())
        }
        ClientCommand::UnsubscribeOrderBook { symbols } => {
            for symbol in symbols {
                conn.order_book_symbols.remove(&symbol);
            }
            Ok(())
        }
        ClientCommand::GetPositions { account_id } => {
            if !authorize(conn, state, account_id).await {
                return send(socket, &ServerEvent::error(&EngineError::Unauthorized { account_id })).await;
            }
            conn.bound_accounts.insert(account_id);
            let positions: Vec<PositionSummary> = state
                .position_manager
                .by_account(account_id)
                .iter()
                .map(PositionSummary::from)
                .collect();
            send(socket, &ServerEvent::PositionsSnapshot { account_id, positions }).await
        }
        ClientCommand::GetPendingOrders { account_id } => {
            if !authorize(conn, state, account_id).await {
                return send(socket, &ServerEvent::error(&EngineError::Unauthorized { account_id })).await;
            }
            conn.bound_accounts.insert(account_id);
            let orders: Vec<OrderSummary> = state
                .order_manager
                .by_account(account_id)
                .iter()
                .map(OrderSummary::from)
                .collect();
            send(socket, &ServerEvent::PendingOrdersSnapshot { account_id, orders }).await
        }
        ClientCommand::PlaceOrder {
            account_id,
            symbol,
            side,
            order_type,
            quantity,
            leverage,
            limit_price,
            take_profit,
            stop_loss,
            client_order_id,
        } => {
            conn.bound_accounts.insert(account_id);
            place_order(
                socket,
                conn,
                state,
                account_id,
                symbol,
                side,
                order_type,
                quantity,
                leverage,
                limit_price,
                take_profit,
                stop_loss,
                client_order_id,
            )
            .await
        }
        ClientCommand::CancelOrder { order_id } => cancel_order(socket, conn, state, order_id).await,
        ClientCommand::ClosePosition { position_id, quantity } => {
            close_position_command(socket, conn, state, position_id, quantity).await
        }
        ClientCommand::ModifyPosition { position_id, take_profit, stop_loss } => {
            modify_position(socket, conn, state, position_id, take_profit, stop_loss).await
        }
        ClientCommand::Auth { .. } | ClientCommand::Ping | ClientCommand::Pong => unreachable!(),
    }
}

/// An authenticated connection may only act on accounts it owns.
async fn authorize(conn: &ConnectionState, state: &GatewayState, account_id: AccountId) -> bool {
    let Some(owner_id) = conn.owner_id() else { return false };
    match state.account_manager.snapshot(account_id).await {
        Ok(account) => account.owner_id == owner_id,
        Err(_) => false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn place_order(
    socket: &mut WebSocket,
    conn: &ConnectionState,
    state: &GatewayState,
    account_id: AccountId,
    symbol: String,
    side: crate::position::Side,
    order_type: PlaceOrderType,
    quantity: f64,
    leverage: u32,
    limit_price: Option<f64>,
    take_profit: Option<f64>,
    stop_loss: Option<f64>,
    client_order_id: Option<String>,
) -> Result<(), axum::Error> {
    if !authorize(conn, state, account_id).await {
        return send(socket, &ServerEvent::error(&EngineError::Unauthorized { account_id })).await;
    }

    let Some(owner_id) = conn.owner_id() else {
        return send(socket, &ServerEvent::error(&EngineError::Unauthorized { account_id })).await;
    };

    if let Some(ref client_order_id) = client_order_id {
        if state.order_manager.has_client_order_id(account_id, client_order_id) {
            let err = EngineError::DuplicateClientOrderId { account_id, client_order_id: client_order_id.clone() };
            return send(socket, &ServerEvent::error(&err)).await;
        }
    }

    let request = OrderRequest {
        owner_id,
        account_id,
        symbol: symbol.clone(),
        side,
        order_type: match order_type {
            PlaceOrderType::Market => OrderType::Market,
            PlaceOrderType::Limit => OrderType::Limit,
        },
        quantity: crate::amount::Amount::from_f64(quantity),
        requested_leverage: leverage,
        limit_price: limit_price.map(crate::amount::Amount::from_f64),
        take_profit: take_profit.map(crate::amount::Amount::from_f64),
        stop_loss: stop_loss.map(crate::amount::Amount::from_f64),
        client_order_id,
    };

    let Some(price) = state.price_engine.get(&symbol) else {
        let err = EngineError::PriceUnavailable { symbol };
        return send(socket, &ServerEvent::error(&err)).await;
    };

    let mut account = match state.account_manager.lock(account_id).await {
        Ok(account) => account,
        Err(err) => return send(socket, &ServerEvent::error(&err)).await,
    };

    let now = chrono::Utc::now();
    let outcome = open_position(
        &mut account,
        &state.position_manager,
        OpenInput { request: &request, plan: state.plan, price: &price, now },
    );

    match outcome {
        Ok(outcome) => {
            state.persistence.enqueue(PersistenceTask::UpsertAccount(account.clone()));
            state.persistence.enqueue(PersistenceTask::UpsertPosition(outcome.position.clone()));
            let audit_event = state.audit.record(Some(account_id), AuditEventType::PositionOpened, &outcome.position, now);
            state.persistence.enqueue(PersistenceTask::InsertAuditLog(audit_event));
            let event = ServerEvent::OrderFilled {
                order_id: crate::ids::OrderId::new(),
                position_id: outcome.position.id,
                exec_price: outcome.exec_price,
            };
            send(socket, &event).await
        }
        Err(EngineError::LimitPriceNotMet { .. }) if request.order_type == OrderType::Limit => {
            match reserve_pending_order(&mut account, &request, state.plan, now, None) {
                Ok(order) => {
                    state.persistence.enqueue(PersistenceTask::UpsertAccount(account.clone()));
                    state.persistence.enqueue(PersistenceTask::InsertOrder(order.clone()));
                    let audit_event = state.audit.record(Some(account_id), AuditEventType::OrderPlaced, &order, now);
                    state.persistence.enqueue(PersistenceTask::InsertAuditLog(audit_event));
                    state.order_manager.place(order);
                    Ok(())
                }
                Err(err) => send(socket, &ServerEvent::error(&err)).await,
            }
        }
        Err(err) => send(socket, &ServerEvent::error(&err)).await,
    }
}

async fn cancel_order(
    socket: &mut WebSocket,
    conn: &ConnectionState,
    state: &GatewayState,
    order_id: crate::ids::OrderId,
) -> Result<(), axum::Error> {
    let Some(order) = state.order_manager.get(order_id) else {
        let err = EngineError::OrderNotFound { order_id };
        return send(socket, &ServerEvent::error(&err)).await;
    };
    if !authorize(conn, state, order.account_id).await {
        return send(socket, &ServerEvent::error(&EngineError::Unauthorized { account_id: order.account_id })).await;
    }

    if let Some(order) = state.order_manager.cancel(order_id) {
        if let Ok(mut account) = state.account_manager.lock(order.account_id).await {
            crate::execution::open::release_reserved_margin(&mut account, &order);
            state.persistence.enqueue(PersistenceTask::UpsertAccount(account.clone()));
        }
        state.persistence.enqueue(PersistenceTask::DeleteOrder(order_id));
        let audit_event = state.audit.record(
            Some(order.account_id),
            AuditEventType::OrderCancelled,
            &order,
            chrono::Utc::now(),
        );
        state.persistence.enqueue(PersistenceTask::InsertAuditLog(audit_event));
    }
    Ok(())
}

async fn close_position_command(
    socket: &mut WebSocket,
    conn: &ConnectionState,
    state: &GatewayState,
    position_id: crate::ids::PositionId,
    quantity: Option<f64>,
) -> Result<(), axum::Error> {
    let Some(position) = state.position_manager.get(position_id) else {
        let err = EngineError::PositionNotFound { position_id };
        return send(socket, &ServerEvent::error(&err)).await;
    };
    if !authorize(conn, state, position.account_id).await {
        return send(socket, &ServerEvent::error(&EngineError::Unauthorized { account_id: position.account_id })).await;
    }
    let Some(price) = state.price_engine.get(&position.symbol) else {
        let err = EngineError::PriceUnavailable { symbol: position.symbol.clone() };
        return send(socket, &ServerEvent::error(&err)).await;
    };
    if price.is_stale(chrono::Utc::now()) {
        let err = EngineError::PriceStale { symbol: position.symbol.clone(), age_ms: price.age_ms(chrono::Utc::now()) };
        return send(socket, &ServerEvent::error(&err)).await;
    }

    let close_price = match position.side {
        crate::position::Side::Long => price.internal_bid,
        crate::position::Side::Short => price.internal_ask,
    };

    let mut account = match state.account_manager.lock(position.account_id).await {
        Ok(account) => account,
        Err(err) => return send(socket, &ServerEvent::error(&err)).await,
    };

    let outcome = close_position(
        &mut account,
        &state.position_manager,
        CloseInput {
            position_id,
            close_price,
            close_reason: CloseReason::Manual,
            external_reference_price: Some(price.external_mid),
            close_quantity: quantity.map(crate::amount::Amount::from_f64),
            now: chrono::Utc::now(),
        },
    );

    match outcome {
        Ok(outcome) => {
            state.persistence.enqueue(PersistenceTask::UpsertAccount(account.clone()));
            state.persistence.enqueue(PersistenceTask::InsertTrade(outcome.trade.clone()));
            match outcome.position_after {
                Some(remaining) => state.persistence.enqueue(PersistenceTask::UpsertPosition(remaining)),
                None => state.persistence.enqueue(PersistenceTask::DeletePosition(position_id)),
            }
            let audit_event = state.audit.record(
                Some(account.id),
                AuditEventType::PositionClosed,
                &outcome.trade,
                chrono::Utc::now(),
            );
            state.persistence.enqueue(PersistenceTask::InsertAuditLog(audit_event));
            let event = ServerEvent::PositionClosed {
                position_id,
                close_reason: outcome.trade.close_reason.into(),
                net_pnl: outcome.net_pnl,
            };
            send(socket, &event).await
        }
        Err(err) => send(socket, &ServerEvent::error(&err)).await,
    }
}

async fn modify_position(
    socket: &mut WebSocket,
    conn: &ConnectionState,
    state: &GatewayState,
    position_id: crate::ids::PositionId,
    take_profit: Option<f64>,
    stop_loss: Option<f64>,
) -> Result<(), axum::Error> {
    let Some(mut position) = state.position_manager.get(position_id) else {
        let err = EngineError::PositionNotFound { position_id };
        return send(socket, &ServerEvent::error(&err)).await;
    };
    if !authorize(conn, state, position.account_id).await {
        return send(socket, &ServerEvent::error(&EngineError::Unauthorized { account_id: position.account_id })).await;
    }
    if let Some(tp) = take_profit {
        position.take_profit = Some(crate::amount::Amount::from_f64(tp));
    }
    if let Some(sl) = stop_loss {
        position.stop_loss = Some(crate::amount::Amount::from_f64(sl));
    }
    position.updated_at = chrono::Utc::now();
    state.position_manager.update(position.clone());
    state.persistence.enqueue(PersistenceTask::UpsertPosition(position));
    Ok(())
}
