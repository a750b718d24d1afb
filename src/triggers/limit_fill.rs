//! Limit-Fill engine — §4.7.
//!
//! Every 100 ms, sweeps every symbol with resting orders and fires any whose
//! trigger condition is met. Unlike TP/SL and Liquidation, this runs on a
//! fixed timer rather than off the price broadcast: a sweep cadence is a
//! better fit than a per-tick reaction here, since filling is itself a
//! mutation of the order book the next sweep must see.

use crate::account::AccountManager;
use crate::audit::{AuditEventType, AuditLog};
use crate::execution::open::{open_position, release_reserved_margin, OpenInput};
use crate::execution::{OrderFilledEvent, OrderRequest, OrderType, PlanLimits};
use crate::order::OrderManager;
use crate::persistence::{PersistenceQueue, PersistenceTask};
use crate::position::{PositionManager, Side};
use crate::price::PriceEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[allow(clippy::too_many_arguments)]
pub async fn run(
    order_manager: Arc<OrderManager>,
    position_manager: Arc<PositionManager>,
    account_manager: Arc<AccountManager>,
    price_engine: Arc<PriceEngine>,
    plan: PlanLimits,
    persistence: Arc<PersistenceQueue>,
    audit: Arc<AuditLog>,
    filled_tx: broadcast::Sender<OrderFilledEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("limit-fill engine shutting down");
                break;
            }
            _ = interval.tick() => {
                sweep(&order_manager, &position_manager, &account_manager, &price_engine, plan, &persistence, &audit, &filled_tx).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn sweep(
    order_manager: &OrderManager,
    position_manager: &PositionManager,
    account_manager: &AccountManager,
    price_engine: &PriceEngine,
    plan: PlanLimits,
    persistence: &PersistenceQueue,
    audit: &AuditLog,
    filled_tx: &broadcast::Sender<OrderFilledEvent>,
) {
    let now = chrono::Utc::now();

    for order in order_manager.all() {
        if order.is_expired(now) {
            if let Some(order) = order_manager.expire(order.id) {
                if let Ok(mut account) = account_manager.lock(order.account_id).await {
                    release_reserved_margin(&mut account, &order);
                    persistence.enqueue(PersistenceTask::UpsertAccount(account.clone()));
                }
                persistence.enqueue(PersistenceTask::DeleteOrder(order.id));
            }
            continue;
        }

        let Some(record) = price_engine.get(&order.symbol) else { continue };
        if record.is_stale(now) {
            continue;
        }
        if !order.is_triggered(record.internal_bid, record.internal_ask) {
            continue;
        }

        // Effective execution price clamps to the better of market/limit so
        // the client never fills worse than what they asked for.
        let exec_price = match order.side {
            Side::Long => record.internal_ask.min(order.limit_price),
            Side::Short => record.internal_bid.max(order.limit_price),
        };

        let Ok(mut account) = account_manager.lock(order.account_id).await else { continue };

        // Release the reserved margin first; the open path below will
        // re-debit it, recomputed against the actual fill price.
        release_reserved_margin(&mut account, &order);

        let request = OrderRequest {
            owner_id: account.owner_id,
            account_id: order.account_id,
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: OrderType::Market,
            quantity: order.quantity,
            requested_leverage: order.leverage,
            limit_price: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: order.client_order_id.clone(),
        };

        let clamped_record = {
            let mut r = record.clone();
            match order.side {
                Side::Long => r.internal_ask = exec_price,
                Side::Short => r.internal_bid = exec_price,
            }
            r
        };

        let result = open_position(
            &mut account,
            position_manager,
            OpenInput { request: &request, plan, price: &clamped_record, now },
        );

        match result {
            Ok(outcome) => {
                order_manager.mark_filled(order.id);
                tracing::info!(order_id = %order.id, position_id = %outcome.position.id, "limit order filled");
                persistence.enqueue(PersistenceTask::UpsertAccount(account.clone()));
                persistence.enqueue(PersistenceTask::UpsertPosition(outcome.position.clone()));
                persistence.enqueue(PersistenceTask::DeleteOrder(order.id));
                let audit_event = audit.record(
                    Some(order.account_id),
                    AuditEventType::OrderFilled,
                    &outcome.position,
                    now,
                );
                persistence.enqueue(PersistenceTask::InsertAuditLog(audit_event));
                let _ = filled_tx.send(OrderFilledEvent {
                    account_id: order.account_id,
                    order_id: order.id,
                    position_id: outcome.position.id,
                    exec_price: outcome.exec_price,
                });
            }
            Err(err) => {
                order_manager.cancel(order.id);
                persistence.enqueue(PersistenceTask::UpsertAccount(account.clone()));
                persistence.enqueue(PersistenceTask::DeleteOrder(order.id));
                tracing::warn!(order_id = %order.id, error = %err, "limit order cancelled on fill attempt");
            }
        }
    }
}

