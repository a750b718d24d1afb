//! Take-Profit / Stop-Loss engine — §4.7.
//!
//! Runs off the price broadcast set up in [`crate::engine`]: on every tick
//! for symbol S, scans S's open positions and closes any whose TP or SL has
//! been crossed, using the side-correct trigger price (bid for LONG exits,
//! ask for SHORT exits, matching the account's actual fill side).

use crate::account::AccountManager;
use crate::audit::{AuditEventType, AuditLog};
use crate::execution::{close::CloseInput, close_position, CloseReason, TradeRecord};
use crate::persistence::{PersistenceQueue, PersistenceTask};
use crate::position::{PositionManager, Side};
use crate::price::PriceRecord;
use std::sync::Arc;
use tokio::sync::broadcast;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    account_manager: Arc<AccountManager>,
    position_manager: Arc<PositionManager>,
    persistence: Arc<PersistenceQueue>,
    audit: Arc<AuditLog>,
    mut price_ticks: broadcast::Receiver<PriceRecord>,
    closed_tx: broadcast::Sender<TradeRecord>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("tp/sl engine shutting down");
                break;
            }
            tick = price_ticks.recv() => {
                let Ok(record) = tick else { continue };
                if record.is_stale(chrono::Utc::now()) {
                    continue;
                }
                handle_tick(&account_manager, &position_manager, &persistence, &audit, &closed_tx, &record).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_tick(
    account_manager: &AccountManager,
    position_manager: &PositionManager,
    persistence: &PersistenceQueue,
    audit: &AuditLog,
    closed_tx: &broadcast::Sender<TradeRecord>,
    record: &PriceRecord,
) {
    for position in position_manager.by_symbol(&record.symbol) {
        let trigger = match position.side {
            Side::Long => {
                if matches!(position.take_profit, Some(tp) if record.internal_bid >= tp) {
                    Some((CloseReason::TakeProfit, position.take_profit.unwrap()))
                } else if matches!(position.stop_loss, Some(sl) if record.internal_bid <= sl) {
                    Some((CloseReason::StopLoss, position.stop_loss.unwrap()))
                } else {
                    None
                }
            }
            Side::Short => {
                if matches!(position.take_profit, Some(tp) if record.internal_ask <= tp) {
                    Some((CloseReason::TakeProfit, position.take_profit.unwrap()))
                } else if matches!(position.stop_loss, Some(sl) if record.internal_ask >= sl) {
                    Some((CloseReason::StopLoss, position.stop_loss.unwrap()))
                } else {
                    None
                }
            }
        };

        let Some((reason, trigger_price)) = trigger else { continue };

        let Ok(mut account) = account_manager.lock(position.account_id).await else {
            continue;
        };
        let result = close_position(
            &mut account,
            position_manager,
            CloseInput {
                position_id: position.id,
                close_price: trigger_price,
                close_reason: reason,
                external_reference_price: Some(record.external_mid),
                close_quantity: None,
                now: chrono::Utc::now(),
            },
        );
        match result {
            Ok(outcome) => {
                tracing::info!(
                    position_id = %position.id,
                    reason = reason.as_str(),
                    net_pnl = %outcome.net_pnl,
                    "position closed by tp/sl engine"
                );
                persistence.enqueue(PersistenceTask::UpsertAccount(outcome.account_after.clone()));
                persistence.enqueue(PersistenceTask::InsertTrade(outcome.trade.clone()));
                match &outcome.position_after {
                    Some(remaining) => persistence.enqueue(PersistenceTask::UpsertPosition(remaining.clone())),
                    None => persistence.enqueue(PersistenceTask::DeletePosition(position.id)),
                }
                let event_type = match reason {
                    CloseReason::TakeProfit => AuditEventType::TpTriggered,
                    CloseReason::StopLoss => AuditEventType::SlTriggered,
                    _ => AuditEventType::PositionClosed,
                };
                let audit_event = audit.record(
                    Some(outcome.account_after.id),
                    event_type,
                    &outcome.trade,
                    chrono::Utc::now(),
                );
                persistence.enqueue(PersistenceTask::InsertAuditLog(audit_event));
                let _ = closed_tx.send(outcome.trade);
            }
            Err(err) => {
                tracing::warn!(position_id = %position.id, error = %err, "tp/sl close attempt failed");
            }
        }
    }
}
