//! Liquidation engine — §4.7.
//!
//! On every price tick, closes any position on that symbol whose
//! side-correct exit price has crossed its liquidation price. Refuses to
//! act on a stale tick. Tracks a one-shot warning flag per position once its
//! normalized distance to liquidation drops below 0.5, so the gateway can
//! surface `RISK_WARNING` without re-firing on every subsequent tick.

use crate::account::AccountManager;
use crate::audit::{AuditEventType, AuditLog};
use crate::execution::{close::CloseInput, close_position, CloseReason, TradeRecord};
use crate::persistence::{PersistenceQueue, PersistenceTask};
use crate::position::{Position, PositionManager, Side};
use crate::price::PriceRecord;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Tracks which positions have already had their near-liquidation warning
/// fired, so the engine surfaces it exactly once per position.
#[derive(Default)]
pub struct WarningTracker {
    warned: Mutex<HashSet<crate::ids::PositionId>>,
}

impl WarningTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_and_check(&self, position_id: crate::ids::PositionId) -> bool {
        let mut warned = self.warned.lock();
        warned.insert(position_id)
    }

    pub fn clear(&self, position_id: crate::ids::PositionId) {
        self.warned.lock().remove(&position_id);
    }
}

/// `max(0, (exit - liquidation) / (entry - liquidation))` for LONG, mirrored
/// for SHORT. Drops toward zero as price approaches the liquidation level.
pub fn normalized_distance(position: &Position, exit_price_f64: f64, liquidation_price_f64: f64) -> f64 {
    let entry = position.entry_price.to_f64();
    let denom = match position.side {
        Side::Long => entry - liquidation_price_f64,
        Side::Short => liquidation_price_f64 - entry,
    };
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    let numer = match position.side {
        Side::Long => exit_price_f64 - liquidation_price_f64,
        Side::Short => liquidation_price_f64 - exit_price_f64,
    };
    (numer / denom).max(0.0)
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    account_manager: Arc<AccountManager>,
    position_manager: Arc<PositionManager>,
    warnings: Arc<WarningTracker>,
    maintenance_margin_rate: f64,
    persistence: Arc<PersistenceQueue>,
    audit: Arc<AuditLog>,
    mut price_ticks: broadcast::Receiver<PriceRecord>,
    closed_tx: broadcast::Sender<TradeRecord>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("liquidation engine shutting down");
                break;
            }
            tick = price_ticks.recv() => {
                let Ok(record) = tick else { continue };
                if record.is_stale(chrono::Utc::now()) {
                    continue;
                }
                handle_tick(&account_manager, &position_manager, &warnings, maintenance_margin_rate, &persistence, &audit, &closed_tx, &record).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_tick(
    account_manager: &AccountManager,
    position_manager: &PositionManager,
    warnings: &WarningTracker,
    maintenance_margin_rate: f64,
    persistence: &PersistenceQueue,
    audit: &AuditLog,
    closed_tx: &broadcast::Sender<TradeRecord>,
    record: &PriceRecord,
) {
    for position in position_manager.by_symbol(&record.symbol) {
        let liquidation_price = position.liquidation_price(maintenance_margin_rate);
        let exit_price = match position.side {
            Side::Long => record.internal_bid,
            Side::Short => record.internal_ask,
        };

        let distance = normalized_distance(&position, exit_price.to_f64(), liquidation_price.to_f64());
        if distance < 0.5 {
            if warnings.mark_and_check(position.id) {
                tracing::warn!(position_id = %position.id, distance, "position nearing liquidation");
            }
        } else {
            warnings.clear(position.id);
        }

        let should_liquidate = match position.side {
            Side::Long => exit_price <= liquidation_price,
            Side::Short => exit_price >= liquidation_price,
        };
        if !should_liquidate {
            continue;
        }

        let Ok(mut account) = account_manager.lock(position.account_id).await else {
            continue;
        };
        let result = close_position(
            &mut account,
            position_manager,
            CloseInput {
                position_id: position.id,
                close_price: exit_price,
                close_reason: CloseReason::Liquidation,
                external_reference_price: Some(record.external_mid),
                close_quantity: None,
                now: chrono::Utc::now(),
            },
        );
        match result {
            Ok(outcome) => {
                warnings.clear(position.id);
                tracing::warn!(
                    position_id = %position.id,
                    net_pnl = %outcome.net_pnl,
                    "position liquidated"
                );
                persistence.enqueue(PersistenceTask::UpsertAccount(outcome.account_after.clone()));
                persistence.enqueue(PersistenceTask::InsertTrade(outcome.trade.clone()));
                match &outcome.position_after {
                    Some(remaining) => persistence.enqueue(PersistenceTask::UpsertPosition(remaining.clone())),
                    None => persistence.enqueue(PersistenceTask::DeletePosition(position.id)),
                }
                let audit_event = audit.record(
                    Some(outcome.account_after.id),
                    AuditEventType::LiquidationTriggered,
                    &outcome.trade,
                    chrono::Utc::now(),
                );
                persistence.enqueue(PersistenceTask::InsertAuditLog(audit_event));
                let _ = closed_tx.send(outcome.trade);
            }
            Err(err) => {
                tracing::error!(position_id = %position.id, error = %err, "liquidation close attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::ids::{AccountId, PositionId};
    use chrono::Utc;

    fn sample_long_position() -> Position {
        Position {
            id: PositionId::new(),
            account_id: AccountId::new(),
            symbol: "ETH-USD".into(),
            side: Side::Long,
            quantity: Amount::from_f64(1.0),
            entry_price: Amount::from_f64(2_000.0),
            leverage: 20,
            margin_reserved: Amount::from_f64(100.0),
            entry_fee: Amount::from_f64(1.0),
            take_profit: None,
            stop_loss: None,
            unrealised_pnl: Amount::ZERO,
            opened_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn normalized_distance_is_one_far_from_liquidation() {
        let position = sample_long_position();
        let distance = normalized_distance(&position, 2_000.0, 1_908.0);
        assert!((distance - 1.0).abs() < 0.01);
    }

    #[test]
    fn normalized_distance_is_zero_at_liquidation() {
        let position = sample_long_position();
        let distance = normalized_distance(&position, 1_908.0, 1_908.0);
        assert!(distance.abs() < 1e-9);
    }

    #[test]
    fn warning_tracker_fires_only_once() {
        let tracker = WarningTracker::new();
        let id = PositionId::new();
        assert!(tracker.mark_and_check(id));
        assert!(!tracker.mark_and_check(id));
        tracker.clear(id);
        assert!(tracker.mark_and_check(id));
    }
}
