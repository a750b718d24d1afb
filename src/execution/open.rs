//! Order Executor — §4.6.1.

use super::{OrderRequest, OrderType, PlanLimits, FEE_BPS};
use crate::account::{AccountState, AccountStatus};
use crate::amount::{notional, Amount};
use crate::error::{EngineError, EngineResult};
use crate::ids::{OrderId, PositionId};
use crate::order::{OrderStatus, PendingOrder};
use crate::position::{Position, PositionManager, Side};
use crate::price::PriceRecord;
use chrono::{DateTime, Utc};
use std::time::Instant;

pub struct OpenInput<'a> {
    pub request: &'a OrderRequest,
    pub plan: PlanLimits,
    pub price: &'a PriceRecord,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OpenOutcome {
    pub position: Position,
    pub account_after: AccountState,
    pub exec_price: Amount,
    pub elapsed_ms: f64,
}

/// Execute the eight-step open algorithm under the account's slot. The
/// caller already holds that slot; this function never acquires one itself.
pub fn open_position(
    account: &mut AccountState,
    positions: &PositionManager,
    input: OpenInput<'_>,
) -> EngineResult<OpenOutcome> {
    let started = Instant::now();
    let OpenInput { request, plan, price, now } = input;

    // Step 1: price freshness and limit-readiness.
    if price.is_stale(now) {
        return Err(EngineError::PriceStale {
            symbol: request.symbol.clone(),
            age_ms: price.age_ms(now),
        });
    }
    if request.order_type == OrderType::Limit {
        let limit_price = request
            .limit_price
            .ok_or_else(|| EngineError::internal("limit order missing limit price"))?;
        let reached = match request.side {
            Side::Long => price.internal_ask <= limit_price,
            Side::Short => price.internal_bid >= limit_price,
        };
        if !reached {
            return Err(EngineError::LimitPriceNotMet {
                order_id: OrderId::new(),
            });
        }
    }

    // Step 2: execution price.
    let exec_price = match request.side {
        Side::Long => price.internal_ask,
        Side::Short => price.internal_bid,
    };

    // Step 3: account eligibility.
    if account.id != request.account_id {
        return Err(EngineError::internal("account/request mismatch"));
    }
    if account.owner_id != request.owner_id {
        return Err(EngineError::Unauthorized {
            account_id: account.id,
        });
    }
    if !account.is_active() {
        return Err(EngineError::AccountInactive {
            account_id: account.id,
            status: format!("{:?}", account.status),
        });
    }
    if account.status == AccountStatus::Suspended || account.status == AccountStatus::Liquidated {
        return Err(EngineError::AccountInactive {
            account_id: account.id,
            status: format!("{:?}", account.status),
        });
    }

    // Step 4: notional, leverage, margin, fee.
    let effective_leverage = request.requested_leverage.min(plan.max_leverage).max(1);
    let entry_value = notional(request.quantity, exec_price);
    let margin_required = entry_value / effective_leverage as i128;
    let entry_fee = entry_value.bps(FEE_BPS);

    // Step 5: margin sufficiency.
    if margin_required + entry_fee > account.available_margin {
        return Err(EngineError::InsufficientMargin {
            required: (margin_required + entry_fee).to_f64(),
            available: account.available_margin.to_f64(),
        });
    }

    // Step 6: liquidation price.
    let liquidation_price = liquidation_price_at_open(
        exec_price,
        effective_leverage,
        request.side,
        plan.maintenance_margin_rate,
    );

    // Step 7: build position, insert, patch account.
    let position = Position {
        id: PositionId::new(),
        account_id: account.id,
        symbol: request.symbol.clone(),
        side: request.side,
        quantity: request.quantity,
        entry_price: exec_price,
        leverage: effective_leverage,
        margin_reserved: margin_required,
        entry_fee,
        take_profit: request.take_profit,
        stop_loss: request.stop_loss,
        unrealised_pnl: Amount::ZERO,
        opened_at: now,
        updated_at: now,
    };
    debug_assert!(match request.side {
        Side::Long => liquidation_price < exec_price,
        Side::Short => liquidation_price > exec_price,
    });

    positions.insert(position.clone());

    account.available_margin = (account.available_margin - margin_required - entry_fee).non_negative();
    account.used_margin += margin_required;
    account.current_balance -= entry_fee;
    account.open_position_count += 1;
    account.total_trades += 1;
    account.recompute(positions.account_unrealised_pnl(account.id));

    Ok(OpenOutcome {
        position,
        account_after: account.clone(),
        exec_price,
        elapsed_ms: started.elapsed().as_secs_f64() * 1_000.0,
    })
}

/// `entry * (1 - 1/leverage + maintenance_margin)` for LONG, mirrored for
/// SHORT — the §9-resolved liquidation-price formula, computed once at open
/// time and stored on the position (it is not recomputed live).
pub fn liquidation_price_at_open(
    entry_price: Amount,
    leverage: u32,
    side: Side,
    maintenance_margin_rate: f64,
) -> Amount {
    let entry = entry_price.to_f64();
    let inv_leverage = 1.0 / leverage.max(1) as f64;
    let price = match side {
        Side::Long => entry * (1.0 - inv_leverage + maintenance_margin_rate),
        Side::Short => entry * (1.0 + inv_leverage - maintenance_margin_rate),
    };
    Amount::from_f64(price.max(0.0))
}

/// Reserve margin for a LIMIT order that isn't immediately fillable and park
/// it on the Order Manager instead of opening a position. Called by the
/// gateway's `PLACE_ORDER` handler when [`open_position`] rejects with
/// [`EngineError::LimitPriceNotMet`].
pub fn reserve_pending_order(
    account: &mut AccountState,
    request: &OrderRequest,
    plan: PlanLimits,
    now: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
) -> EngineResult<PendingOrder> {
    let limit_price = request
        .limit_price
        .ok_or_else(|| EngineError::internal("limit order missing limit price"))?;

    if !account.is_active() {
        return Err(EngineError::AccountInactive {
            account_id: account.id,
            status: format!("{:?}", account.status),
        });
    }

    let effective_leverage = request.requested_leverage.min(plan.max_leverage).max(1);
    let entry_value = notional(request.quantity, limit_price);
    let margin_required = entry_value / effective_leverage as i128;

    if margin_required > account.available_margin {
        return Err(EngineError::InsufficientMargin {
            required: margin_required.to_f64(),
            available: account.available_margin.to_f64(),
        });
    }

    account.available_margin -= margin_required;
    account.dirty = true;
    account.updated_at = now;

    Ok(PendingOrder {
        id: OrderId::new(),
        account_id: account.id,
        symbol: request.symbol.clone(),
        side: request.side,
        quantity: request.quantity,
        limit_price,
        leverage: effective_leverage,
        client_order_id: request.client_order_id.clone(),
        margin_reserved: margin_required,
        status: OrderStatus::Resting,
        created_at: now,
        expires_at,
    })
}

/// Release a cancelled or expired order's reserved margin back to the
/// account. Caller already holds the account slot and has removed the order
/// from the Order Manager.
pub fn release_reserved_margin(account: &mut AccountState, order: &PendingOrder) {
    account.available_margin += order.margin_reserved;
    account.dirty = true;
    account.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountState;
    use crate::ids::{AccountId, OwnerId};
    use crate::price::PriceRecord;

    fn sample_account() -> AccountState {
        AccountState::new(
            AccountId::new(),
            OwnerId::new(),
            crate::account::AccountType::Evaluation,
            Amount::from_f64(10_000.0),
            Amount::from_f64(400.0),
            Amount::from_f64(1_000.0),
        )
    }

    fn sample_price(internal_bid: f64, internal_ask: f64, when: DateTime<Utc>) -> PriceRecord {
        PriceRecord {
            symbol: "BTC-USD".into(),
            external_bid: Amount::from_f64(internal_bid),
            external_ask: Amount::from_f64(internal_ask),
            external_mid: Amount::from_f64((internal_bid + internal_ask) / 2.0),
            internal_bid: Amount::from_f64(internal_bid),
            internal_ask: Amount::from_f64(internal_ask),
            change_24h_pct: 0.0,
            high_24h: Amount::from_f64(internal_ask),
            low_24h: Amount::from_f64(internal_bid),
            volume_24h: Amount::ZERO,
            funding_rate: 0.0,
            timestamp: when,
        }
    }

    #[test]
    fn scenario_1_open_matches_pinned_figures() {
        let mut account = sample_account();
        let account_id = account.id;
        let owner_id = account.owner_id;
        let now = Utc::now();
        let price = sample_price(29_997.0, 30_000.0, now);
        let positions = PositionManager::new();

        let request = OrderRequest {
            owner_id,
            account_id,
            symbol: "BTC-USD".into(),
            side: Side::Long,
            order_type: OrderType::Market,
            quantity: Amount::from_f64(0.1),
            requested_leverage: 10,
            limit_price: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        };

        let outcome = open_position(
            &mut account,
            &positions,
            OpenInput { request: &request, plan: PlanLimits::default(), price: &price, now },
        )
        .unwrap();

        assert!((outcome.position.margin_reserved.to_f64() - 300.0).abs() < 1e-6);
        assert!((outcome.position.entry_fee.to_f64() - 1.5).abs() < 1e-6);
        assert!((account.available_margin.to_f64() - 9_698.5).abs() < 1e-6);
        assert!((account.used_margin.to_f64() - 300.0).abs() < 1e-6);
        assert!((account.current_balance.to_f64() - 9_998.5).abs() < 1e-6);
    }

    #[test]
    fn stale_price_rejects_open() {
        let mut account = sample_account();
        let positions = PositionManager::new();
        let now = Utc::now();
        let stale_price = sample_price(29_997.0, 30_000.0, now - chrono::Duration::seconds(6));

        let request = OrderRequest {
            owner_id: account.owner_id,
            account_id: account.id,
            symbol: "BTC-USD".into(),
            side: Side::Long,
            order_type: OrderType::Market,
            quantity: Amount::from_f64(0.1),
            requested_leverage: 10,
            limit_price: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        };

        let result = open_position(
            &mut account,
            &positions,
            OpenInput { request: &request, plan: PlanLimits::default(), price: &stale_price, now },
        );
        assert!(matches!(result, Err(EngineError::PriceStale { .. })));
    }

    #[test]
    fn insufficient_margin_rejects_open() {
        let mut account = sample_account();
        account.available_margin = Amount::from_f64(10.0);
        let positions = PositionManager::new();
        let now = Utc::now();
        let price = sample_price(29_997.0, 30_000.0, now);

        let request = OrderRequest {
            owner_id: account.owner_id,
            account_id: account.id,
            symbol: "BTC-USD".into(),
            side: Side::Long,
            order_type: OrderType::Market,
            quantity: Amount::from_f64(0.1),
            requested_leverage: 10,
            limit_price: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        };

        let result = open_position(
            &mut account,
            &positions,
            OpenInput { request: &request, plan: PlanLimits::default(), price: &price, now },
        );
        assert!(matches!(result, Err(EngineError::InsufficientMargin { .. })));
    }

    #[test]
    fn liquidation_price_formula_matches_scenario_2() {
        let liq = liquidation_price_at_open(Amount::from_f64(2_000.0), 20, Side::Long, 0.004);
        assert!((liq.to_f64() - 1_908.0).abs() < 1.0);
    }

    #[test]
    fn unmet_limit_price_is_rejected_not_parked() {
        let mut account = sample_account();
        let positions = PositionManager::new();
        let now = Utc::now();
        let price = sample_price(29_997.0, 30_000.0, now);

        let request = OrderRequest {
            owner_id: account.owner_id,
            account_id: account.id,
            symbol: "BTC-USD".into(),
            side: Side::Long,
            order_type: OrderType::Limit,
            quantity: Amount::from_f64(0.1),
            requested_leverage: 10,
            limit_price: Some(Amount::from_f64(29_000.0)),
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        };

        let result = open_position(
            &mut account,
            &positions,
            OpenInput { request: &request, plan: PlanLimits::default(), price: &price, now },
        );
        assert!(matches!(result, Err(EngineError::LimitPriceNotMet { .. })));
    }
}
