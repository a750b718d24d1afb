//! Close Executor — §4.6.2 and §4.6.3.

use super::{CloseReason, TradeRecord, FEE_BPS};
use crate::account::AccountState;
use crate::amount::{notional, Amount};
use crate::error::{EngineError, EngineResult};
use crate::ids::{PositionId, TradeId};
use crate::position::{Position, PositionManager, Side};
use chrono::{DateTime, Utc};
use std::time::Instant;

pub struct CloseInput {
    pub position_id: PositionId,
    pub close_price: Amount,
    pub close_reason: CloseReason,
    pub external_reference_price: Option<Amount>,
    /// `Some(qty)` for a partial close; `None` closes the position in full.
    pub close_quantity: Option<Amount>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub trade: TradeRecord,
    pub position_after: Option<Position>,
    pub account_after: AccountState,
    pub gross_pnl: Amount,
    pub net_pnl: Amount,
    pub exec_price: Amount,
    pub elapsed_ms: f64,
}

/// Execute the ten-step close algorithm under the account's slot.
pub fn close_position(
    account: &mut AccountState,
    positions: &PositionManager,
    input: CloseInput,
) -> EngineResult<CloseOutcome> {
    let started = Instant::now();

    // Step 1.
    let position = positions
        .get(input.position_id)
        .ok_or(EngineError::PositionNotFound {
            position_id: input.position_id,
        })?;
    if position.account_id != account.id {
        return Err(EngineError::internal("position/account mismatch"));
    }

    // Step 2.
    let full_quantity = position.quantity;
    let qty_closed = match input.close_quantity {
        Some(qty) if qty.to_f64() > 0.0 && qty < full_quantity => qty,
        _ => full_quantity,
    };
    let partial = qty_closed < full_quantity;

    // Step 3: gross P&L.
    let price_diff = match position.side {
        Side::Long => input.close_price - position.entry_price,
        Side::Short => position.entry_price - input.close_price,
    };
    let gross = notional(qty_closed, price_diff);

    // Step 4: exit fee.
    let exit_value = notional(qty_closed, input.close_price);
    let exit_fee = exit_value.bps(FEE_BPS);

    // Step 5: funding portion, proportional to the fraction closed. This
    // engine does not yet accrue funding on open positions (no perpetual
    // funding-settlement loop is wired up), so the field is always zero
    // today; the proportional split is still computed explicitly so the
    // day that loop lands, this function needs no change.
    let accumulated_funding = Amount::ZERO;
    let funding_portion = accumulated_funding.proportion(qty_closed, full_quantity);

    // Step 6: net.
    let net = gross - exit_fee - funding_portion;

    // Step 7: margin released.
    let margin_released = position.margin_reserved.proportion(qty_closed, full_quantity);

    // Step 8: apply to account.
    account.current_balance += net;
    account.available_margin = (account.available_margin + margin_released + net).non_negative();
    account.used_margin = (account.used_margin - margin_released).non_negative();
    account.peak_balance = account.peak_balance.max(account.current_balance);
    account.daily_pnl += net;
    account.current_profit += net;
    if net.to_f64() > 0.0 {
        account.winning_trades += 1;
    } else if net.to_f64() < 0.0 {
        account.losing_trades += 1;
    }
    account.dirty = true;
    account.updated_at = input.now;

    // Step 9: position update.
    let entry_fee_closed = position.entry_fee.proportion(qty_closed, full_quantity);
    let position_after = if partial {
        let remaining_qty = full_quantity - qty_closed;
        let mut remaining = position.clone();
        remaining.quantity = remaining_qty;
        remaining.margin_reserved = position.margin_reserved - margin_released;
        remaining.entry_fee = position.entry_fee - entry_fee_closed;
        remaining.updated_at = input.now;
        positions.update(remaining.clone());
        Some(remaining)
    } else {
        positions.remove(position.id);
        account.open_position_count = account.open_position_count.saturating_sub(1);
        None
    };

    let total_fees = exit_fee + entry_fee_closed;

    let trade = TradeRecord {
        trade_id: TradeId::new(),
        account_id: account.id,
        position_id: position.id,
        symbol: position.symbol.clone(),
        side: position.side,
        quantity_closed: qty_closed,
        leverage: position.leverage,
        entry_price: position.entry_price,
        entry_value: notional(qty_closed, position.entry_price),
        entry_fee: entry_fee_closed,
        exit_price: input.close_price,
        exit_value,
        exit_fee,
        close_reason: input.close_reason,
        funding_fee: funding_portion,
        gross_pnl: gross,
        total_fees,
        net_pnl: net,
        duration_seconds: (input.now - position.opened_at).num_seconds(),
        external_entry_price: None,
        external_exit_price: input.external_reference_price,
        closed_at: input.now,
    };

    Ok(CloseOutcome {
        trade,
        position_after,
        account_after: account.clone(),
        gross_pnl: gross,
        net_pnl: net,
        exec_price: input.close_price,
        elapsed_ms: started.elapsed().as_secs_f64() * 1_000.0,
    })
}

#[derive(Debug, Clone)]
pub struct BatchCloseOutcome {
    pub closed_count: u32,
    pub skipped_stale_count: u32,
    pub total_pnl: Amount,
    pub trades: Vec<TradeRecord>,
}

/// Batch close for breach — §4.6.3. Closes every open position on the
/// account in full, at `reason`, skipping any whose mark price is missing
/// or stale (the trader is protected from a bad exit during a breach event;
/// the position simply stays open for the next attempt).
pub fn batch_close_for_breach(
    account: &mut AccountState,
    positions: &PositionManager,
    reason: CloseReason,
    mark_price_for: impl Fn(&str) -> Option<(Amount, bool)>,
    now: DateTime<Utc>,
) -> BatchCloseOutcome {
    let mut outcome = BatchCloseOutcome {
        closed_count: 0,
        skipped_stale_count: 0,
        total_pnl: Amount::ZERO,
        trades: Vec::new(),
    };

    for position in positions.by_account(account.id) {
        match mark_price_for(&position.symbol) {
            None => {
                outcome.skipped_stale_count += 1;
                continue;
            }
            Some((_, stale)) if stale => {
                outcome.skipped_stale_count += 1;
                continue;
            }
            Some((price, _)) => {
                let result = close_position(
                    account,
                    positions,
                    CloseInput {
                        position_id: position.id,
                        close_price: price,
                        close_reason: reason,
                        external_reference_price: None,
                        close_quantity: None,
                        now,
                    },
                );
                if let Ok(close) = result {
                    outcome.closed_count += 1;
                    outcome.total_pnl += close.net_pnl;
                    outcome.trades.push(close.trade);
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountState, AccountType};
    use crate::ids::{AccountId, OwnerId};

    fn opened_account_with_position() -> (AccountState, PositionManager, PositionId) {
        let account_id = AccountId::new();
        let mut account = AccountState::new(
            account_id,
            OwnerId::new(),
            AccountType::Evaluation,
            Amount::from_f64(10_000.0),
            Amount::from_f64(400.0),
            Amount::from_f64(1_000.0),
        );
        account.current_balance = Amount::from_f64(9_998.5);
        account.available_margin = Amount::from_f64(9_698.5);
        account.used_margin = Amount::from_f64(300.0);
        account.open_position_count = 1;

        let positions = PositionManager::new();
        let position = Position {
            id: PositionId::new(),
            account_id,
            symbol: "BTC-USD".into(),
            side: Side::Long,
            quantity: Amount::from_f64(0.1),
            entry_price: Amount::from_f64(30_000.0),
            leverage: 10,
            margin_reserved: Amount::from_f64(300.0),
            entry_fee: Amount::from_f64(1.5),
            take_profit: None,
            stop_loss: None,
            unrealised_pnl: Amount::ZERO,
            opened_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let id = position.id;
        positions.insert(position);
        (account, positions, id)
    }

    #[test]
    fn scenario_1_full_close_matches_pinned_figures() {
        let (mut account, positions, position_id) = opened_account_with_position();

        let outcome = close_position(
            &mut account,
            &positions,
            CloseInput {
                position_id,
                close_price: Amount::from_f64(30_300.0),
                close_reason: CloseReason::Manual,
                external_reference_price: None,
                close_quantity: None,
                now: Utc::now(),
            },
        )
        .unwrap();

        assert!((outcome.gross_pnl.to_f64() - 30.0).abs() < 1e-6);
        assert!((outcome.trade.exit_fee.to_f64() - 1.515).abs() < 1e-6);
        assert!((outcome.net_pnl.to_f64() - 28.485).abs() < 1e-6);
        assert!((account.current_balance.to_f64() - 10_026.985).abs() < 1e-6);
        assert!((account.available_margin.to_f64() - 10_026.985).abs() < 1e-6);
        assert!(account.used_margin.is_zero());
        assert!(positions.get(position_id).is_none());
    }

    #[test]
    fn open_then_immediate_close_at_same_price_loses_only_fees() {
        let (mut account, positions, position_id) = opened_account_with_position();

        let outcome = close_position(
            &mut account,
            &positions,
            CloseInput {
                position_id,
                close_price: Amount::from_f64(30_000.0),
                close_reason: CloseReason::Manual,
                external_reference_price: None,
                close_quantity: None,
                now: Utc::now(),
            },
        )
        .unwrap();

        let expected_net = -(Amount::from_f64(1.5) + outcome.trade.exit_fee);
        assert!((outcome.net_pnl.to_f64() - expected_net.to_f64()).abs() < 1e-6);
    }

    #[test]
    fn partial_close_scales_position_proportionally() {
        let (mut account, positions, position_id) = opened_account_with_position();

        let outcome = close_position(
            &mut account,
            &positions,
            CloseInput {
                position_id,
                close_price: Amount::from_f64(30_300.0),
                close_reason: CloseReason::Manual,
                external_reference_price: None,
                close_quantity: Some(Amount::from_f64(0.05)),
                now: Utc::now(),
            },
        )
        .unwrap();

        let remaining = outcome.position_after.expect("partial close leaves a position");
        assert!((remaining.quantity.to_f64() - 0.05).abs() < 1e-9);
        assert!((remaining.margin_reserved.to_f64() - 150.0).abs() < 1e-6);
        assert!((remaining.entry_fee.to_f64() - 0.75).abs() < 1e-6);
        assert!(positions.get(position_id).is_some());
    }

    #[test]
    fn n_partial_closes_match_one_full_close_at_average_price() {
        let (mut partial_account, partial_positions, partial_id) = opened_account_with_position();
        let (mut full_account, full_positions, full_id) = opened_account_with_position();

        // Two partial closes of 0.05 each at the same price as one full
        // close of 0.1 — no funding accrual, equal fee rate either way.
        for _ in 0..2 {
            close_position(
                &mut partial_account,
                &partial_positions,
                CloseInput {
                    position_id: partial_id,
                    close_price: Amount::from_f64(30_300.0),
                    close_reason: CloseReason::Manual,
                    external_reference_price: None,
                    close_quantity: Some(Amount::from_f64(0.05)),
                    now: Utc::now(),
                },
            )
            .unwrap();
        }

        close_position(
            &mut full_account,
            &full_positions,
            CloseInput {
                position_id: full_id,
                close_price: Amount::from_f64(30_300.0),
                close_reason: CloseReason::Manual,
                external_reference_price: None,
                close_quantity: None,
                now: Utc::now(),
            },
        )
        .unwrap();

        assert!((partial_account.current_balance.to_f64() - full_account.current_balance.to_f64()).abs() < 1e-6);
        assert!(partial_account.used_margin.is_zero());
        assert!(full_account.used_margin.is_zero());
    }

    #[test]
    fn close_on_unknown_position_errors() {
        let (mut account, positions, _) = opened_account_with_position();
        let result = close_position(
            &mut account,
            &positions,
            CloseInput {
                position_id: PositionId::new(),
                close_price: Amount::from_f64(30_000.0),
                close_reason: CloseReason::Manual,
                external_reference_price: None,
                close_quantity: None,
                now: Utc::now(),
            },
        );
        assert!(matches!(result, Err(EngineError::PositionNotFound { .. })));
    }

    #[test]
    fn batch_close_skips_stale_and_missing_prices() {
        let (mut account, positions, _) = opened_account_with_position();

        let outcome = batch_close_for_breach(
            &mut account,
            &positions,
            CloseReason::Breach,
            |_symbol| Some((Amount::from_f64(30_300.0), true)),
            Utc::now(),
        );

        assert_eq!(outcome.closed_count, 0);
        assert_eq!(outcome.skipped_stale_count, 1);
        assert!(positions.by_account(account.id).len() == 1);
    }

    #[test]
    fn batch_close_closes_fresh_priced_positions() {
        let (mut account, positions, _) = opened_account_with_position();

        let outcome = batch_close_for_breach(
            &mut account,
            &positions,
            CloseReason::Breach,
            |_symbol| Some((Amount::from_f64(30_300.0), false)),
            Utc::now(),
        );

        assert_eq!(outcome.closed_count, 1);
        assert_eq!(outcome.skipped_stale_count, 0);
        assert!(positions.by_account(account.id).is_empty());
    }
}
