//! Fixed-point monetary arithmetic.
//!
//! Every quantity that feeds `current_balance` or margin accounting is an
//! `Amount`: an `i128` scaled by [`SCALE`] (10^-8 units, "satoshi-like").
//! `f64` is reserved for display-only statistics that never flow back into
//! the ledger — see the decimal-arithmetic design note in SPEC_FULL.md.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

pub const SCALE: i128 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_raw(raw: i128) -> Self {
        Amount(raw)
    }

    pub fn raw(self) -> i128 {
        self.0
    }

    pub fn from_f64(value: f64) -> Self {
        Amount((value * SCALE as f64).round() as i128)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn max(self, other: Amount) -> Amount {
        Amount(self.0.max(other.0))
    }

    pub fn min(self, other: Amount) -> Amount {
        Amount(self.0.min(other.0))
    }

    /// Clamp to >= 0; used for fields the spec states can never go negative.
    pub fn non_negative(self) -> Amount {
        Amount(self.0.max(0))
    }

    /// `self * numerator / denominator`, rounding to nearest, for proportional
    /// allocation of a field across a partial close.
    pub fn proportion(self, numerator: Amount, denominator: Amount) -> Amount {
        if denominator.0 == 0 {
            return Amount::ZERO;
        }
        // i128 is wide enough that raw*raw does not realistically overflow at
        // the unit scales this engine trades (quantities stay well under 10^12).
        let scaled = self.0 * numerator.0;
        Amount(scaled / denominator.0)
    }

    /// Basis points of `self`, e.g. `amount.bps(5)` for a 5 bps fee.
    pub fn bps(self, bps: i64) -> Amount {
        Amount(self.0 * bps as i128 / 10_000)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.8}", self.to_f64())
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl Neg for Amount {
    type Output = Amount;
    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl Mul<i128> for Amount {
    type Output = Amount;
    fn mul(self, rhs: i128) -> Amount {
        Amount(self.0 * rhs)
    }
}

impl Div<i128> for Amount {
    type Output = Amount;
    fn div(self, rhs: i128) -> Amount {
        Amount(self.0 / rhs)
    }
}

/// `price * quantity`, both scaled `Amount`s, de-scaling once.
pub fn notional(quantity: Amount, price: Amount) -> Amount {
    Amount((quantity.raw() * price.raw()) / SCALE)
}

/// `numerator / denominator` for two `Amount`s, producing a scaled `Amount`
/// (e.g. notional / leverage-as-scaled-amount would be wrong; leverage is a
/// plain integer ratio, so callers divide by `i128` instead via `Div<i128>`).
pub fn ratio(numerator: Amount, denominator: Amount) -> Amount {
    if denominator.is_zero() {
        return Amount::ZERO;
    }
    Amount((numerator.raw() * SCALE) / denominator.raw())
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, Add::add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_f64_round_trips() {
        let a = Amount::from_f64(30_000.0);
        assert_eq!(a.to_f64(), 30_000.0);
    }

    #[test]
    fn notional_multiplies_and_descales() {
        let qty = Amount::from_f64(0.1);
        let price = Amount::from_f64(30_000.0);
        assert!((notional(qty, price).to_f64() - 3_000.0).abs() < 1e-9);
    }

    #[test]
    fn bps_applies_basis_points() {
        let notional = Amount::from_f64(3_000.0);
        let fee = notional.bps(5);
        assert!((fee.to_f64() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn proportion_allocates_partial_amounts() {
        let total = Amount::from_f64(300.0);
        let qty_closed = Amount::from_f64(0.05);
        let qty_total = Amount::from_f64(0.1);
        let allocated = total.proportion(qty_closed, qty_total);
        assert!((allocated.to_f64() - 150.0).abs() < 1e-6);
    }
}
