//! Fixed-point money in nano-units (1e-9 of a currency unit).
//!
//! Provider prices are tiny fractions (a tenth of a cent per page, a few
//! dollars per million tokens), so amounts are carried as integers and only
//! converted to decimals at the edges.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Nano-units per whole currency unit.
pub const NANOS_PER_UNIT: i64 = 1_000_000_000;

/// A non-currency-tagged monetary amount in nano-units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn nanos(self) -> i64 {
        self.0
    }

    /// Converts a decimal price (e.g. `0.001`) to nano-units, rounding to the
    /// nearest nano. Non-finite input maps to zero.
    pub fn from_decimal(value: f64) -> Self {
        if !value.is_finite() {
            return Self::ZERO;
        }
        Self((value * NANOS_PER_UNIT as f64).round() as i64)
    }

    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / NANOS_PER_UNIT as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// `self * units / per`, rounded half away from zero.
    pub fn scaled(self, units: i64, per: i64) -> Self {
        Self(mul_div_round(units, self.0, per))
    }
}

/// Computes `value * multiplier / divisor` with half-up rounding on the
/// absolute value. A zero divisor yields zero.
pub fn mul_div_round(value: i64, multiplier: i64, divisor: i64) -> i64 {
    if divisor == 0 {
        return 0;
    }
    let product = value as i128 * multiplier as i128;
    let divisor = divisor as i128;
    let negative = (product < 0) != (divisor < 0);
    let (abs_product, abs_divisor) = (product.abs(), divisor.abs());
    let quotient = (abs_product + abs_divisor / 2) / abs_divisor;
    let signed = if negative { -quotient } else { quotient };
    signed.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

/// Renders the shortest decimal with at least two fraction digits,
/// e.g. `0.01325`, `1.50`.
impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / NANOS_PER_UNIT as u64;
        let frac = format!("{:09}", abs % NANOS_PER_UNIT as u64);
        let trimmed = frac.trim_end_matches('0');
        let frac = if trimmed.len() < 2 {
            &frac[..2]
        } else {
            trimmed
        };
        write!(f, "{}{}.{}", sign, whole, frac)
    }
}
