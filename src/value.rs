//! Exact decimal amounts tagged with a currency unit.
//!
//! Every monetary and BPS computation in the crate goes through `Value`.
//! Division truncates toward zero at wei precision (18 dp), which for the
//! non-negative amounts we deal in is a floor.

use num_bigint::BigUint;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 10_000 BPS = 100%
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Native EVM assets (and their wrapped ERC-20 forms) use 18 decimals.
pub const NATIVE_DECIMALS: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Eth,
    Matic,
    Usd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Eth => "ETH",
            Currency::Matic => "MATIC",
            Currency::Usd => "USD",
        }
    }

    /// Maps a marketplace price symbol onto a currency. Wrapped forms count as
    /// their native asset.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol.trim().to_ascii_uppercase().as_str() {
            "ETH" | "WETH" => Some(Currency::Eth),
            "MATIC" | "WMATIC" | "POL" => Some(Currency::Matic),
            "USD" | "USDC" => Some(Currency::Usd),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Value {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    /// Sum of two values in the same currency. `None` on currency mismatch or
    /// overflow.
    pub fn checked_add(&self, other: &Value) -> Option<Value> {
        if self.currency != other.currency {
            return None;
        }
        self.amount
            .checked_add(other.amount)
            .map(|amount| Value::new(amount, self.currency))
    }

    /// `amount × bps / 10_000`, floored at wei precision.
    pub fn mul_bps(&self, bps: u32) -> Option<Value> {
        let scaled = self.amount.checked_mul(Decimal::from(bps))?;
        let amount = floor_div(scaled, Decimal::from(BPS_DENOMINATOR))?;
        Some(Value::new(amount, self.currency))
    }

    pub fn min(self, other: Value) -> Value {
        if other.amount < self.amount {
            other
        } else {
            self
        }
    }

    /// Amount in base units (wei for native assets).
    pub fn to_wei(&self) -> Option<BigUint> {
        to_base_units(self.amount, NATIVE_DECIMALS)
    }

    pub fn from_wei(wei: &BigUint, currency: Currency) -> Option<Value> {
        from_base_units(wei, NATIVE_DECIMALS).map(|amount| Value::new(amount, currency))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount.normalize(), self.currency)
    }
}

/// Truncates to wei precision.
pub fn round_down(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(NATIVE_DECIMALS, RoundingStrategy::ToZero)
}

/// Division with the crate-wide rounding rule. `None` on a zero denominator.
pub fn floor_div(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    if denominator.is_zero() {
        return None;
    }
    numerator.checked_div(denominator).map(round_down)
}

/// Converts a decimal amount into integer base units. Precision beyond
/// `decimals` is truncated. Negative amounts have no base-unit form.
pub fn to_base_units(amount: Decimal, decimals: u32) -> Option<BigUint> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return None;
    }
    let mantissa = BigUint::from(amount.mantissa().unsigned_abs());
    let scale = amount.scale();
    let ten = BigUint::from(10u32);
    Some(if scale <= decimals {
        mantissa * ten.pow(decimals - scale)
    } else {
        mantissa / ten.pow(scale - decimals)
    })
}

/// Converts integer base units into a decimal amount. `None` when the value
/// does not fit the decimal mantissa or `decimals` exceeds the supported scale.
pub fn from_base_units(units: &BigUint, decimals: u32) -> Option<Decimal> {
    let raw = i128::try_from(units).ok()?;
    Decimal::try_from_i128_with_scale(raw, decimals)
        .ok()
        .map(|d| d.normalize())
}
