use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of indivisible units in one whole coin.
pub const UNITS_PER_COIN: u64 = 1_000_000_000;

const FRACTION_DIGITS: usize = 9;

/// Bookkeeping amount held as an integer count of 10^-9 coin units.
///
/// Integer representation keeps store-side increments exact: three joins at
/// `0.005` always sum to exactly `0.015`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_units(units: u64) -> Self {
        Self(units)
    }

    pub const fn units(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_mul(self, factor: u64) -> Option<Amount> {
        self.0.checked_mul(factor).map(Amount)
    }

    /// Units as a signed delta for store increments.
    pub fn as_delta(self) -> Option<i64> {
        i64::try_from(self.0).ok()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountParseError {
    #[error("empty amount")]
    Empty,
    #[error("invalid digit in amount '{0}'")]
    InvalidDigit(String),
    #[error("amount '{0}' has more than 9 fractional digits")]
    TooPrecise(String),
    #[error("amount '{0}' overflows")]
    Overflow(String),
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountParseError::Empty);
        }

        let (whole, fraction) = match s.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (s, ""),
        };

        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction) {
            return Err(AmountParseError::InvalidDigit(s.to_string()));
        }
        if fraction.len() > FRACTION_DIGITS {
            return Err(AmountParseError::TooPrecise(s.to_string()));
        }

        let whole_units = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u64>()
                .map_err(|_| AmountParseError::Overflow(s.to_string()))?
        };
        let fraction_units = if fraction.is_empty() {
            0
        } else {
            // right-pad to 9 digits: "005" -> "005000000"
            format!("{:0<width$}", fraction, width = FRACTION_DIGITS)
                .parse::<u64>()
                .map_err(|_| AmountParseError::InvalidDigit(s.to_string()))?
        };

        whole_units
            .checked_mul(UNITS_PER_COIN)
            .and_then(|units| units.checked_add(fraction_units))
            .map(Amount)
            .ok_or_else(|| AmountParseError::Overflow(s.to_string()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNITS_PER_COIN;
        let fraction = format!("{:0width$}", self.0 % UNITS_PER_COIN, width = FRACTION_DIGITS);
        let trimmed = fraction.trim_end_matches('0');
        if trimmed.is_empty() {
            write!(f, "{}.0", whole)
        } else {
            write!(f, "{}.{}", whole, trimmed)
        }
    }
}
