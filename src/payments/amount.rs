// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Exact stablecoin amounts.
//!
//! Amounts are held as integer micro-units (6 decimal places, USDT's on-chain
//! precision) so that "amount equals the expected amount exactly" is an
//! integer comparison. Exchange APIs report up to 8 decimals; digits beyond
//! the sixth must be zero.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Decimal places kept.
pub const SCALE: u32 = 6;
const UNIT: i64 = 10i64.pow(SCALE);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("amount must be a valid non-negative decimal number")]
    Invalid,
    #[error("amount has more than {SCALE} significant decimal places")]
    TooPrecise,
    #[error("amount is too large")]
    Overflow,
}

/// A non-negative amount in micro-units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Whole units, e.g. `Amount::whole(105)` is 105.000000.
    pub const fn whole(units: i64) -> Self {
        Amount(units * UNIT)
    }

    pub const fn from_micros(micros: i64) -> Self {
        Amount(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Parse a decimal string such as `"105"`, `"105.5"` or `"105.00000000"`.
    pub fn parse(value: &str) -> Result<Self, AmountError> {
        let trimmed = value.trim();
        let (whole_part, fraction_part) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };

        if whole_part.is_empty() || !whole_part.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountError::Invalid);
        }
        if !fraction_part.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountError::Invalid);
        }
        if trimmed.ends_with('.') {
            return Err(AmountError::Invalid);
        }

        let significant = fraction_part.trim_end_matches('0');
        if significant.len() > SCALE as usize {
            return Err(AmountError::TooPrecise);
        }

        let whole = whole_part.parse::<i64>().map_err(|_| AmountError::Overflow)?;
        let fraction = if significant.is_empty() {
            0
        } else {
            let padded = format!("{significant:0<width$}", width = SCALE as usize);
            padded.parse::<i64>().map_err(|_| AmountError::Invalid)?
        };

        whole
            .checked_mul(UNIT)
            .and_then(|w| w.checked_add(fraction))
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNIT;
        let fraction = self.0 % UNIT;
        if fraction == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{fraction:0width$}", width = SCALE as usize);
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        let text = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text,
            Raw::Number(number) => number.to_string(),
        };
        Amount::parse(&text).map_err(serde::de::Error::custom)
    }
}
