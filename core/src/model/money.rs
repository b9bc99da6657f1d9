// tessera/src/model/money.rs

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// ISO-4217 currency code. Amounts everywhere else are integers in the
/// currency's minor unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
  pub fn new(code: impl AsRef<str>) -> Self {
    Currency(code.as_ref().trim().to_ascii_uppercase())
  }

  pub fn code(&self) -> &str {
    &self.0
  }

  pub fn minor_unit_digits(&self) -> u32 {
    minor_unit_digits(&self.0)
  }

  /// Converts a major-unit decimal (`12.50`) into minor units (`1250`),
  /// rounding half-up at the currency's precision.
  pub fn to_minor_units(&self, amount: Decimal) -> i64 {
    let scaled = amount * Decimal::from(10_i64.pow(self.minor_unit_digits()));
    let rounded = scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    rounded.to_i64().unwrap_or(if rounded.is_sign_negative() { i64::MIN } else { i64::MAX })
  }

  pub fn to_major_units(&self, amount_cts: i64) -> Decimal {
    Decimal::new(amount_cts, self.minor_unit_digits())
  }

  /// `"12.50 CHF"`
  pub fn format(&self, amount_cts: i64) -> String {
    format!("{} {}", self.to_major_units(amount_cts), self.0)
  }
}

impl std::fmt::Display for Currency {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

pub fn minor_unit_digits(code: &str) -> u32 {
  match code {
    "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "UGX" | "UYI" | "VND" | "VUV"
    | "XAF" | "XOF" | "XPF" => 0,
    "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
    _ => 2,
  }
}
