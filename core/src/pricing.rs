// tessera/src/pricing.rs

//! Reservation totals from line items.
//!
//! All amounts are integers in the currency's minor unit. Percentages are
//! applied with half-up rounding to the minor unit. Whatever the VAT mode, the
//! result satisfies `final = src - discount + vat`, with `src` and `discount`
//! expressed net of VAT.

use crate::error::{CoreError, CoreResult};
use crate::model::{Currency, TotalPrice, VatStatus};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
  Ticket,
  AdditionalService,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
  pub kind: LineItemKind,
  /// Listed unit price, VAT included or not according to the VAT status.
  pub unit_price_cts: i64,
  pub quantity: i64,
  /// Overrides the context VAT rate for this line.
  pub vat_percentage: Option<Decimal>,
}

impl LineItem {
  pub fn ticket(unit_price_cts: i64, quantity: i64) -> Self {
    LineItem {
      kind: LineItemKind::Ticket,
      unit_price_cts,
      quantity,
      vat_percentage: None,
    }
  }

  pub fn service(unit_price_cts: i64, quantity: i64) -> Self {
    LineItem {
      kind: LineItemKind::AdditionalService,
      unit_price_cts,
      quantity,
      vat_percentage: None,
    }
  }

  /// Promo codes reduce ticket prices only.
  pub fn is_discountable(&self) -> bool {
    self.kind == LineItemKind::Ticket
  }

  fn listed_cts(&self) -> CoreResult<i64> {
    self.unit_price_cts.checked_mul(self.quantity).ok_or_else(overflow)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Discount {
  /// e.g. `10` for ten percent.
  Percentage(Decimal),
  FixedPerTicket(i64),
  FixedPerReservation(i64),
}

#[derive(Debug, Clone)]
pub struct PriceInput {
  pub items: Vec<LineItem>,
  pub discount: Option<Discount>,
  pub vat_status: VatStatus,
  pub vat_percentage: Decimal,
  pub currency: Currency,
  /// Reverse charge: the buyer accounts for VAT.
  pub vat_exempt: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PriceCalculator;

fn overflow() -> CoreError {
  CoreError::validation("items", "error.price.overflow")
}

fn add(a: i64, b: i64) -> CoreResult<i64> {
  a.checked_add(b).ok_or_else(overflow)
}

fn sub(a: i64, b: i64) -> CoreResult<i64> {
  a.checked_sub(b).ok_or_else(overflow)
}

/// Half-up rounding to an integer number of minor units.
pub fn round_half_up(value: Decimal) -> CoreResult<i64> {
  value
    .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
    .to_i64()
    .ok_or_else(overflow)
}

/// `amount * numerator / denominator`, rounded half-up.
fn scaled(amount_cts: i64, numerator: Decimal, denominator: Decimal) -> CoreResult<i64> {
  let value = Decimal::from(amount_cts)
    .checked_mul(numerator)
    .and_then(|v| v.checked_div(denominator))
    .ok_or_else(overflow)?;
  round_half_up(value)
}

pub(crate) fn percentage_of(amount_cts: i64, percentage: Decimal) -> CoreResult<i64> {
  scaled(amount_cts, percentage, Decimal::ONE_HUNDRED)
}

/// VAT contained in a VAT-inclusive amount.
fn extract_vat(gross_cts: i64, percentage: Decimal) -> CoreResult<i64> {
  if percentage.is_zero() {
    return Ok(0);
  }
  let denominator = Decimal::ONE_HUNDRED.checked_add(percentage).ok_or_else(overflow)?;
  scaled(gross_cts, percentage, denominator)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct LineTotals {
  src: i64,
  discount: i64,
  vat: i64,
  final_price: i64,
}

impl PriceCalculator {
  pub fn new() -> Self {
    PriceCalculator
  }

  pub fn calculate(&self, input: &PriceInput) -> CoreResult<TotalPrice> {
    validate(input)?;

    let nominal = input.vat_status;
    let exempt = input.vat_exempt || nominal.is_exempt();
    let effective_status = if exempt { nominal.to_exempt() } else { nominal };

    let discounts = allocate_discounts(&input.items, input.discount.as_ref())?;

    let mut totals = LineTotals::default();
    for (item, line_discount) in input.items.iter().zip(discounts) {
      let rate = if nominal == VatStatus::None {
        Decimal::ZERO
      } else {
        item.vat_percentage.unwrap_or(input.vat_percentage)
      };
      let line = line_totals(item.listed_cts()?, line_discount, rate, effective_status)?;
      totals.src = add(totals.src, line.src)?;
      totals.discount = add(totals.discount, line.discount)?;
      totals.vat = add(totals.vat, line.vat)?;
      totals.final_price = add(totals.final_price, line.final_price)?;
    }

    let total = TotalPrice {
      src_price_cts: totals.src,
      discount_cts: totals.discount,
      vat_cts: totals.vat,
      final_price_cts: totals.final_price,
      vat_status: effective_status,
      currency: input.currency.clone(),
    };
    debug_assert!(total.is_consistent());
    Ok(total)
  }
}

fn validate(input: &PriceInput) -> CoreResult<()> {
  if input.vat_percentage.is_sign_negative() {
    return Err(CoreError::validation("vat_percentage", "error.vat.negative"));
  }
  for item in &input.items {
    if item.quantity < 0 || item.unit_price_cts < 0 {
      return Err(CoreError::validation("items", "error.price.negative"));
    }
  }
  match &input.discount {
    Some(Discount::Percentage(p)) if p.is_sign_negative() || *p > Decimal::ONE_HUNDRED => {
      Err(CoreError::validation("discount", "error.discount.out_of_range"))
    }
    Some(Discount::FixedPerTicket(a)) | Some(Discount::FixedPerReservation(a)) if *a < 0 => {
      Err(CoreError::validation("discount", "error.discount.out_of_range"))
    }
    _ => Ok(()),
  }
}

/// Discount per line, on listed prices, never exceeding the line amount.
fn allocate_discounts(items: &[LineItem], discount: Option<&Discount>) -> CoreResult<Vec<i64>> {
  let Some(discount) = discount else {
    return Ok(vec![0; items.len()]);
  };
  match discount {
    Discount::Percentage(p) => items
      .iter()
      .map(|i| if i.is_discountable() { percentage_of(i.listed_cts()?, *p) } else { Ok(0) })
      .collect(),
    Discount::FixedPerTicket(amount) => items
      .iter()
      .map(|i| {
        if i.is_discountable() {
          (*amount).min(i.unit_price_cts).checked_mul(i.quantity).ok_or_else(overflow)
        } else {
          Ok(0)
        }
      })
      .collect(),
    Discount::FixedPerReservation(amount) => {
      let mut discountable = 0i64;
      for item in items.iter().filter(|i| i.is_discountable()) {
        discountable = add(discountable, item.listed_cts()?)?;
      }
      let total = (*amount).min(discountable);
      if total == 0 {
        return Ok(vec![0; items.len()]);
      }
      // Proportional split; the last discountable line absorbs the rounding rest.
      let last = items.iter().rposition(LineItem::is_discountable);
      let mut remaining = total;
      items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
          if !item.is_discountable() {
            return Ok(0);
          }
          if Some(idx) == last {
            return Ok(remaining);
          }
          let share = scaled(total, Decimal::from(item.listed_cts()?), Decimal::from(discountable))?.min(remaining);
          remaining -= share;
          Ok(share)
        })
        .collect()
    }
  }
}

fn line_totals(listed: i64, discount: i64, rate: Decimal, status: VatStatus) -> CoreResult<LineTotals> {
  let payable_listed = sub(listed, discount)?;
  let totals = match status {
    VatStatus::None | VatStatus::NotIncludedExempt => LineTotals {
      src: listed,
      discount,
      vat: 0,
      final_price: payable_listed,
    },
    VatStatus::NotIncluded => {
      let vat = percentage_of(payable_listed, rate)?;
      LineTotals {
        src: listed,
        discount,
        vat,
        final_price: add(payable_listed, vat)?,
      }
    }
    VatStatus::Included | VatStatus::IncludedExempt => {
      let src = sub(listed, extract_vat(listed, rate)?)?;
      let vat = extract_vat(payable_listed, rate)?;
      let net_payable = sub(payable_listed, vat)?;
      let discount = sub(src, net_payable)?;
      if status == VatStatus::Included {
        LineTotals {
          src,
          discount,
          vat,
          final_price: payable_listed,
        }
      } else {
        // Exempt buyers pay the net price.
        LineTotals {
          src,
          discount,
          vat: 0,
          final_price: net_payable,
        }
      }
    }
  };
  Ok(totals)
}

#[cfg(test)]
mod tests {
  use super::*;
  fn input(status: VatStatus, items: Vec<LineItem>, discount: Option<Discount>) -> PriceInput {
    PriceInput {
      items,
      discount,
      vat_status: status,
      vat_percentage: Decimal::new(77, 1),
      currency: Currency::new("CHF"),
      vat_exempt: false,
    }
  }

  #[test]
  fn not_included_adds_vat_on_top() {
    let total = PriceCalculator
      .calculate(&input(VatStatus::NotIncluded, vec![LineItem::ticket(1000, 2)], None))
      .unwrap();
    assert_eq!(total.src_price_cts, 2000);
    assert_eq!(total.vat_cts, 154);
    assert_eq!(total.final_price_cts, 2154);
  }

  #[test]
  fn included_extracts_vat() {
    let total = PriceCalculator
      .calculate(&input(VatStatus::Included, vec![LineItem::ticket(1077, 1)], None))
      .unwrap();
    assert_eq!(total.vat_cts, 77);
    assert_eq!(total.src_price_cts, 1000);
    assert_eq!(total.final_price_cts, 1077);
    assert!(total.is_consistent());
  }

  #[test]
  fn services_are_not_discounted() {
    let total = PriceCalculator
      .calculate(&input(
        VatStatus::None,
        vec![LineItem::ticket(1000, 1), LineItem::service(500, 1)],
        Some(Discount::Percentage(Decimal::from(50))),
      ))
      .unwrap();
    assert_eq!(total.discount_cts, 500);
    assert_eq!(total.final_price_cts, 1000);
  }
}
