// tests/pricing_tests.rs
use rust_decimal::Decimal;
use tessera::model::{Currency, VatStatus};
use tessera::{CoreError, Discount, LineItem, PriceCalculator, PriceInput};

fn input(vat_status: VatStatus, items: Vec<LineItem>, discount: Option<Discount>) -> PriceInput {
  PriceInput {
    items,
    discount,
    vat_status,
    vat_percentage: Decimal::new(77, 1),
    currency: Currency::new("CHF"),
    vat_exempt: false,
  }
}

#[test]
fn test_fixed_reservation_discount_is_split_across_tickets() {
  let total = PriceCalculator::new()
    .calculate(&input(
      VatStatus::None,
      vec![LineItem::ticket(3000, 1), LineItem::ticket(1000, 1), LineItem::service(200, 1)],
      Some(Discount::FixedPerReservation(1000)),
    ))
    .unwrap();
  assert_eq!(total.src_price_cts, 4200);
  assert_eq!(total.discount_cts, 1000);
  assert_eq!(total.final_price_cts, 3200);
  assert!(total.is_consistent());
}

#[test]
fn test_discount_never_exceeds_ticket_price() {
  let total = PriceCalculator::new()
    .calculate(&input(
      VatStatus::None,
      vec![LineItem::ticket(1000, 2)],
      Some(Discount::FixedPerTicket(1500)),
    ))
    .unwrap();
  assert_eq!(total.discount_cts, 2000);
  assert_eq!(total.final_price_cts, 0);
}

#[test]
fn test_percentage_discount_applies_before_vat() {
  let total = PriceCalculator::new()
    .calculate(&input(
      VatStatus::NotIncluded,
      vec![LineItem::ticket(1000, 1)],
      Some(Discount::Percentage(Decimal::from(10))),
    ))
    .unwrap();
  assert_eq!(total.discount_cts, 100);
  // 7.7% of 900 is 69.3
  assert_eq!(total.vat_cts, 69);
  assert_eq!(total.final_price_cts, 969);
  assert!(total.is_consistent());
}

#[test]
fn test_reverse_charge_removes_vat() {
  let mut included = input(VatStatus::Included, vec![LineItem::ticket(1077, 1)], None);
  included.vat_exempt = true;
  let total = PriceCalculator::new().calculate(&included).unwrap();
  assert_eq!(total.vat_status, VatStatus::IncludedExempt);
  assert_eq!(total.vat_cts, 0);
  assert_eq!(total.final_price_cts, 1000);
  assert!(total.is_consistent());

  let mut on_top = input(VatStatus::NotIncluded, vec![LineItem::ticket(1000, 1)], None);
  on_top.vat_exempt = true;
  let total = PriceCalculator::new().calculate(&on_top).unwrap();
  assert_eq!(total.vat_status, VatStatus::NotIncludedExempt);
  assert_eq!(total.final_price_cts, 1000);
}

#[test]
fn test_line_vat_rate_overrides_context_rate() {
  let mut reduced = LineItem::service(1000, 1);
  reduced.vat_percentage = Some(Decimal::new(25, 1));
  let total = PriceCalculator::new()
    .calculate(&input(VatStatus::NotIncluded, vec![LineItem::ticket(1000, 1), reduced], None))
    .unwrap();
  assert_eq!(total.vat_cts, 77 + 25);
  assert_eq!(total.final_price_cts, 2102);
}

#[test]
fn test_invalid_inputs_are_rejected() {
  let out_of_range = input(
    VatStatus::None,
    vec![LineItem::ticket(1000, 1)],
    Some(Discount::Percentage(Decimal::from(150))),
  );
  assert!(matches!(
    PriceCalculator::new().calculate(&out_of_range),
    Err(CoreError::Validation { .. })
  ));

  let negative = input(VatStatus::None, vec![LineItem::ticket(1000, -1)], None);
  assert!(matches!(
    PriceCalculator::new().calculate(&negative),
    Err(CoreError::Validation { .. })
  ));
}

#[test]
fn test_amounts_beyond_range_are_rejected() {
  let huge_line = input(VatStatus::None, vec![LineItem::ticket(i64::MAX / 2, 3)], None);
  assert!(matches!(
    PriceCalculator::new().calculate(&huge_line),
    Err(CoreError::Validation { .. })
  ));

  let huge_sum = input(
    VatStatus::None,
    vec![LineItem::ticket(i64::MAX / 2, 1), LineItem::ticket(i64::MAX / 2, 1), LineItem::service(10, 1)],
    None,
  );
  assert!(matches!(
    PriceCalculator::new().calculate(&huge_sum),
    Err(CoreError::Validation { .. })
  ));

  let vat_on_top = input(VatStatus::NotIncluded, vec![LineItem::ticket(i64::MAX - 1, 1)], None);
  assert!(matches!(
    PriceCalculator::new().calculate(&vat_on_top),
    Err(CoreError::Validation { .. })
  ));
}
