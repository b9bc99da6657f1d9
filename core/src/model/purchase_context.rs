// tessera/src/model/purchase_context.rs

use super::money::Currency;
use super::reservation::VatStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventFormat {
  InPerson,
  Online,
  Hybrid,
}

string_enum!(EventFormat {
  InPerson => "IN_PERSON",
  Online => "ONLINE",
  Hybrid => "HYBRID",
});

/// The event being sold, as far as payments are concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseContext {
  pub id: i64,
  pub short_name: String,
  pub display_name: String,
  pub organization_id: i64,
  pub currency: Currency,
  pub begins_at: DateTime<Utc>,
  pub format: EventFormat,
  pub vat_status: VatStatus,
  pub vat_percentage: Decimal,
}

impl PurchaseContext {
  pub fn is_online(&self) -> bool {
    self.format == EventFormat::Online
  }
}
