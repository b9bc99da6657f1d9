// tessera/src/model/reservation.rs

use super::money::Currency;
use super::payment::PaymentProxy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
  Pending,
  InPayment,
  ExternalProcessingPayment,
  OfflinePayment,
  DeferredOfflinePayment,
  CustomOfflinePayment,
  Stuck,
  Complete,
  Cancelled,
  CreditNoteIssued,
}

string_enum!(ReservationStatus {
  Pending => "PENDING",
  InPayment => "IN_PAYMENT",
  ExternalProcessingPayment => "EXTERNAL_PROCESSING_PAYMENT",
  OfflinePayment => "OFFLINE_PAYMENT",
  DeferredOfflinePayment => "DEFERRED_OFFLINE_PAYMENT",
  CustomOfflinePayment => "CUSTOM_OFFLINE_PAYMENT",
  Stuck => "STUCK",
  Complete => "COMPLETE",
  Cancelled => "CANCELLED",
  CreditNoteIssued => "CREDIT_NOTE_ISSUED",
});

impl ReservationStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      ReservationStatus::Complete | ReservationStatus::Cancelled | ReservationStatus::CreditNoteIssued
    )
  }

  /// States in which the customer owes money that will arrive out of band.
  pub fn is_awaiting_offline_payment(&self) -> bool {
    matches!(
      self,
      ReservationStatus::OfflinePayment
        | ReservationStatus::DeferredOfflinePayment
        | ReservationStatus::CustomOfflinePayment
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VatStatus {
  None,
  Included,
  NotIncluded,
  IncludedExempt,
  NotIncludedExempt,
}

string_enum!(VatStatus {
  None => "NONE",
  Included => "INCLUDED",
  NotIncluded => "NOT_INCLUDED",
  IncludedExempt => "INCLUDED_EXEMPT",
  NotIncludedExempt => "NOT_INCLUDED_EXEMPT",
});

impl VatStatus {
  /// Reverse charge: VAT is not collected, the nominal mode is remembered.
  pub fn to_exempt(self) -> Self {
    match self {
      VatStatus::Included => VatStatus::IncludedExempt,
      VatStatus::NotIncluded => VatStatus::NotIncludedExempt,
      other => other,
    }
  }

  pub fn is_exempt(&self) -> bool {
    matches!(self, VatStatus::IncludedExempt | VatStatus::NotIncludedExempt)
  }

  /// Whether listed prices already contain VAT.
  pub fn prices_include_vat(&self) -> bool {
    matches!(self, VatStatus::Included | VatStatus::IncludedExempt)
  }
}

/// Totals of a reservation in minor units.
///
/// `src_price_cts` is always the VAT-exclusive amount before discount, so that
/// `final_price_cts == src_price_cts - discount_cts + vat_cts` in every VAT mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalPrice {
  pub src_price_cts: i64,
  pub discount_cts: i64,
  pub vat_cts: i64,
  pub final_price_cts: i64,
  pub vat_status: VatStatus,
  pub currency: Currency,
}

impl TotalPrice {
  pub fn requires_payment(&self) -> bool {
    self.final_price_cts > 0
  }

  pub fn is_consistent(&self) -> bool {
    self.final_price_cts == self.src_price_cts - self.discount_cts + self.vat_cts
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingDetails {
  pub full_name: String,
  pub email: String,
  pub billing_address: Option<String>,
  pub company_name: Option<String>,
  pub vat_number: Option<String>,
  pub vat_country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketReservation {
  pub id: String,
  pub status: ReservationStatus,
  pub validity: DateTime<Utc>,
  pub purchase_context_id: i64,
  pub currency: Currency,
  pub src_price_cts: i64,
  pub vat_cts: i64,
  pub discount_cts: i64,
  pub final_price_cts: i64,
  pub vat_status: VatStatus,
  pub customer: BillingDetails,
  pub invoice_requested: bool,
  pub invoice_number: Option<String>,
  pub payment_method: Option<PaymentProxy>,
  pub locale: String,
  pub created_at: DateTime<Utc>,
  pub confirmed_at: Option<DateTime<Utc>>,
}

impl TicketReservation {
  /// The truncated reservation id customers quote in bank transfer references.
  pub fn short_id(&self) -> String {
    short_reservation_id(&self.id)
  }

  /// A PENDING reservation whose validity is now or in the past is expired.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.validity <= now
  }

  pub fn total_price(&self) -> TotalPrice {
    TotalPrice {
      src_price_cts: self.src_price_cts,
      discount_cts: self.discount_cts,
      vat_cts: self.vat_cts,
      final_price_cts: self.final_price_cts,
      vat_status: self.vat_status,
      currency: self.currency.clone(),
    }
  }

  pub fn apply_total(&mut self, total: &TotalPrice) {
    self.src_price_cts = total.src_price_cts;
    self.discount_cts = total.discount_cts;
    self.vat_cts = total.vat_cts;
    self.final_price_cts = total.final_price_cts;
    self.vat_status = total.vat_status;
    self.currency = total.currency.clone();
  }
}

pub fn short_reservation_id(id: &str) -> String {
  id.chars().filter(|c| *c != '-').take(8).collect::<String>().to_uppercase()
}
