// tessera/src/model/audit.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
  PaymentAttempted,
  PaymentRedirected,
  PaymentConfirmed,
  PaymentFailed,
  OfflinePaymentRequested,
  MatchingPaymentFound,
  ReservationComplete,
  ReservationCancelled,
  ReservationStuck,
  PaymentReset,
  InvoiceAssigned,
  Refund,
}

string_enum!(AuditEvent {
  PaymentAttempted => "PAYMENT_ATTEMPTED",
  PaymentRedirected => "PAYMENT_REDIRECTED",
  PaymentConfirmed => "PAYMENT_CONFIRMED",
  PaymentFailed => "PAYMENT_FAILED",
  OfflinePaymentRequested => "OFFLINE_PAYMENT_REQUESTED",
  MatchingPaymentFound => "MATCHING_PAYMENT_FOUND",
  ReservationComplete => "RESERVATION_COMPLETE",
  ReservationCancelled => "RESERVATION_CANCELLED",
  ReservationStuck => "RESERVATION_STUCK",
  PaymentReset => "PAYMENT_RESET",
  InvoiceAssigned => "INVOICE_ASSIGNED",
  Refund => "REFUND",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
  pub reservation_id: String,
  pub event: AuditEvent,
  pub at: DateTime<Utc>,
  pub details: BTreeMap<String, String>,
}

impl AuditEntry {
  pub fn new(reservation_id: impl Into<String>, event: AuditEvent, at: DateTime<Utc>) -> Self {
    AuditEntry {
      reservation_id: reservation_id.into(),
      event,
      at,
      details: BTreeMap::new(),
    }
  }

  pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
    self.details.insert(key.into(), value.to_string());
    self
  }
}
