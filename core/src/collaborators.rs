// tessera/src/collaborators.rs

//! Interfaces to the parts of the system that live outside payment
//! coordination: mail delivery, invoice numbering and ticket capacity.

use crate::error::CoreResult;
use crate::model::{PaymentMethod, PurchaseContext, Ticket, TicketReservation, TotalPrice};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbound customer mail. Callers log failures and carry on; a mail that
/// cannot be sent never undoes a payment.
#[async_trait]
pub trait NotificationManager: Send + Sync {
  async fn send_confirmation_email(&self, context: &PurchaseContext, reservation: &TicketReservation) -> anyhow::Result<()>;

  async fn send_ticket_by_email(&self, context: &PurchaseContext, ticket: &Ticket) -> anyhow::Result<()>;

  async fn send_offline_payment_instructions(
    &self,
    context: &PurchaseContext,
    reservation: &TicketReservation,
    method: PaymentMethod,
  ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
  pub total: TotalPrice,
  pub description: String,
  pub ticket_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingDocument {
  pub number: String,
  pub reservation_id: String,
  pub generated_at: DateTime<Utc>,
  pub total: TotalPrice,
}

#[async_trait]
pub trait InvoiceGenerator: Send + Sync {
  /// Returns the reservation's billing document, generating it on first call.
  async fn get_or_create_billing_document(
    &self,
    context: &PurchaseContext,
    reservation: &TicketReservation,
    summary: &OrderSummary,
  ) -> anyhow::Result<BillingDocument>;
}

/// Ticket capacity bookkeeping.
#[async_trait]
pub trait TicketInventory: Send + Sync {
  async fn count_unsold(&self, category_id: i64) -> CoreResult<i64>;

  async fn reserve_tickets(&self, reservation_id: &str, category_id: i64, quantity: usize) -> CoreResult<Vec<Ticket>>;

  /// Returns the reservation's tickets to the category pool.
  async fn release_tickets(&self, reservation_id: &str) -> CoreResult<u64>;

  /// Marks the reservation's tickets ACQUIRED.
  async fn confirm_tickets(&self, reservation_id: &str) -> CoreResult<Vec<Ticket>>;

  async fn tickets_for(&self, reservation_id: &str) -> CoreResult<Vec<Ticket>>;
}
