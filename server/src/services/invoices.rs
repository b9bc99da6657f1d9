// server/src/services/invoices.rs

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tessera::collaborators::{BillingDocument, InvoiceGenerator, OrderSummary};
use tessera::model::{PurchaseContext, TicketReservation};
use tessera::Clock;
use tracing::{event, instrument, Level};

/// Invoice numbers from a database sequence, prefixed by the purchase
/// context's short name and the year: `rustfest-2026-000042`.
pub struct InvoiceSequence {
  pool: PgPool,
  clock: Arc<dyn Clock>,
}

impl InvoiceSequence {
  pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
    InvoiceSequence { pool, clock }
  }
}

pub fn format_invoice_number(context_short_name: &str, year: i32, sequence: i64) -> String {
  format!("{context_short_name}-{year}-{sequence:06}")
}

#[async_trait]
impl InvoiceGenerator for InvoiceSequence {
  #[instrument(skip_all, fields(reservation_id = %reservation.id))]
  async fn get_or_create_billing_document(
    &self,
    context: &PurchaseContext,
    reservation: &TicketReservation,
    summary: &OrderSummary,
  ) -> anyhow::Result<BillingDocument> {
    let now = self.clock.now();
    let number = match &reservation.invoice_number {
      Some(existing) => existing.clone(),
      None => {
        let sequence: i64 = sqlx::query_scalar("SELECT nextval('invoice_number_seq')")
          .fetch_one(&self.pool)
          .await
          .context("allocating invoice number")?;
        let number = format_invoice_number(&context.short_name, chrono::Datelike::year(&now), sequence);
        event!(Level::INFO, invoice_number = %number, "Invoice number allocated.");
        number
      }
    };
    Ok(BillingDocument {
      number,
      reservation_id: reservation.id.clone(),
      generated_at: now,
      total: summary.total.clone(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::format_invoice_number;

  #[test]
  fn invoice_numbers_are_zero_padded() {
    assert_eq!(format_invoice_number("rustfest", 2026, 42), "rustfest-2026-000042");
    assert_eq!(format_invoice_number("jsday", 2027, 1_234_567), "jsday-2027-1234567");
  }
}
