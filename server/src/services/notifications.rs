// server/src/services/notifications.rs

//! Customer mail. Messages are rendered and written to the log; the reply-to
//! address comes from the organization row and is cached.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Duration;
use sqlx::PgPool;
use std::sync::Arc;
use tessera::collaborators::NotificationManager;
use tessera::model::{PaymentMethod, PurchaseContext, Ticket, TicketReservation};
use tessera::{Clock, TtlCache};
use tracing::{info, instrument};

const REPLY_TO_TTL_MINUTES: i64 = 10;
const REPLY_TO_CAPACITY: usize = 1_000;

#[derive(Debug)]
pub struct OutgoingEmail {
  pub to: String,
  pub reply_to: String,
  pub subject: String,
  pub body: String,
  pub message_id: String,
}

pub struct LoggingNotifications {
  pool: PgPool,
  reply_to: TtlCache<i64, String>,
}

impl LoggingNotifications {
  pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
    LoggingNotifications {
      pool,
      reply_to: TtlCache::new(Duration::minutes(REPLY_TO_TTL_MINUTES), REPLY_TO_CAPACITY, clock),
    }
  }

  async fn reply_to_address(&self, organization_id: i64) -> anyhow::Result<String> {
    if let Some(address) = self.reply_to.get(&organization_id) {
      return Ok(address);
    }
    let address: String = sqlx::query_scalar("SELECT email FROM organization WHERE id = $1")
      .bind(organization_id)
      .fetch_one(&self.pool)
      .await
      .with_context(|| format!("loading reply-to address of organization {organization_id}"))?;
    self.reply_to.insert(organization_id, address.clone());
    Ok(address)
  }

  async fn deliver(&self, context: &PurchaseContext, to: &str, subject: String, body: String) -> anyhow::Result<()> {
    let email = OutgoingEmail {
      to: to.to_string(),
      reply_to: self.reply_to_address(context.organization_id).await?,
      subject,
      body,
      message_id: format!("<{}@{}>", uuid::Uuid::new_v4(), context.short_name),
    };
    info!(
      to = %email.to,
      reply_to = %email.reply_to,
      subject = %email.subject,
      message_id = %email.message_id,
      body_len = email.body.len(),
      "Email dispatched."
    );
    Ok(())
  }
}

pub fn offline_instructions(context: &PurchaseContext, reservation: &TicketReservation, method: PaymentMethod) -> String {
  let amount = reservation.currency.format(reservation.final_price_cts);
  match method {
    PaymentMethod::BankTransfer => format!(
      "Please transfer {amount} for {} quoting the reference {} before {}.",
      context.display_name,
      reservation.short_id(),
      reservation.validity.format("%Y-%m-%d")
    ),
    PaymentMethod::OnSite => format!("Please pay {amount} at the {} desk.", context.display_name),
    other => format!(
      "Your reservation {} for {} is waiting for a {other} payment of {amount}.",
      reservation.short_id(),
      context.display_name
    ),
  }
}

#[async_trait]
impl NotificationManager for LoggingNotifications {
  #[instrument(skip_all, fields(reservation_id = %reservation.id))]
  async fn send_confirmation_email(&self, context: &PurchaseContext, reservation: &TicketReservation) -> anyhow::Result<()> {
    let subject = format!("{}: reservation {} confirmed", context.display_name, reservation.short_id());
    let mut body = format!(
      "Dear {}, we received your payment of {}.",
      reservation.customer.full_name,
      reservation.currency.format(reservation.final_price_cts)
    );
    if let Some(invoice) = &reservation.invoice_number {
      body.push_str(&format!(" Invoice {invoice} is attached."));
    }
    self.deliver(context, &reservation.customer.email, subject, body).await
  }

  #[instrument(skip_all, fields(ticket = %ticket.uuid))]
  async fn send_ticket_by_email(&self, context: &PurchaseContext, ticket: &Ticket) -> anyhow::Result<()> {
    let Some(to) = ticket.owner_email.as_deref().filter(|e| !e.is_empty()) else {
      info!("Ticket has no owner yet, not sending.");
      return Ok(());
    };
    let subject = format!("Your ticket for {}", context.display_name);
    let body = format!("Ticket {} is attached.", ticket.uuid);
    self.deliver(context, to, subject, body).await
  }

  #[instrument(skip_all, fields(reservation_id = %reservation.id, method = %method))]
  async fn send_offline_payment_instructions(
    &self,
    context: &PurchaseContext,
    reservation: &TicketReservation,
    method: PaymentMethod,
  ) -> anyhow::Result<()> {
    let subject = format!("{}: complete your payment", context.display_name);
    let body = offline_instructions(context, reservation, method);
    self.deliver(context, &reservation.customer.email, subject, body).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};
  use rust_decimal::Decimal;
  use tessera::model::{BillingDetails, Currency, EventFormat, ReservationStatus, VatStatus};

  fn context() -> PurchaseContext {
    PurchaseContext {
      id: 1,
      short_name: "rustfest".into(),
      display_name: "RustFest".into(),
      organization_id: 1,
      currency: Currency::new("EUR"),
      begins_at: Utc.with_ymd_and_hms(2026, 11, 1, 9, 0, 0).unwrap(),
      format: EventFormat::InPerson,
      vat_status: VatStatus::None,
      vat_percentage: Decimal::ZERO,
    }
  }

  fn reservation() -> TicketReservation {
    TicketReservation {
      id: "abcd1234-0000-4000-8000-000000000000".into(),
      status: ReservationStatus::OfflinePayment,
      validity: Utc.with_ymd_and_hms(2026, 10, 20, 12, 0, 0).unwrap(),
      purchase_context_id: 1,
      currency: Currency::new("EUR"),
      src_price_cts: 2500,
      vat_cts: 0,
      discount_cts: 0,
      final_price_cts: 2500,
      vat_status: VatStatus::None,
      customer: BillingDetails {
        full_name: "Ada".into(),
        email: "ada@example.org".into(),
        ..Default::default()
      },
      invoice_requested: false,
      invoice_number: None,
      payment_method: None,
      locale: "en".into(),
      created_at: Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap(),
      confirmed_at: None,
    }
  }

  #[test]
  fn bank_transfer_instructions_quote_the_short_reference() {
    let text = offline_instructions(&context(), &reservation(), PaymentMethod::BankTransfer);
    assert!(text.contains("25.00 EUR"), "{text}");
    assert!(text.contains("ABCD1234"), "{text}");
    assert!(text.contains("2026-10-20"), "{text}");
  }
}
