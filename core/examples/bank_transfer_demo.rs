// tessera/examples/bank_transfer_demo.rs

//! A reservation paid by bank transfer, end to end, on the in-memory store:
//! price it, choose the payment method, wait for the money, confirm.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tessera::collaborators::{BillingDocument, InvoiceGenerator, NotificationManager, OrderSummary};
use tessera::model::{
  BillingDetails, Currency, EventFormat, PaymentMethod, PurchaseContext, ReservationStatus, Ticket, TicketReservation,
  TicketStatus, VatStatus,
};
use tessera::store::{AuditStore, InMemoryStore, ReservationStore};
use tessera::{
  ConfigKey, ConfigScope, InMemoryConfiguration, JobPolicy, LineItem, PaymentRequest, PaymentServices, PaymentSystem,
  PriceCalculator, PriceInput, SystemClock,
};
use tracing::info;

const EVENT_ID: i64 = 7;
const CATEGORY_ID: i64 = 70;

struct LogMailer;

#[async_trait]
impl NotificationManager for LogMailer {
  async fn send_confirmation_email(&self, _context: &PurchaseContext, reservation: &TicketReservation) -> anyhow::Result<()> {
    info!(to = %reservation.customer.email, "Confirmation email sent.");
    Ok(())
  }

  async fn send_ticket_by_email(&self, _context: &PurchaseContext, ticket: &Ticket) -> anyhow::Result<()> {
    info!(ticket = %ticket.uuid, "Ticket email sent.");
    Ok(())
  }

  async fn send_offline_payment_instructions(
    &self,
    _context: &PurchaseContext,
    reservation: &TicketReservation,
    method: PaymentMethod,
  ) -> anyhow::Result<()> {
    info!(%method, reference = %reservation.short_id(), "Payment instructions sent.");
    Ok(())
  }
}

struct FixedInvoices;

#[async_trait]
impl InvoiceGenerator for FixedInvoices {
  async fn get_or_create_billing_document(
    &self,
    _context: &PurchaseContext,
    reservation: &TicketReservation,
    summary: &OrderSummary,
  ) -> anyhow::Result<BillingDocument> {
    Ok(BillingDocument {
      number: "2026-0001".to_string(),
      reservation_id: reservation.id.clone(),
      generated_at: Utc::now(),
      total: summary.total.clone(),
    })
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

  let now = Utc::now();
  let event = PurchaseContext {
    id: EVENT_ID,
    short_name: "rustfest".to_string(),
    display_name: "RustFest".to_string(),
    organization_id: 1,
    currency: Currency::new("EUR"),
    begins_at: now + Duration::days(60),
    format: EventFormat::InPerson,
    vat_status: VatStatus::NotIncluded,
    vat_percentage: Decimal::from(19),
  };

  let store = Arc::new(InMemoryStore::new());
  store.add_purchase_context(event.clone());
  store.add_tickets((1..=10).map(|id| Ticket {
    id,
    uuid: format!("t-{id}"),
    category_id: CATEGORY_ID,
    purchase_context_id: EVENT_ID,
    reservation_id: None,
    status: TicketStatus::Free,
    src_price_cts: 12_000,
    owner_name: None,
    owner_email: None,
  }));

  let config = Arc::new(InMemoryConfiguration::new());
  config.set(ConfigScope::Event(EVENT_ID), ConfigKey::BankTransferEnabled, "true");
  config.set(ConfigScope::Event(EVENT_ID), ConfigKey::OfflinePaymentDays, "7");

  let services = PaymentServices {
    reservations: store.clone(),
    transactions: store.clone(),
    audit: store.clone(),
    jobs: store.clone(),
    purchase_contexts: store.clone(),
    configuration: config,
    notifications: Arc::new(LogMailer),
    invoices: Arc::new(FixedInvoices),
    inventory: store.clone(),
    clock: Arc::new(SystemClock),
  };
  let system = PaymentSystem::with_http_gateways(services.clone(), JobPolicy::default())?;

  let reservation_id = uuid::Uuid::new_v4().to_string();
  let tickets = services.inventory.reserve_tickets(&reservation_id, CATEGORY_ID, 2).await?;
  let total = PriceCalculator::new().calculate(&PriceInput {
    items: vec![LineItem::ticket(12_000, tickets.len() as i64)],
    discount: None,
    vat_status: event.vat_status,
    vat_percentage: event.vat_percentage,
    currency: event.currency.clone(),
    vat_exempt: false,
  })?;
  info!(final_cts = total.final_price_cts, vat_cts = total.vat_cts, "Reservation priced.");

  ReservationStore::insert(
    store.as_ref(),
    TicketReservation {
      id: reservation_id.clone(),
      status: ReservationStatus::Pending,
      validity: now + Duration::minutes(25),
      purchase_context_id: EVENT_ID,
      currency: total.currency.clone(),
      src_price_cts: total.src_price_cts,
      vat_cts: total.vat_cts,
      discount_cts: total.discount_cts,
      final_price_cts: total.final_price_cts,
      vat_status: total.vat_status,
      customer: BillingDetails {
        full_name: "Grace Hopper".to_string(),
        email: "grace@example.org".to_string(),
        ..Default::default()
      },
      invoice_requested: true,
      invoice_number: None,
      payment_method: None,
      locale: "en".to_string(),
      created_at: now,
      confirmed_at: None,
    },
  )
  .await?;

  let (context, request) = system.orchestrator.payment_context(&reservation_id).await?;
  for descriptor in system.registry.active_payment_methods(&context, &request).await? {
    info!(method = %descriptor.method, provider = %descriptor.provider, "Method offered.");
  }

  let result = system
    .orchestrator
    .perform_payment(PaymentRequest {
      reservation_id: reservation_id.clone(),
      method: PaymentMethod::BankTransfer,
      token: None,
      selected_offline_method: None,
    })
    .await?;
  info!(?result, "Payment requested.");

  let outcome = system
    .orchestrator
    .confirm_offline_payment(&reservation_id, "backoffice@example.org")
    .await?;
  info!(?outcome, "Transfer confirmed.");

  for entry in AuditStore::for_reservation(store.as_ref(), &reservation_id).await? {
    info!(event = %entry.event, details = ?entry.details, "Audit.");
  }
  Ok(())
}
