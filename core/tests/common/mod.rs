// tests/common/mod.rs
#![allow(dead_code)] // Not every test file uses every fixture.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tessera::collaborators::{BillingDocument, InvoiceGenerator, NotificationManager, OrderSummary};
use tessera::model::{
  AuditEvent, BillingDetails, Currency, EventFormat, PaymentMethod, PaymentSpecification, PurchaseContext,
  ReservationStatus, Ticket, TicketReservation, TicketStatus, Transaction, VatStatus,
};
use tessera::providers::http::GatewayError;
use tessera::providers::paypal::{PaypalApi, PaypalCapture, PaypalCredentials, PaypalError, PaypalOrder};
use tessera::providers::registry::GatewayClients;
use tessera::providers::revolut::{RevolutApi, RevolutCredentials, StatementEntry};
use tessera::providers::stripe::{
  ChargeRequest, CheckoutSession, CheckoutSessionRequest, StripeApi, StripeCharge, StripeCredentials, StripeError,
  StripeRefund,
};
use tessera::providers::RefundOutcome;
use tessera::store::{AuditStore, ReservationStore, TransactionStore};
use tessera::{ConfigKey, ConfigScope, InMemoryConfiguration, JobPolicy, ManualClock, PaymentServices, PaymentSystem};
use tessera::store::InMemoryStore;
use tracing::Level;

pub const ORGANIZATION_ID: i64 = 10;
pub const EVENT_ID: i64 = 1;
pub const CATEGORY_ID: i64 = 100;
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

pub fn start_time() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
}

// --- Fake Stripe ---
#[derive(Default)]
pub struct FakeStripe {
  pub charges: Mutex<Vec<ChargeRequest>>,
  pub next_charge_error: Mutex<Option<StripeError>>,
  pub sessions: Mutex<Vec<CheckoutSessionRequest>>,
  pub session_payment_status: Mutex<String>,
  pub refunds: Mutex<Vec<(String, Option<i64>)>>,
}

#[async_trait]
impl StripeApi for FakeStripe {
  async fn create_charge(
    &self,
    _credentials: &StripeCredentials,
    request: &ChargeRequest,
    _idempotency_key: &str,
  ) -> Result<StripeCharge, StripeError> {
    if let Some(err) = self.next_charge_error.lock().take() {
      return Err(err);
    }
    let mut charges = self.charges.lock();
    charges.push(request.clone());
    Ok(StripeCharge {
      id: format!("ch_test_{}", charges.len()),
      amount: request.amount_cts,
      paid: true,
    })
  }

  async fn create_checkout_session(
    &self,
    _credentials: &StripeCredentials,
    request: &CheckoutSessionRequest,
    _idempotency_key: &str,
  ) -> Result<CheckoutSession, StripeError> {
    let mut sessions = self.sessions.lock();
    sessions.push(request.clone());
    let id = format!("cs_test_{}", sessions.len());
    Ok(CheckoutSession {
      url: Some(format!("https://checkout.stripe.test/{id}")),
      id,
      status: Some("open".to_string()),
      payment_status: "unpaid".to_string(),
      payment_intent: None,
    })
  }

  async fn retrieve_checkout_session(
    &self,
    _credentials: &StripeCredentials,
    session_id: &str,
  ) -> Result<CheckoutSession, StripeError> {
    let payment_status = self.session_payment_status.lock().clone();
    let paid = payment_status == "paid";
    Ok(CheckoutSession {
      id: session_id.to_string(),
      url: None,
      status: Some(if paid { "complete" } else { "open" }.to_string()),
      payment_status,
      payment_intent: paid.then(|| "pi_test_1".to_string()),
    })
  }

  async fn create_refund(
    &self,
    _credentials: &StripeCredentials,
    payment_reference: &str,
    amount_cts: Option<i64>,
  ) -> Result<StripeRefund, StripeError> {
    let mut refunds = self.refunds.lock();
    refunds.push((payment_reference.to_string(), amount_cts));
    Ok(StripeRefund {
      id: format!("re_test_{}", refunds.len()),
      amount: amount_cts.unwrap_or_default(),
      status: Some("succeeded".to_string()),
    })
  }
}

// --- Fake PayPal ---
#[derive(Default)]
pub struct FakePaypal {
  pub orders: AtomicUsize,
  pub captures: Mutex<Vec<String>>,
}

#[async_trait]
impl PaypalApi for FakePaypal {
  async fn create_order(
    &self,
    _credentials: &PaypalCredentials,
    _spec: &PaymentSpecification,
    _return_url: &str,
    _cancel_url: &str,
    _request_id: &str,
  ) -> Result<PaypalOrder, PaypalError> {
    let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
    Ok(PaypalOrder {
      id: format!("ORDER-{n}"),
      approve_url: Some(format!("https://paypal.test/approve/ORDER-{n}")),
    })
  }

  async fn capture_order(
    &self,
    _credentials: &PaypalCredentials,
    order_id: &str,
    _request_id: &str,
  ) -> Result<PaypalCapture, PaypalError> {
    self.captures.lock().push(order_id.to_string());
    Ok(PaypalCapture {
      capture_id: format!("CAPTURE-{order_id}"),
      status: "COMPLETED".to_string(),
      fee_cts: Some(50),
    })
  }

  async fn refund_capture(
    &self,
    _credentials: &PaypalCredentials,
    capture_id: &str,
    amount: Option<(i64, &str)>,
  ) -> Result<RefundOutcome, PaypalError> {
    Ok(RefundOutcome {
      refund_id: format!("REFUND-{capture_id}"),
      amount_cts: amount.map(|(a, _)| a).unwrap_or_default(),
    })
  }
}

// --- Fake Revolut ---
#[derive(Default)]
pub struct FakeRevolut {
  pub statement: Mutex<Vec<StatementEntry>>,
}

impl FakeRevolut {
  pub fn add_transfer(&self, id: &str, reference: &str, amount_cts: i64, currency: &str) {
    self.statement.lock().push(StatementEntry {
      id: id.to_string(),
      reference: reference.to_string(),
      amount_cts,
      currency: currency.to_string(),
      created_at: start_time(),
    });
  }
}

#[async_trait]
impl RevolutApi for FakeRevolut {
  async fn incoming_transfers(
    &self,
    _credentials: &RevolutCredentials,
    _since: DateTime<Utc>,
  ) -> Result<Vec<StatementEntry>, GatewayError> {
    Ok(self.statement.lock().clone())
  }
}

// --- Recording collaborators ---
#[derive(Default)]
pub struct RecordingNotifications {
  pub sent: Mutex<Vec<String>>,
  pub fail_confirmation: AtomicBool,
}

impl RecordingNotifications {
  pub fn sent(&self) -> Vec<String> {
    self.sent.lock().clone()
  }

  pub fn count(&self, prefix: &str) -> usize {
    self.sent.lock().iter().filter(|s| s.starts_with(prefix)).count()
  }
}

#[async_trait]
impl NotificationManager for RecordingNotifications {
  async fn send_confirmation_email(&self, _context: &PurchaseContext, reservation: &TicketReservation) -> anyhow::Result<()> {
    if self.fail_confirmation.load(Ordering::SeqCst) {
      anyhow::bail!("smtp unavailable");
    }
    self.sent.lock().push(format!("confirmation:{}", reservation.id));
    Ok(())
  }

  async fn send_ticket_by_email(&self, _context: &PurchaseContext, ticket: &Ticket) -> anyhow::Result<()> {
    self.sent.lock().push(format!("ticket:{}", ticket.uuid));
    Ok(())
  }

  async fn send_offline_payment_instructions(
    &self,
    _context: &PurchaseContext,
    reservation: &TicketReservation,
    method: PaymentMethod,
  ) -> anyhow::Result<()> {
    self.sent.lock().push(format!("offline:{}:{}", method, reservation.id));
    Ok(())
  }
}

#[derive(Default)]
pub struct SequentialInvoices {
  next: AtomicUsize,
}

#[async_trait]
impl InvoiceGenerator for SequentialInvoices {
  async fn get_or_create_billing_document(
    &self,
    _context: &PurchaseContext,
    reservation: &TicketReservation,
    summary: &OrderSummary,
  ) -> anyhow::Result<BillingDocument> {
    let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
    Ok(BillingDocument {
      number: format!("INV-{n:04}"),
      reservation_id: reservation.id.clone(),
      generated_at: start_time(),
      total: summary.total.clone(),
    })
  }
}

// --- Harness ---
pub struct Harness {
  pub store: Arc<InMemoryStore>,
  pub config: Arc<InMemoryConfiguration>,
  pub clock: Arc<ManualClock>,
  pub notifications: Arc<RecordingNotifications>,
  pub invoices: Arc<SequentialInvoices>,
  pub stripe: Arc<FakeStripe>,
  pub paypal: Arc<FakePaypal>,
  pub revolut: Arc<FakeRevolut>,
  pub system: PaymentSystem,
  next_ticket: AtomicUsize,
}

pub fn purchase_context(format: EventFormat) -> PurchaseContext {
  PurchaseContext {
    id: EVENT_ID,
    short_name: "rustconf".to_string(),
    display_name: "RustConf".to_string(),
    organization_id: ORGANIZATION_ID,
    currency: Currency::new("CHF"),
    begins_at: start_time() + Duration::days(30),
    format,
    vat_status: VatStatus::Included,
    vat_percentage: Decimal::new(77, 1),
  }
}

impl Harness {
  pub fn new() -> Self {
    Self::with_format(EventFormat::InPerson)
  }

  pub fn with_format(format: EventFormat) -> Self {
    let store = Arc::new(InMemoryStore::new());
    store.add_purchase_context(purchase_context(format));
    let config = Arc::new(InMemoryConfiguration::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let notifications = Arc::new(RecordingNotifications::default());
    let invoices = Arc::new(SequentialInvoices::default());
    let stripe = Arc::new(FakeStripe::default());
    let paypal = Arc::new(FakePaypal::default());
    let revolut = Arc::new(FakeRevolut::default());

    let services = PaymentServices {
      reservations: store.clone(),
      transactions: store.clone(),
      audit: store.clone(),
      jobs: store.clone(),
      purchase_contexts: store.clone(),
      configuration: config.clone(),
      notifications: notifications.clone(),
      invoices: invoices.clone(),
      inventory: store.clone(),
      clock: clock.clone(),
    };
    let gateways = GatewayClients {
      stripe: stripe.clone(),
      paypal: paypal.clone(),
    };
    let system = PaymentSystem::new(services, gateways, revolut.clone(), JobPolicy::default());

    Harness {
      store,
      config,
      clock,
      notifications,
      invoices,
      stripe,
      paypal,
      revolut,
      system,
      next_ticket: AtomicUsize::new(1),
    }
  }

  pub fn event_config(&self, key: ConfigKey, value: &str) {
    self.config.set(ConfigScope::Event(EVENT_ID), key, value);
  }

  pub fn enable_stripe_card(&self) {
    self.event_config(ConfigKey::StripeCcEnabled, "true");
    self.event_config(ConfigKey::StripeSecretKey, "sk_test_123");
    self.event_config(ConfigKey::StripeWebhookSecret, WEBHOOK_SECRET);
  }

  pub fn enable_stripe_checkout(&self) {
    self.enable_stripe_card();
    self.event_config(ConfigKey::StripeEnableSca, "true");
  }

  pub fn enable_bank_transfer(&self) {
    self.event_config(ConfigKey::BankTransferEnabled, "true");
  }

  /// Inserts a PENDING reservation with `tickets` tickets and the given total,
  /// valid for 25 minutes.
  pub async fn pending_reservation(&self, id: &str, final_price_cts: i64, tickets: usize) -> String {
    let now = self.clock_now();
    let vat_cts = 0;
    let reservation = TicketReservation {
      id: id.to_string(),
      status: ReservationStatus::Pending,
      validity: now + Duration::minutes(25),
      purchase_context_id: EVENT_ID,
      currency: Currency::new("CHF"),
      src_price_cts: final_price_cts,
      vat_cts,
      discount_cts: 0,
      final_price_cts,
      vat_status: VatStatus::Included,
      customer: BillingDetails {
        full_name: "Ada Lovelace".to_string(),
        email: "ada@example.org".to_string(),
        ..Default::default()
      },
      invoice_requested: true,
      invoice_number: None,
      payment_method: None,
      locale: "en".to_string(),
      created_at: now,
      confirmed_at: None,
    };
    ReservationStore::insert(self.store.as_ref(), reservation).await.unwrap();

    let first = self.next_ticket.fetch_add(tickets, Ordering::SeqCst) as i64;
    self.store.add_tickets((0..tickets as i64).map(|i| Ticket {
      id: first + i,
      uuid: format!("ticket-{}", first + i),
      category_id: CATEGORY_ID,
      purchase_context_id: EVENT_ID,
      reservation_id: Some(id.to_string()),
      status: TicketStatus::Pending,
      src_price_cts: final_price_cts / tickets.max(1) as i64,
      owner_name: Some("Ada Lovelace".to_string()),
      owner_email: Some("ada@example.org".to_string()),
    }));
    id.to_string()
  }

  pub fn clock_now(&self) -> DateTime<Utc> {
    use tessera::Clock;
    self.clock.now()
  }

  pub async fn status(&self, reservation_id: &str) -> ReservationStatus {
    ReservationStore::find(self.store.as_ref(), reservation_id).await.unwrap().unwrap().status
  }

  pub async fn reservation(&self, reservation_id: &str) -> TicketReservation {
    ReservationStore::find(self.store.as_ref(), reservation_id).await.unwrap().unwrap()
  }

  pub async fn transactions(&self, reservation_id: &str) -> Vec<Transaction> {
    TransactionStore::find_for_reservation(self.store.as_ref(), reservation_id).await.unwrap()
  }

  pub async fn audit_events(&self, reservation_id: &str) -> Vec<AuditEvent> {
    AuditStore::for_reservation(self.store.as_ref(), reservation_id)
      .await
      .unwrap()
      .into_iter()
      .map(|e| e.event)
      .collect()
  }
}

// --- Webhook payloads ---
pub fn checkout_completed_payload(event_id: &str, session_id: &str, reservation_id: &str, live: bool) -> String {
  serde_json::json!({
    "id": event_id,
    "type": "checkout.session.completed",
    "livemode": live,
    "data": { "object": {
      "id": session_id,
      "payment_status": "paid",
      "payment_intent": "pi_test_1",
      "client_reference_id": reservation_id,
      "metadata": { "reservation_id": reservation_id }
    }}
  })
  .to_string()
}

pub fn checkout_expired_payload(event_id: &str, session_id: &str, reservation_id: &str) -> String {
  serde_json::json!({
    "id": event_id,
    "type": "checkout.session.expired",
    "livemode": false,
    "data": { "object": {
      "id": session_id,
      "payment_status": "unpaid",
      "metadata": { "reservation_id": reservation_id }
    }}
  })
  .to_string()
}

// --- Helper for Tracing Setup ---
use once_cell::sync::Lazy;
static TRACING_INIT: Lazy<()> = Lazy::new(|| {
  tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer()
    .try_init()
    .ok();
});

pub fn setup_tracing() {
  Lazy::force(&TRACING_INIT);
}
