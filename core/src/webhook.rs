// tessera/src/webhook.rs

//! Applies asynchronous gateway notifications and bank matches to local state.
//!
//! Delivery is at-least-once and unordered, so every mutation is a
//! compare-and-set on the current transaction status: a replay finds the
//! transaction already settled and does nothing.

use crate::error::{CoreError, CoreResult};
use crate::flow::{ContextData, Flow, FlowControl};
use crate::model::{
  AuditEntry, AuditEvent, PaymentProxy, ReservationStatus, TicketReservation, Transaction, TransactionChanges,
  TransactionStatus,
};
use crate::providers::revolut::{BankMatch, RevolutSettings};
use crate::providers::{PaymentContext, PaymentMethodRegistry, PaymentProvider, WebhookEvent, WebhookOutcome, WebhookRequest};
use crate::services::PaymentServices;
use crate::state_machine::ReservationStateMachine;
use serde::Serialize;
use std::sync::Arc;
use tracing::{event, instrument, Level};

pub const CHARGE_ID_KEY: &str = "charge_id";
pub const WEBHOOK_EVENT_KEY: &str = "webhook_event_id";
pub const STATEMENT_ID_KEY: &str = "statement_id";
pub const PAID_CTS_KEY: &str = "paid_cts";
/// Gateway reference of the attempt before the charge replaced it.
pub const ATTEMPT_REFERENCE_KEY: &str = "attempt_reference";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookResult {
  Successful,
  Failed(String),
  NotRelevant,
}

/// What applying a bank match did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankMatchOutcome {
  /// Payment confirmed and reservation completed.
  Confirmed,
  /// Transaction flagged for an operator to confirm.
  MarkedForReview,
  /// The transaction was no longer waiting for money.
  Skipped,
}

#[derive(Default)]
struct WebhookState {
  proxy: Option<PaymentProxy>,
  request: Option<WebhookRequest>,
  provider: Option<Arc<dyn PaymentProvider>>,
  event: Option<WebhookEvent>,
  transaction: Option<Transaction>,
  reservation: Option<TicketReservation>,
  context: Option<PaymentContext>,
  result: Option<WebhookResult>,
}

type WebhookCtx = ContextData<WebhookState>;

struct Deps {
  services: PaymentServices,
  registry: Arc<PaymentMethodRegistry>,
  state_machine: ReservationStateMachine,
}

fn missing(what: &str) -> CoreError {
  CoreError::Internal(format!("webhook flow state is missing {what}"))
}

fn finish(ctx: &WebhookCtx, result: WebhookResult) -> CoreResult<FlowControl> {
  ctx.update(|s| s.result = Some(result));
  Ok(FlowControl::Stop)
}

pub struct WebhookReconciler {
  deps: Arc<Deps>,
  flow: Flow<WebhookState, CoreError>,
}

impl WebhookReconciler {
  pub fn new(services: PaymentServices, registry: Arc<PaymentMethodRegistry>) -> Self {
    let state_machine = ReservationStateMachine::new(services.clone());
    let deps = Arc::new(Deps {
      services,
      registry,
      state_machine,
    });
    let mut flow = Flow::new(
      "process_webhook",
      &[
        ("parse", false, None),
        ("locate", false, None),
        ("verify", false, None),
        ("check_mode", false, None),
        ("apply", false, None),
      ],
    );
    let d = deps.clone();
    flow.on("parse", move |ctx: WebhookCtx| parse(d.clone(), ctx));
    let d = deps.clone();
    flow.on("locate", move |ctx: WebhookCtx| locate(d.clone(), ctx));
    flow.on("verify", verify);
    flow.on("check_mode", check_mode);
    let d = deps.clone();
    flow.on("apply", move |ctx: WebhookCtx| apply(d.clone(), ctx));
    WebhookReconciler { deps, flow }
  }

  /// Processes one delivery for `proxy`.
  ///
  /// A bad signature is an error so the caller can answer 400; everything
  /// the gateway does not need to redeliver maps to `NotRelevant`.
  #[instrument(name = "WebhookReconciler::process_webhook", skip(self, request))]
  pub async fn process_webhook(&self, proxy: PaymentProxy, request: WebhookRequest) -> CoreResult<WebhookResult> {
    let ctx = ContextData::new(WebhookState {
      proxy: Some(proxy),
      request: Some(request),
      ..Default::default()
    });
    self.flow.run(ctx.clone()).await?;
    let result = ctx.write().result.take().unwrap_or(WebhookResult::NotRelevant);
    Ok(result)
  }

  /// Applies a unique statement match found by the bank poller.
  ///
  /// Exact matches are confirmed straight away when the account does not
  /// require manual review; everything else waits for an operator.
  #[instrument(name = "WebhookReconciler::apply_bank_match", skip(self, settings), fields(reservation_id = %bank_match.reservation_id))]
  pub async fn apply_bank_match(&self, bank_match: &BankMatch, settings: &RevolutSettings) -> CoreResult<BankMatchOutcome> {
    let services = &self.deps.services;
    let now = services.clock.now();
    let auto_confirm = bank_match.exact && !settings.manual_review;
    let target = if auto_confirm {
      TransactionStatus::Complete
    } else {
      TransactionStatus::OfflineMatchingPaymentFound
    };
    let changes = TransactionChanges::default()
      .with_metadata(STATEMENT_ID_KEY, bank_match.statement_id.clone())
      .with_metadata(PAID_CTS_KEY, bank_match.paid_cts.to_string());
    let updated = services
      .transactions
      .transition(
        bank_match.transaction_id,
        &[TransactionStatus::Pending, TransactionStatus::OfflinePendingReview],
        target,
        changes,
        now,
      )
      .await?;
    if updated.is_none() {
      event!(Level::DEBUG, transaction_id = bank_match.transaction_id, "Matched transaction already handled.");
      return Ok(BankMatchOutcome::Skipped);
    }

    services
      .audit(
        AuditEntry::new(&bank_match.reservation_id, AuditEvent::MatchingPaymentFound, now)
          .detail("transaction_id", bank_match.transaction_id)
          .detail(STATEMENT_ID_KEY, &bank_match.statement_id)
          .detail(PAID_CTS_KEY, bank_match.paid_cts)
          .detail("auto_confirmed", auto_confirm),
      )
      .await?;

    if !auto_confirm {
      event!(Level::INFO, statement_id = %bank_match.statement_id, "Bank transfer matched; awaiting review.");
      return Ok(BankMatchOutcome::MarkedForReview);
    }
    self.deps.state_machine.complete(&bank_match.reservation_id).await?;
    event!(Level::INFO, statement_id = %bank_match.statement_id, "Bank transfer matched and confirmed.");
    Ok(BankMatchOutcome::Confirmed)
  }
}

async fn parse(d: Arc<Deps>, ctx: WebhookCtx) -> CoreResult<FlowControl> {
  let (proxy, request) = {
    let s = ctx.read();
    (s.proxy, s.request.clone())
  };
  let proxy = proxy.ok_or_else(|| missing("the proxy"))?;
  let request = request.ok_or_else(|| missing("the request"))?;
  let provider = d
    .registry
    .webhook_provider(proxy)
    .ok_or_else(|| CoreError::validation("proxy", "error.webhook.unsupported"))?;
  let Some(handler) = provider.as_webhook_handler() else {
    return Err(missing("a webhook handler"));
  };
  let Some(parsed) = handler.parse_webhook(&request)? else {
    event!(Level::DEBUG, "Webhook event type ignored.");
    return finish(&ctx, WebhookResult::NotRelevant);
  };
  event!(Level::DEBUG, event_id = %parsed.event_id, event_type = %parsed.event_type, "Webhook parsed.");
  ctx.update(|s| {
    s.provider = Some(provider.clone());
    s.event = Some(parsed);
  });
  Ok(FlowControl::Continue)
}

async fn find_transaction(d: &Deps, proxy: PaymentProxy, parsed: &WebhookEvent) -> CoreResult<Option<Transaction>> {
  if let Some(reference) = &parsed.gateway_reference {
    if let Some(tx) = d.services.transactions.find_by_gateway_id(proxy, reference).await? {
      return Ok(Some(tx));
    }
  }
  let Some(reservation_id) = &parsed.reservation_id else {
    return Ok(None);
  };
  let mut candidates: Vec<Transaction> = d
    .services
    .transactions
    .find_for_reservation(reservation_id)
    .await?
    .into_iter()
    .filter(|t| t.payment_proxy == proxy)
    .collect();
  // The open attempt if there is one, else the latest.
  candidates.sort_by_key(|t| (t.status.is_active(), t.created_at, t.id));
  Ok(candidates.pop())
}

async fn locate(d: Arc<Deps>, ctx: WebhookCtx) -> CoreResult<FlowControl> {
  let (proxy, parsed) = {
    let s = ctx.read();
    (s.proxy, s.event.clone())
  };
  let proxy = proxy.ok_or_else(|| missing("the proxy"))?;
  let parsed = parsed.ok_or_else(|| missing("the event"))?;
  let Some(transaction) = find_transaction(&d, proxy, &parsed).await? else {
    event!(
      Level::WARN,
      event_id = %parsed.event_id,
      reservation_id = ?parsed.reservation_id,
      "Webhook for an unknown transaction ignored."
    );
    return finish(&ctx, WebhookResult::NotRelevant);
  };
  let reservation = match d.services.reservations.find(&transaction.reservation_id).await? {
    Some(r) => r,
    None => {
      event!(Level::WARN, transaction_id = transaction.id, "Webhook transaction without reservation.");
      return finish(&ctx, WebhookResult::NotRelevant);
    }
  };
  let purchase_context = d.services.load_context(reservation.purchase_context_id).await?;
  let context = PaymentContext::new(purchase_context, Vec::new(), d.services.clock.now());
  ctx.update(|s| {
    s.transaction = Some(transaction);
    s.reservation = Some(reservation);
    s.context = Some(context);
  });
  Ok(FlowControl::Continue)
}

async fn verify(ctx: WebhookCtx) -> CoreResult<FlowControl> {
  let (provider, request, context) = {
    let s = ctx.read();
    (s.provider.clone(), s.request.clone(), s.context.clone())
  };
  let provider = provider.ok_or_else(|| missing("the provider"))?;
  let request = request.ok_or_else(|| missing("the request"))?;
  let context = context.ok_or_else(|| missing("the context"))?;
  let Some(handler) = provider.as_webhook_handler() else {
    return Err(missing("a webhook handler"));
  };
  if !handler.verify_webhook(&request, &context).await? {
    event!(Level::WARN, purchase_context_id = context.purchase_context.id, "Webhook signature rejected.");
    return Err(CoreError::validation("signature", "error.webhook.signature"));
  }
  Ok(FlowControl::Continue)
}

async fn check_mode(ctx: WebhookCtx) -> CoreResult<FlowControl> {
  let (provider, parsed, context) = {
    let s = ctx.read();
    (s.provider.clone(), s.event.clone(), s.context.clone())
  };
  let provider = provider.ok_or_else(|| missing("the provider"))?;
  let parsed = parsed.ok_or_else(|| missing("the event"))?;
  let context = context.ok_or_else(|| missing("the context"))?;
  let Some(handler) = provider.as_webhook_handler() else {
    return Err(missing("a webhook handler"));
  };
  if !handler.accepts_mode(&parsed, &context).await? {
    event!(Level::WARN, live_mode = parsed.live_mode, event_id = %parsed.event_id, "Webhook from the other environment ignored.");
    return finish(&ctx, WebhookResult::NotRelevant);
  }
  Ok(FlowControl::Continue)
}

async fn apply(d: Arc<Deps>, ctx: WebhookCtx) -> CoreResult<FlowControl> {
  let (parsed, transaction, reservation) = {
    let s = ctx.read();
    (s.event.clone(), s.transaction.clone(), s.reservation.clone())
  };
  let parsed = parsed.ok_or_else(|| missing("the event"))?;
  let transaction = transaction.ok_or_else(|| missing("the transaction"))?;
  let reservation = reservation.ok_or_else(|| missing("the reservation"))?;

  let result = match &parsed.outcome {
    WebhookOutcome::Succeeded { charge_id, fee_cts } => {
      apply_success(&d, &parsed, &transaction, &reservation, charge_id, *fee_cts).await?
    }
    WebhookOutcome::Failed { reason } => apply_failure(&d, &parsed, &transaction, reason).await?,
  };
  finish(&ctx, result)
}

async fn apply_success(
  d: &Deps,
  parsed: &WebhookEvent,
  transaction: &Transaction,
  reservation: &TicketReservation,
  charge_id: &str,
  fee_cts: Option<i64>,
) -> CoreResult<WebhookResult> {
  let services = &d.services;
  match transaction.status {
    TransactionStatus::Complete => {
      // Replay. Finish a completion that was interrupted, otherwise nothing.
      if !reservation.status.is_terminal() {
        event!(Level::WARN, reservation_id = %reservation.id, "Resuming interrupted completion.");
        if let Err(e) = d.state_machine.complete(&reservation.id).await {
          event!(Level::ERROR, reservation_id = %reservation.id, error = %e, "Interrupted completion could not be resumed.");
        }
      }
      return Ok(WebhookResult::NotRelevant);
    }
    status if !status.is_active() => {
      // Money arrived for an attempt that was abandoned or already failed.
      event!(
        Level::ERROR,
        reservation_id = %reservation.id,
        transaction_id = transaction.id,
        transaction_status = %status,
        charge_id,
        "Payment captured on a closed attempt."
      );
      d.state_machine
        .mark_stuck(&reservation.id, &format!("payment {charge_id} captured on {status} transaction"))
        .await?;
      return Ok(WebhookResult::Failed(format!("payment captured on {status} transaction")));
    }
    _ => {}
  }

  let now = services.clock.now();
  let mut changes = TransactionChanges::gateway_id(charge_id);
  if let Some(previous) = transaction.gateway_id.as_deref().filter(|id| *id != charge_id) {
    changes = changes.with_metadata(ATTEMPT_REFERENCE_KEY, previous);
  }
  let mut changes = changes
    .with_metadata(CHARGE_ID_KEY, charge_id)
    .with_metadata(WEBHOOK_EVENT_KEY, parsed.event_id.clone());
  changes.platform_fee_cts = fee_cts;
  let completed = services
    .transactions
    .transition(transaction.id, TransactionStatus::ACTIVE, TransactionStatus::Complete, changes, now)
    .await?;
  if completed.is_none() {
    event!(Level::DEBUG, transaction_id = transaction.id, "Transaction settled concurrently.");
    return Ok(WebhookResult::NotRelevant);
  }
  services
    .audit(
      AuditEntry::new(&reservation.id, AuditEvent::PaymentConfirmed, now)
        .detail("transaction_id", transaction.id)
        .detail(CHARGE_ID_KEY, charge_id)
        .detail(WEBHOOK_EVENT_KEY, &parsed.event_id),
    )
    .await?;

  match d.state_machine.complete(&reservation.id).await {
    Ok(_) => Ok(WebhookResult::Successful),
    Err(err) if err.is_fatal_for_attempt() => {
      d.state_machine.mark_stuck(&reservation.id, &err.to_string()).await?;
      Err(err)
    }
    Err(err) => Err(err),
  }
}

async fn apply_failure(
  d: &Deps,
  parsed: &WebhookEvent,
  transaction: &Transaction,
  reason: &str,
) -> CoreResult<WebhookResult> {
  if !transaction.status.is_active() {
    return Ok(WebhookResult::NotRelevant);
  }
  let services = &d.services;
  let now = services.clock.now();
  let failed = services
    .transactions
    .transition(
      transaction.id,
      TransactionStatus::ACTIVE,
      TransactionStatus::Failed,
      TransactionChanges::failure(reason).with_metadata(WEBHOOK_EVENT_KEY, parsed.event_id.clone()),
      now,
    )
    .await?;
  if failed.is_none() {
    return Ok(WebhookResult::NotRelevant);
  }
  services
    .audit(
      AuditEntry::new(&transaction.reservation_id, AuditEvent::PaymentFailed, now)
        .detail("transaction_id", transaction.id)
        .detail("reason", reason)
        .detail(WEBHOOK_EVENT_KEY, &parsed.event_id),
    )
    .await?;
  d.state_machine
    .back_to_pending(
      &transaction.reservation_id,
      &[ReservationStatus::ExternalProcessingPayment, ReservationStatus::InPayment],
    )
    .await?;
  event!(Level::INFO, reservation_id = %transaction.reservation_id, reason, "Payment failed by webhook; reservation retryable.");
  Ok(WebhookResult::Failed(reason.to_string()))
}
