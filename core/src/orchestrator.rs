// tessera/src/orchestrator.rs

//! End-to-end payment attempts.
//!
//! `perform_payment` runs as a flow with one step per phase of the attempt:
//!
//! 1. `load`: reservation, purchase context and payment specification.
//! 2. `check_payable`: expiry and status.
//! 3. `resolve_provider`: first provider accepting the method, or `Failed`.
//! 4. `validate`: client token and offline-method selection.
//! 5. `open_attempt`: fresh PENDING transaction; reservation to IN_PAYMENT.
//! 6. `do_payment`: the provider call.
//! 7. `apply_outcome`: completion, failure bookkeeping or waiting.
//! 8. `notify` (optional): offline payment instructions.

use crate::config::ConfigKey;
use crate::error::{CoreError, CoreResult};
use crate::flow::{ContextData, Flow, FlowControl, SkipCondition};
use crate::model::{
  AuditEntry, AuditEvent, NewTransaction, PaymentMethod, PaymentProxy, PaymentResult, PaymentSpecification,
  PaymentToken, ReservationStatus, TicketReservation, Transaction, TransactionChanges, TransactionRequest,
  TransactionStatus,
};
use crate::providers::offline::{CustomOfflineCatalog, CustomOfflineMethod, OFFLINE_METHOD_KEY};
use crate::providers::{PaymentContext, PaymentMethodRegistry, PaymentProvider, RefundOutcome};
use crate::services::PaymentServices;
use crate::state_machine::{CompletionOutcome, ReservationStateMachine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{event, instrument, Level};

pub const METHOD_UNAVAILABLE_ERROR: &str = "error.STEP2_PAYMENT_METHOD_UNAVAILABLE";
pub const REFUNDED_CTS_KEY: &str = "refunded_cts";

/// What the customer submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
  pub reservation_id: String,
  pub method: PaymentMethod,
  #[serde(default)]
  pub token: Option<PaymentToken>,
  #[serde(default)]
  pub selected_offline_method: Option<String>,
}

/// Where a reservation's payment stands, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
  pub reservation_status: ReservationStatus,
  pub transaction_status: Option<TransactionStatus>,
  pub payment_proxy: Option<PaymentProxy>,
  pub amount_cts: i64,
  pub currency: String,
  /// The chosen custom offline method, even if it was deleted since.
  pub offline_method: Option<CustomOfflineMethod>,
}

/// State of one attempt, shared by the flow steps.
#[derive(Default)]
pub struct PaymentAttemptState {
  pub request: Option<PaymentRequest>,
  pub reservation: Option<TicketReservation>,
  pub context: Option<PaymentContext>,
  pub spec: Option<PaymentSpecification>,
  pub provider: Option<Arc<dyn PaymentProvider>>,
  pub attempt: Option<Transaction>,
  pub result: Option<PaymentResult>,
}

impl PaymentAttemptState {
  fn new(request: PaymentRequest) -> Self {
    PaymentAttemptState {
      request: Some(request),
      ..Default::default()
    }
  }
}

struct Deps {
  services: PaymentServices,
  registry: Arc<PaymentMethodRegistry>,
  state_machine: ReservationStateMachine,
}

fn missing(what: &str) -> CoreError {
  CoreError::Internal(format!("payment flow state is missing {what}"))
}

pub struct PaymentOrchestrator {
  deps: Arc<Deps>,
  flow: Flow<PaymentAttemptState, CoreError>,
}

impl PaymentOrchestrator {
  pub fn new(services: PaymentServices, registry: Arc<PaymentMethodRegistry>) -> Self {
    let state_machine = ReservationStateMachine::new(services.clone());
    let deps = Arc::new(Deps {
      services,
      registry,
      state_machine,
    });
    let flow = build_payment_flow(deps.clone());
    PaymentOrchestrator { deps, flow }
  }

  pub fn registry(&self) -> &PaymentMethodRegistry {
    &self.deps.registry
  }

  pub fn state_machine(&self) -> &ReservationStateMachine {
    &self.deps.state_machine
  }

  /// Payment context and transaction request for a reservation, as the
  /// registry needs them to list methods.
  pub async fn payment_context(&self, reservation_id: &str) -> CoreResult<(PaymentContext, TransactionRequest)> {
    let reservation = self.deps.services.load_reservation(reservation_id).await?;
    let context = context_for(&self.deps.services, &reservation).await?;
    let mut request = TransactionRequest::new(reservation.total_price());
    request.billing_country = reservation.customer.vat_country.clone();
    Ok((context, request))
  }

  /// Latest payment attempt of a reservation.
  #[instrument(name = "PaymentOrchestrator::payment_summary", skip(self))]
  pub async fn payment_summary(&self, reservation_id: &str) -> CoreResult<PaymentSummary> {
    let services = &self.deps.services;
    let reservation = services.load_reservation(reservation_id).await?;
    let latest = services
      .transactions
      .find_for_reservation(reservation_id)
      .await?
      .into_iter()
      .max_by_key(|t| (t.created_at, t.id));

    let offline_method = match latest.as_ref().and_then(|t| t.metadata.get(OFFLINE_METHOD_KEY)) {
      Some(method_id) => {
        let context = context_for(services, &reservation).await?;
        let values = services
          .configuration
          .get_for(&[ConfigKey::CustomOfflinePayments], &context.config_level())
          .await?;
        CustomOfflineCatalog::from_config(&values)?.resolve_for_display(method_id).cloned()
      }
      None => None,
    };

    Ok(PaymentSummary {
      reservation_status: reservation.status,
      transaction_status: latest.as_ref().map(|t| t.status),
      payment_proxy: latest.as_ref().map(|t| t.payment_proxy),
      amount_cts: reservation.final_price_cts,
      currency: reservation.currency.code().to_string(),
      offline_method,
    })
  }

  /// Runs one payment attempt.
  ///
  /// Returns `Err` for validation problems (the reservation is untouched),
  /// for concurrent attempts, for gateway timeouts (the attempt stays open so
  /// a webhook can resolve it) and for integrity failures (the reservation is
  /// parked as STUCK). Declined payments are `Ok(PaymentResult::Failed)`.
  #[instrument(name = "PaymentOrchestrator::perform_payment", skip(self, request), fields(reservation_id = %request.reservation_id, method = %request.method))]
  pub async fn perform_payment(&self, request: PaymentRequest) -> CoreResult<PaymentResult> {
    let ctx = ContextData::new(PaymentAttemptState::new(request));
    match self.flow.run(ctx.clone()).await {
      Ok(_) => ctx.write().result.take().ok_or_else(|| missing("a result")),
      Err(err) => self.handle_attempt_error(&ctx, err).await,
    }
  }

  async fn handle_attempt_error(
    &self,
    ctx: &ContextData<PaymentAttemptState>,
    err: CoreError,
  ) -> CoreResult<PaymentResult> {
    let (attempt, reservation_id) = {
      let state = ctx.read();
      (
        state.attempt.clone(),
        state.request.as_ref().map(|r| r.reservation_id.clone()).unwrap_or_default(),
      )
    };
    let Some(attempt) = attempt else {
      // Nothing was written yet.
      return Err(err);
    };

    match &err {
      CoreError::GatewayTimeout(_) => {
        event!(Level::WARN, transaction_id = attempt.id, error = %err, "Gateway timeout; attempt left open.");
        Err(err)
      }
      CoreError::Gateway { code, .. } => {
        let code = code.clone();
        record_failure(&self.deps, &reservation_id, &attempt, &code, &[ReservationStatus::InPayment]).await?;
        Ok(PaymentResult::failed(code))
      }
      e if e.is_fatal_for_attempt() => {
        event!(Level::ERROR, transaction_id = attempt.id, error = %err, "Payment attempt failed unexpectedly.");
        if let Err(stuck_err) = self.deps.state_machine.mark_stuck(&reservation_id, &err.to_string()).await {
          event!(Level::ERROR, error = %stuck_err, "Could not mark reservation STUCK.");
        }
        Err(err)
      }
      _ => {
        let code = match &err {
          CoreError::Validation { code, .. } => code.clone(),
          other => other.to_string(),
        };
        record_failure(&self.deps, &reservation_id, &attempt, &code, &[ReservationStatus::InPayment]).await?;
        Err(err)
      }
    }
  }

  /// Abandons a redirect-based attempt, or one that never reached the
  /// gateway, so the customer can choose another method.
  #[instrument(name = "PaymentOrchestrator::reset_payment", skip(self))]
  pub async fn reset_payment(&self, reservation_id: &str) -> CoreResult<()> {
    let services = &self.deps.services;
    let reservation = services.load_reservation(reservation_id).await?;
    let active = services.transactions.find_active_for_reservation(reservation_id).await?;
    match reservation.status {
      ReservationStatus::ExternalProcessingPayment => {}
      ReservationStatus::InPayment if active.as_ref().map_or(true, |t| t.gateway_id.is_none()) => {}
      ReservationStatus::Pending if active.is_none() => return Ok(()),
      ReservationStatus::InPayment => {
        return Err(CoreError::PaymentAlreadyInProgress(reservation_id.to_string()));
      }
      status => {
        return Err(CoreError::ReservationNotPayable {
          reservation_id: reservation_id.to_string(),
          status,
        })
      }
    }

    let now = services.clock.now();
    if let Some(active) = &active {
      let cancelled = services
        .transactions
        .transition(
          active.id,
          &[TransactionStatus::Pending],
          TransactionStatus::Cancelled,
          TransactionChanges::failure("payment reset"),
          now,
        )
        .await?;
      if cancelled.is_none() {
        // Settled by a webhook meanwhile.
        return Err(CoreError::PaymentAlreadyInProgress(reservation_id.to_string()));
      }
    }
    self
      .deps
      .state_machine
      .back_to_pending(
        reservation_id,
        &[ReservationStatus::ExternalProcessingPayment, ReservationStatus::InPayment],
      )
      .await?;
    services
      .audit(
        AuditEntry::new(reservation_id, AuditEvent::PaymentReset, now)
          .detail("transaction_id", active.map(|t| t.id.to_string()).unwrap_or_default()),
      )
      .await?;
    Ok(())
  }

  /// Finishes a redirect-based payment when the customer returns from the
  /// provider's page.
  #[instrument(name = "PaymentOrchestrator::confirm_external_payment", skip(self, token))]
  pub async fn confirm_external_payment(
    &self,
    reservation_id: &str,
    token: Option<PaymentToken>,
  ) -> CoreResult<PaymentResult> {
    let services = &self.deps.services;
    let reservation = services.load_reservation(reservation_id).await?;
    if reservation.status == ReservationStatus::Complete {
      let paid = services
        .transactions
        .find_for_reservation(reservation_id)
        .await?
        .into_iter()
        .find(|t| t.status == TransactionStatus::Complete);
      return Ok(PaymentResult::successful(
        paid.and_then(|t| t.gateway_id).unwrap_or_default(),
      ));
    }
    if reservation.status != ReservationStatus::ExternalProcessingPayment {
      return Err(CoreError::ReservationNotPayable {
        reservation_id: reservation_id.to_string(),
        status: reservation.status,
      });
    }
    let attempt = services
      .transactions
      .find_active_for_reservation(reservation_id)
      .await?
      .ok_or_else(|| CoreError::Integrity(format!("reservation {reservation_id} awaits a payment without transaction")))?;
    let provider = self
      .deps
      .registry
      .providers()
      .iter()
      .find(|p| p.proxy() == attempt.payment_proxy && p.as_external_processing().is_some())
      .cloned()
      .ok_or_else(|| CoreError::Integrity(format!("no external processing for {}", attempt.payment_proxy)))?;
    let Some(external) = provider.as_external_processing() else {
      return Err(missing("an external processing capability"));
    };

    let context = context_for(services, &reservation).await?;
    let spec = specification_for(&reservation, &context, token.clone(), None);
    let outcome = external.confirm_external_payment(&spec, &attempt, token.as_ref()).await;
    let result = match outcome {
      Ok(result) => result,
      Err(err @ CoreError::GatewayTimeout(_)) => return Err(err),
      Err(err) if err.is_fatal_for_attempt() => {
        self.deps.state_machine.mark_stuck(reservation_id, &err.to_string()).await?;
        return Err(err);
      }
      Err(err) => return Err(err),
    };
    apply_result(
      &self.deps,
      reservation_id,
      &attempt,
      &result,
      &[ReservationStatus::ExternalProcessingPayment],
    )
    .await?;
    Ok(result)
  }

  /// Operator confirmation that an offline payment arrived.
  #[instrument(name = "PaymentOrchestrator::confirm_offline_payment", skip(self))]
  pub async fn confirm_offline_payment(&self, reservation_id: &str, confirmed_by: &str) -> CoreResult<CompletionOutcome> {
    let services = &self.deps.services;
    let reservation = services.load_reservation(reservation_id).await?;
    if reservation.status == ReservationStatus::Complete {
      return Ok(CompletionOutcome::AlreadyComplete);
    }
    if !reservation.status.is_awaiting_offline_payment() {
      return Err(CoreError::ReservationNotPayable {
        reservation_id: reservation_id.to_string(),
        status: reservation.status,
      });
    }
    let active = services
      .transactions
      .find_active_for_reservation(reservation_id)
      .await?
      .ok_or_else(|| CoreError::Integrity(format!("reservation {reservation_id} has no open offline transaction")))?;
    let now = services.clock.now();
    let confirmed = services
      .transactions
      .transition(
        active.id,
        TransactionStatus::ACTIVE,
        TransactionStatus::Complete,
        TransactionChanges::default().with_metadata("confirmed_by", confirmed_by),
        now,
      )
      .await?;
    if confirmed.is_none() {
      return Err(CoreError::PaymentAlreadyInProgress(reservation_id.to_string()));
    }
    services
      .audit(
        AuditEntry::new(reservation_id, AuditEvent::PaymentConfirmed, now)
          .detail("transaction_id", active.id)
          .detail("confirmed_by", confirmed_by),
      )
      .await?;
    self.deps.state_machine.complete(reservation_id).await
  }

  /// Refunds all or part of a completed reservation's payment.
  #[instrument(name = "PaymentOrchestrator::refund", skip(self))]
  pub async fn refund(&self, reservation_id: &str, amount_cts: Option<i64>, requested_by: &str) -> CoreResult<RefundOutcome> {
    let services = &self.deps.services;
    let reservation = services.load_reservation(reservation_id).await?;
    if reservation.status != ReservationStatus::Complete {
      return Err(CoreError::validation("reservation", "error.refund.not_complete"));
    }
    let paid = services
      .transactions
      .find_for_reservation(reservation_id)
      .await?
      .into_iter()
      .find(|t| t.status == TransactionStatus::Complete)
      .ok_or_else(|| CoreError::Integrity(format!("complete reservation {reservation_id} without payment")))?;

    let already_refunded: i64 = paid
      .metadata
      .get(REFUNDED_CTS_KEY)
      .and_then(|v| v.parse().ok())
      .unwrap_or(0);
    let refundable = paid.amount_cts - already_refunded;
    let requested = amount_cts.unwrap_or(refundable);
    if requested <= 0 || requested > refundable {
      return Err(CoreError::validation("amount", "error.refund.amount"));
    }

    let provider = self
      .deps
      .registry
      .providers()
      .iter()
      .find(|p| p.proxy() == paid.payment_proxy && p.as_refund_request().is_some())
      .cloned()
      .ok_or_else(|| CoreError::validation("payment_method", "error.refund.unsupported"))?;
    let Some(refunder) = provider.as_refund_request() else {
      return Err(missing("a refund capability"));
    };

    let context = context_for(services, &reservation).await?;
    let amount = (requested != paid.amount_cts).then_some(requested);
    let outcome = refunder.refund(&paid, &context, amount).await?;

    let now = services.clock.now();
    let total_refunded = already_refunded + requested;
    services
      .transactions
      .transition(
        paid.id,
        &[TransactionStatus::Complete],
        TransactionStatus::Complete,
        TransactionChanges::default().with_metadata(REFUNDED_CTS_KEY, total_refunded.to_string()),
        now,
      )
      .await?;
    services
      .audit(
        AuditEntry::new(reservation_id, AuditEvent::Refund, now)
          .detail("refund_id", &outcome.refund_id)
          .detail("amount_cts", requested)
          .detail("requested_by", requested_by),
      )
      .await?;
    event!(Level::INFO, refund_id = %outcome.refund_id, amount_cts = requested, "Refund issued.");
    Ok(outcome)
  }
}

async fn context_for(services: &PaymentServices, reservation: &TicketReservation) -> CoreResult<PaymentContext> {
  let purchase_context = services.load_context(reservation.purchase_context_id).await?;
  let mut category_ids: Vec<i64> = services
    .inventory
    .tickets_for(&reservation.id)
    .await?
    .into_iter()
    .map(|t| t.category_id)
    .collect();
  category_ids.sort_unstable();
  category_ids.dedup();
  Ok(PaymentContext::new(purchase_context, category_ids, services.clock.now()))
}

fn specification_for(
  reservation: &TicketReservation,
  context: &PaymentContext,
  token: Option<PaymentToken>,
  selected_offline_method: Option<String>,
) -> PaymentSpecification {
  PaymentSpecification {
    reservation_id: reservation.id.clone(),
    purchase_context: context.purchase_context.clone(),
    price: reservation.total_price(),
    customer: reservation.customer.clone(),
    locale: reservation.locale.clone(),
    invoice_requested: reservation.invoice_requested,
    token,
    selected_offline_method,
    category_ids: context.category_ids.clone(),
  }
}

/// Marks the attempt FAILED and returns the reservation to PENDING.
async fn record_failure(
  deps: &Deps,
  reservation_id: &str,
  attempt: &Transaction,
  error_code: &str,
  from: &[ReservationStatus],
) -> CoreResult<()> {
  let now = deps.services.clock.now();
  deps
    .services
    .transactions
    .transition(
      attempt.id,
      TransactionStatus::ACTIVE,
      TransactionStatus::Failed,
      TransactionChanges::failure(error_code),
      now,
    )
    .await?;
  deps.state_machine.back_to_pending(reservation_id, from).await?;
  deps
    .services
    .audit(
      AuditEntry::new(reservation_id, AuditEvent::PaymentFailed, now)
        .detail("transaction_id", attempt.id)
        .detail("error_code", error_code),
    )
    .await?;
  event!(Level::INFO, reservation_id, error_code, "Payment attempt failed; reservation retryable.");
  Ok(())
}

/// Applies a provider result to the attempt and the reservation.
async fn apply_result(
  deps: &Deps,
  reservation_id: &str,
  attempt: &Transaction,
  result: &PaymentResult,
  waiting_from: &[ReservationStatus],
) -> CoreResult<()> {
  let now = deps.services.clock.now();
  match result {
    PaymentResult::Successful { gateway_id } if result.is_paid() => {
      deps
        .services
        .audit(
          AuditEntry::new(reservation_id, AuditEvent::PaymentConfirmed, now)
            .detail("transaction_id", attempt.id)
            .detail("gateway_id", gateway_id),
        )
        .await?;
      deps.state_machine.complete(reservation_id).await?;
    }
    PaymentResult::Successful { .. } => {}
    PaymentResult::Redirect { url } => {
      deps
        .services
        .audit(
          AuditEntry::new(reservation_id, AuditEvent::PaymentRedirected, now)
            .detail("transaction_id", attempt.id)
            .detail("url", url),
        )
        .await?;
    }
    PaymentResult::Failed { error_code } => {
      record_failure(deps, reservation_id, attempt, error_code, waiting_from).await?;
    }
  }
  Ok(())
}

type AttemptCtx = ContextData<PaymentAttemptState>;

fn build_payment_flow(deps: Arc<Deps>) -> Flow<PaymentAttemptState, CoreError> {
  let settled_now: SkipCondition<PaymentAttemptState> = Arc::new(|ctx: &AttemptCtx| !awaits_offline_payment(ctx));
  let mut flow = Flow::new(
    "perform_payment",
    &[
      ("load", false, None),
      ("check_payable", false, None),
      ("resolve_provider", false, None),
      ("validate", false, None),
      ("open_attempt", false, None),
      ("do_payment", false, None),
      ("apply_outcome", false, None),
      ("notify", true, Some(settled_now)),
    ],
  );

  let d = deps.clone();
  flow.on("load", move |ctx: AttemptCtx| load(d.clone(), ctx));
  let d = deps.clone();
  flow.on("check_payable", move |ctx: AttemptCtx| check_payable(d.clone(), ctx));
  let d = deps.clone();
  flow.on("resolve_provider", move |ctx: AttemptCtx| resolve_provider(d.clone(), ctx));
  flow.on("validate", validate);
  let d = deps.clone();
  flow.on("open_attempt", move |ctx: AttemptCtx| open_attempt(d.clone(), ctx));
  flow.on("do_payment", do_payment);
  let d = deps.clone();
  flow.on("apply_outcome", move |ctx: AttemptCtx| apply_outcome(d.clone(), ctx));
  flow.on("notify", move |ctx: AttemptCtx| notify(deps.clone(), ctx));
  flow
}

async fn load(d: Arc<Deps>, ctx: AttemptCtx) -> CoreResult<FlowControl> {
  let request = ctx.read().request.clone().ok_or_else(|| missing("the request"))?;
  let reservation = d.services.load_reservation(&request.reservation_id).await?;
  let context = context_for(&d.services, &reservation).await?;
  let spec = specification_for(&reservation, &context, request.token, request.selected_offline_method);
  ctx.update(|s| {
    s.reservation = Some(reservation);
    s.context = Some(context);
    s.spec = Some(spec);
  });
  Ok(FlowControl::Continue)
}

async fn check_payable(d: Arc<Deps>, ctx: AttemptCtx) -> CoreResult<FlowControl> {
  let reservation = ctx.read().reservation.clone().ok_or_else(|| missing("the reservation"))?;
  ReservationStateMachine::check_payable(&reservation, d.services.clock.now())?;
  if !reservation.total_price().is_consistent() {
    return Err(CoreError::Integrity(format!(
      "reservation {} totals are inconsistent",
      reservation.id
    )));
  }
  Ok(FlowControl::Continue)
}

async fn resolve_provider(d: Arc<Deps>, ctx: AttemptCtx) -> CoreResult<FlowControl> {
  let (method, context, reservation) = {
    let s = ctx.read();
    (s.request.as_ref().map(|r| r.method), s.context.clone(), s.reservation.clone())
  };
  let method = method.ok_or_else(|| missing("the request"))?;
  let context = context.ok_or_else(|| missing("the payment context"))?;
  let reservation = reservation.ok_or_else(|| missing("the reservation"))?;
  let mut request = TransactionRequest::new(reservation.total_price());
  request.billing_country = reservation.customer.vat_country.clone();

  match d.registry.resolve(method, &context, &request).await? {
    Some(provider) => {
      event!(Level::DEBUG, provider = %provider.id(), "Provider resolved.");
      ctx.update(|s| s.provider = Some(provider));
      Ok(FlowControl::Continue)
    }
    None => {
      event!(Level::INFO, method = %method, "No provider accepts the payment method.");
      ctx.update(|s| s.result = Some(PaymentResult::failed(METHOD_UNAVAILABLE_ERROR)));
      Ok(FlowControl::Stop)
    }
  }
}

async fn validate(ctx: AttemptCtx) -> CoreResult<FlowControl> {
  let (provider, spec) = {
    let s = ctx.read();
    (s.provider.clone(), s.spec.clone())
  };
  let provider = provider.ok_or_else(|| missing("the provider"))?;
  let spec = spec.ok_or_else(|| missing("the specification"))?;
  if provider.requires_client_token() {
    provider.validate_token(spec.token.as_ref())?;
  }
  provider.validate_selection(&spec).await?;
  Ok(FlowControl::Continue)
}

async fn open_attempt(d: Arc<Deps>, ctx: AttemptCtx) -> CoreResult<FlowControl> {
  let (provider, spec, status) = {
    let s = ctx.read();
    (s.provider.clone(), s.spec.clone(), s.reservation.as_ref().map(|r| r.status))
  };
  let provider = provider.ok_or_else(|| missing("the provider"))?;
  let spec = spec.ok_or_else(|| missing("the specification"))?;
  let now = d.services.clock.now();

  let new = NewTransaction {
    reservation_id: spec.reservation_id.clone(),
    payment_proxy: provider.proxy(),
    amount_cts: spec.amount_cts(),
    currency: spec.currency_code().to_string(),
    description: spec.description(),
    metadata: provider.attempt_metadata(&spec),
    created_at: now,
  };
  let Some(attempt) = d.services.transactions.open_attempt(new).await? else {
    event!(Level::WARN, "Rejected concurrent payment attempt.");
    return Err(CoreError::PaymentAlreadyInProgress(spec.reservation_id.clone()));
  };

  if status != Some(ReservationStatus::InPayment) {
    let moved = d
      .state_machine
      .transition(&spec.reservation_id, &[ReservationStatus::Pending], ReservationStatus::InPayment)
      .await?;
    if !moved {
      // The reservation moved under us; give the attempt back.
      d.services
        .transactions
        .transition(
          attempt.id,
          &[TransactionStatus::Pending],
          TransactionStatus::Cancelled,
          TransactionChanges::failure("reservation changed concurrently"),
          now,
        )
        .await?;
      return Err(CoreError::PaymentAlreadyInProgress(spec.reservation_id.clone()));
    }
  }

  d.services
    .audit(
      AuditEntry::new(&spec.reservation_id, AuditEvent::PaymentAttempted, now)
        .detail("transaction_id", attempt.id)
        .detail("provider", provider.id())
        .detail("amount_cts", attempt.amount_cts),
    )
    .await?;
  ctx.update(|s| s.attempt = Some(attempt));
  Ok(FlowControl::Continue)
}

async fn do_payment(ctx: AttemptCtx) -> CoreResult<FlowControl> {
  let (provider, spec, attempt) = {
    let s = ctx.read();
    (s.provider.clone(), s.spec.clone(), s.attempt.clone())
  };
  let provider = provider.ok_or_else(|| missing("the provider"))?;
  let spec = spec.ok_or_else(|| missing("the specification"))?;
  let attempt = attempt.ok_or_else(|| missing("the attempt"))?;
  let result = provider.do_payment(&spec, &attempt).await?;
  ctx.update(|s| s.result = Some(result));
  Ok(FlowControl::Continue)
}

async fn apply_outcome(d: Arc<Deps>, ctx: AttemptCtx) -> CoreResult<FlowControl> {
  let (spec, attempt, result) = {
    let s = ctx.read();
    (s.spec.clone(), s.attempt.clone(), s.result.clone())
  };
  let spec = spec.ok_or_else(|| missing("the specification"))?;
  let attempt = attempt.ok_or_else(|| missing("the attempt"))?;
  let result = result.ok_or_else(|| missing("a result"))?;
  apply_result(&d, &spec.reservation_id, &attempt, &result, &[ReservationStatus::InPayment]).await?;
  Ok(FlowControl::Continue)
}

/// Accepted but not paid yet: the money comes later, by transfer or at the desk.
fn awaits_offline_payment(ctx: &AttemptCtx) -> bool {
  ctx
    .read()
    .result
    .as_ref()
    .map_or(false, |r| r.is_successful() && !r.is_paid())
}

/// Offline instructions for attempts that will be settled later. Mail
/// failures never fail the attempt.
async fn notify(d: Arc<Deps>, ctx: AttemptCtx) -> CoreResult<FlowControl> {
  let (spec, method) = {
    let s = ctx.read();
    (s.spec.clone(), s.request.as_ref().map(|r| r.method))
  };
  let (Some(spec), Some(method)) = (spec, method) else {
    return Ok(FlowControl::Continue);
  };
  let reservation = d.services.load_reservation(&spec.reservation_id).await?;
  if let Err(e) = d
    .services
    .notifications
    .send_offline_payment_instructions(&spec.purchase_context, &reservation, method)
    .await
  {
    event!(Level::WARN, reservation_id = %spec.reservation_id, error = %e, "Offline payment instructions not sent.");
  }
  Ok(FlowControl::Continue)
}

impl std::fmt::Debug for PaymentOrchestrator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PaymentOrchestrator")
      .field("flow", &self.flow.step_names())
      .finish()
  }
}
