// tessera/src/providers/stripe_checkout.rs

//! Stripe Checkout: the customer pays on Stripe's hosted page and the result
//! comes back as a webhook (or when the customer returns to the shop).

use super::http::{GatewayError, DEFAULT_GATEWAY_TIMEOUT};
use super::stripe::{
  credentials_and_fee, stripe_refund, verify_signature, CheckoutSessionRequest, HttpStripeApi, StripeApi, StripeError,
  CREDENTIAL_KEYS, SIGNATURE_TOLERANCE_SECS,
};
use super::{
  ConfigSnapshot, ExternalProcessing, PaymentContext, PaymentProvider, ProviderId, RefundOutcome, RefundRequest,
  WebhookEvent, WebhookHandler, WebhookOutcome, WebhookRequest,
};
use crate::config::{ConfigKey, ConfigLevel};
use crate::error::{CoreError, CoreResult};
use crate::model::{
  PaymentMethod, PaymentProxy, PaymentResult, PaymentSpecification, PaymentToken, ReservationStatus, Transaction,
  TransactionChanges, TransactionRequest, TransactionStatus,
};
use crate::services::PaymentServices;
use crate::state_machine::ReservationStateMachine;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{event, instrument, Level};

pub const CHECKOUT_SESSION_KEY: &str = "checkout_session_id";
pub const CHECKOUT_URL_KEY: &str = "checkout_url";

pub struct StripeCheckoutProvider {
  services: PaymentServices,
  state_machine: ReservationStateMachine,
  api: Arc<dyn StripeApi>,
}

impl StripeCheckoutProvider {
  pub fn new(services: PaymentServices, api: Arc<dyn StripeApi>) -> Self {
    let state_machine = ReservationStateMachine::new(services.clone());
    StripeCheckoutProvider {
      services,
      state_machine,
      api,
    }
  }

  pub fn with_http(services: PaymentServices) -> Result<Self, GatewayError> {
    Ok(Self::new(services, Arc::new(HttpStripeApi::new(DEFAULT_GATEWAY_TIMEOUT)?)))
  }

  fn level(spec: &PaymentSpecification) -> ConfigLevel {
    ConfigLevel::event(spec.purchase_context.organization_id, spec.purchase_context.id)
  }

  async fn complete_attempt(&self, attempt: &Transaction, payment_intent: &str) -> CoreResult<PaymentResult> {
    let now = self.services.clock.now();
    let changes = TransactionChanges::gateway_id(payment_intent).with_metadata(
      CHECKOUT_SESSION_KEY,
      attempt.gateway_id.clone().unwrap_or_default(),
    );
    let updated = self
      .services
      .transactions
      .transition(attempt.id, &[TransactionStatus::Pending], TransactionStatus::Complete, changes, now)
      .await?;
    match updated {
      Some(_) => Ok(PaymentResult::successful(payment_intent)),
      // A webhook settled it in the meantime.
      None => match self.services.transactions.find(attempt.id).await? {
        Some(tx) if tx.status == TransactionStatus::Complete => {
          Ok(PaymentResult::successful(tx.gateway_id.unwrap_or_else(|| payment_intent.to_string())))
        }
        _ => Err(CoreError::Integrity(format!(
          "checkout paid but transaction {} is no longer pending",
          attempt.id
        ))),
      },
    }
  }
}

#[async_trait]
impl PaymentProvider for StripeCheckoutProvider {
  fn id(&self) -> ProviderId {
    ProviderId::StripeCheckout
  }

  fn proxy(&self) -> PaymentProxy {
    PaymentProxy::Stripe
  }

  fn payment_methods(&self) -> &'static [PaymentMethod] {
    &[PaymentMethod::CreditCard]
  }

  fn config_keys(&self) -> &'static [ConfigKey] {
    &[ConfigKey::StripeCcEnabled, ConfigKey::StripeEnableSca, ConfigKey::StripeSecretKey]
  }

  fn accept(
    &self,
    method: PaymentMethod,
    _context: &PaymentContext,
    request: &TransactionRequest,
    config: &ConfigSnapshot,
  ) -> bool {
    self.handles(method)
      && request.amount_cts() > 0
      && config.event.bool(ConfigKey::StripeCcEnabled)
      && config.event.bool(ConfigKey::StripeEnableSca)
      && config.event.get(ConfigKey::StripeSecretKey).map_or(false, |v| v.is_present())
  }

  #[instrument(name = "StripeCheckoutProvider::do_payment", skip_all, fields(reservation_id = %spec.reservation_id, transaction_id = attempt.id))]
  async fn do_payment(&self, spec: &PaymentSpecification, attempt: &Transaction) -> CoreResult<PaymentResult> {
    let values = self.services.configuration.get_for(CREDENTIAL_KEYS, &Self::level(spec)).await?;
    let (credentials, fee) = credentials_and_fee(&values, spec.amount_cts())?;
    let base_url = values.require(ConfigKey::BaseUrl)?;
    let base_url = base_url.trim_end_matches('/');
    let request = CheckoutSessionRequest {
      amount_cts: spec.amount_cts(),
      currency: spec.currency_code().to_string(),
      description: spec.description(),
      reservation_id: spec.reservation_id.clone(),
      customer_email: spec.customer.email.clone(),
      success_url: format!("{base_url}/reservations/{}/payment/return", spec.reservation_id),
      cancel_url: format!("{base_url}/reservations/{}/payment/cancel", spec.reservation_id),
      application_fee_cts: fee,
    };

    let session = match self
      .api
      .create_checkout_session(&credentials, &request, &format!("tessera-tx-{}", attempt.id))
      .await
    {
      Ok(session) => session,
      Err(StripeError::Timeout) => {
        return Err(CoreError::GatewayTimeout(format!(
          "stripe checkout session for transaction {}",
          attempt.id
        )))
      }
      Err(err) => {
        event!(Level::WARN, error = %err, "Checkout session creation failed.");
        return Ok(PaymentResult::failed(err.error_code()));
      }
    };
    let Some(url) = session.url.clone() else {
      return Ok(PaymentResult::failed("error.STEP2_STRIPE_unexpected"));
    };

    let changes = TransactionChanges {
      gateway_id: Some(session.id.clone()),
      platform_fee_cts: fee,
      ..Default::default()
    }
    .with_metadata(CHECKOUT_SESSION_KEY, session.id.clone())
    .with_metadata(CHECKOUT_URL_KEY, url.clone());
    let now = self.services.clock.now();
    self
      .services
      .transactions
      .transition(attempt.id, &[TransactionStatus::Pending], TransactionStatus::Pending, changes, now)
      .await?
      .ok_or_else(|| CoreError::Integrity(format!("transaction {} left PENDING during checkout", attempt.id)))?;

    self
      .state_machine
      .enter_waiting_state(
        &spec.reservation_id,
        ReservationStatus::ExternalProcessingPayment,
        PaymentProxy::Stripe,
        None,
      )
      .await?;
    event!(Level::INFO, session_id = %session.id, "Customer redirected to Stripe Checkout.");
    Ok(PaymentResult::redirect(url))
  }

  fn as_webhook_handler(&self) -> Option<&dyn WebhookHandler> {
    Some(self)
  }

  fn as_refund_request(&self) -> Option<&dyn RefundRequest> {
    Some(self)
  }

  fn as_external_processing(&self) -> Option<&dyn ExternalProcessing> {
    Some(self)
  }
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
  id: String,
  #[serde(rename = "type")]
  event_type: String,
  #[serde(default)]
  livemode: bool,
  data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
  object: serde_json::Value,
}

fn str_field<'a>(object: &'a serde_json::Value, path: &[&str]) -> Option<&'a str> {
  path.iter().try_fold(object, |value, key| value.get(*key))?.as_str()
}

#[async_trait]
impl WebhookHandler for StripeCheckoutProvider {
  fn parse_webhook(&self, request: &WebhookRequest) -> CoreResult<Option<WebhookEvent>> {
    let parsed: StripeEvent = serde_json::from_str(&request.payload)
      .map_err(|_| CoreError::validation("payload", "error.webhook.malformed"))?;
    let object = &parsed.data.object;
    let reservation_id = str_field(object, &["metadata", "reservation_id"])
      .or_else(|| str_field(object, &["client_reference_id"]))
      .map(str::to_string);

    let (gateway_reference, outcome) = match parsed.event_type.as_str() {
      "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
        if str_field(object, &["payment_status"]) != Some("paid") {
          // Completed but still settling (delayed payment methods).
          return Ok(None);
        }
        let charge_id = str_field(object, &["payment_intent"]).unwrap_or(parsed.id.as_str()).to_string();
        (
          str_field(object, &["id"]).map(str::to_string),
          WebhookOutcome::Succeeded { charge_id, fee_cts: None },
        )
      }
      "checkout.session.async_payment_failed" | "checkout.session.expired" => (
        str_field(object, &["id"]).map(str::to_string),
        WebhookOutcome::Failed {
          reason: parsed.event_type.clone(),
        },
      ),
      "payment_intent.succeeded" => (
        None,
        WebhookOutcome::Succeeded {
          charge_id: str_field(object, &["id"]).unwrap_or_default().to_string(),
          fee_cts: object.get("application_fee_amount").and_then(|v| v.as_i64()),
        },
      ),
      "payment_intent.payment_failed" => (
        None,
        WebhookOutcome::Failed {
          reason: str_field(object, &["last_payment_error", "code"])
            .map(|code| format!("error.STEP2_STRIPE_{code}"))
            .unwrap_or_else(|| "error.STEP2_STRIPE_unexpected".to_string()),
        },
      ),
      _ => return Ok(None),
    };

    Ok(Some(WebhookEvent {
      event_id: parsed.id,
      event_type: parsed.event_type,
      gateway_reference,
      reservation_id,
      live_mode: parsed.livemode,
      outcome,
    }))
  }

  async fn verify_webhook(&self, request: &WebhookRequest, context: &PaymentContext) -> CoreResult<bool> {
    let Some(header) = request.signature.as_deref() else {
      return Ok(false);
    };
    let values = self
      .services
      .configuration
      .get_for(&[ConfigKey::StripeWebhookSecret], &context.config_level())
      .await?;
    let secret = values.require(ConfigKey::StripeWebhookSecret)?;
    Ok(verify_signature(
      &request.payload,
      header,
      &secret,
      context.now,
      SIGNATURE_TOLERANCE_SECS,
    ))
  }

  async fn accepts_mode(&self, event: &WebhookEvent, context: &PaymentContext) -> CoreResult<bool> {
    let values = self
      .services
      .configuration
      .get_for(&[ConfigKey::StripeLiveMode], &context.config_level())
      .await?;
    Ok(values.bool(ConfigKey::StripeLiveMode) == event.live_mode)
  }
}

#[async_trait]
impl RefundRequest for StripeCheckoutProvider {
  async fn refund(
    &self,
    transaction: &Transaction,
    context: &PaymentContext,
    amount_cts: Option<i64>,
  ) -> CoreResult<RefundOutcome> {
    stripe_refund(&self.services, self.api.as_ref(), transaction, context, amount_cts).await
  }
}

#[async_trait]
impl ExternalProcessing for StripeCheckoutProvider {
  /// Asks Stripe about the session when the customer comes back before the
  /// webhook did.
  async fn confirm_external_payment(
    &self,
    spec: &PaymentSpecification,
    attempt: &Transaction,
    _token: Option<&PaymentToken>,
  ) -> CoreResult<PaymentResult> {
    if attempt.status == TransactionStatus::Complete {
      return Ok(PaymentResult::successful(attempt.gateway_id.clone().unwrap_or_default()));
    }
    let session_id = attempt
      .metadata
      .get(CHECKOUT_SESSION_KEY)
      .cloned()
      .or_else(|| attempt.gateway_id.clone())
      .ok_or_else(|| CoreError::Integrity(format!("transaction {} has no checkout session", attempt.id)))?;
    let values = self.services.configuration.get_for(CREDENTIAL_KEYS, &Self::level(spec)).await?;
    let (credentials, _) = credentials_and_fee(&values, attempt.amount_cts)?;
    let session = match self.api.retrieve_checkout_session(&credentials, &session_id).await {
      Ok(session) => session,
      Err(StripeError::Timeout) => return Err(CoreError::GatewayTimeout(format!("checkout session {session_id}"))),
      Err(err) => return Ok(PaymentResult::failed(err.error_code())),
    };
    match (session.payment_status.as_str(), session.status.as_deref()) {
      ("paid", _) => {
        let intent = session.payment_intent.unwrap_or(session.id);
        self.complete_attempt(attempt, &intent).await
      }
      (_, Some("expired")) => Ok(PaymentResult::failed("error.STEP2_STRIPE_abort")),
      _ => Ok(PaymentResult::redirect(
        attempt
          .metadata
          .get(CHECKOUT_URL_KEY)
          .cloned()
          .or(session.url)
          .unwrap_or_default(),
      )),
    }
  }
}
