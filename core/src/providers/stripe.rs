// tessera/src/providers/stripe.rs

//! Stripe card payments: the REST client, error classification, platform
//! fees, webhook signatures and the synchronous card provider.

use super::http::{build_client, GatewayError, DEFAULT_GATEWAY_TIMEOUT};
use super::{ConfigSnapshot, PaymentContext, PaymentProvider, ProviderId, RefundOutcome, RefundRequest};
use crate::config::{ConfigKey, ConfigValues};
use crate::error::{CoreError, CoreResult};
use crate::model::{
  PaymentMethod, PaymentProxy, PaymentResult, PaymentSpecification, PaymentToken, Transaction, TransactionChanges,
  TransactionRequest, TransactionStatus,
};
use crate::services::PaymentServices;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, instrument, Level};

pub const STRIPE_API_BASE: &str = "https://api.stripe.com";
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Failures reported by the Stripe API, by the family Stripe assigns them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StripeError {
  #[error("card error {code}: {message}")]
  Card { code: String, message: String },

  #[error("invalid request on '{param}': {message}")]
  InvalidRequest { param: String, message: String },

  #[error("authentication with Stripe failed: {0}")]
  Authentication(String),

  #[error("could not reach Stripe: {0}")]
  ApiConnection(String),

  #[error("Stripe rate limit hit: {0}")]
  RateLimit(String),

  #[error("Stripe API error: {0}")]
  Api(String),

  /// No answer within the client timeout. The charge may still have happened.
  #[error("Stripe call timed out")]
  Timeout,
}

impl StripeError {
  /// The user-facing message key for this error.
  pub fn error_code(&self) -> String {
    match self {
      StripeError::Card { code, .. } => format!("error.STEP2_STRIPE_{code}"),
      StripeError::InvalidRequest { param, .. } => format!("error.STEP2_STRIPE_invalid_{param}"),
      StripeError::Authentication(_) | StripeError::ApiConnection(_) => "error.STEP2_STRIPE_abort".to_string(),
      StripeError::RateLimit(_) | StripeError::Api(_) | StripeError::Timeout => {
        "error.STEP2_STRIPE_unexpected".to_string()
      }
    }
  }
}

impl From<GatewayError> for StripeError {
  fn from(err: GatewayError) -> Self {
    match err {
      GatewayError::Timeout => StripeError::Timeout,
      GatewayError::Connection(message) => StripeError::ApiConnection(message),
      GatewayError::Status { status, body } => classify_response(status, &body),
      GatewayError::Decode(message) => StripeError::Api(message),
    }
  }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
  error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
  #[serde(rename = "type")]
  kind: Option<String>,
  code: Option<String>,
  param: Option<String>,
  message: Option<String>,
}

/// Maps an error response body onto a `StripeError`.
pub fn classify_response(status: u16, body: &str) -> StripeError {
  let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
  let message = parsed
    .as_ref()
    .and_then(|e| e.message.clone())
    .unwrap_or_else(|| body.to_string());
  match (status, parsed) {
    (401, _) => StripeError::Authentication(message),
    (429, _) => StripeError::RateLimit(message),
    (_, Some(ErrorBody { kind: Some(kind), code, .. })) if kind == "card_error" => StripeError::Card {
      code: code.unwrap_or_else(|| "card_declined".to_string()),
      message,
    },
    (_, Some(ErrorBody { kind: Some(kind), param, .. })) if kind == "invalid_request_error" => {
      StripeError::InvalidRequest {
        param: param.unwrap_or_else(|| "request".to_string()),
        message,
      }
    }
    _ => StripeError::Api(message),
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeCredentials {
  pub secret_key: String,
  pub connected_account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
  pub amount_cts: i64,
  pub currency: String,
  pub source: String,
  pub description: String,
  pub reservation_id: String,
  pub customer_email: String,
  pub application_fee_cts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StripeCharge {
  pub id: String,
  pub amount: i64,
  #[serde(default)]
  pub paid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
  pub amount_cts: i64,
  pub currency: String,
  pub description: String,
  pub reservation_id: String,
  pub customer_email: String,
  pub success_url: String,
  pub cancel_url: String,
  pub application_fee_cts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
  pub id: String,
  pub url: Option<String>,
  pub status: Option<String>,
  #[serde(default)]
  pub payment_status: String,
  pub payment_intent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StripeRefund {
  pub id: String,
  pub amount: i64,
  pub status: Option<String>,
}

/// The subset of the Stripe REST API used for payments.
#[async_trait]
pub trait StripeApi: Send + Sync {
  async fn create_charge(
    &self,
    credentials: &StripeCredentials,
    request: &ChargeRequest,
    idempotency_key: &str,
  ) -> Result<StripeCharge, StripeError>;

  async fn create_checkout_session(
    &self,
    credentials: &StripeCredentials,
    request: &CheckoutSessionRequest,
    idempotency_key: &str,
  ) -> Result<CheckoutSession, StripeError>;

  async fn retrieve_checkout_session(
    &self,
    credentials: &StripeCredentials,
    session_id: &str,
  ) -> Result<CheckoutSession, StripeError>;

  /// `payment_reference` is a charge id (`ch_…`) or a payment intent id (`pi_…`).
  async fn create_refund(
    &self,
    credentials: &StripeCredentials,
    payment_reference: &str,
    amount_cts: Option<i64>,
  ) -> Result<StripeRefund, StripeError>;
}

/// `StripeApi` over HTTPS with form-encoded requests.
#[derive(Debug, Clone)]
pub struct HttpStripeApi {
  client: reqwest::Client,
  base_url: String,
}

impl HttpStripeApi {
  pub fn new(timeout: Duration) -> Result<Self, GatewayError> {
    Self::with_base_url(STRIPE_API_BASE, timeout)
  }

  pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
    Ok(HttpStripeApi {
      client: build_client(timeout)?,
      base_url: base_url.into(),
    })
  }

  fn request(
    &self,
    method: reqwest::Method,
    path: &str,
    credentials: &StripeCredentials,
  ) -> reqwest::RequestBuilder {
    let mut builder = self
      .client
      .request(method, format!("{}{}", self.base_url, path))
      .bearer_auth(&credentials.secret_key);
    if let Some(account) = &credentials.connected_account {
      builder = builder.header("Stripe-Account", account);
    }
    builder
  }

  async fn send<T: serde::de::DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T, StripeError> {
    let response = builder.send().await.map_err(GatewayError::from)?;
    let status = response.status();
    let body = response.text().await.map_err(GatewayError::from)?;
    if !status.is_success() {
      return Err(classify_response(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|e| StripeError::Api(format!("unexpected response: {e}")))
  }
}

#[async_trait]
impl StripeApi for HttpStripeApi {
  async fn create_charge(
    &self,
    credentials: &StripeCredentials,
    request: &ChargeRequest,
    idempotency_key: &str,
  ) -> Result<StripeCharge, StripeError> {
    let mut form = vec![
      ("amount".to_string(), request.amount_cts.to_string()),
      ("currency".to_string(), request.currency.to_lowercase()),
      ("source".to_string(), request.source.clone()),
      ("description".to_string(), request.description.clone()),
      ("receipt_email".to_string(), request.customer_email.clone()),
      ("metadata[reservation_id]".to_string(), request.reservation_id.clone()),
    ];
    if let Some(fee) = request.application_fee_cts.filter(|f| *f > 0) {
      form.push(("application_fee_amount".to_string(), fee.to_string()));
    }
    let builder = self
      .request(reqwest::Method::POST, "/v1/charges", credentials)
      .header("Idempotency-Key", idempotency_key)
      .form(&form);
    self.send(builder).await
  }

  async fn create_checkout_session(
    &self,
    credentials: &StripeCredentials,
    request: &CheckoutSessionRequest,
    idempotency_key: &str,
  ) -> Result<CheckoutSession, StripeError> {
    let mut form = vec![
      ("mode".to_string(), "payment".to_string()),
      ("success_url".to_string(), request.success_url.clone()),
      ("cancel_url".to_string(), request.cancel_url.clone()),
      ("client_reference_id".to_string(), request.reservation_id.clone()),
      ("customer_email".to_string(), request.customer_email.clone()),
      ("line_items[0][quantity]".to_string(), "1".to_string()),
      ("line_items[0][price_data][currency]".to_string(), request.currency.to_lowercase()),
      ("line_items[0][price_data][unit_amount]".to_string(), request.amount_cts.to_string()),
      ("line_items[0][price_data][product_data][name]".to_string(), request.description.clone()),
      ("metadata[reservation_id]".to_string(), request.reservation_id.clone()),
      ("payment_intent_data[metadata][reservation_id]".to_string(), request.reservation_id.clone()),
    ];
    if let Some(fee) = request.application_fee_cts.filter(|f| *f > 0) {
      form.push(("payment_intent_data[application_fee_amount]".to_string(), fee.to_string()));
    }
    let builder = self
      .request(reqwest::Method::POST, "/v1/checkout/sessions", credentials)
      .header("Idempotency-Key", idempotency_key)
      .form(&form);
    self.send(builder).await
  }

  async fn retrieve_checkout_session(
    &self,
    credentials: &StripeCredentials,
    session_id: &str,
  ) -> Result<CheckoutSession, StripeError> {
    let builder = self.request(
      reqwest::Method::GET,
      &format!("/v1/checkout/sessions/{session_id}"),
      credentials,
    );
    self.send(builder).await
  }

  async fn create_refund(
    &self,
    credentials: &StripeCredentials,
    payment_reference: &str,
    amount_cts: Option<i64>,
  ) -> Result<StripeRefund, StripeError> {
    let field = if payment_reference.starts_with("pi_") { "payment_intent" } else { "charge" };
    let mut form = vec![(field.to_string(), payment_reference.to_string())];
    if let Some(amount) = amount_cts {
      form.push(("amount".to_string(), amount.to_string()));
    }
    let builder = self.request(reqwest::Method::POST, "/v1/refunds", credentials).form(&form);
    self.send(builder).await
  }
}

/// Platform fee in minor units: a percentage of the amount plus a fixed part,
/// never more than the amount itself.
pub fn platform_fee(amount_cts: i64, percentage: Decimal, fixed_cts: i64) -> CoreResult<i64> {
  let variable = crate::pricing::percentage_of(amount_cts, percentage)?;
  Ok(variable.saturating_add(fixed_cts).clamp(0, amount_cts.max(0)))
}

pub(crate) const CREDENTIAL_KEYS: &[ConfigKey] = &[
  ConfigKey::StripeSecretKey,
  ConfigKey::StripeConnectedId,
  ConfigKey::PlatformFeePercentage,
  ConfigKey::PlatformFeeFixedCts,
  ConfigKey::StripeLiveMode,
  ConfigKey::StripeWebhookSecret,
  ConfigKey::BaseUrl,
];

/// Credentials and fee for one payment, read from the event's configuration.
pub(crate) fn credentials_and_fee(values: &ConfigValues, amount_cts: i64) -> CoreResult<(StripeCredentials, Option<i64>)> {
  let secret_key = values.require(ConfigKey::StripeSecretKey)?;
  let connected_account = values.string(ConfigKey::StripeConnectedId).filter(|s| !s.trim().is_empty());
  let fee = if connected_account.is_some() {
    Some(platform_fee(
      amount_cts,
      values.decimal(ConfigKey::PlatformFeePercentage)?,
      values.i64(ConfigKey::PlatformFeeFixedCts)?,
    )?)
  } else {
    None
  };
  Ok((
    StripeCredentials {
      secret_key,
      connected_account,
    },
    fee,
  ))
}

/// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=…]`) against
/// `payload`. Signatures older than `tolerance_secs` are rejected.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: DateTime<Utc>, tolerance_secs: i64) -> bool {
  let mut timestamp: Option<i64> = None;
  let mut signatures = Vec::new();
  for part in header.split(',') {
    match part.trim().split_once('=') {
      Some(("t", value)) => timestamp = value.parse().ok(),
      Some(("v1", value)) => signatures.push(value.to_string()),
      _ => {}
    }
  }
  let Some(timestamp) = timestamp else {
    return false;
  };
  if (now.timestamp() - timestamp).abs() > tolerance_secs {
    return false;
  }
  let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
    return false;
  };
  mac.update(format!("{timestamp}.{payload}").as_bytes());
  let expected = mac.finalize().into_bytes();
  signatures.iter().any(|sig| {
    hex::decode(sig)
      .ok()
      .map_or(false, |bytes| constant_time_eq(&bytes, expected.as_slice()))
  })
}

/// Builds a header as Stripe would send it. Used to sign test payloads.
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> String {
  let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
    Ok(mac) => mac,
    Err(_) => return format!("t={timestamp}"),
  };
  mac.update(format!("{timestamp}.{payload}").as_bytes());
  format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
  a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Direct card charge with a token produced by Stripe.js.
pub struct StripeCardProvider {
  services: PaymentServices,
  api: std::sync::Arc<dyn StripeApi>,
}

impl StripeCardProvider {
  pub fn new(services: PaymentServices, api: std::sync::Arc<dyn StripeApi>) -> Self {
    StripeCardProvider { services, api }
  }

  pub fn with_http(services: PaymentServices) -> Result<Self, GatewayError> {
    Ok(Self::new(services, std::sync::Arc::new(HttpStripeApi::new(DEFAULT_GATEWAY_TIMEOUT)?)))
  }
}

#[async_trait]
impl PaymentProvider for StripeCardProvider {
  fn id(&self) -> ProviderId {
    ProviderId::StripeCard
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
      && !config.event.bool(ConfigKey::StripeEnableSca)
      && config.event.get(ConfigKey::StripeSecretKey).map_or(false, |v| v.is_present())
  }

  fn requires_client_token(&self) -> bool {
    true
  }

  fn validate_token(&self, token: Option<&PaymentToken>) -> CoreResult<()> {
    match token {
      Some(PaymentToken::StripeCard { token })
        if (token.starts_with("tok_") || token.starts_with("pm_") || token.starts_with("src_"))
          && token.len() > 4 =>
      {
        Ok(())
      }
      _ => Err(CoreError::validation("token", "error.STEP2_STRIPE_abort")),
    }
  }

  #[instrument(name = "StripeCardProvider::do_payment", skip_all, fields(reservation_id = %spec.reservation_id, transaction_id = attempt.id))]
  async fn do_payment(&self, spec: &PaymentSpecification, attempt: &Transaction) -> CoreResult<PaymentResult> {
    let Some(PaymentToken::StripeCard { token }) = &spec.token else {
      return Err(CoreError::validation("token", "error.STEP2_STRIPE_abort"));
    };
    let level = crate::config::ConfigLevel::event(spec.purchase_context.organization_id, spec.purchase_context.id);
    let values = self.services.configuration.get_for(CREDENTIAL_KEYS, &level).await?;
    let (credentials, fee) = credentials_and_fee(&values, spec.amount_cts())?;

    let request = ChargeRequest {
      amount_cts: spec.amount_cts(),
      currency: spec.currency_code().to_string(),
      source: token.clone(),
      description: spec.description(),
      reservation_id: spec.reservation_id.clone(),
      customer_email: spec.customer.email.clone(),
      application_fee_cts: fee,
    };
    let idempotency_key = format!("tessera-tx-{}", attempt.id);

    match self.api.create_charge(&credentials, &request, &idempotency_key).await {
      Ok(charge) => {
        let changes = TransactionChanges {
          gateway_id: Some(charge.id.clone()),
          platform_fee_cts: fee,
          ..Default::default()
        };
        let now = self.services.clock.now();
        let updated = self
          .services
          .transactions
          .transition(attempt.id, &[TransactionStatus::Pending], TransactionStatus::Complete, changes, now)
          .await?;
        if updated.is_none() {
          event!(Level::ERROR, charge_id = %charge.id, "Card charged but transaction is no longer pending.");
          return Err(CoreError::Integrity(format!(
            "charge {} captured for transaction {} which is no longer pending",
            charge.id, attempt.id
          )));
        }
        event!(Level::INFO, charge_id = %charge.id, "Card charge succeeded.");
        Ok(PaymentResult::successful(charge.id))
      }
      Err(StripeError::Timeout) => {
        event!(Level::WARN, "Stripe charge timed out; transaction left pending.");
        Err(CoreError::GatewayTimeout(format!("stripe charge for transaction {}", attempt.id)))
      }
      Err(err) => {
        let code = err.error_code();
        event!(Level::WARN, error = %err, error_code = %code, "Stripe charge failed.");
        Ok(PaymentResult::failed(code))
      }
    }
  }

  fn as_refund_request(&self) -> Option<&dyn RefundRequest> {
    Some(self)
  }
}

#[async_trait]
impl RefundRequest for StripeCardProvider {
  async fn refund(
    &self,
    transaction: &Transaction,
    context: &PaymentContext,
    amount_cts: Option<i64>,
  ) -> CoreResult<RefundOutcome> {
    stripe_refund(&self.services, self.api.as_ref(), transaction, context, amount_cts).await
  }
}

pub(crate) async fn stripe_refund(
  services: &PaymentServices,
  api: &dyn StripeApi,
  transaction: &Transaction,
  context: &PaymentContext,
  amount_cts: Option<i64>,
) -> CoreResult<RefundOutcome> {
  let reference = transaction
    .gateway_id
    .as_deref()
    .ok_or_else(|| CoreError::Integrity(format!("transaction {} has no gateway reference", transaction.id)))?;
  let values = services.configuration.get_for(CREDENTIAL_KEYS, &context.config_level()).await?;
  let (credentials, _) = credentials_and_fee(&values, transaction.amount_cts)?;
  match api.create_refund(&credentials, reference, amount_cts).await {
    Ok(refund) => Ok(RefundOutcome {
      refund_id: refund.id,
      amount_cts: refund.amount,
    }),
    Err(StripeError::Timeout) => Err(CoreError::GatewayTimeout(format!("stripe refund for {reference}"))),
    Err(err) => Err(CoreError::Gateway {
      code: err.error_code(),
      message: err.to_string(),
    }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classification_table() {
    let card = StripeError::Card {
      code: "card_declined".into(),
      message: "declined".into(),
    };
    assert_eq!(card.error_code(), "error.STEP2_STRIPE_card_declined");
    let invalid = StripeError::InvalidRequest {
      param: "currency".into(),
      message: "bad".into(),
    };
    assert_eq!(invalid.error_code(), "error.STEP2_STRIPE_invalid_currency");
    assert_eq!(StripeError::Authentication("x".into()).error_code(), "error.STEP2_STRIPE_abort");
    assert_eq!(StripeError::ApiConnection("x".into()).error_code(), "error.STEP2_STRIPE_abort");
    assert_eq!(StripeError::Api("x".into()).error_code(), "error.STEP2_STRIPE_unexpected");
  }

  #[test]
  fn classifies_error_bodies() {
    let body = r#"{"error":{"type":"card_error","code":"expired_card","message":"Your card has expired."}}"#;
    assert_eq!(
      classify_response(402, body),
      StripeError::Card {
        code: "expired_card".into(),
        message: "Your card has expired.".into()
      }
    );
    assert!(matches!(classify_response(401, "{}"), StripeError::Authentication(_)));
  }

  #[test]
  fn signature_round_trip_and_tolerance() {
    let now = Utc::now();
    let header = sign_payload("{}", "whsec_test", now.timestamp());
    assert!(verify_signature("{}", &header, "whsec_test", now, SIGNATURE_TOLERANCE_SECS));
    assert!(!verify_signature("{ }", &header, "whsec_test", now, SIGNATURE_TOLERANCE_SECS));
    let later = now + chrono::Duration::seconds(SIGNATURE_TOLERANCE_SECS + 1);
    assert!(!verify_signature("{}", &header, "whsec_test", later, SIGNATURE_TOLERANCE_SECS));
  }

  #[test]
  fn platform_fee_is_capped() {
    assert_eq!(platform_fee(1000, Decimal::from(5), 30).unwrap(), 80);
    assert_eq!(platform_fee(10, Decimal::from(50), 30).unwrap(), 10);
  }
}
