// tessera/src/providers/paypal.rs

//! PayPal orders: the customer approves on PayPal, comes back, and the order
//! is captured.

use super::http::{build_client, GatewayError, DEFAULT_GATEWAY_TIMEOUT};
use super::{
  ConfigSnapshot, ExternalProcessing, PaymentContext, PaymentProvider, ProviderId, RefundOutcome, RefundRequest,
};
use crate::cache::TtlCache;
use crate::config::{ConfigKey, ConfigLevel, ConfigValues};
use crate::error::{CoreError, CoreResult};
use crate::model::{
  PaymentMethod, PaymentProxy, PaymentResult, PaymentSpecification, PaymentToken, ReservationStatus, Transaction,
  TransactionChanges, TransactionRequest, TransactionStatus,
};
use crate::services::PaymentServices;
use crate::state_machine::ReservationStateMachine;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, instrument, Level};

pub const PAYPAL_LIVE_BASE: &str = "https://api-m.paypal.com";
pub const PAYPAL_SANDBOX_BASE: &str = "https://api-m.sandbox.paypal.com";
pub const PAYPAL_ORDER_KEY: &str = "paypal_order_id";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaypalError {
  /// PayPal refused the payment instrument or the order state.
  #[error("PayPal declined: {0}")]
  Declined(String),

  #[error("PayPal authentication failed: {0}")]
  Authentication(String),

  #[error("PayPal call timed out")]
  Timeout,

  #[error("PayPal error: {0}")]
  Other(String),
}

impl PaypalError {
  pub fn error_code(&self) -> String {
    match self {
      PaypalError::Declined(issue) => format!("error.STEP2_PAYPAL_{}", issue.to_lowercase()),
      PaypalError::Authentication(_) => "error.STEP2_PAYPAL_abort".to_string(),
      PaypalError::Timeout | PaypalError::Other(_) => "error.STEP2_PAYPAL_unexpected".to_string(),
    }
  }
}

impl From<GatewayError> for PaypalError {
  fn from(err: GatewayError) -> Self {
    match err {
      GatewayError::Timeout => PaypalError::Timeout,
      GatewayError::Status { status: 401, body } => PaypalError::Authentication(body),
      GatewayError::Status { status: 422, body } => PaypalError::Declined(issue_from_body(&body)),
      other => PaypalError::Other(other.to_string()),
    }
  }
}

fn issue_from_body(body: &str) -> String {
  serde_json::from_str::<serde_json::Value>(body)
    .ok()
    .and_then(|v| {
      v.get("details")?
        .get(0)?
        .get("issue")?
        .as_str()
        .map(str::to_string)
    })
    .unwrap_or_else(|| "UNPROCESSABLE_ENTITY".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaypalCredentials {
  pub client_id: String,
  pub client_secret: String,
  pub live: bool,
}

impl PaypalCredentials {
  fn from_config(values: &ConfigValues) -> CoreResult<Self> {
    Ok(PaypalCredentials {
      client_id: values.require(ConfigKey::PaypalClientId)?,
      client_secret: values.require(ConfigKey::PaypalClientSecret)?,
      live: values.bool(ConfigKey::PaypalLiveMode),
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaypalOrder {
  pub id: String,
  pub approve_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaypalCapture {
  pub capture_id: String,
  pub status: String,
  pub fee_cts: Option<i64>,
}

#[async_trait]
pub trait PaypalApi: Send + Sync {
  async fn create_order(
    &self,
    credentials: &PaypalCredentials,
    spec: &PaymentSpecification,
    return_url: &str,
    cancel_url: &str,
    request_id: &str,
  ) -> Result<PaypalOrder, PaypalError>;

  async fn capture_order(
    &self,
    credentials: &PaypalCredentials,
    order_id: &str,
    request_id: &str,
  ) -> Result<PaypalCapture, PaypalError>;

  async fn refund_capture(
    &self,
    credentials: &PaypalCredentials,
    capture_id: &str,
    amount: Option<(i64, &str)>,
  ) -> Result<RefundOutcome, PaypalError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
  access_token: String,
  expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
  id: String,
  #[serde(default)]
  links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
  href: String,
  rel: String,
}

#[derive(Debug, Deserialize)]
struct CaptureResponse {
  status: String,
  purchase_units: Vec<CapturedUnit>,
}

#[derive(Debug, Deserialize)]
struct CapturedUnit {
  payments: CapturedPayments,
}

#[derive(Debug, Deserialize)]
struct CapturedPayments {
  captures: Vec<CaptureDetail>,
}

#[derive(Debug, Deserialize)]
struct CaptureDetail {
  id: String,
  status: String,
  seller_receivable_breakdown: Option<Breakdown>,
}

#[derive(Debug, Deserialize)]
struct Breakdown {
  paypal_fee: Option<Amount>,
}

#[derive(Debug, Deserialize)]
struct Amount {
  value: String,
  currency_code: String,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
  id: String,
  amount: Option<Amount>,
}

fn to_cts(amount: &Amount) -> Option<i64> {
  let value: rust_decimal::Decimal = amount.value.parse().ok()?;
  Some(crate::model::Currency::new(&amount.currency_code).to_minor_units(value))
}

/// `PaypalApi` over HTTPS. OAuth tokens are kept in an injected cache until
/// shortly before they expire.
pub struct HttpPaypalApi {
  client: reqwest::Client,
  tokens: Arc<TtlCache<String, String>>,
}

impl HttpPaypalApi {
  pub fn new(timeout: Duration, tokens: Arc<TtlCache<String, String>>) -> Result<Self, GatewayError> {
    Ok(HttpPaypalApi {
      client: build_client(timeout)?,
      tokens,
    })
  }

  fn base_url(credentials: &PaypalCredentials) -> &'static str {
    if credentials.live {
      PAYPAL_LIVE_BASE
    } else {
      PAYPAL_SANDBOX_BASE
    }
  }

  async fn access_token(&self, credentials: &PaypalCredentials) -> Result<String, PaypalError> {
    if let Some(token) = self.tokens.get(&credentials.client_id) {
      return Ok(token);
    }
    let response = self
      .client
      .post(format!("{}/v1/oauth2/token", Self::base_url(credentials)))
      .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
      .form(&[("grant_type", "client_credentials")])
      .send()
      .await
      .map_err(GatewayError::from)?;
    let token: TokenResponse = super::http::error_for_status(response)
      .await?
      .json()
      .await
      .map_err(GatewayError::from)?;
    let ttl = ChronoDuration::seconds((token.expires_in - 60).max(0));
    self
      .tokens
      .insert_with_ttl(credentials.client_id.clone(), token.access_token.clone(), ttl);
    Ok(token.access_token)
  }

  async fn post_json<T: serde::de::DeserializeOwned>(
    &self,
    credentials: &PaypalCredentials,
    path: &str,
    body: serde_json::Value,
    request_id: Option<&str>,
  ) -> Result<T, PaypalError> {
    let token = self.access_token(credentials).await?;
    let mut builder = self
      .client
      .post(format!("{}{}", Self::base_url(credentials), path))
      .bearer_auth(token)
      .json(&body);
    if let Some(request_id) = request_id {
      builder = builder.header("PayPal-Request-Id", request_id);
    }
    let response = builder.send().await.map_err(GatewayError::from)?;
    let response = super::http::error_for_status(response).await.map_err(|e| {
      if matches!(e, GatewayError::Status { status: 401, .. }) {
        self.tokens.invalidate(&credentials.client_id);
      }
      PaypalError::from(e)
    })?;
    Ok(response.json().await.map_err(GatewayError::from)?)
  }
}

#[async_trait]
impl PaypalApi for HttpPaypalApi {
  async fn create_order(
    &self,
    credentials: &PaypalCredentials,
    spec: &PaymentSpecification,
    return_url: &str,
    cancel_url: &str,
    request_id: &str,
  ) -> Result<PaypalOrder, PaypalError> {
    let currency = &spec.price.currency;
    let body = json!({
      "intent": "CAPTURE",
      "purchase_units": [{
        "reference_id": spec.reservation_id,
        "custom_id": spec.reservation_id,
        "description": spec.description(),
        "amount": {
          "currency_code": currency.code(),
          "value": currency.to_major_units(spec.amount_cts()).to_string(),
        }
      }],
      "application_context": {
        "return_url": return_url,
        "cancel_url": cancel_url,
        "user_action": "PAY_NOW",
        "shipping_preference": "NO_SHIPPING",
      }
    });
    let order: OrderResponse = self.post_json(credentials, "/v2/checkout/orders", body, Some(request_id)).await?;
    let approve_url = order
      .links
      .iter()
      .find(|l| l.rel == "approve" || l.rel == "payer-action")
      .map(|l| l.href.clone());
    Ok(PaypalOrder {
      id: order.id,
      approve_url,
    })
  }

  async fn capture_order(
    &self,
    credentials: &PaypalCredentials,
    order_id: &str,
    request_id: &str,
  ) -> Result<PaypalCapture, PaypalError> {
    let captured: CaptureResponse = self
      .post_json(
        credentials,
        &format!("/v2/checkout/orders/{order_id}/capture"),
        json!({}),
        Some(request_id),
      )
      .await?;
    let detail = captured
      .purchase_units
      .into_iter()
      .flat_map(|u| u.payments.captures)
      .next()
      .ok_or_else(|| PaypalError::Other(format!("order {order_id} captured without capture details")))?;
    let fee_cts = detail
      .seller_receivable_breakdown
      .as_ref()
      .and_then(|b| b.paypal_fee.as_ref())
      .and_then(to_cts);
    Ok(PaypalCapture {
      capture_id: detail.id,
      status: if detail.status.is_empty() { captured.status } else { detail.status },
      fee_cts,
    })
  }

  async fn refund_capture(
    &self,
    credentials: &PaypalCredentials,
    capture_id: &str,
    amount: Option<(i64, &str)>,
  ) -> Result<RefundOutcome, PaypalError> {
    let body = match amount {
      Some((cts, currency)) => {
        let currency = crate::model::Currency::new(currency);
        json!({"amount": {"value": currency.to_major_units(cts).to_string(), "currency_code": currency.code()}})
      }
      None => json!({}),
    };
    let refund: RefundResponse = self
      .post_json(credentials, &format!("/v2/payments/captures/{capture_id}/refund"), body, None)
      .await?;
    Ok(RefundOutcome {
      refund_id: refund.id,
      amount_cts: refund.amount.as_ref().and_then(to_cts).or(amount.map(|(cts, _)| cts)).unwrap_or(0),
    })
  }
}

const PAYPAL_KEYS: &[ConfigKey] = &[
  ConfigKey::PaypalClientId,
  ConfigKey::PaypalClientSecret,
  ConfigKey::PaypalLiveMode,
  ConfigKey::BaseUrl,
];

pub struct PaypalProvider {
  services: PaymentServices,
  state_machine: ReservationStateMachine,
  api: Arc<dyn PaypalApi>,
}

impl PaypalProvider {
  pub fn new(services: PaymentServices, api: Arc<dyn PaypalApi>) -> Self {
    let state_machine = ReservationStateMachine::new(services.clone());
    PaypalProvider {
      services,
      state_machine,
      api,
    }
  }

  pub fn with_http(services: PaymentServices, tokens: Arc<TtlCache<String, String>>) -> Result<Self, GatewayError> {
    let api = HttpPaypalApi::new(DEFAULT_GATEWAY_TIMEOUT, tokens)?;
    Ok(Self::new(services, Arc::new(api)))
  }

  async fn values_for(&self, spec: &PaymentSpecification) -> CoreResult<ConfigValues> {
    let level = ConfigLevel::event(spec.purchase_context.organization_id, spec.purchase_context.id);
    self.services.configuration.get_for(PAYPAL_KEYS, &level).await
  }
}

#[async_trait]
impl PaymentProvider for PaypalProvider {
  fn id(&self) -> ProviderId {
    ProviderId::Paypal
  }

  fn proxy(&self) -> PaymentProxy {
    PaymentProxy::Paypal
  }

  fn payment_methods(&self) -> &'static [PaymentMethod] {
    &[PaymentMethod::Paypal]
  }

  fn config_keys(&self) -> &'static [ConfigKey] {
    &[ConfigKey::PaypalEnabled, ConfigKey::PaypalClientId]
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
      && config.event.bool(ConfigKey::PaypalEnabled)
      && config.event.get(ConfigKey::PaypalClientId).map_or(false, |v| v.is_present())
  }

  #[instrument(name = "PaypalProvider::do_payment", skip_all, fields(reservation_id = %spec.reservation_id, transaction_id = attempt.id))]
  async fn do_payment(&self, spec: &PaymentSpecification, attempt: &Transaction) -> CoreResult<PaymentResult> {
    let values = self.values_for(spec).await?;
    let credentials = PaypalCredentials::from_config(&values)?;
    let base_url = values.require(ConfigKey::BaseUrl)?;
    let base_url = base_url.trim_end_matches('/');
    let return_url = format!("{base_url}/reservations/{}/payment/return", spec.reservation_id);
    let cancel_url = format!("{base_url}/reservations/{}/payment/cancel", spec.reservation_id);

    let order = match self
      .api
      .create_order(&credentials, spec, &return_url, &cancel_url, &format!("tessera-tx-{}", attempt.id))
      .await
    {
      Ok(order) => order,
      Err(PaypalError::Timeout) => {
        return Err(CoreError::GatewayTimeout(format!("paypal order for transaction {}", attempt.id)))
      }
      Err(err) => {
        event!(Level::WARN, error = %err, "PayPal order creation failed.");
        return Ok(PaymentResult::failed(err.error_code()));
      }
    };
    let Some(approve_url) = order.approve_url else {
      return Ok(PaymentResult::failed("error.STEP2_PAYPAL_unexpected"));
    };

    let now = self.services.clock.now();
    let changes = TransactionChanges::gateway_id(order.id.clone()).with_metadata(PAYPAL_ORDER_KEY, order.id.clone());
    self
      .services
      .transactions
      .transition(attempt.id, &[TransactionStatus::Pending], TransactionStatus::Pending, changes, now)
      .await?
      .ok_or_else(|| CoreError::Integrity(format!("transaction {} left PENDING during PayPal order", attempt.id)))?;
    self
      .state_machine
      .enter_waiting_state(
        &spec.reservation_id,
        ReservationStatus::ExternalProcessingPayment,
        PaymentProxy::Paypal,
        None,
      )
      .await?;
    Ok(PaymentResult::redirect(approve_url))
  }

  fn as_external_processing(&self) -> Option<&dyn ExternalProcessing> {
    Some(self)
  }

  fn as_refund_request(&self) -> Option<&dyn RefundRequest> {
    Some(self)
  }
}

#[async_trait]
impl ExternalProcessing for PaypalProvider {
  #[instrument(name = "PaypalProvider::confirm_external_payment", skip_all, fields(transaction_id = attempt.id))]
  async fn confirm_external_payment(
    &self,
    spec: &PaymentSpecification,
    attempt: &Transaction,
    token: Option<&PaymentToken>,
  ) -> CoreResult<PaymentResult> {
    let Some(PaymentToken::PaypalApproval { order_id, payer_id }) = token else {
      return Err(CoreError::validation("token", "error.STEP2_PAYPAL_abort"));
    };
    if attempt.metadata.get(PAYPAL_ORDER_KEY) != Some(order_id) {
      event!(Level::WARN, order_id = %order_id, "PayPal approval does not belong to the active attempt.");
      return Err(CoreError::validation("token", "error.STEP2_PAYPAL_abort"));
    }
    if attempt.status == TransactionStatus::Complete {
      return Ok(PaymentResult::successful(attempt.gateway_id.clone().unwrap_or_default()));
    }

    let values = self.values_for(spec).await?;
    let credentials = PaypalCredentials::from_config(&values)?;
    let capture = match self
      .api
      .capture_order(&credentials, order_id, &format!("tessera-capture-{}", attempt.id))
      .await
    {
      Ok(capture) => capture,
      Err(PaypalError::Timeout) => return Err(CoreError::GatewayTimeout(format!("paypal capture of {order_id}"))),
      Err(err) => {
        event!(Level::WARN, error = %err, "PayPal capture failed.");
        return Ok(PaymentResult::failed(err.error_code()));
      }
    };
    if capture.status != "COMPLETED" {
      return Ok(PaymentResult::failed("error.STEP2_PAYPAL_unexpected"));
    }

    let changes = TransactionChanges {
      gateway_id: Some(capture.capture_id.clone()),
      platform_fee_cts: capture.fee_cts,
      ..Default::default()
    }
    .with_metadata("paypal_payer_id", payer_id.clone());
    let now = self.services.clock.now();
    self
      .services
      .transactions
      .transition(attempt.id, &[TransactionStatus::Pending], TransactionStatus::Complete, changes, now)
      .await?
      .ok_or_else(|| {
        CoreError::Integrity(format!("PayPal captured {order_id} but transaction {} is no longer pending", attempt.id))
      })?;
    Ok(PaymentResult::successful(capture.capture_id))
  }
}

#[async_trait]
impl RefundRequest for PaypalProvider {
  async fn refund(
    &self,
    transaction: &Transaction,
    context: &PaymentContext,
    amount_cts: Option<i64>,
  ) -> CoreResult<RefundOutcome> {
    let capture_id = transaction
      .gateway_id
      .as_deref()
      .ok_or_else(|| CoreError::Integrity(format!("transaction {} has no capture id", transaction.id)))?;
    let values = self.services.configuration.get_for(PAYPAL_KEYS, &context.config_level()).await?;
    let credentials = PaypalCredentials::from_config(&values)?;
    let amount = amount_cts.map(|cts| (cts, transaction.currency.as_str()));
    match self.api.refund_capture(&credentials, capture_id, amount).await {
      Ok(outcome) => Ok(outcome),
      Err(PaypalError::Timeout) => Err(CoreError::GatewayTimeout(format!("paypal refund of {capture_id}"))),
      Err(err) => Err(CoreError::Gateway {
        code: err.error_code(),
        message: err.to_string(),
      }),
    }
  }
}
