// tessera/src/providers/mod.rs

//! Payment providers and their capabilities.
//!
//! Every provider implements `PaymentProvider`. Optional behaviour (webhooks,
//! refunds, confirmation after a redirect) is exposed through capability
//! traits that a provider hands out from `as_*` queries; callers ask for the
//! capability instead of inspecting concrete types.

pub mod bank_transfer;
pub mod http;
pub mod offline;
pub mod paypal;
pub mod registry;
pub mod revolut;
pub mod stripe;
pub mod stripe_checkout;

use crate::config::{ConfigKey, ConfigLevel, ConfigValues};
use crate::error::CoreResult;
use crate::model::{
  PaymentMethod, PaymentProxy, PaymentResult, PaymentSpecification, PaymentToken, PurchaseContext, Transaction,
  TransactionRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use registry::{PaymentMethodDescriptor, PaymentMethodRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderId {
  StripeCard,
  StripeCheckout,
  BankTransfer,
  DeferredBankTransfer,
  OnSite,
  CustomOffline,
  Paypal,
}

impl ProviderId {
  pub fn as_str(&self) -> &'static str {
    match self {
      ProviderId::StripeCard => "stripe-card",
      ProviderId::StripeCheckout => "stripe-checkout",
      ProviderId::BankTransfer => "bank-transfer",
      ProviderId::DeferredBankTransfer => "deferred-bank-transfer",
      ProviderId::OnSite => "on-site",
      ProviderId::CustomOffline => "custom-offline",
      ProviderId::Paypal => "paypal",
    }
  }
}

impl std::fmt::Display for ProviderId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Where a payment is being made: the event, the categories in the
/// reservation and the time of the request.
#[derive(Debug, Clone)]
pub struct PaymentContext {
  pub purchase_context: Arc<PurchaseContext>,
  pub category_ids: Vec<i64>,
  pub now: DateTime<Utc>,
}

impl PaymentContext {
  pub fn new(purchase_context: Arc<PurchaseContext>, category_ids: Vec<i64>, now: DateTime<Utc>) -> Self {
    PaymentContext {
      purchase_context,
      category_ids,
      now,
    }
  }

  pub fn config_level(&self) -> ConfigLevel {
    ConfigLevel::event(self.purchase_context.organization_id, self.purchase_context.id)
  }

  pub fn category_level(&self, category_id: i64) -> ConfigLevel {
    self.config_level().for_category(category_id)
  }
}

/// Configuration read once per registry call: event-level values plus the
/// values of each ticket category in the reservation.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
  pub event: ConfigValues,
  pub categories: Vec<(i64, ConfigValues)>,
}

/// Result of a refund call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundOutcome {
  pub refund_id: String,
  pub amount_cts: i64,
}

/// A webhook request as received, before it is trusted.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
  pub payload: String,
  pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
  Succeeded { charge_id: String, fee_cts: Option<i64> },
  Failed { reason: String },
}

/// What a webhook claims happened. Only acted on after `verify_webhook`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
  pub event_id: String,
  pub event_type: String,
  /// The gateway reference stored on the transaction when the attempt started.
  pub gateway_reference: Option<String>,
  pub reservation_id: Option<String>,
  pub live_mode: bool,
  pub outcome: WebhookOutcome,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
  fn id(&self) -> ProviderId;

  fn proxy(&self) -> PaymentProxy;

  fn payment_methods(&self) -> &'static [PaymentMethod];

  fn handles(&self, method: PaymentMethod) -> bool {
    self.payment_methods().contains(&method)
  }

  /// Event-level keys `accept` reads.
  fn config_keys(&self) -> &'static [ConfigKey];

  /// Cheap eligibility check without side effects.
  fn accept(
    &self,
    method: PaymentMethod,
    context: &PaymentContext,
    request: &TransactionRequest,
    config: &ConfigSnapshot,
  ) -> bool;

  /// Whether the client must tokenize payment details before `do_payment`.
  fn requires_client_token(&self) -> bool {
    false
  }

  /// Checks the client-supplied token reference before anything is charged.
  fn validate_token(&self, _token: Option<&PaymentToken>) -> CoreResult<()> {
    Ok(())
  }

  /// Checks the customer's selection against current configuration. Runs
  /// before a transaction row is created.
  async fn validate_selection(&self, _spec: &PaymentSpecification) -> CoreResult<()> {
    Ok(())
  }

  /// Metadata stored on the transaction row when the attempt is opened.
  fn attempt_metadata(&self, _spec: &PaymentSpecification) -> BTreeMap<String, String> {
    BTreeMap::new()
  }

  /// Executes the attempt recorded by `attempt`. Called at most once per attempt.
  async fn do_payment(&self, spec: &PaymentSpecification, attempt: &Transaction) -> CoreResult<PaymentResult>;

  fn as_webhook_handler(&self) -> Option<&dyn WebhookHandler> {
    None
  }

  fn as_refund_request(&self) -> Option<&dyn RefundRequest> {
    None
  }

  fn as_external_processing(&self) -> Option<&dyn ExternalProcessing> {
    None
  }
}

/// Providers that receive asynchronous notifications.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
  /// Parses an untrusted payload. `None` for event types that do not concern
  /// payment completion or failure.
  fn parse_webhook(&self, request: &WebhookRequest) -> CoreResult<Option<WebhookEvent>>;

  /// Verifies the signature with the secret configured for `context`.
  async fn verify_webhook(&self, request: &WebhookRequest, context: &PaymentContext) -> CoreResult<bool>;

  /// Whether the event's mode matches the mode configured for `context`.
  async fn accepts_mode(&self, event: &WebhookEvent, context: &PaymentContext) -> CoreResult<bool>;
}

#[async_trait]
pub trait RefundRequest: Send + Sync {
  /// Refunds `amount_cts`, or everything when `None`.
  async fn refund(
    &self,
    transaction: &Transaction,
    context: &PaymentContext,
    amount_cts: Option<i64>,
  ) -> CoreResult<RefundOutcome>;
}

/// Providers whose customer leaves for a hosted page and comes back.
#[async_trait]
pub trait ExternalProcessing: Send + Sync {
  /// Resolves an attempt after the customer returned from the provider.
  async fn confirm_external_payment(
    &self,
    spec: &PaymentSpecification,
    attempt: &Transaction,
    token: Option<&PaymentToken>,
  ) -> CoreResult<PaymentResult>;
}
