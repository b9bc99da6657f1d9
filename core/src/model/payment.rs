// tessera/src/model/payment.rs

use super::purchase_context::PurchaseContext;
use super::reservation::{BillingDetails, TotalPrice};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Gateway reference stored for payments that will be settled later
/// (bank transfer, deferred bank transfer, offline methods).
pub const NOT_YET_PAID_TRANSACTION_ID: &str = "not-paid";

/// What the customer picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
  CreditCard,
  Paypal,
  BankTransfer,
  OnSite,
  CustomOffline,
  None,
}

string_enum!(PaymentMethod {
  CreditCard => "CREDIT_CARD",
  Paypal => "PAYPAL",
  BankTransfer => "BANK_TRANSFER",
  OnSite => "ON_SITE",
  CustomOffline => "CUSTOM_OFFLINE",
  None => "NONE",
});

/// Which gateway family processes the money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentProxy {
  Stripe,
  Paypal,
  Offline,
  OnSite,
  CustomOffline,
  None,
}

string_enum!(PaymentProxy {
  Stripe => "STRIPE",
  Paypal => "PAYPAL",
  Offline => "OFFLINE",
  OnSite => "ON_SITE",
  CustomOffline => "CUSTOM_OFFLINE",
  None => "NONE",
});

/// Client-side references a provider validates before charging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentToken {
  /// A Stripe.js card token or payment method id (`tok_…`, `pm_…`).
  StripeCard { token: String },
  /// Returned by PayPal after the buyer approved the order.
  PaypalApproval { order_id: String, payer_id: String },
}

/// Everything a provider needs to execute one payment attempt.
#[derive(Debug, Clone)]
pub struct PaymentSpecification {
  pub reservation_id: String,
  pub purchase_context: Arc<PurchaseContext>,
  pub price: TotalPrice,
  pub customer: BillingDetails,
  pub locale: String,
  pub invoice_requested: bool,
  pub token: Option<PaymentToken>,
  /// Identifier of the selected custom offline method.
  pub selected_offline_method: Option<String>,
  /// Categories of the reserved tickets, for per-category method filters.
  pub category_ids: Vec<i64>,
}

impl PaymentSpecification {
  pub fn amount_cts(&self) -> i64 {
    self.price.final_price_cts
  }

  pub fn currency_code(&self) -> &str {
    self.price.currency.code()
  }

  pub fn description(&self) -> String {
    format!(
      "{} - reservation {}",
      self.purchase_context.display_name,
      super::reservation::short_reservation_id(&self.reservation_id)
    )
  }
}

/// Amount and billing country of a prospective payment, used by `accept`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
  pub price: TotalPrice,
  pub billing_country: Option<String>,
}

impl TransactionRequest {
  pub fn new(price: TotalPrice) -> Self {
    TransactionRequest {
      price,
      billing_country: None,
    }
  }

  pub fn amount_cts(&self) -> i64 {
    self.price.final_price_cts
  }
}

/// Outcome of `do_payment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentResult {
  /// Money was taken, or the provider accepted the order for later settlement
  /// (`gateway_id == NOT_YET_PAID_TRANSACTION_ID`).
  Successful { gateway_id: String },
  /// The customer must continue on the provider's side.
  Redirect { url: String },
  /// The attempt failed; `error_code` is a user-facing message key.
  Failed { error_code: String },
}

impl PaymentResult {
  pub fn successful(gateway_id: impl Into<String>) -> Self {
    PaymentResult::Successful {
      gateway_id: gateway_id.into(),
    }
  }

  pub fn redirect(url: impl Into<String>) -> Self {
    PaymentResult::Redirect { url: url.into() }
  }

  pub fn failed(error_code: impl Into<String>) -> Self {
    PaymentResult::Failed {
      error_code: error_code.into(),
    }
  }

  pub fn is_successful(&self) -> bool {
    matches!(self, PaymentResult::Successful { .. })
  }

  /// Successful and actually settled, as opposed to "will be paid later".
  pub fn is_paid(&self) -> bool {
    matches!(self, PaymentResult::Successful { gateway_id } if gateway_id != NOT_YET_PAID_TRANSACTION_ID)
  }
}
