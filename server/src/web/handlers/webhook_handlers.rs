// server/src/web/handlers/webhook_handlers.rs

use actix_web::{web, HttpRequest, HttpResponse};
use tessera::model::PaymentProxy;
use tessera::providers::WebhookRequest;
use tessera::WebhookResult;
use tracing::{info, instrument, warn};

use crate::errors::AppError;
use crate::state::AppState;

const SIGNATURE_HEADERS: [&str; 2] = ["stripe-signature", "paypal-transmission-sig"];

/// `stripe`, `paypal`, ... to the proxy that owns the webhook.
pub fn proxy_for(provider: &str) -> Option<PaymentProxy> {
  provider.trim().to_ascii_uppercase().replace('-', "_").parse().ok()
}

#[instrument(
  name = "handler::webhook",
  skip(app_state, req, body),
  fields(provider = %provider, payload_len = body.len())
)]
pub async fn webhook_handler(
  app_state: web::Data<AppState>,
  req: HttpRequest,
  provider: web::Path<String>,
  body: web::Bytes,
) -> Result<HttpResponse, AppError> {
  let provider = provider.into_inner();
  let proxy = proxy_for(&provider).ok_or_else(|| AppError::NotFound(format!("webhook provider '{provider}'")))?;
  let payload = String::from_utf8(body.to_vec())
    .map_err(|_| AppError::Validation("webhook payload is not UTF-8".to_string()))?;
  let signature = SIGNATURE_HEADERS
    .iter()
    .find_map(|name| req.headers().get(*name))
    .and_then(|value| value.to_str().ok())
    .map(String::from);

  let result = app_state
    .system
    .reconciler
    .process_webhook(proxy, WebhookRequest { payload, signature })
    .await?;
  match &result {
    WebhookResult::Failed(reason) => warn!(%reason, "Webhook processed with a failed payment."),
    other => info!(result = ?other, "Webhook processed."),
  }
  // Always 200 once the event was accepted, otherwise the gateway keeps retrying.
  Ok(HttpResponse::Ok().json(result))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn provider_path_maps_to_proxy() {
    assert_eq!(proxy_for("stripe"), Some(PaymentProxy::Stripe));
    assert_eq!(proxy_for("paypal"), Some(PaymentProxy::Paypal));
    assert_eq!(proxy_for("custom-offline"), Some(PaymentProxy::CustomOffline));
    assert_eq!(proxy_for("mollie"), None);
  }
}
