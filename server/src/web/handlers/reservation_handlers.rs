// server/src/web/handlers/reservation_handlers.rs

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tessera::model::{PaymentMethod, PaymentResult, PaymentToken};
use tessera::{CancellationReason, PaymentRequest};
use tracing::{info, instrument};

use super::reservation_id;
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PaymentPayload {
  pub method: PaymentMethod,
  #[serde(default)]
  pub token: Option<PaymentToken>,
  #[serde(default)]
  pub selected_offline_method: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmPayload {
  #[serde(default)]
  pub token: Option<PaymentToken>,
}

fn payment_response(result: PaymentResult) -> HttpResponse {
  match &result {
    PaymentResult::Failed { .. } => HttpResponse::PaymentRequired().json(result),
    _ => HttpResponse::Ok().json(result),
  }
}

#[instrument(name = "handler::payment_methods", skip(app_state))]
pub async fn payment_methods_handler(
  app_state: web::Data<AppState>,
  path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
  let id = reservation_id(path.into_inner())?;
  let system = &app_state.system;
  let (context, request) = system.orchestrator.payment_context(&id).await?;
  let methods = system.registry.active_payment_methods(&context, &request).await?;
  Ok(HttpResponse::Ok().json(json!({
    "reservationId": id,
    "amountCts": request.amount_cts(),
    "currency": request.price.currency,
    "methods": methods,
  })))
}

#[instrument(name = "handler::payment_summary", skip(app_state))]
pub async fn payment_summary_handler(
  app_state: web::Data<AppState>,
  path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
  let id = reservation_id(path.into_inner())?;
  let summary = app_state.system.orchestrator.payment_summary(&id).await?;
  Ok(HttpResponse::Ok().json(summary))
}

#[instrument(name = "handler::perform_payment", skip(app_state, payload), fields(method = %payload.method))]
pub async fn perform_payment_handler(
  app_state: web::Data<AppState>,
  path: web::Path<String>,
  payload: web::Json<PaymentPayload>,
) -> Result<HttpResponse, AppError> {
  let id = reservation_id(path.into_inner())?;
  let payload = payload.into_inner();
  let result = app_state
    .system
    .orchestrator
    .perform_payment(PaymentRequest {
      reservation_id: id,
      method: payload.method,
      token: payload.token,
      selected_offline_method: payload.selected_offline_method,
    })
    .await?;
  info!(?result, "Payment attempt finished.");
  Ok(payment_response(result))
}

#[instrument(name = "handler::confirm_payment", skip(app_state, payload))]
pub async fn confirm_payment_handler(
  app_state: web::Data<AppState>,
  path: web::Path<String>,
  payload: Option<web::Json<ConfirmPayload>>,
) -> Result<HttpResponse, AppError> {
  let id = reservation_id(path.into_inner())?;
  let token = payload.and_then(|p| p.into_inner().token);
  let result = app_state.system.orchestrator.confirm_external_payment(&id, token).await?;
  Ok(payment_response(result))
}

#[instrument(name = "handler::reset_payment", skip(app_state))]
pub async fn reset_payment_handler(
  app_state: web::Data<AppState>,
  path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
  let id = reservation_id(path.into_inner())?;
  app_state.system.orchestrator.reset_payment(&id).await?;
  Ok(HttpResponse::NoContent().finish())
}

#[instrument(name = "handler::cancel_reservation", skip(app_state))]
pub async fn cancel_reservation_handler(
  app_state: web::Data<AppState>,
  path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
  let id = reservation_id(path.into_inner())?;
  let cancelled = app_state
    .system
    .orchestrator
    .state_machine()
    .cancel_pending_reservation(&id, CancellationReason::Customer)
    .await?;
  Ok(HttpResponse::Ok().json(json!({ "reservationId": id, "cancelled": cancelled })))
}
