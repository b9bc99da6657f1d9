// server/src/web/handlers/admin_handlers.rs

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tessera::model::JobName;
use tessera::CompletionOutcome;
use tracing::{info, instrument};

use super::reservation_id;
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConfirmOfflinePayload {
  pub confirmed_by: String,
}

#[derive(Debug, Deserialize)]
pub struct RefundPayload {
  /// Omit for a full refund of what is left.
  #[serde(default)]
  pub amount_cts: Option<i64>,
  pub requested_by: String,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleJobPayload {
  pub job_name: JobName,
  #[serde(default)]
  pub metadata: BTreeMap<String, String>,
}

fn operator(name: &str) -> Result<&str, AppError> {
  let name = name.trim();
  if name.is_empty() {
    return Err(AppError::Validation("operator name is required".to_string()));
  }
  Ok(name)
}

#[instrument(name = "handler::confirm_offline", skip(app_state, payload))]
pub async fn confirm_offline_handler(
  app_state: web::Data<AppState>,
  path: web::Path<String>,
  payload: web::Json<ConfirmOfflinePayload>,
) -> Result<HttpResponse, AppError> {
  let id = reservation_id(path.into_inner())?;
  let by = operator(&payload.confirmed_by)?;
  let outcome = app_state.system.orchestrator.confirm_offline_payment(&id, by).await?;
  let body = match outcome {
    CompletionOutcome::Completed { invoice_number } => {
      info!(reservation_id = %id, confirmed_by = by, "Offline payment confirmed.");
      json!({ "reservationId": id, "status": "COMPLETE", "invoiceNumber": invoice_number })
    }
    CompletionOutcome::AlreadyComplete => json!({ "reservationId": id, "status": "ALREADY_COMPLETE" }),
  };
  Ok(HttpResponse::Ok().json(body))
}

#[instrument(name = "handler::refund", skip(app_state, payload))]
pub async fn refund_handler(
  app_state: web::Data<AppState>,
  path: web::Path<String>,
  payload: web::Json<RefundPayload>,
) -> Result<HttpResponse, AppError> {
  let id = reservation_id(path.into_inner())?;
  let by = operator(&payload.requested_by)?;
  let outcome = app_state.system.orchestrator.refund(&id, payload.amount_cts, by).await?;
  Ok(HttpResponse::Ok().json(outcome))
}

#[instrument(name = "handler::schedule_job", skip(app_state, payload), fields(job = %payload.job_name))]
pub async fn schedule_job_handler(
  app_state: web::Data<AppState>,
  payload: web::Json<ScheduleJobPayload>,
) -> Result<HttpResponse, AppError> {
  let payload = payload.into_inner();
  let job_id = app_state.system.jobs.schedule(payload.job_name, payload.metadata).await?;
  Ok(HttpResponse::Accepted().json(json!({ "jobId": job_id, "jobName": payload.job_name })))
}
