// server/src/errors.rs

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use tessera::{CoreError, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
  #[error("Validation Error: {0}")]
  Validation(String),

  #[error("Resource Not Found: {0}")]
  NotFound(String),

  #[error("Configuration Error: {0}")]
  Config(String),

  #[error("Database Error: {0}")]
  Sqlx(#[from] sqlx::Error),

  #[error("Payment Error: {source}")]
  Payment {
    #[from]
    source: CoreError,
  },
}

impl From<anyhow::Error> for AppError {
  fn from(err: anyhow::Error) -> Self {
    match err.downcast::<sqlx::Error>() {
      Ok(sqlx_err) => AppError::Sqlx(sqlx_err),
      Err(other) => AppError::Payment {
        source: CoreError::from(other),
      },
    }
  }
}

/// Machine-readable code for the response body. Validation failures carry
/// their own code; everything else gets one per variant.
fn payment_error_code(err: &CoreError) -> String {
  match err {
    CoreError::Validation { code, .. } => code.clone(),
    CoreError::ReservationNotPayable { .. } => "error.reservation.not_payable".to_string(),
    CoreError::PaymentAlreadyInProgress(_) => "error.payment.in_progress".to_string(),
    CoreError::CustomOfflinePaymentMethodDoesNotExist(_) => "error.payment.custom_method_unknown".to_string(),
    CoreError::NotFound(_) => "error.not_found".to_string(),
    CoreError::Gateway { code, .. } => format!("error.gateway.{code}"),
    CoreError::GatewayTimeout(_) => "error.gateway.timeout".to_string(),
    CoreError::Reconciliation(_) => "error.reconciliation".to_string(),
    CoreError::IllegalTransition { .. } | CoreError::IllegalTransactionTransition { .. } => {
      "error.reservation.conflict".to_string()
    }
    _ => "error.internal".to_string(),
  }
}

fn payment_status(err: &CoreError) -> StatusCode {
  match err {
    CoreError::NotFound(_) => StatusCode::NOT_FOUND,
    CoreError::PaymentAlreadyInProgress(_) => StatusCode::CONFLICT,
    CoreError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
    CoreError::MissingConfiguration(_) | CoreError::InvalidConfiguration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    other => match other.kind() {
      ErrorKind::Validation => StatusCode::BAD_REQUEST,
      ErrorKind::Provider => StatusCode::BAD_GATEWAY,
      ErrorKind::Integrity => StatusCode::CONFLICT,
      ErrorKind::Reconciliation => StatusCode::UNPROCESSABLE_ENTITY,
      ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    },
  }
}

impl ResponseError for AppError {
  fn status_code(&self) -> StatusCode {
    match self {
      AppError::Validation(_) => StatusCode::BAD_REQUEST,
      AppError::NotFound(_) => StatusCode::NOT_FOUND,
      AppError::Payment { source } => payment_status(source),
      AppError::Config(_) | AppError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  fn error_response(&self) -> HttpResponse {
    let status = self.status_code();
    if status.is_server_error() {
      tracing::error!(application_error = %self, "Responding with error");
    } else {
      tracing::warn!(application_error = %self, "Responding with error");
    }
    let body = match self {
      AppError::Validation(m) => json!({"error": "error.validation", "detail": m}),
      AppError::NotFound(m) => json!({"error": "error.not_found", "detail": m}),
      AppError::Payment { source } if !status.is_server_error() => {
        json!({"error": payment_error_code(source), "detail": source.to_string()})
      }
      AppError::Payment { source } => json!({"error": payment_error_code(source)}),
      AppError::Config(_) | AppError::Sqlx(_) => {
        json!({"error": "error.internal", "detail": "An internal error occurred"})
      }
    };
    HttpResponse::build(status).json(body)
  }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;
  use tessera::model::ReservationStatus;

  #[test]
  fn payment_errors_map_to_http_statuses() {
    let cases = [
      (CoreError::validation("token", "error.token.missing"), StatusCode::BAD_REQUEST),
      (CoreError::NotFound("reservation x".into()), StatusCode::NOT_FOUND),
      (
        CoreError::ReservationNotPayable {
          reservation_id: "x".into(),
          status: ReservationStatus::Cancelled,
        },
        StatusCode::BAD_REQUEST,
      ),
      (CoreError::PaymentAlreadyInProgress("x".into()), StatusCode::CONFLICT),
      (
        CoreError::Gateway {
          code: "card_declined".into(),
          message: "declined".into(),
        },
        StatusCode::BAD_GATEWAY,
      ),
      (CoreError::GatewayTimeout("stripe".into()), StatusCode::GATEWAY_TIMEOUT),
      (CoreError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (err, expected) in cases {
      assert_eq!(AppError::from(err).status_code(), expected);
    }
  }

  #[test]
  fn validation_code_is_exposed() {
    let err = CoreError::validation("method", "error.payment.method_unavailable");
    assert_eq!(payment_error_code(&err), "error.payment.method_unavailable");
    assert_eq!(payment_error_code(&CoreError::Internal("db".into())), "error.internal");
  }
}
