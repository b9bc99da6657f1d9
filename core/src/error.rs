// tessera/src/error.rs

use crate::config::ConfigKey;
use crate::flow::FlowError;
use crate::model::{ReservationStatus, TransactionStatus};
use anyhow::Error as AnyhowError;
use thiserror::Error;

/// Where an error sits in the failure taxonomy. Drives logging level, whether
/// the reservation is parked as STUCK, and what the HTTP layer exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Bad input or a reservation that can no longer be paid.
  Validation,
  /// The gateway refused or could not be reached.
  Provider,
  /// Double-payment attempts, missing mandatory configuration, broken invariants.
  Integrity,
  /// Asynchronous notification that cannot be matched to local state.
  Reconciliation,
  Internal,
}

#[derive(Debug, Error)]
pub enum CoreError {
  #[error("Validation failed on '{field}': {code}")]
  Validation { field: String, code: String },

  #[error("Reservation {reservation_id} cannot be paid in status {status}")]
  ReservationNotPayable {
    reservation_id: String,
    status: ReservationStatus,
  },

  #[error("A payment attempt is already in progress for reservation {0}")]
  PaymentAlreadyInProgress(String),

  #[error("Custom offline payment method '{0}' does not exist")]
  CustomOfflinePaymentMethodDoesNotExist(String),

  #[error("Illegal reservation transition {from} -> {to} for {reservation_id}")]
  IllegalTransition {
    reservation_id: String,
    from: ReservationStatus,
    to: ReservationStatus,
  },

  #[error("Illegal transaction transition to {to} for transaction {transaction_id}")]
  IllegalTransactionTransition { transaction_id: i64, to: TransactionStatus },

  #[error("Required configuration {0:?} is missing")]
  MissingConfiguration(ConfigKey),

  #[error("Configuration {key:?} has an invalid value: {message}")]
  InvalidConfiguration { key: ConfigKey, message: String },

  #[error("Gateway error ({code}): {message}")]
  Gateway { code: String, message: String },

  #[error("Gateway call timed out: {0}")]
  GatewayTimeout(String),

  #[error("Integrity violation: {0}")]
  Integrity(String),

  #[error("Reconciliation error: {0}")]
  Reconciliation(String),

  #[error("Not found: {0}")]
  NotFound(String),

  #[error(transparent)]
  Flow(#[from] FlowError),

  #[error("Storage error: {source}")]
  Storage {
    #[source]
    source: AnyhowError,
  },

  #[error("Internal error: {0}")]
  Internal(String),
}

impl CoreError {
  pub fn validation(field: impl Into<String>, code: impl Into<String>) -> Self {
    CoreError::Validation {
      field: field.into(),
      code: code.into(),
    }
  }

  pub fn storage(err: impl Into<AnyhowError>) -> Self {
    CoreError::Storage { source: err.into() }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      CoreError::Validation { .. }
      | CoreError::ReservationNotPayable { .. }
      | CoreError::CustomOfflinePaymentMethodDoesNotExist(_)
      | CoreError::NotFound(_) => ErrorKind::Validation,
      CoreError::Gateway { .. } | CoreError::GatewayTimeout(_) => ErrorKind::Provider,
      CoreError::PaymentAlreadyInProgress(_)
      | CoreError::IllegalTransition { .. }
      | CoreError::IllegalTransactionTransition { .. }
      | CoreError::MissingConfiguration(_)
      | CoreError::InvalidConfiguration { .. }
      | CoreError::Integrity(_) => ErrorKind::Integrity,
      CoreError::Reconciliation(_) => ErrorKind::Reconciliation,
      CoreError::Flow(_) | CoreError::Storage { .. } | CoreError::Internal(_) => ErrorKind::Internal,
    }
  }

  /// Errors that must park a reservation in STUCK for an operator when they
  /// surface in the middle of a payment attempt. A concurrent attempt is an
  /// integrity error too, but the other attempt still owns the reservation.
  pub fn is_fatal_for_attempt(&self) -> bool {
    matches!(
      self,
      CoreError::MissingConfiguration(_)
        | CoreError::InvalidConfiguration { .. }
        | CoreError::Integrity(_)
        | CoreError::IllegalTransition { .. }
        | CoreError::IllegalTransactionTransition { .. }
        | CoreError::Storage { .. }
        | CoreError::Internal(_)
    )
  }
}

impl From<AnyhowError> for CoreError {
  fn from(err: AnyhowError) -> Self {
    // Unwrap a CoreError that travelled through anyhow instead of nesting it.
    match err.downcast::<CoreError>() {
      Ok(core_err) => core_err,
      Err(other) => CoreError::Storage { source: other },
    }
  }
}

impl From<serde_json::Error> for CoreError {
  fn from(err: serde_json::Error) -> Self {
    CoreError::Internal(format!("JSON processing failed: {err}"))
  }
}

pub type CoreResult<T, E = CoreError> = std::result::Result<T, E>;
