// tessera/src/providers/http.rs

//! Shared HTTP plumbing for gateway clients.

use crate::error::CoreError;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum GatewayError {
  /// The request may or may not have reached the gateway.
  #[error("gateway call timed out")]
  Timeout,

  #[error("gateway connection failed: {0}")]
  Connection(String),

  #[error("gateway answered {status}: {body}")]
  Status { status: u16, body: String },

  #[error("could not decode gateway response: {0}")]
  Decode(String),
}

impl From<reqwest::Error> for GatewayError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      GatewayError::Timeout
    } else if err.is_decode() {
      GatewayError::Decode(err.to_string())
    } else if let Some(status) = err.status() {
      GatewayError::Status {
        status: status.as_u16(),
        body: err.to_string(),
      }
    } else {
      GatewayError::Connection(err.to_string())
    }
  }
}

impl From<GatewayError> for CoreError {
  fn from(err: GatewayError) -> Self {
    match err {
      GatewayError::Timeout => CoreError::GatewayTimeout("gateway did not answer in time".to_string()),
      GatewayError::Connection(message) => CoreError::Gateway {
        code: "connection".to_string(),
        message,
      },
      GatewayError::Status { status, body } => CoreError::Gateway {
        code: status.to_string(),
        message: body,
      },
      GatewayError::Decode(message) => CoreError::Gateway {
        code: "decode".to_string(),
        message,
      },
    }
  }
}

/// A client with rustls and an overall request timeout.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, GatewayError> {
  reqwest::Client::builder()
    .use_rustls_tls()
    .timeout(timeout)
    .connect_timeout(timeout.min(Duration::from_secs(5)))
    .build()
    .map_err(|e| GatewayError::Connection(e.to_string()))
}

/// Reads a non-2xx response into a `GatewayError::Status`.
pub(crate) async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  Err(GatewayError::Status {
    status: status.as_u16(),
    body,
  })
}
