// tessera/src/model/job.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobName {
  CheckOfflinePayments,
  ExpirePendingReservations,
  ExpireOfflinePayments,
  RetryConfirmationEmail,
}

string_enum!(JobName {
  CheckOfflinePayments => "CHECK_OFFLINE_PAYMENTS",
  ExpirePendingReservations => "EXPIRE_PENDING_RESERVATIONS",
  ExpireOfflinePayments => "EXPIRE_OFFLINE_PAYMENTS",
  RetryConfirmationEmail => "RETRY_CONFIRMATION_EMAIL",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
  Pending,
  Executed,
  Failed,
}

string_enum!(JobStatus {
  Pending => "PENDING",
  Executed => "EXECUTED",
  Failed => "FAILED",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminJobSchedule {
  pub id: i64,
  pub job_name: JobName,
  pub scheduled_at: DateTime<Utc>,
  pub status: JobStatus,
  pub attempts: u32,
  pub metadata: BTreeMap<String, String>,
  pub last_error: Option<String>,
  pub updated_at: DateTime<Utc>,
}
