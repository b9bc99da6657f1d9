// tessera/src/model/transaction.rs

use super::payment::PaymentProxy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
  Pending,
  Complete,
  Failed,
  OfflinePendingReview,
  OfflineMatchingPaymentFound,
  Cancelled,
}

string_enum!(TransactionStatus {
  Pending => "PENDING",
  Complete => "COMPLETE",
  Failed => "FAILED",
  OfflinePendingReview => "OFFLINE_PENDING_REVIEW",
  OfflineMatchingPaymentFound => "OFFLINE_MATCHING_PAYMENT_FOUND",
  Cancelled => "CANCELLED",
});

impl TransactionStatus {
  /// At most one transaction per reservation may be in one of these.
  pub const ACTIVE: &'static [TransactionStatus] = &[
    TransactionStatus::Pending,
    TransactionStatus::OfflinePendingReview,
    TransactionStatus::OfflineMatchingPaymentFound,
  ];

  pub fn is_active(&self) -> bool {
    Self::ACTIVE.contains(self)
  }
}

/// One payment attempt against a reservation. Rows are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
  pub id: i64,
  pub reservation_id: String,
  pub payment_proxy: PaymentProxy,
  pub gateway_id: Option<String>,
  pub status: TransactionStatus,
  pub amount_cts: i64,
  pub currency: String,
  pub platform_fee_cts: i64,
  pub description: String,
  pub failure_reason: Option<String>,
  pub metadata: BTreeMap<String, String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
  pub reservation_id: String,
  pub payment_proxy: PaymentProxy,
  pub amount_cts: i64,
  pub currency: String,
  pub description: String,
  pub metadata: BTreeMap<String, String>,
  pub created_at: DateTime<Utc>,
}

/// Fields written together with a status change. `None` leaves the column as is;
/// metadata entries are merged.
#[derive(Debug, Clone, Default)]
pub struct TransactionChanges {
  pub gateway_id: Option<String>,
  pub platform_fee_cts: Option<i64>,
  pub failure_reason: Option<String>,
  pub metadata: BTreeMap<String, String>,
}

impl TransactionChanges {
  pub fn gateway_id(gateway_id: impl Into<String>) -> Self {
    TransactionChanges {
      gateway_id: Some(gateway_id.into()),
      ..Default::default()
    }
  }

  pub fn failure(reason: impl Into<String>) -> Self {
    TransactionChanges {
      failure_reason: Some(reason.into()),
      ..Default::default()
    }
  }

  pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }

  pub fn apply_to(&self, tx: &mut Transaction) {
    if let Some(gateway_id) = &self.gateway_id {
      tx.gateway_id = Some(gateway_id.clone());
    }
    if let Some(fee) = self.platform_fee_cts {
      tx.platform_fee_cts = fee;
    }
    if let Some(reason) = &self.failure_reason {
      tx.failure_reason = Some(reason.clone());
    }
    for (k, v) in &self.metadata {
      tx.metadata.insert(k.clone(), v.clone());
    }
  }
}
