// tessera/src/store/mod.rs

//! Persistence seams.
//!
//! Status columns are only ever changed with compare-and-set: a transition
//! names the statuses it expects to find and reports whether it won. Two
//! concurrent writers (a customer retry and a webhook) cannot both win.

pub mod memory;

use crate::error::CoreResult;
use crate::model::{
  AdminJobSchedule, AuditEntry, JobName, NewTransaction, PaymentProxy, PurchaseContext, ReservationStatus,
  TicketReservation, Transaction, TransactionChanges, TransactionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub use memory::InMemoryStore;

#[async_trait]
pub trait ReservationStore: Send + Sync {
  async fn find(&self, id: &str) -> CoreResult<Option<TicketReservation>>;

  async fn insert(&self, reservation: TicketReservation) -> CoreResult<()>;

  /// Moves the reservation to `to` if its current status is one of `from`.
  /// Reaching COMPLETE also stamps `confirmed_at`.
  async fn transition(
    &self,
    id: &str,
    from: &[ReservationStatus],
    to: ReservationStatus,
    at: DateTime<Utc>,
  ) -> CoreResult<bool>;

  async fn update_payment_details(
    &self,
    id: &str,
    proxy: PaymentProxy,
    validity: Option<DateTime<Utc>>,
  ) -> CoreResult<()>;

  /// Writes the invoice number only if none is set yet. Returns whether it was written.
  async fn set_invoice_number_if_absent(&self, id: &str, invoice_number: &str) -> CoreResult<bool>;

  /// Reservations in one of `statuses` whose validity is at or before `now`.
  async fn find_expired(&self, statuses: &[ReservationStatus], now: DateTime<Utc>) -> CoreResult<Vec<TicketReservation>>;

  async fn find_by_status(&self, statuses: &[ReservationStatus]) -> CoreResult<Vec<TicketReservation>>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
  /// Inserts a PENDING transaction unless the reservation already has an
  /// active one, in which case nothing is written and `None` is returned.
  async fn open_attempt(&self, new: NewTransaction) -> CoreResult<Option<Transaction>>;

  async fn find(&self, id: i64) -> CoreResult<Option<Transaction>>;

  async fn find_active_for_reservation(&self, reservation_id: &str) -> CoreResult<Option<Transaction>>;

  async fn find_for_reservation(&self, reservation_id: &str) -> CoreResult<Vec<Transaction>>;

  async fn find_by_gateway_id(&self, proxy: PaymentProxy, gateway_id: &str) -> CoreResult<Option<Transaction>>;

  async fn find_by_status(&self, proxy: PaymentProxy, statuses: &[TransactionStatus]) -> CoreResult<Vec<Transaction>>;

  /// Compare-and-set on the status column, applying `changes` in the same write.
  /// `from` may contain `to` to update fields without changing status.
  async fn transition(
    &self,
    id: i64,
    from: &[TransactionStatus],
    to: TransactionStatus,
    changes: TransactionChanges,
    at: DateTime<Utc>,
  ) -> CoreResult<Option<Transaction>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
  async fn record(&self, entry: AuditEntry) -> CoreResult<()>;

  async fn for_reservation(&self, reservation_id: &str) -> CoreResult<Vec<AuditEntry>>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
  async fn schedule(
    &self,
    job_name: JobName,
    scheduled_at: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
  ) -> CoreResult<i64>;

  async fn find(&self, id: i64) -> CoreResult<Option<AdminJobSchedule>>;

  /// PENDING jobs due at `now`, oldest first.
  async fn pending(&self, now: DateTime<Utc>, limit: usize) -> CoreResult<Vec<AdminJobSchedule>>;

  async fn mark_executed(&self, id: i64, at: DateTime<Utc>) -> CoreResult<()>;

  /// Keeps the job PENDING with a later due time after a failed run.
  async fn reschedule(&self, id: i64, next_run: DateTime<Utc>, attempts: u32, error: &str) -> CoreResult<()>;

  async fn mark_failed(&self, id: i64, attempts: u32, error: &str, at: DateTime<Utc>) -> CoreResult<()>;

  /// Deletes EXECUTED jobs last updated before `executed_before` and FAILED jobs
  /// before `failed_before`. Returns the number of removed rows.
  async fn cleanup(&self, executed_before: DateTime<Utc>, failed_before: DateTime<Utc>) -> CoreResult<u64>;
}

#[async_trait]
pub trait PurchaseContextStore: Send + Sync {
  async fn find(&self, id: i64) -> CoreResult<Option<PurchaseContext>>;
}
