// tessera/src/store/memory.rs

//! In-process implementation of every store trait plus `TicketInventory`.
//!
//! Each collection sits behind its own `parking_lot::Mutex`; a compare-and-set
//! runs entirely under one lock, which gives the same guarantees as the
//! conditional `UPDATE` used by the database store.

use super::{AuditStore, JobStore, PurchaseContextStore, ReservationStore, TransactionStore};
use crate::collaborators::TicketInventory;
use crate::error::{CoreError, CoreResult};
use crate::model::{
  AdminJobSchedule, AuditEntry, JobName, JobStatus, NewTransaction, PaymentProxy, PurchaseContext,
  ReservationStatus, Ticket, TicketReservation, TicketStatus, Transaction, TransactionChanges, TransactionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{event, Level};

#[derive(Debug, Default)]
pub struct InMemoryStore {
  reservations: Mutex<HashMap<String, TicketReservation>>,
  transactions: Mutex<BTreeMap<i64, Transaction>>,
  audit: Mutex<Vec<AuditEntry>>,
  jobs: Mutex<BTreeMap<i64, AdminJobSchedule>>,
  contexts: Mutex<HashMap<i64, PurchaseContext>>,
  tickets: Mutex<BTreeMap<i64, Ticket>>,
  sequences: Mutex<Sequences>,
}

#[derive(Debug, Default)]
struct Sequences {
  transaction: i64,
  job: i64,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_purchase_context(&self, context: PurchaseContext) {
    self.contexts.lock().insert(context.id, context);
  }

  pub fn add_tickets(&self, tickets: impl IntoIterator<Item = Ticket>) {
    let mut all = self.tickets.lock();
    for ticket in tickets {
      all.insert(ticket.id, ticket);
    }
  }

  /// Every transaction row, in insertion order.
  pub fn all_transactions(&self) -> Vec<Transaction> {
    self.transactions.lock().values().cloned().collect()
  }

  pub fn all_jobs(&self) -> Vec<AdminJobSchedule> {
    self.jobs.lock().values().cloned().collect()
  }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
  async fn find(&self, id: &str) -> CoreResult<Option<TicketReservation>> {
    Ok(self.reservations.lock().get(id).cloned())
  }

  async fn insert(&self, reservation: TicketReservation) -> CoreResult<()> {
    let mut all = self.reservations.lock();
    if all.contains_key(&reservation.id) {
      return Err(CoreError::Integrity(format!("reservation {} already exists", reservation.id)));
    }
    all.insert(reservation.id.clone(), reservation);
    Ok(())
  }

  async fn transition(
    &self,
    id: &str,
    from: &[ReservationStatus],
    to: ReservationStatus,
    at: DateTime<Utc>,
  ) -> CoreResult<bool> {
    let mut all = self.reservations.lock();
    let Some(reservation) = all.get_mut(id) else {
      return Ok(false);
    };
    if !from.contains(&reservation.status) {
      event!(Level::DEBUG, reservation_id = id, current = %reservation.status, target = %to, "Reservation CAS lost.");
      return Ok(false);
    }
    reservation.status = to;
    if to == ReservationStatus::Complete {
      reservation.confirmed_at = Some(at);
    }
    Ok(true)
  }

  async fn update_payment_details(
    &self,
    id: &str,
    proxy: PaymentProxy,
    validity: Option<DateTime<Utc>>,
  ) -> CoreResult<()> {
    let mut all = self.reservations.lock();
    let reservation = all
      .get_mut(id)
      .ok_or_else(|| CoreError::NotFound(format!("reservation {id}")))?;
    reservation.payment_method = Some(proxy);
    if let Some(validity) = validity {
      reservation.validity = validity;
    }
    Ok(())
  }

  async fn set_invoice_number_if_absent(&self, id: &str, invoice_number: &str) -> CoreResult<bool> {
    let mut all = self.reservations.lock();
    let reservation = all
      .get_mut(id)
      .ok_or_else(|| CoreError::NotFound(format!("reservation {id}")))?;
    if reservation.invoice_number.is_some() {
      return Ok(false);
    }
    reservation.invoice_number = Some(invoice_number.to_string());
    Ok(true)
  }

  async fn find_expired(&self, statuses: &[ReservationStatus], now: DateTime<Utc>) -> CoreResult<Vec<TicketReservation>> {
    Ok(
      self
        .reservations
        .lock()
        .values()
        .filter(|r| statuses.contains(&r.status) && r.is_expired_at(now))
        .cloned()
        .collect(),
    )
  }

  async fn find_by_status(&self, statuses: &[ReservationStatus]) -> CoreResult<Vec<TicketReservation>> {
    Ok(
      self
        .reservations
        .lock()
        .values()
        .filter(|r| statuses.contains(&r.status))
        .cloned()
        .collect(),
    )
  }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
  async fn open_attempt(&self, new: NewTransaction) -> CoreResult<Option<Transaction>> {
    let mut all = self.transactions.lock();
    let has_active = all
      .values()
      .any(|t| t.reservation_id == new.reservation_id && t.status.is_active());
    if has_active {
      return Ok(None);
    }
    let id = {
      let mut seq = self.sequences.lock();
      seq.transaction += 1;
      seq.transaction
    };
    let tx = Transaction {
      id,
      reservation_id: new.reservation_id,
      payment_proxy: new.payment_proxy,
      gateway_id: None,
      status: TransactionStatus::Pending,
      amount_cts: new.amount_cts,
      currency: new.currency,
      platform_fee_cts: 0,
      description: new.description,
      failure_reason: None,
      metadata: new.metadata,
      created_at: new.created_at,
      updated_at: new.created_at,
    };
    all.insert(id, tx.clone());
    Ok(Some(tx))
  }

  async fn find(&self, id: i64) -> CoreResult<Option<Transaction>> {
    Ok(self.transactions.lock().get(&id).cloned())
  }

  async fn find_active_for_reservation(&self, reservation_id: &str) -> CoreResult<Option<Transaction>> {
    Ok(
      self
        .transactions
        .lock()
        .values()
        .find(|t| t.reservation_id == reservation_id && t.status.is_active())
        .cloned(),
    )
  }

  async fn find_for_reservation(&self, reservation_id: &str) -> CoreResult<Vec<Transaction>> {
    Ok(
      self
        .transactions
        .lock()
        .values()
        .filter(|t| t.reservation_id == reservation_id)
        .cloned()
        .collect(),
    )
  }

  async fn find_by_gateway_id(&self, proxy: PaymentProxy, gateway_id: &str) -> CoreResult<Option<Transaction>> {
    Ok(
      self
        .transactions
        .lock()
        .values()
        .find(|t| t.payment_proxy == proxy && t.gateway_id.as_deref() == Some(gateway_id))
        .cloned(),
    )
  }

  async fn find_by_status(&self, proxy: PaymentProxy, statuses: &[TransactionStatus]) -> CoreResult<Vec<Transaction>> {
    Ok(
      self
        .transactions
        .lock()
        .values()
        .filter(|t| t.payment_proxy == proxy && statuses.contains(&t.status))
        .cloned()
        .collect(),
    )
  }

  async fn transition(
    &self,
    id: i64,
    from: &[TransactionStatus],
    to: TransactionStatus,
    changes: TransactionChanges,
    at: DateTime<Utc>,
  ) -> CoreResult<Option<Transaction>> {
    let mut all = self.transactions.lock();
    let Some(tx) = all.get_mut(&id) else {
      return Ok(None);
    };
    if !from.contains(&tx.status) {
      event!(Level::DEBUG, transaction_id = id, current = %tx.status, target = %to, "Transaction CAS lost.");
      return Ok(None);
    }
    tx.status = to;
    tx.updated_at = at;
    changes.apply_to(tx);
    Ok(Some(tx.clone()))
  }
}

#[async_trait]
impl AuditStore for InMemoryStore {
  async fn record(&self, entry: AuditEntry) -> CoreResult<()> {
    self.audit.lock().push(entry);
    Ok(())
  }

  async fn for_reservation(&self, reservation_id: &str) -> CoreResult<Vec<AuditEntry>> {
    Ok(
      self
        .audit
        .lock()
        .iter()
        .filter(|e| e.reservation_id == reservation_id)
        .cloned()
        .collect(),
    )
  }
}

#[async_trait]
impl JobStore for InMemoryStore {
  async fn schedule(
    &self,
    job_name: JobName,
    scheduled_at: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
  ) -> CoreResult<i64> {
    let id = {
      let mut seq = self.sequences.lock();
      seq.job += 1;
      seq.job
    };
    self.jobs.lock().insert(
      id,
      AdminJobSchedule {
        id,
        job_name,
        scheduled_at,
        status: JobStatus::Pending,
        attempts: 0,
        metadata,
        last_error: None,
        updated_at: scheduled_at,
      },
    );
    Ok(id)
  }

  async fn find(&self, id: i64) -> CoreResult<Option<AdminJobSchedule>> {
    Ok(self.jobs.lock().get(&id).cloned())
  }

  async fn pending(&self, now: DateTime<Utc>, limit: usize) -> CoreResult<Vec<AdminJobSchedule>> {
    let mut due: Vec<AdminJobSchedule> = self
      .jobs
      .lock()
      .values()
      .filter(|j| j.status == JobStatus::Pending && j.scheduled_at <= now)
      .cloned()
      .collect();
    due.sort_by_key(|j| (j.scheduled_at, j.id));
    due.truncate(limit);
    Ok(due)
  }

  async fn mark_executed(&self, id: i64, at: DateTime<Utc>) -> CoreResult<()> {
    let mut jobs = self.jobs.lock();
    let job = jobs.get_mut(&id).ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
    job.status = JobStatus::Executed;
    job.attempts += 1;
    job.last_error = None;
    job.updated_at = at;
    Ok(())
  }

  async fn reschedule(&self, id: i64, next_run: DateTime<Utc>, attempts: u32, error: &str) -> CoreResult<()> {
    let mut jobs = self.jobs.lock();
    let job = jobs.get_mut(&id).ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
    job.scheduled_at = next_run;
    job.attempts = attempts;
    job.last_error = Some(error.to_string());
    Ok(())
  }

  async fn mark_failed(&self, id: i64, attempts: u32, error: &str, at: DateTime<Utc>) -> CoreResult<()> {
    let mut jobs = self.jobs.lock();
    let job = jobs.get_mut(&id).ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
    job.status = JobStatus::Failed;
    job.attempts = attempts;
    job.last_error = Some(error.to_string());
    job.updated_at = at;
    Ok(())
  }

  async fn cleanup(&self, executed_before: DateTime<Utc>, failed_before: DateTime<Utc>) -> CoreResult<u64> {
    let mut jobs = self.jobs.lock();
    let before = jobs.len();
    jobs.retain(|_, j| match j.status {
      JobStatus::Executed => j.updated_at >= executed_before,
      JobStatus::Failed => j.updated_at >= failed_before,
      JobStatus::Pending => true,
    });
    Ok((before - jobs.len()) as u64)
  }
}

#[async_trait]
impl PurchaseContextStore for InMemoryStore {
  async fn find(&self, id: i64) -> CoreResult<Option<PurchaseContext>> {
    Ok(self.contexts.lock().get(&id).cloned())
  }
}

#[async_trait]
impl TicketInventory for InMemoryStore {
  async fn count_unsold(&self, category_id: i64) -> CoreResult<i64> {
    Ok(
      self
        .tickets
        .lock()
        .values()
        .filter(|t| t.category_id == category_id && t.status == TicketStatus::Free)
        .count() as i64,
    )
  }

  async fn reserve_tickets(&self, reservation_id: &str, category_id: i64, quantity: usize) -> CoreResult<Vec<Ticket>> {
    let mut all = self.tickets.lock();
    let free: Vec<i64> = all
      .values()
      .filter(|t| t.category_id == category_id && t.status == TicketStatus::Free)
      .map(|t| t.id)
      .take(quantity)
      .collect();
    if free.len() < quantity {
      return Err(CoreError::validation("category", "error.tickets.sold_out"));
    }
    let mut reserved = Vec::with_capacity(quantity);
    for id in free {
      if let Some(ticket) = all.get_mut(&id) {
        ticket.status = TicketStatus::Pending;
        ticket.reservation_id = Some(reservation_id.to_string());
        reserved.push(ticket.clone());
      }
    }
    Ok(reserved)
  }

  async fn release_tickets(&self, reservation_id: &str) -> CoreResult<u64> {
    let mut released = 0;
    for ticket in self.tickets.lock().values_mut() {
      if ticket.reservation_id.as_deref() == Some(reservation_id) && ticket.status == TicketStatus::Pending {
        ticket.status = TicketStatus::Free;
        ticket.reservation_id = None;
        ticket.owner_name = None;
        ticket.owner_email = None;
        released += 1;
      }
    }
    Ok(released)
  }

  async fn confirm_tickets(&self, reservation_id: &str) -> CoreResult<Vec<Ticket>> {
    let mut confirmed = Vec::new();
    for ticket in self.tickets.lock().values_mut() {
      if ticket.reservation_id.as_deref() == Some(reservation_id) && ticket.status == TicketStatus::Pending {
        ticket.status = TicketStatus::Acquired;
        confirmed.push(ticket.clone());
      }
    }
    Ok(confirmed)
  }

  async fn tickets_for(&self, reservation_id: &str) -> CoreResult<Vec<Ticket>> {
    Ok(
      self
        .tickets
        .lock()
        .values()
        .filter(|t| t.reservation_id.as_deref() == Some(reservation_id))
        .cloned()
        .collect(),
    )
  }
}
