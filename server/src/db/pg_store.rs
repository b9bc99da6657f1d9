// server/src/db/pg_store.rs

//! PostgreSQL implementation of the reservation, transaction, audit, job and
//! purchase-context stores, plus ticket inventory.
//!
//! Status changes are single conditional `UPDATE`s (`WHERE status = ANY(..)`);
//! the affected row count tells the caller whether it won.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use std::fmt::Display;
use tessera::collaborators::TicketInventory;
use tessera::model::{
  AdminJobSchedule, AuditEntry, BillingDetails, Currency, JobName, NewTransaction, PaymentProxy, PurchaseContext,
  ReservationStatus, Ticket, TicketReservation, TicketStatus, Transaction, TransactionChanges, TransactionStatus,
};
use tessera::store::{AuditStore, JobStore, PurchaseContextStore, ReservationStore, TransactionStore};
use tessera::{CoreError, CoreResult};
use tracing::{event, instrument, Level};

const TRANSACTION_COLUMNS: &str = "id, reservation_id, payment_proxy, gateway_id, status, amount_cts, currency, \
  platform_fee_cts, description, failure_reason, metadata, created_at, updated_at";

const JOB_COLUMNS: &str = "id, job_name, scheduled_at, status, attempts, metadata, last_error, updated_at";

const TICKET_COLUMNS: &str =
  "id, uuid, category_id, purchase_context_id, reservation_id, status, src_price_cts, owner_name, owner_email";

#[derive(Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub fn new(pool: PgPool) -> Self {
    PgStore { pool }
  }
}

fn names<S: Display>(statuses: &[S]) -> Vec<String> {
  statuses.iter().map(ToString::to_string).collect()
}

#[derive(FromRow)]
struct ReservationRow {
  id: String,
  status: String,
  validity: DateTime<Utc>,
  purchase_context_id: i64,
  currency: String,
  src_price_cts: i64,
  vat_cts: i64,
  discount_cts: i64,
  final_price_cts: i64,
  vat_status: String,
  full_name: String,
  email_address: String,
  billing_address: Option<String>,
  company_name: Option<String>,
  vat_number: Option<String>,
  vat_country: Option<String>,
  invoice_requested: bool,
  invoice_number: Option<String>,
  payment_method: Option<String>,
  user_language: String,
  created_at: DateTime<Utc>,
  confirmed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReservationRow> for TicketReservation {
  type Error = CoreError;

  fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
    Ok(TicketReservation {
      id: row.id,
      status: row.status.parse()?,
      validity: row.validity,
      purchase_context_id: row.purchase_context_id,
      currency: Currency::new(row.currency),
      src_price_cts: row.src_price_cts,
      vat_cts: row.vat_cts,
      discount_cts: row.discount_cts,
      final_price_cts: row.final_price_cts,
      vat_status: row.vat_status.parse()?,
      customer: BillingDetails {
        full_name: row.full_name,
        email: row.email_address,
        billing_address: row.billing_address,
        company_name: row.company_name,
        vat_number: row.vat_number,
        vat_country: row.vat_country,
      },
      invoice_requested: row.invoice_requested,
      invoice_number: row.invoice_number,
      payment_method: row.payment_method.map(|p| p.parse()).transpose()?,
      locale: row.user_language,
      created_at: row.created_at,
      confirmed_at: row.confirmed_at,
    })
  }
}

fn reservations(rows: Vec<ReservationRow>) -> CoreResult<Vec<TicketReservation>> {
  rows.into_iter().map(TicketReservation::try_from).collect()
}

#[derive(FromRow)]
struct TransactionRow {
  id: i64,
  reservation_id: String,
  payment_proxy: String,
  gateway_id: Option<String>,
  status: String,
  amount_cts: i64,
  currency: String,
  platform_fee_cts: i64,
  description: String,
  failure_reason: Option<String>,
  metadata: Json<BTreeMap<String, String>>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
  type Error = CoreError;

  fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
    Ok(Transaction {
      id: row.id,
      reservation_id: row.reservation_id,
      payment_proxy: row.payment_proxy.parse()?,
      gateway_id: row.gateway_id,
      status: row.status.parse()?,
      amount_cts: row.amount_cts,
      currency: row.currency,
      platform_fee_cts: row.platform_fee_cts,
      description: row.description,
      failure_reason: row.failure_reason,
      metadata: row.metadata.0,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

#[derive(FromRow)]
struct JobRow {
  id: i64,
  job_name: String,
  scheduled_at: DateTime<Utc>,
  status: String,
  attempts: i32,
  metadata: Json<BTreeMap<String, String>>,
  last_error: Option<String>,
  updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for AdminJobSchedule {
  type Error = CoreError;

  fn try_from(row: JobRow) -> Result<Self, Self::Error> {
    Ok(AdminJobSchedule {
      id: row.id,
      job_name: row.job_name.parse()?,
      scheduled_at: row.scheduled_at,
      status: row.status.parse()?,
      attempts: u32::try_from(row.attempts).unwrap_or(0),
      metadata: row.metadata.0,
      last_error: row.last_error,
      updated_at: row.updated_at,
    })
  }
}

#[derive(FromRow)]
struct TicketRow {
  id: i64,
  uuid: String,
  category_id: i64,
  purchase_context_id: i64,
  reservation_id: Option<String>,
  status: String,
  src_price_cts: i64,
  owner_name: Option<String>,
  owner_email: Option<String>,
}

impl TryFrom<TicketRow> for Ticket {
  type Error = CoreError;

  fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
    Ok(Ticket {
      id: row.id,
      uuid: row.uuid,
      category_id: row.category_id,
      purchase_context_id: row.purchase_context_id,
      reservation_id: row.reservation_id,
      status: row.status.parse()?,
      src_price_cts: row.src_price_cts,
      owner_name: row.owner_name,
      owner_email: row.owner_email,
    })
  }
}

fn tickets(rows: Vec<TicketRow>) -> CoreResult<Vec<Ticket>> {
  rows.into_iter().map(Ticket::try_from).collect()
}

#[derive(FromRow)]
struct PurchaseContextRow {
  id: i64,
  short_name: String,
  display_name: String,
  organization_id: i64,
  currency: String,
  begins_at: DateTime<Utc>,
  format: String,
  vat_status: String,
  vat_percentage: Decimal,
}

#[derive(FromRow)]
struct AuditRow {
  reservation_id: String,
  event_type: String,
  event_time: DateTime<Utc>,
  details: Json<BTreeMap<String, String>>,
}

#[async_trait]
impl ReservationStore for PgStore {
  async fn find(&self, id: &str) -> CoreResult<Option<TicketReservation>> {
    sqlx::query_as::<_, ReservationRow>("SELECT * FROM tickets_reservation WHERE id = $1")
      .bind(id)
      .fetch_optional(&self.pool)
      .await
      .map_err(CoreError::storage)?
      .map(TicketReservation::try_from)
      .transpose()
  }

  #[instrument(skip(self, reservation), fields(reservation_id = %reservation.id))]
  async fn insert(&self, reservation: TicketReservation) -> CoreResult<()> {
    let customer = reservation.customer;
    let result = sqlx::query(
      "INSERT INTO tickets_reservation (id, status, validity, purchase_context_id, currency, src_price_cts, vat_cts, \
       discount_cts, final_price_cts, vat_status, full_name, email_address, billing_address, company_name, vat_number, \
       vat_country, invoice_requested, invoice_number, payment_method, user_language, created_at, confirmed_at) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22) \
       ON CONFLICT (id) DO NOTHING",
    )
    .bind(&reservation.id)
    .bind(reservation.status.as_str())
    .bind(reservation.validity)
    .bind(reservation.purchase_context_id)
    .bind(reservation.currency.code())
    .bind(reservation.src_price_cts)
    .bind(reservation.vat_cts)
    .bind(reservation.discount_cts)
    .bind(reservation.final_price_cts)
    .bind(reservation.vat_status.as_str())
    .bind(customer.full_name)
    .bind(customer.email)
    .bind(customer.billing_address)
    .bind(customer.company_name)
    .bind(customer.vat_number)
    .bind(customer.vat_country)
    .bind(reservation.invoice_requested)
    .bind(reservation.invoice_number)
    .bind(reservation.payment_method.map(|p| p.as_str()))
    .bind(reservation.locale)
    .bind(reservation.created_at)
    .bind(reservation.confirmed_at)
    .execute(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    if result.rows_affected() == 0 {
      return Err(CoreError::Integrity(format!("reservation {} already exists", reservation.id)));
    }
    Ok(())
  }

  async fn transition(
    &self,
    id: &str,
    from: &[ReservationStatus],
    to: ReservationStatus,
    at: DateTime<Utc>,
  ) -> CoreResult<bool> {
    let result = sqlx::query(
      "UPDATE tickets_reservation \
       SET status = $2, confirmed_at = CASE WHEN $2 = 'COMPLETE' THEN $3 ELSE confirmed_at END \
       WHERE id = $1 AND status = ANY($4)",
    )
    .bind(id)
    .bind(to.as_str())
    .bind(at)
    .bind(names(from))
    .execute(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    let won = result.rows_affected() == 1;
    if !won {
      event!(Level::DEBUG, reservation_id = id, target = %to, "Reservation CAS lost.");
    }
    Ok(won)
  }

  async fn update_payment_details(
    &self,
    id: &str,
    proxy: PaymentProxy,
    validity: Option<DateTime<Utc>>,
  ) -> CoreResult<()> {
    let result = sqlx::query(
      "UPDATE tickets_reservation SET payment_method = $2, validity = COALESCE($3, validity) WHERE id = $1",
    )
    .bind(id)
    .bind(proxy.as_str())
    .bind(validity)
    .execute(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    if result.rows_affected() == 0 {
      return Err(CoreError::NotFound(format!("reservation {id}")));
    }
    Ok(())
  }

  async fn set_invoice_number_if_absent(&self, id: &str, invoice_number: &str) -> CoreResult<bool> {
    let result = sqlx::query(
      "UPDATE tickets_reservation SET invoice_number = $2 WHERE id = $1 AND invoice_number IS NULL",
    )
    .bind(id)
    .bind(invoice_number)
    .execute(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    if result.rows_affected() == 1 {
      return Ok(true);
    }
    match ReservationStore::find(self, id).await? {
      Some(_) => Ok(false),
      None => Err(CoreError::NotFound(format!("reservation {id}"))),
    }
  }

  async fn find_expired(&self, statuses: &[ReservationStatus], now: DateTime<Utc>) -> CoreResult<Vec<TicketReservation>> {
    let rows = sqlx::query_as::<_, ReservationRow>(
      "SELECT * FROM tickets_reservation WHERE status = ANY($1) AND validity <= $2 ORDER BY validity",
    )
    .bind(names(statuses))
    .bind(now)
    .fetch_all(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    reservations(rows)
  }

  async fn find_by_status(&self, statuses: &[ReservationStatus]) -> CoreResult<Vec<TicketReservation>> {
    let rows = sqlx::query_as::<_, ReservationRow>(
      "SELECT * FROM tickets_reservation WHERE status = ANY($1) ORDER BY created_at",
    )
    .bind(names(statuses))
    .fetch_all(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    reservations(rows)
  }
}

#[async_trait]
impl TransactionStore for PgStore {
  #[instrument(skip(self, new), fields(reservation_id = %new.reservation_id, proxy = %new.payment_proxy))]
  async fn open_attempt(&self, new: NewTransaction) -> CoreResult<Option<Transaction>> {
    // The partial unique index turns a second active attempt into a no-op insert.
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
      "INSERT INTO b_transaction (reservation_id, payment_proxy, status, amount_cts, currency, description, metadata, \
       created_at, updated_at) VALUES ($1, $2, 'PENDING', $3, $4, $5, $6, $7, $7) \
       ON CONFLICT DO NOTHING RETURNING {TRANSACTION_COLUMNS}"
    ))
    .bind(&new.reservation_id)
    .bind(new.payment_proxy.as_str())
    .bind(new.amount_cts)
    .bind(&new.currency)
    .bind(&new.description)
    .bind(Json(&new.metadata))
    .bind(new.created_at)
    .fetch_optional(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    if row.is_none() {
      event!(Level::DEBUG, "An active transaction already exists.");
    }
    row.map(Transaction::try_from).transpose()
  }

  async fn find(&self, id: i64) -> CoreResult<Option<Transaction>> {
    sqlx::query_as::<_, TransactionRow>(&format!("SELECT {TRANSACTION_COLUMNS} FROM b_transaction WHERE id = $1"))
      .bind(id)
      .fetch_optional(&self.pool)
      .await
      .map_err(CoreError::storage)?
      .map(Transaction::try_from)
      .transpose()
  }

  async fn find_active_for_reservation(&self, reservation_id: &str) -> CoreResult<Option<Transaction>> {
    sqlx::query_as::<_, TransactionRow>(&format!(
      "SELECT {TRANSACTION_COLUMNS} FROM b_transaction WHERE reservation_id = $1 AND status = ANY($2)"
    ))
    .bind(reservation_id)
    .bind(names(TransactionStatus::ACTIVE))
    .fetch_optional(&self.pool)
    .await
    .map_err(CoreError::storage)?
    .map(Transaction::try_from)
    .transpose()
  }

  async fn find_for_reservation(&self, reservation_id: &str) -> CoreResult<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
      "SELECT {TRANSACTION_COLUMNS} FROM b_transaction WHERE reservation_id = $1 ORDER BY id"
    ))
    .bind(reservation_id)
    .fetch_all(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    rows.into_iter().map(Transaction::try_from).collect()
  }

  async fn find_by_gateway_id(&self, proxy: PaymentProxy, gateway_id: &str) -> CoreResult<Option<Transaction>> {
    sqlx::query_as::<_, TransactionRow>(&format!(
      "SELECT {TRANSACTION_COLUMNS} FROM b_transaction WHERE payment_proxy = $1 AND gateway_id = $2 \
       ORDER BY id DESC LIMIT 1"
    ))
    .bind(proxy.as_str())
    .bind(gateway_id)
    .fetch_optional(&self.pool)
    .await
    .map_err(CoreError::storage)?
    .map(Transaction::try_from)
    .transpose()
  }

  async fn find_by_status(&self, proxy: PaymentProxy, statuses: &[TransactionStatus]) -> CoreResult<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
      "SELECT {TRANSACTION_COLUMNS} FROM b_transaction WHERE payment_proxy = $1 AND status = ANY($2) ORDER BY id"
    ))
    .bind(proxy.as_str())
    .bind(names(statuses))
    .fetch_all(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    rows.into_iter().map(Transaction::try_from).collect()
  }

  async fn transition(
    &self,
    id: i64,
    from: &[TransactionStatus],
    to: TransactionStatus,
    changes: TransactionChanges,
    at: DateTime<Utc>,
  ) -> CoreResult<Option<Transaction>> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
      "UPDATE b_transaction SET status = $2, updated_at = $3, gateway_id = COALESCE($4, gateway_id), \
       platform_fee_cts = COALESCE($5, platform_fee_cts), failure_reason = COALESCE($6, failure_reason), \
       metadata = metadata || $7 \
       WHERE id = $1 AND status = ANY($8) RETURNING {TRANSACTION_COLUMNS}"
    ))
    .bind(id)
    .bind(to.as_str())
    .bind(at)
    .bind(changes.gateway_id)
    .bind(changes.platform_fee_cts)
    .bind(changes.failure_reason)
    .bind(Json(&changes.metadata))
    .bind(names(from))
    .fetch_optional(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    if row.is_none() {
      event!(Level::DEBUG, transaction_id = id, target = %to, "Transaction CAS lost.");
    }
    row.map(Transaction::try_from).transpose()
  }
}

#[async_trait]
impl AuditStore for PgStore {
  async fn record(&self, entry: AuditEntry) -> CoreResult<()> {
    sqlx::query("INSERT INTO audit_log (reservation_id, event_type, event_time, details) VALUES ($1, $2, $3, $4)")
      .bind(&entry.reservation_id)
      .bind(entry.event.as_str())
      .bind(entry.at)
      .bind(Json(&entry.details))
      .execute(&self.pool)
      .await
      .map_err(CoreError::storage)?;
    Ok(())
  }

  async fn for_reservation(&self, reservation_id: &str) -> CoreResult<Vec<AuditEntry>> {
    let rows = sqlx::query_as::<_, AuditRow>(
      "SELECT reservation_id, event_type, event_time, details FROM audit_log WHERE reservation_id = $1 ORDER BY id",
    )
    .bind(reservation_id)
    .fetch_all(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    rows
      .into_iter()
      .map(|row| {
        Ok(AuditEntry {
          reservation_id: row.reservation_id,
          event: row.event_type.parse()?,
          at: row.event_time,
          details: row.details.0,
        })
      })
      .collect()
  }
}

#[async_trait]
impl JobStore for PgStore {
  async fn schedule(
    &self,
    job_name: JobName,
    scheduled_at: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
  ) -> CoreResult<i64> {
    sqlx::query_scalar::<_, i64>(
      "INSERT INTO admin_job_queue (job_name, scheduled_at, status, attempts, metadata, updated_at) \
       VALUES ($1, $2, 'PENDING', 0, $3, $2) RETURNING id",
    )
    .bind(job_name.as_str())
    .bind(scheduled_at)
    .bind(Json(&metadata))
    .fetch_one(&self.pool)
    .await
    .map_err(CoreError::storage)
  }

  async fn find(&self, id: i64) -> CoreResult<Option<AdminJobSchedule>> {
    sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM admin_job_queue WHERE id = $1"))
      .bind(id)
      .fetch_optional(&self.pool)
      .await
      .map_err(CoreError::storage)?
      .map(AdminJobSchedule::try_from)
      .transpose()
  }

  async fn pending(&self, now: DateTime<Utc>, limit: usize) -> CoreResult<Vec<AdminJobSchedule>> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
      "SELECT {JOB_COLUMNS} FROM admin_job_queue WHERE status = 'PENDING' AND scheduled_at <= $1 \
       ORDER BY scheduled_at, id LIMIT $2"
    ))
    .bind(now)
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    rows.into_iter().map(AdminJobSchedule::try_from).collect()
  }

  async fn mark_executed(&self, id: i64, at: DateTime<Utc>) -> CoreResult<()> {
    let result = sqlx::query(
      "UPDATE admin_job_queue SET status = 'EXECUTED', attempts = attempts + 1, last_error = NULL, updated_at = $2 \
       WHERE id = $1",
    )
    .bind(id)
    .bind(at)
    .execute(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    job_found(id, result.rows_affected())
  }

  async fn reschedule(&self, id: i64, next_run: DateTime<Utc>, attempts: u32, error: &str) -> CoreResult<()> {
    let result = sqlx::query(
      "UPDATE admin_job_queue SET scheduled_at = $2, attempts = $3, last_error = $4 WHERE id = $1",
    )
    .bind(id)
    .bind(next_run)
    .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
    .bind(error)
    .execute(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    job_found(id, result.rows_affected())
  }

  async fn mark_failed(&self, id: i64, attempts: u32, error: &str, at: DateTime<Utc>) -> CoreResult<()> {
    let result = sqlx::query(
      "UPDATE admin_job_queue SET status = 'FAILED', attempts = $2, last_error = $3, updated_at = $4 WHERE id = $1",
    )
    .bind(id)
    .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
    .bind(error)
    .bind(at)
    .execute(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    job_found(id, result.rows_affected())
  }

  async fn cleanup(&self, executed_before: DateTime<Utc>, failed_before: DateTime<Utc>) -> CoreResult<u64> {
    let result = sqlx::query(
      "DELETE FROM admin_job_queue \
       WHERE (status = 'EXECUTED' AND updated_at < $1) OR (status = 'FAILED' AND updated_at < $2)",
    )
    .bind(executed_before)
    .bind(failed_before)
    .execute(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    Ok(result.rows_affected())
  }
}

fn job_found(id: i64, rows_affected: u64) -> CoreResult<()> {
  if rows_affected == 0 {
    return Err(CoreError::NotFound(format!("job {id}")));
  }
  Ok(())
}

#[async_trait]
impl PurchaseContextStore for PgStore {
  async fn find(&self, id: i64) -> CoreResult<Option<PurchaseContext>> {
    let row = sqlx::query_as::<_, PurchaseContextRow>("SELECT * FROM purchase_context WHERE id = $1")
      .bind(id)
      .fetch_optional(&self.pool)
      .await
      .map_err(CoreError::storage)?;
    let Some(row) = row else {
      return Ok(None);
    };
    Ok(Some(PurchaseContext {
      id: row.id,
      short_name: row.short_name,
      display_name: row.display_name,
      organization_id: row.organization_id,
      currency: Currency::new(row.currency),
      begins_at: row.begins_at,
      format: row.format.parse()?,
      vat_status: row.vat_status.parse()?,
      vat_percentage: row.vat_percentage,
    }))
  }
}

#[async_trait]
impl TicketInventory for PgStore {
  async fn count_unsold(&self, category_id: i64) -> CoreResult<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM ticket WHERE category_id = $1 AND status = 'FREE'")
      .bind(category_id)
      .fetch_one(&self.pool)
      .await
      .map_err(CoreError::storage)
  }

  #[instrument(skip(self))]
  async fn reserve_tickets(&self, reservation_id: &str, category_id: i64, quantity: usize) -> CoreResult<Vec<Ticket>> {
    let mut tx = self.pool.begin().await.map_err(CoreError::storage)?;
    let rows = sqlx::query_as::<_, TicketRow>(&format!(
      "UPDATE ticket SET status = 'PENDING', reservation_id = $1 \
       WHERE id IN (SELECT id FROM ticket WHERE category_id = $2 AND status = 'FREE' \
                    ORDER BY id LIMIT $3 FOR UPDATE SKIP LOCKED) \
       RETURNING {TICKET_COLUMNS}"
    ))
    .bind(reservation_id)
    .bind(category_id)
    .bind(i64::try_from(quantity).unwrap_or(i64::MAX))
    .fetch_all(&mut *tx)
    .await
    .map_err(CoreError::storage)?;
    if rows.len() < quantity {
      // Dropping `tx` rolls the partial reservation back.
      return Err(CoreError::validation("category", "error.tickets.sold_out"));
    }
    tx.commit().await.map_err(CoreError::storage)?;
    tickets(rows)
  }

  async fn release_tickets(&self, reservation_id: &str) -> CoreResult<u64> {
    let result = sqlx::query(
      "UPDATE ticket SET status = $2, reservation_id = NULL, owner_name = NULL, owner_email = NULL \
       WHERE reservation_id = $1 AND status = $3",
    )
    .bind(reservation_id)
    .bind(TicketStatus::Free.as_str())
    .bind(TicketStatus::Pending.as_str())
    .execute(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    Ok(result.rows_affected())
  }

  async fn confirm_tickets(&self, reservation_id: &str) -> CoreResult<Vec<Ticket>> {
    let rows = sqlx::query_as::<_, TicketRow>(&format!(
      "UPDATE ticket SET status = $2 WHERE reservation_id = $1 AND status = $3 RETURNING {TICKET_COLUMNS}"
    ))
    .bind(reservation_id)
    .bind(TicketStatus::Acquired.as_str())
    .bind(TicketStatus::Pending.as_str())
    .fetch_all(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    tickets(rows)
  }

  async fn tickets_for(&self, reservation_id: &str) -> CoreResult<Vec<Ticket>> {
    let rows = sqlx::query_as::<_, TicketRow>(&format!(
      "SELECT {TICKET_COLUMNS} FROM ticket WHERE reservation_id = $1 ORDER BY id"
    ))
    .bind(reservation_id)
    .fetch_all(&self.pool)
    .await
    .map_err(CoreError::storage)?;
    tickets(rows)
  }
}
