// tests/jobs_tests.rs
mod common;

use async_trait::async_trait;
use chrono::Duration;
use common::*;
use serial_test::serial;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tessera::model::{
  AdminJobSchedule, AuditEvent, JobName, JobStatus, PaymentMethod, PaymentToken, ReservationStatus, TransactionStatus,
};
use tessera::providers::stripe::StripeError;
use tessera::store::JobStore;
use tessera::{AdminJobExecutor, AdminJobManager, ConfigKey, CoreError, CoreResult, JobPolicy, PaymentRequest};

const RES: &str = "5eed5eed-0000-4000-8000-000000000007";

async fn pay(h: &Harness, method: PaymentMethod) -> CoreResult<tessera::model::PaymentResult> {
  let token = (method == PaymentMethod::CreditCard).then(|| PaymentToken::StripeCard {
    token: "tok_visa".to_string(),
  });
  h.system
    .orchestrator
    .perform_payment(PaymentRequest {
      reservation_id: RES.to_string(),
      method,
      token,
      selected_offline_method: None,
    })
    .await
}

async fn run_job(h: &Harness, name: JobName) -> i64 {
  let id = h.system.jobs.schedule(name, BTreeMap::new()).await.unwrap();
  h.system.jobs.process_pending_jobs().await.unwrap();
  id
}

async fn job(h: &Harness, id: i64) -> AdminJobSchedule {
  JobStore::find(h.store.as_ref(), id).await.unwrap().unwrap()
}

fn enable_revolut(h: &Harness, manual_review: bool) {
  h.event_config(ConfigKey::RevolutEnabled, "true");
  h.event_config(ConfigKey::RevolutApiKey, "rev_key");
  h.event_config(ConfigKey::RevolutManualReview, if manual_review { "true" } else { "false" });
}

#[tokio::test]
#[serial]
async fn test_expired_pending_reservation_is_cancelled() {
  setup_tracing();
  let h = Harness::new();
  h.pending_reservation(RES, 5_000, 1).await;

  run_job(&h, JobName::ExpirePendingReservations).await;
  assert_eq!(h.status(RES).await, ReservationStatus::Pending);

  h.clock.advance(Duration::minutes(26));
  let id = run_job(&h, JobName::ExpirePendingReservations).await;
  assert_eq!(h.status(RES).await, ReservationStatus::Cancelled);
  assert!(h.audit_events(RES).await.contains(&AuditEvent::ReservationCancelled));
  assert_eq!(job(&h, id).await.status, JobStatus::Executed);
}

#[tokio::test]
#[serial]
async fn test_expired_reservation_with_open_attempt_becomes_stuck() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 5_000, 1).await;
  *h.stripe.next_charge_error.lock() = Some(StripeError::Timeout);
  assert!(matches!(pay(&h, PaymentMethod::CreditCard).await, Err(CoreError::GatewayTimeout(_))));

  h.clock.advance(Duration::minutes(26));
  run_job(&h, JobName::ExpirePendingReservations).await;
  assert_eq!(h.status(RES).await, ReservationStatus::Stuck);
  assert!(h.audit_events(RES).await.contains(&AuditEvent::ReservationStuck));
}

#[tokio::test]
#[serial]
async fn test_unpaid_bank_transfer_expires_after_deadline() {
  setup_tracing();
  let h = Harness::new();
  h.enable_bank_transfer();
  h.pending_reservation(RES, 5_000, 1).await;
  pay(&h, PaymentMethod::BankTransfer).await.unwrap();

  h.clock.advance(Duration::days(4));
  run_job(&h, JobName::ExpireOfflinePayments).await;
  assert_eq!(h.status(RES).await, ReservationStatus::OfflinePayment);

  h.clock.advance(Duration::days(2));
  run_job(&h, JobName::ExpireOfflinePayments).await;
  assert_eq!(h.status(RES).await, ReservationStatus::Cancelled);
}

#[tokio::test]
#[serial]
async fn test_exact_bank_transfer_is_confirmed_without_review() {
  setup_tracing();
  let h = Harness::new();
  h.enable_bank_transfer();
  enable_revolut(&h, false);
  h.pending_reservation(RES, 5_000, 1).await;
  pay(&h, PaymentMethod::BankTransfer).await.unwrap();
  let short_id = h.reservation(RES).await.short_id();
  h.revolut.add_transfer("rt-1", &format!("Tickets {short_id}"), 5_000, "CHF");

  run_job(&h, JobName::CheckOfflinePayments).await;

  assert_eq!(h.status(RES).await, ReservationStatus::Complete);
  let tx = &h.transactions(RES).await[0];
  assert_eq!(tx.status, TransactionStatus::Complete);
  assert_eq!(tx.metadata.get("statement_id").map(String::as_str), Some("rt-1"));
  assert!(h.audit_events(RES).await.contains(&AuditEvent::MatchingPaymentFound));
  assert_eq!(h.notifications.count("confirmation:"), 1);

  // The same statement on the next pass finds nothing left to match.
  run_job(&h, JobName::CheckOfflinePayments).await;
  assert_eq!(h.notifications.count("confirmation:"), 1);
}

#[tokio::test]
#[serial]
async fn test_bank_transfer_waits_for_operator_under_manual_review() {
  setup_tracing();
  let h = Harness::new();
  h.enable_bank_transfer();
  enable_revolut(&h, true);
  h.pending_reservation(RES, 5_000, 1).await;
  pay(&h, PaymentMethod::BankTransfer).await.unwrap();
  let short_id = h.reservation(RES).await.short_id();
  h.revolut.add_transfer("rt-2", &short_id.to_lowercase(), 5_000, "CHF");

  run_job(&h, JobName::CheckOfflinePayments).await;
  assert_eq!(h.status(RES).await, ReservationStatus::OfflinePayment);
  assert_eq!(
    h.transactions(RES).await[0].status,
    TransactionStatus::OfflineMatchingPaymentFound
  );

  // A found transfer protects the reservation from offline expiry.
  h.clock.advance(Duration::days(6));
  run_job(&h, JobName::ExpireOfflinePayments).await;
  assert_eq!(h.status(RES).await, ReservationStatus::OfflinePayment);

  h.system.orchestrator.confirm_offline_payment(RES, "ops").await.unwrap();
  assert_eq!(h.status(RES).await, ReservationStatus::Complete);
}

#[tokio::test]
#[serial]
async fn test_transfer_with_wrong_amount_is_left_alone() {
  setup_tracing();
  let h = Harness::new();
  h.enable_bank_transfer();
  enable_revolut(&h, false);
  h.pending_reservation(RES, 5_000, 1).await;
  pay(&h, PaymentMethod::BankTransfer).await.unwrap();
  let short_id = h.reservation(RES).await.short_id();
  h.revolut.add_transfer("rt-3", &short_id, 4_000, "CHF");
  h.revolut.add_transfer("rt-4", &short_id, 5_000, "EUR");

  run_job(&h, JobName::CheckOfflinePayments).await;
  assert_eq!(h.status(RES).await, ReservationStatus::OfflinePayment);
  assert_eq!(h.transactions(RES).await[0].status, TransactionStatus::Pending);
}

#[tokio::test]
#[serial]
async fn test_failed_confirmation_email_is_retried() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 5_000, 1).await;
  h.notifications.fail_confirmation.store(true, Ordering::SeqCst);

  assert!(pay(&h, PaymentMethod::CreditCard).await.unwrap().is_paid());
  assert_eq!(h.status(RES).await, ReservationStatus::Complete);
  assert_eq!(h.notifications.count("confirmation:"), 0);

  let summary = h.system.jobs.process_pending_jobs().await.unwrap();
  assert_eq!(summary.rescheduled, 1);

  h.notifications.fail_confirmation.store(false, Ordering::SeqCst);
  h.clock.advance(Duration::minutes(1));
  let summary = h.system.jobs.process_pending_jobs().await.unwrap();
  assert_eq!(summary.executed, 1);
  assert_eq!(h.notifications.count("confirmation:"), 1);
}

struct AlwaysFailing {
  calls: AtomicUsize,
}

#[async_trait]
impl AdminJobExecutor for AlwaysFailing {
  fn job_name(&self) -> JobName {
    JobName::CheckOfflinePayments
  }

  async fn execute(&self, _job: &AdminJobSchedule) -> CoreResult<()> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    Err(CoreError::Reconciliation("bank unavailable".to_string()))
  }
}

#[tokio::test]
#[serial]
async fn test_failing_job_backs_off_then_gives_up() {
  setup_tracing();
  let h = Harness::new();
  let executor = Arc::new(AlwaysFailing {
    calls: AtomicUsize::new(0),
  });
  let policy = JobPolicy {
    max_attempts: 3,
    ..JobPolicy::default()
  };
  let manager = AdminJobManager::new(h.system.services.clone(), vec![executor.clone() as Arc<dyn AdminJobExecutor>], policy);
  let id = manager.schedule(JobName::CheckOfflinePayments, BTreeMap::new()).await.unwrap();

  assert_eq!(manager.process_pending_jobs().await.unwrap().rescheduled, 1);
  let first = job(&h, id).await;
  assert_eq!(first.attempts, 1);
  assert_eq!(first.scheduled_at, start_time() + Duration::minutes(1));
  assert_eq!(first.last_error.as_deref(), Some("Reconciliation error: bank unavailable"));

  // Not due yet.
  assert_eq!(manager.process_pending_jobs().await.unwrap(), Default::default());

  h.clock.advance(Duration::minutes(1));
  manager.process_pending_jobs().await.unwrap();
  assert_eq!(job(&h, id).await.scheduled_at, start_time() + Duration::minutes(3));

  h.clock.advance(Duration::minutes(2));
  assert_eq!(manager.process_pending_jobs().await.unwrap().failed, 1);
  let parked = job(&h, id).await;
  assert_eq!(parked.status, JobStatus::Failed);
  assert_eq!(parked.attempts, 3);
  assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

  h.clock.advance(Duration::weeks(1) + Duration::seconds(1));
  assert_eq!(manager.cleanup().await.unwrap(), 1);
  assert!(JobStore::find(h.store.as_ref(), id).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn test_job_without_executor_fails_immediately() {
  setup_tracing();
  let h = Harness::new();
  let manager = AdminJobManager::new(h.system.services.clone(), Vec::new(), JobPolicy::default());
  let id = manager.schedule(JobName::ExpireOfflinePayments, BTreeMap::new()).await.unwrap();

  assert_eq!(manager.process_pending_jobs().await.unwrap().failed, 1);
  let failed = job(&h, id).await;
  assert_eq!(failed.status, JobStatus::Failed);
  assert_eq!(failed.last_error.as_deref(), Some("no executor registered"));
}
