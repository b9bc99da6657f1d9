// tessera/src/jobs/executors.rs

use super::AdminJobExecutor;
use crate::error::{CoreError, CoreResult};
use crate::model::{AdminJobSchedule, JobName, ReservationStatus, TransactionStatus};
use crate::providers::revolut::RevolutStatementMatcher;
use crate::services::PaymentServices;
use crate::state_machine::{CancellationReason, ReservationStateMachine};
use crate::webhook::WebhookReconciler;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{event, Level};

/// Cancels PENDING reservations past their validity. Reservations still in
/// IN_PAYMENT or EXTERNAL_PROCESSING_PAYMENT may have been charged, so they
/// are parked as STUCK instead.
pub struct ExpirePendingReservationsExecutor {
  services: PaymentServices,
  state_machine: ReservationStateMachine,
}

impl ExpirePendingReservationsExecutor {
  pub fn new(services: PaymentServices) -> Self {
    let state_machine = ReservationStateMachine::new(services.clone());
    ExpirePendingReservationsExecutor { services, state_machine }
  }
}

#[async_trait]
impl AdminJobExecutor for ExpirePendingReservationsExecutor {
  fn job_name(&self) -> JobName {
    JobName::ExpirePendingReservations
  }

  async fn execute(&self, _job: &AdminJobSchedule) -> CoreResult<()> {
    let now = self.services.clock.now();
    let expired = self
      .services
      .reservations
      .find_expired(
        &[
          ReservationStatus::Pending,
          ReservationStatus::InPayment,
          ReservationStatus::ExternalProcessingPayment,
        ],
        now,
      )
      .await?;
    let (mut cancelled, mut stuck) = (0usize, 0usize);
    for reservation in expired {
      let pending = reservation.status == ReservationStatus::Pending;
      let outcome = if pending {
        self
          .state_machine
          .cancel_pending_reservation(&reservation.id, CancellationReason::Expired)
          .await
      } else {
        self
          .state_machine
          .mark_stuck(&reservation.id, "payment still in progress at expiry")
          .await
      };
      match outcome {
        Ok(true) if pending => cancelled += 1,
        Ok(true) => stuck += 1,
        Ok(false) => {}
        Err(e) => event!(Level::WARN, reservation_id = %reservation.id, error = %e, "Could not expire reservation."),
      }
    }
    if cancelled + stuck > 0 {
      event!(Level::INFO, cancelled, stuck, "Expired reservations processed.");
    }
    Ok(())
  }
}

/// Cancels bank-transfer reservations whose payment deadline passed without
/// any matching transfer.
pub struct ExpireOfflinePaymentsExecutor {
  services: PaymentServices,
  state_machine: ReservationStateMachine,
}

impl ExpireOfflinePaymentsExecutor {
  pub fn new(services: PaymentServices) -> Self {
    let state_machine = ReservationStateMachine::new(services.clone());
    ExpireOfflinePaymentsExecutor { services, state_machine }
  }
}

#[async_trait]
impl AdminJobExecutor for ExpireOfflinePaymentsExecutor {
  fn job_name(&self) -> JobName {
    JobName::ExpireOfflinePayments
  }

  async fn execute(&self, _job: &AdminJobSchedule) -> CoreResult<()> {
    let now = self.services.clock.now();
    let expired = self
      .services
      .reservations
      .find_expired(&[ReservationStatus::OfflinePayment], now)
      .await?;
    let mut cancelled = 0usize;
    for reservation in expired {
      let active = self.services.transactions.find_active_for_reservation(&reservation.id).await?;
      if active.map_or(false, |t| t.status != TransactionStatus::Pending) {
        // A transfer was found; an operator decides.
        continue;
      }
      match self
        .state_machine
        .cancel_pending_reservation(&reservation.id, CancellationReason::Expired)
        .await
      {
        Ok(done) => cancelled += usize::from(done),
        Err(e) => event!(Level::WARN, reservation_id = %reservation.id, error = %e, "Could not expire offline reservation."),
      }
    }
    if cancelled > 0 {
      event!(Level::INFO, cancelled, "Expired offline payments cancelled.");
    }
    Ok(())
  }
}

/// Polls bank statements and applies unique matches.
pub struct CheckOfflinePaymentsExecutor {
  matcher: RevolutStatementMatcher,
  reconciler: Arc<WebhookReconciler>,
}

impl CheckOfflinePaymentsExecutor {
  pub fn new(matcher: RevolutStatementMatcher, reconciler: Arc<WebhookReconciler>) -> Self {
    CheckOfflinePaymentsExecutor { matcher, reconciler }
  }
}

#[async_trait]
impl AdminJobExecutor for CheckOfflinePaymentsExecutor {
  fn job_name(&self) -> JobName {
    JobName::CheckOfflinePayments
  }

  async fn execute(&self, _job: &AdminJobSchedule) -> CoreResult<()> {
    let mut failures = Vec::new();
    for account in self.matcher.find_matches().await? {
      for bank_match in &account.report.matches {
        if let Err(e) = self.reconciler.apply_bank_match(bank_match, &account.settings).await {
          event!(Level::ERROR, reservation_id = %bank_match.reservation_id, error = %e, "Bank match not applied.");
          failures.push(bank_match.reservation_id.clone());
        }
      }
    }
    if failures.is_empty() {
      Ok(())
    } else {
      Err(CoreError::Reconciliation(format!(
        "bank matches not applied for {}",
        failures.join(", ")
      )))
    }
  }
}

pub const RESERVATION_ID_KEY: &str = "reservation_id";

/// Re-sends a confirmation email that failed right after completion.
pub struct RetryConfirmationEmailExecutor {
  services: PaymentServices,
}

impl RetryConfirmationEmailExecutor {
  pub fn new(services: PaymentServices) -> Self {
    RetryConfirmationEmailExecutor { services }
  }
}

#[async_trait]
impl AdminJobExecutor for RetryConfirmationEmailExecutor {
  fn job_name(&self) -> JobName {
    JobName::RetryConfirmationEmail
  }

  async fn execute(&self, job: &AdminJobSchedule) -> CoreResult<()> {
    let reservation_id = job
      .metadata
      .get(RESERVATION_ID_KEY)
      .ok_or_else(|| CoreError::validation(RESERVATION_ID_KEY, "missing"))?;
    let reservation = self.services.load_reservation(reservation_id).await?;
    if reservation.status != ReservationStatus::Complete {
      event!(Level::INFO, reservation_id = %reservation_id, status = %reservation.status, "Reservation no longer complete; email skipped.");
      return Ok(());
    }
    let context = self.services.load_context(reservation.purchase_context_id).await?;
    self
      .services
      .notifications
      .send_confirmation_email(&context, &reservation)
      .await
      .map_err(CoreError::from)?;
    event!(Level::INFO, reservation_id = %reservation_id, "Confirmation email re-sent.");
    Ok(())
  }
}
