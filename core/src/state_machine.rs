// tessera/src/state_machine.rs

//! The only code that changes a reservation's status.

use crate::collaborators::OrderSummary;
use crate::error::{CoreError, CoreResult};
use crate::jobs::executors::RESERVATION_ID_KEY;
use crate::model::{
  AuditEntry, AuditEvent, JobName, PaymentProxy, ReservationStatus, TicketReservation, TransactionChanges,
  TransactionStatus,
};
use crate::services::PaymentServices;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{event, instrument, Level};

use ReservationStatus as S;

const WAITING_STATES: [ReservationStatus; 4] = [
  S::ExternalProcessingPayment,
  S::OfflinePayment,
  S::DeferredOfflinePayment,
  S::CustomOfflinePayment,
];

/// States from which a reservation may be cancelled and its tickets released.
pub const CANCELLABLE_FROM: [ReservationStatus; 6] = [
  S::Pending,
  S::Stuck,
  S::ExternalProcessingPayment,
  S::OfflinePayment,
  S::DeferredOfflinePayment,
  S::CustomOfflinePayment,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
  /// The customer abandoned the reservation.
  Customer,
  /// Validity ran out.
  Expired,
  Operator,
}

impl CancellationReason {
  fn as_str(&self) -> &'static str {
    match self {
      CancellationReason::Customer => "customer",
      CancellationReason::Expired => "expired",
      CancellationReason::Operator => "operator",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
  Completed { invoice_number: Option<String> },
  /// Another caller completed the reservation first; nothing was repeated.
  AlreadyComplete,
}

#[derive(Clone, Debug)]
pub struct ReservationStateMachine {
  services: PaymentServices,
}

impl ReservationStateMachine {
  pub fn new(services: PaymentServices) -> Self {
    ReservationStateMachine { services }
  }

  pub fn is_allowed(from: ReservationStatus, to: ReservationStatus) -> bool {
    match from {
      S::Pending => matches!(to, S::InPayment | S::Stuck | S::Cancelled) || WAITING_STATES.contains(&to),
      S::InPayment => matches!(to, S::Pending | S::Complete | S::Stuck) || WAITING_STATES.contains(&to),
      S::ExternalProcessingPayment | S::OfflinePayment | S::DeferredOfflinePayment | S::CustomOfflinePayment => {
        matches!(to, S::Complete | S::Cancelled | S::Pending | S::Stuck)
      }
      S::Stuck => matches!(to, S::Cancelled | S::Complete),
      S::Complete => to == S::CreditNoteIssued,
      S::Cancelled | S::CreditNoteIssued => false,
    }
  }

  /// Rejects reservations that can no longer take a payment attempt.
  pub fn check_payable(reservation: &TicketReservation, now: DateTime<Utc>) -> CoreResult<()> {
    match reservation.status {
      S::Pending | S::InPayment => {
        if reservation.is_expired_at(now) {
          Err(CoreError::validation("reservation", "ORDER_EXPIRED"))
        } else {
          Ok(())
        }
      }
      status => Err(CoreError::ReservationNotPayable {
        reservation_id: reservation.id.clone(),
        status,
      }),
    }
  }

  /// Compare-and-set transition restricted to the allowed table.
  #[instrument(name = "ReservationStateMachine::transition", skip(self), fields(reservation_id = %reservation_id))]
  pub async fn transition(
    &self,
    reservation_id: &str,
    from: &[ReservationStatus],
    to: ReservationStatus,
  ) -> CoreResult<bool> {
    let allowed: Vec<ReservationStatus> = from.iter().copied().filter(|f| Self::is_allowed(*f, to)).collect();
    if allowed.is_empty() {
      return Err(CoreError::IllegalTransition {
        reservation_id: reservation_id.to_string(),
        from: from.first().copied().unwrap_or(S::Pending),
        to,
      });
    }
    let now = self.services.clock.now();
    let moved = self.services.reservations.transition(reservation_id, &allowed, to, now).await?;
    if moved {
      event!(Level::INFO, target_status = %to, "Reservation status changed.");
    }
    Ok(moved)
  }

  /// Moves a reservation into the provider's waiting state and records the
  /// chosen proxy and, if given, the new validity.
  pub async fn enter_waiting_state(
    &self,
    reservation_id: &str,
    to: ReservationStatus,
    proxy: PaymentProxy,
    validity: Option<DateTime<Utc>>,
  ) -> CoreResult<()> {
    if !WAITING_STATES.contains(&to) {
      return Err(CoreError::Integrity(format!("{to} is not a waiting state")));
    }
    if !self.transition(reservation_id, &[S::Pending, S::InPayment], to).await? {
      return Err(self.lost_race(reservation_id, to).await);
    }
    self
      .services
      .reservations
      .update_payment_details(reservation_id, proxy, validity)
      .await
  }

  /// Returns a reservation to PENDING so the customer can retry.
  pub async fn back_to_pending(&self, reservation_id: &str, from: &[ReservationStatus]) -> CoreResult<bool> {
    self.transition(reservation_id, from, S::Pending).await
  }

  /// Parks a reservation for operator attention.
  #[instrument(name = "ReservationStateMachine::mark_stuck", skip(self))]
  pub async fn mark_stuck(&self, reservation_id: &str, reason: &str) -> CoreResult<bool> {
    let from = [S::Pending, S::InPayment, S::ExternalProcessingPayment];
    let moved = self.transition(reservation_id, &from, S::Stuck).await?;
    if moved {
      event!(Level::ERROR, reservation_id, reason, "Reservation marked STUCK.");
      let now = self.services.clock.now();
      self
        .services
        .audit(AuditEntry::new(reservation_id, AuditEvent::ReservationStuck, now).detail("reason", reason))
        .await?;
    }
    Ok(moved)
  }

  /// Completes a reservation whose payment transaction is COMPLETE.
  ///
  /// The status change happens first; only the caller that wins it confirms
  /// tickets, assigns the invoice number and sends mail.
  #[instrument(name = "ReservationStateMachine::complete", skip(self))]
  pub async fn complete(&self, reservation_id: &str) -> CoreResult<CompletionOutcome> {
    let transactions = self.services.transactions.find_for_reservation(reservation_id).await?;
    let paid = transactions.iter().filter(|t| t.status == TransactionStatus::Complete).count();
    if paid != 1 {
      event!(Level::ERROR, reservation_id, complete_transactions = paid, "Refusing to complete reservation.");
      return Err(CoreError::Integrity(format!(
        "reservation {reservation_id} has {paid} complete transactions"
      )));
    }

    let mut from = vec![S::InPayment, S::Stuck];
    from.extend(WAITING_STATES);
    if !self.transition(reservation_id, &from, S::Complete).await? {
      let current = self.services.load_reservation(reservation_id).await?;
      if current.status == S::Complete {
        event!(Level::DEBUG, reservation_id, "Reservation already complete.");
        return Ok(CompletionOutcome::AlreadyComplete);
      }
      return Err(CoreError::IllegalTransition {
        reservation_id: reservation_id.to_string(),
        from: current.status,
        to: S::Complete,
      });
    }

    let reservation = self.services.load_reservation(reservation_id).await?;
    let context = self.services.load_context(reservation.purchase_context_id).await?;
    let now = self.services.clock.now();

    let tickets = self.services.inventory.confirm_tickets(reservation_id).await?;
    let invoice_number = self.assign_invoice_number(&reservation, tickets.len()).await?;

    self
      .services
      .audit(AuditEntry::new(reservation_id, AuditEvent::ReservationComplete, now).detail("tickets", tickets.len()))
      .await?;

    let mut reservation = reservation;
    if invoice_number.is_some() {
      reservation.invoice_number = invoice_number.clone();
    }
    if let Err(e) = self.services.notifications.send_confirmation_email(&context, &reservation).await {
      event!(Level::WARN, reservation_id, error = %e, "Confirmation email failed; scheduling retry.");
      let mut metadata = BTreeMap::new();
      metadata.insert(RESERVATION_ID_KEY.to_string(), reservation_id.to_string());
      self
        .services
        .jobs
        .schedule(JobName::RetryConfirmationEmail, now, metadata)
        .await?;
    }
    for ticket in tickets.iter().filter(|t| t.is_assigned()) {
      if let Err(e) = self.services.notifications.send_ticket_by_email(&context, ticket).await {
        event!(Level::WARN, reservation_id, ticket = %ticket.uuid, error = %e, "Ticket email failed.");
      }
    }

    Ok(CompletionOutcome::Completed { invoice_number })
  }

  /// Generates the billing document once. A number already stored is never
  /// overwritten; a failing generator leaves the reservation complete without one.
  async fn assign_invoice_number(&self, reservation: &TicketReservation, ticket_count: usize) -> CoreResult<Option<String>> {
    if !reservation.invoice_requested || reservation.invoice_number.is_some() {
      return Ok(None);
    }
    let context = self.services.load_context(reservation.purchase_context_id).await?;
    let summary = OrderSummary {
      total: reservation.total_price(),
      description: format!("{} - {}", context.display_name, reservation.short_id()),
      ticket_count,
    };
    let document = match self
      .services
      .invoices
      .get_or_create_billing_document(&context, reservation, &summary)
      .await
    {
      Ok(document) => document,
      Err(e) => {
        event!(Level::ERROR, reservation_id = %reservation.id, error = %e, "Invoice generation failed.");
        return Ok(None);
      }
    };
    let written = self
      .services
      .reservations
      .set_invoice_number_if_absent(&reservation.id, &document.number)
      .await?;
    if !written {
      return Ok(None);
    }
    let now = self.services.clock.now();
    self
      .services
      .audit(AuditEntry::new(&reservation.id, AuditEvent::InvoiceAssigned, now).detail("invoice_number", &document.number))
      .await?;
    Ok(Some(document.number))
  }

  /// Cancels a reservation that has not been paid, cancels its active
  /// transaction and returns its tickets to the pool.
  #[instrument(name = "ReservationStateMachine::cancel_pending_reservation", skip(self))]
  pub async fn cancel_pending_reservation(&self, reservation_id: &str, reason: CancellationReason) -> CoreResult<bool> {
    let current = self.services.load_reservation(reservation_id).await?;
    if current.status == S::Cancelled {
      return Ok(false);
    }
    if !CANCELLABLE_FROM.contains(&current.status) {
      return Err(CoreError::IllegalTransition {
        reservation_id: reservation_id.to_string(),
        from: current.status,
        to: S::Cancelled,
      });
    }
    if !self.transition(reservation_id, &CANCELLABLE_FROM, S::Cancelled).await? {
      return Ok(false);
    }

    let now = self.services.clock.now();
    if let Some(active) = self.services.transactions.find_active_for_reservation(reservation_id).await? {
      self
        .services
        .transactions
        .transition(
          active.id,
          TransactionStatus::ACTIVE,
          TransactionStatus::Cancelled,
          TransactionChanges::failure(format!("reservation cancelled ({})", reason.as_str())),
          now,
        )
        .await?;
    }
    let released = self.services.inventory.release_tickets(reservation_id).await?;
    self
      .services
      .audit(
        AuditEntry::new(reservation_id, AuditEvent::ReservationCancelled, now)
          .detail("reason", reason.as_str())
          .detail("released_tickets", released),
      )
      .await?;
    event!(Level::INFO, reservation_id, released, reason = reason.as_str(), "Reservation cancelled.");
    Ok(true)
  }

  async fn lost_race(&self, reservation_id: &str, to: ReservationStatus) -> CoreError {
    match self.services.reservations.find(reservation_id).await {
      Ok(Some(current)) => CoreError::IllegalTransition {
        reservation_id: reservation_id.to_string(),
        from: current.status,
        to,
      },
      Ok(None) => CoreError::NotFound(format!("reservation {reservation_id}")),
      Err(e) => e,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn terminal_states_do_not_move() {
    for to in ReservationStatus::ALL {
      assert!(!ReservationStateMachine::is_allowed(S::Cancelled, *to));
    }
    assert!(ReservationStateMachine::is_allowed(S::Complete, S::CreditNoteIssued));
    assert!(!ReservationStateMachine::is_allowed(S::Complete, S::Pending));
  }

  #[test]
  fn pending_cannot_complete_without_payment() {
    assert!(!ReservationStateMachine::is_allowed(S::Pending, S::Complete));
    assert!(ReservationStateMachine::is_allowed(S::InPayment, S::Complete));
  }
}
