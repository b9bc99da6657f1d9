// tessera/src/providers/bank_transfer.rs

//! Bank transfer and deferred bank transfer. Nothing is charged: the
//! reservation waits for the money and a transaction stays PENDING until an
//! operator or the statement matcher confirms it.

use super::{ConfigSnapshot, PaymentContext, PaymentProvider, ProviderId};
use crate::config::{ConfigKey, ConfigLevel};
use crate::error::{CoreError, CoreResult};
use crate::model::{
  AuditEntry, AuditEvent, PaymentMethod, PaymentProxy, PaymentResult, PaymentSpecification, ReservationStatus,
  Transaction, TransactionChanges, TransactionRequest, TransactionStatus, NOT_YET_PAID_TRANSACTION_ID,
};
use crate::services::PaymentServices;
use crate::state_machine::ReservationStateMachine;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{event, instrument, Level};

pub const DEFERRED_DISABLED_ERROR: &str = "error.STEP2_DEFERRED_BANK_TRANSFER_DISABLED";

/// Puts a reservation into an offline waiting state. Shared by every provider
/// that settles out of band.
pub(crate) async fn start_offline_payment(
  services: &PaymentServices,
  state_machine: &ReservationStateMachine,
  spec: &PaymentSpecification,
  attempt: &Transaction,
  status: ReservationStatus,
  proxy: PaymentProxy,
  validity: Option<DateTime<Utc>>,
) -> CoreResult<PaymentResult> {
  let now = services.clock.now();
  services
    .transactions
    .transition(
      attempt.id,
      &[TransactionStatus::Pending],
      TransactionStatus::Pending,
      TransactionChanges::gateway_id(NOT_YET_PAID_TRANSACTION_ID),
      now,
    )
    .await?
    .ok_or_else(|| CoreError::Integrity(format!("transaction {} is no longer pending", attempt.id)))?;

  state_machine
    .enter_waiting_state(&spec.reservation_id, status, proxy, validity)
    .await?;

  let mut entry = AuditEntry::new(&spec.reservation_id, AuditEvent::OfflinePaymentRequested, now)
    .detail("status", status)
    .detail("transaction_id", attempt.id);
  if let Some(validity) = validity {
    entry = entry.detail("validity", validity.to_rfc3339());
  }
  services.audit(entry).await?;
  event!(Level::INFO, reservation_id = %spec.reservation_id, target_status = %status, "Awaiting offline payment.");
  Ok(PaymentResult::successful(NOT_YET_PAID_TRANSACTION_ID))
}

fn level(spec: &PaymentSpecification) -> ConfigLevel {
  ConfigLevel::event(spec.purchase_context.organization_id, spec.purchase_context.id)
}

/// Payment deadline: `days` from now, but never after the event starts.
pub fn offline_payment_deadline(now: DateTime<Utc>, days: i64, event_begin: DateTime<Utc>) -> DateTime<Utc> {
  (now + Duration::days(days.max(0))).min(event_begin)
}

pub struct BankTransferProvider {
  services: PaymentServices,
  state_machine: ReservationStateMachine,
}

impl BankTransferProvider {
  pub fn new(services: PaymentServices) -> Self {
    let state_machine = ReservationStateMachine::new(services.clone());
    BankTransferProvider { services, state_machine }
  }
}

#[async_trait]
impl PaymentProvider for BankTransferProvider {
  fn id(&self) -> ProviderId {
    ProviderId::BankTransfer
  }

  fn proxy(&self) -> PaymentProxy {
    PaymentProxy::Offline
  }

  fn payment_methods(&self) -> &'static [PaymentMethod] {
    &[PaymentMethod::BankTransfer]
  }

  fn config_keys(&self) -> &'static [ConfigKey] {
    &[ConfigKey::BankTransferEnabled]
  }

  fn accept(
    &self,
    method: PaymentMethod,
    context: &PaymentContext,
    request: &TransactionRequest,
    config: &ConfigSnapshot,
  ) -> bool {
    self.handles(method)
      && request.amount_cts() > 0
      && context.purchase_context.begins_at > context.now
      && config.event.bool(ConfigKey::BankTransferEnabled)
  }

  #[instrument(name = "BankTransferProvider::do_payment", skip_all, fields(reservation_id = %spec.reservation_id))]
  async fn do_payment(&self, spec: &PaymentSpecification, attempt: &Transaction) -> CoreResult<PaymentResult> {
    let values = self
      .services
      .configuration
      .get_for(&[ConfigKey::OfflinePaymentDays], &level(spec))
      .await?;
    let days = values.i64(ConfigKey::OfflinePaymentDays)?;
    let now = self.services.clock.now();
    let validity = offline_payment_deadline(now, days, spec.purchase_context.begins_at);
    start_offline_payment(
      &self.services,
      &self.state_machine,
      spec,
      attempt,
      ReservationStatus::OfflinePayment,
      PaymentProxy::Offline,
      Some(validity),
    )
    .await
  }
}

/// Bank transfer with payment due only when the event starts. Requires both
/// the bank transfer method and the deferred flag.
pub struct DeferredBankTransferProvider {
  services: PaymentServices,
  state_machine: ReservationStateMachine,
}

impl DeferredBankTransferProvider {
  pub fn new(services: PaymentServices) -> Self {
    let state_machine = ReservationStateMachine::new(services.clone());
    DeferredBankTransferProvider { services, state_machine }
  }
}

#[async_trait]
impl PaymentProvider for DeferredBankTransferProvider {
  fn id(&self) -> ProviderId {
    ProviderId::DeferredBankTransfer
  }

  fn proxy(&self) -> PaymentProxy {
    PaymentProxy::Offline
  }

  fn payment_methods(&self) -> &'static [PaymentMethod] {
    &[PaymentMethod::BankTransfer]
  }

  fn config_keys(&self) -> &'static [ConfigKey] {
    &[ConfigKey::BankTransferEnabled, ConfigKey::DeferredBankTransferEnabled]
  }

  fn accept(
    &self,
    method: PaymentMethod,
    context: &PaymentContext,
    request: &TransactionRequest,
    config: &ConfigSnapshot,
  ) -> bool {
    self.handles(method)
      && request.amount_cts() > 0
      && context.purchase_context.begins_at > context.now
      && config.event.bool(ConfigKey::BankTransferEnabled)
      && config.event.bool(ConfigKey::DeferredBankTransferEnabled)
  }

  #[instrument(name = "DeferredBankTransferProvider::do_payment", skip_all, fields(reservation_id = %spec.reservation_id))]
  async fn do_payment(&self, spec: &PaymentSpecification, attempt: &Transaction) -> CoreResult<PaymentResult> {
    // The flag may have been switched off since the method list was shown.
    let values = self
      .services
      .configuration
      .get_for(&[ConfigKey::DeferredBankTransferEnabled], &level(spec))
      .await?;
    if !values.bool(ConfigKey::DeferredBankTransferEnabled) {
      event!(Level::WARN, "Deferred bank transfer disabled since selection.");
      return Ok(PaymentResult::failed(DEFERRED_DISABLED_ERROR));
    }
    start_offline_payment(
      &self.services,
      &self.state_machine,
      spec,
      attempt,
      ReservationStatus::DeferredOfflinePayment,
      PaymentProxy::Offline,
      Some(spec.purchase_context.begins_at),
    )
    .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deadline_never_exceeds_event_begin() {
    let now = Utc::now();
    assert_eq!(offline_payment_deadline(now, 5, now + Duration::days(30)), now + Duration::days(5));
    assert_eq!(offline_payment_deadline(now, 5, now + Duration::days(2)), now + Duration::days(2));
  }
}
