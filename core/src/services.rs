// tessera/src/services.rs

use crate::clock::Clock;
use crate::collaborators::{InvoiceGenerator, NotificationManager, TicketInventory};
use crate::config::ConfigurationProvider;
use crate::error::{CoreError, CoreResult};
use crate::model::{AuditEntry, PurchaseContext, TicketReservation};
use crate::store::{AuditStore, JobStore, PurchaseContextStore, ReservationStore, TransactionStore};
use std::sync::Arc;
use tracing::{event, Level};

/// Handles to every store and collaborator a component may need.
///
/// Cloning is cheap; components keep their own copy.
#[derive(Clone)]
pub struct PaymentServices {
  pub reservations: Arc<dyn ReservationStore>,
  pub transactions: Arc<dyn TransactionStore>,
  pub audit: Arc<dyn AuditStore>,
  pub jobs: Arc<dyn JobStore>,
  pub purchase_contexts: Arc<dyn PurchaseContextStore>,
  pub configuration: Arc<dyn ConfigurationProvider>,
  pub notifications: Arc<dyn NotificationManager>,
  pub invoices: Arc<dyn InvoiceGenerator>,
  pub inventory: Arc<dyn TicketInventory>,
  pub clock: Arc<dyn Clock>,
}

impl PaymentServices {
  pub async fn load_reservation(&self, id: &str) -> CoreResult<TicketReservation> {
    self
      .reservations
      .find(id)
      .await?
      .ok_or_else(|| CoreError::NotFound(format!("reservation {id}")))
  }

  pub async fn load_context(&self, id: i64) -> CoreResult<Arc<PurchaseContext>> {
    self
      .purchase_contexts
      .find(id)
      .await?
      .map(Arc::new)
      .ok_or_else(|| CoreError::NotFound(format!("purchase context {id}")))
  }

  pub async fn audit(&self, entry: AuditEntry) -> CoreResult<()> {
    event!(Level::DEBUG, reservation_id = %entry.reservation_id, audit_event = %entry.event, "Audit entry.");
    self.audit.record(entry).await
  }
}

impl std::fmt::Debug for PaymentServices {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PaymentServices").finish_non_exhaustive()
  }
}
