// tessera/src/model/mod.rs

//! Data structures shared by every component: reservations, tickets,
//! transactions, purchase contexts, scheduled jobs and audit rows.

/// Generates `as_str`, `Display` and `FromStr` for the status enums that are
/// persisted as upper-case strings.
macro_rules! string_enum {
  ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
    impl $name {
      pub const ALL: &'static [$name] = &[$($name::$variant),+];

      pub fn as_str(&self) -> &'static str {
        match self {
          $($name::$variant => $text),+
        }
      }
    }

    impl std::fmt::Display for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
      }
    }

    impl std::str::FromStr for $name {
      type Err = crate::error::CoreError;

      fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
          $($text => Ok($name::$variant),)+
          other => Err(crate::error::CoreError::Internal(format!(
            "unknown {} value '{}'",
            stringify!($name),
            other
          ))),
        }
      }
    }
  };
}

pub mod audit;
pub mod job;
pub mod money;
pub mod payment;
pub mod purchase_context;
pub mod reservation;
pub mod ticket;
pub mod transaction;

pub use audit::{AuditEntry, AuditEvent};
pub use job::{AdminJobSchedule, JobName, JobStatus};
pub use money::{minor_unit_digits, Currency};
pub use payment::{
  PaymentMethod, PaymentProxy, PaymentResult, PaymentSpecification, PaymentToken, TransactionRequest,
  NOT_YET_PAID_TRANSACTION_ID,
};
pub use purchase_context::{EventFormat, PurchaseContext};
pub use reservation::{BillingDetails, ReservationStatus, TicketReservation, TotalPrice, VatStatus};
pub use ticket::{Ticket, TicketStatus};
pub use transaction::{NewTransaction, Transaction, TransactionChanges, TransactionStatus};
