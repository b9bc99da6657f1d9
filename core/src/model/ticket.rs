// tessera/src/model/ticket.rs

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
  Free,
  Pending,
  Acquired,
  CheckedIn,
  Released,
  Cancelled,
}

string_enum!(TicketStatus {
  Free => "FREE",
  Pending => "PENDING",
  Acquired => "ACQUIRED",
  CheckedIn => "CHECKED_IN",
  Released => "RELEASED",
  Cancelled => "CANCELLED",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
  pub id: i64,
  pub uuid: String,
  pub category_id: i64,
  pub purchase_context_id: i64,
  pub reservation_id: Option<String>,
  pub status: TicketStatus,
  pub src_price_cts: i64,
  pub owner_name: Option<String>,
  pub owner_email: Option<String>,
}

impl Ticket {
  pub fn is_assigned(&self) -> bool {
    self.owner_email.as_deref().map_or(false, |e| !e.is_empty())
  }
}
