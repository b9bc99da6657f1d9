// server/src/web/handlers/mod.rs

pub mod admin_handlers;
pub mod reservation_handlers;
pub mod webhook_handlers;

use crate::errors::AppError;

/// Reservation ids are UUIDs; anything else is rejected before touching the store.
pub(crate) fn reservation_id(raw: String) -> Result<String, AppError> {
  uuid::Uuid::parse_str(&raw)
    .map(|id| id.to_string())
    .map_err(|_| AppError::Validation(format!("'{raw}' is not a reservation id")))
}

#[cfg(test)]
mod tests {
  use super::reservation_id;

  #[test]
  fn reservation_ids_are_normalised_uuids() {
    assert_eq!(
      reservation_id("A1B2C3D4-0000-4000-8000-000000000001".to_string()).unwrap(),
      "a1b2c3d4-0000-4000-8000-000000000001"
    );
    assert!(reservation_id("../etc/passwd".to_string()).is_err());
  }
}
