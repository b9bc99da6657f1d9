// server/src/state.rs
use crate::config::AppConfig;
use sqlx::PgPool;
use std::sync::Arc;
use tessera::PaymentSystem;

#[derive(Clone)]
pub struct AppState {
  pub db_pool: PgPool,
  pub system: PaymentSystem,
  pub config: Arc<AppConfig>,
}
