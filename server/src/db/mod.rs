// server/src/db/mod.rs

pub mod pg_config;
pub mod pg_store;

pub use pg_config::PgConfiguration;
pub use pg_store::PgStore;

use sqlx::PgPool;

/// Applies the SQL files under `migrations/`.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
  sqlx::migrate!("./migrations").run(pool).await
}
