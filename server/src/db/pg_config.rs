// server/src/db/pg_config.rs

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use tessera::config::resolve_hierarchically;
use tessera::{ConfigKey, ConfigLevel, ConfigScope, ConfigValues, ConfigurationProvider, CoreError, CoreResult};
use tracing::{event, Level};

/// Reads the `configuration` table. Every `get_for` is one query covering all
/// requested keys at every scope of the level.
#[derive(Clone)]
pub struct PgConfiguration {
  pool: PgPool,
}

impl PgConfiguration {
  pub fn new(pool: PgPool) -> Self {
    PgConfiguration { pool }
  }
}

#[derive(FromRow)]
struct ConfigRow {
  scope: String,
  scope_id: i64,
  c_key: String,
  c_value: String,
}

fn scope_of(scope: &str, scope_id: i64) -> Option<ConfigScope> {
  match scope {
    "SYSTEM" => Some(ConfigScope::System),
    "ORGANIZATION" => Some(ConfigScope::Organization(scope_id)),
    "EVENT" => Some(ConfigScope::Event(scope_id)),
    "CATEGORY" => Some(ConfigScope::Category(scope_id)),
    _ => None,
  }
}

fn scope_columns(scope: ConfigScope) -> (String, i64) {
  let (name, id) = match scope {
    ConfigScope::System => ("SYSTEM", 0),
    ConfigScope::Organization(id) => ("ORGANIZATION", id),
    ConfigScope::Event(id) => ("EVENT", id),
    ConfigScope::Category(id) => ("CATEGORY", id),
  };
  (name.to_string(), id)
}

#[async_trait]
impl ConfigurationProvider for PgConfiguration {
  async fn get_for(&self, keys: &[ConfigKey], level: &ConfigLevel) -> CoreResult<ConfigValues> {
    let (scopes, scope_ids): (Vec<String>, Vec<i64>) = level.scopes().into_iter().map(scope_columns).unzip();
    let key_names: Vec<String> = keys.iter().map(|k| k.name().to_string()).collect();

    let rows = sqlx::query_as::<_, ConfigRow>(
      "SELECT c.scope, c.scope_id, c.c_key, c.c_value FROM configuration c \
       JOIN UNNEST($1::text[], $2::bigint[]) AS s(scope, scope_id) \
         ON s.scope = c.scope AND s.scope_id = c.scope_id \
       WHERE c.c_key = ANY($3)",
    )
    .bind(scopes)
    .bind(scope_ids)
    .bind(key_names)
    .fetch_all(&self.pool)
    .await
    .map_err(CoreError::storage)?;

    let mut stored = HashMap::with_capacity(rows.len());
    for row in rows {
      match (scope_of(&row.scope, row.scope_id), ConfigKey::from_name(&row.c_key)) {
        (Some(scope), Some(key)) => {
          stored.insert((scope, key), row.c_value);
        }
        _ => event!(Level::WARN, scope = %row.scope, key = %row.c_key, "Ignoring unknown configuration row."),
      }
    }
    Ok(resolve_hierarchically(keys, level, |scope, key| stored.get(&(scope, key)).cloned()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scope_columns_round_trip() {
    for scope in [
      ConfigScope::System,
      ConfigScope::Organization(3),
      ConfigScope::Event(42),
      ConfigScope::Category(7),
    ] {
      let (name, id) = scope_columns(scope);
      assert_eq!(scope_of(&name, id), Some(scope));
    }
    assert_eq!(scope_of("TENANT", 1), None);
  }
}
