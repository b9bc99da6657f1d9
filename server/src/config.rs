// server/src/config.rs

use crate::errors::{AppError, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use tessera::SchedulerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
  Text,
  Json,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
  pub server_host: String,
  pub server_port: u16,
  pub database_url: String,
  pub app_base_url: String,
  pub gateway_timeout: Duration,
  pub job_poll_interval: Duration,
  pub offline_payment_check_interval: Duration,
  pub log_format: LogFormat,
}

fn seconds(name: &str, raw: Option<String>, default: u64) -> Result<Duration> {
  match raw {
    None => Ok(Duration::from_secs(default)),
    Some(value) => value
      .trim()
      .parse::<u64>()
      .ok()
      .filter(|secs| *secs > 0)
      .map(Duration::from_secs)
      .ok_or_else(|| AppError::Config(format!("Invalid {name}: '{value}'"))),
  }
}

impl AppConfig {
  pub fn from_env() -> Result<Self> {
    dotenv().ok();
    Self::from_lookup(|name| env::var(name).ok())
  }

  /// Builds the configuration from any variable source.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let server_host = lookup("SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
    let server_port = lookup("SERVER_PORT")
      .unwrap_or_else(|| "8080".to_string())
      .parse::<u16>()
      .map_err(|e| AppError::Config(format!("Invalid SERVER_PORT: {}", e)))?;
    let database_url =
      lookup("DATABASE_URL").ok_or_else(|| AppError::Config("Missing environment variable 'DATABASE_URL'".to_string()))?;
    let app_base_url = lookup("APP_BASE_URL").unwrap_or_else(|| format!("http://{}:{}", server_host, server_port));

    let gateway_timeout = seconds("GATEWAY_TIMEOUT_SECS", lookup("GATEWAY_TIMEOUT_SECS"), 15)?;
    let job_poll_interval = seconds("JOB_POLL_INTERVAL_SECS", lookup("JOB_POLL_INTERVAL_SECS"), 5)?;
    let offline_payment_check_interval = seconds(
      "OFFLINE_PAYMENT_CHECK_INTERVAL_SECS",
      lookup("OFFLINE_PAYMENT_CHECK_INTERVAL_SECS"),
      30 * 60,
    )?;
    let log_format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
      None | Some("") | Some("text") => LogFormat::Text,
      Some("json") => LogFormat::Json,
      Some(other) => return Err(AppError::Config(format!("Invalid LOG_FORMAT: '{other}'"))),
    };

    Ok(Self {
      server_host,
      server_port,
      database_url,
      app_base_url,
      gateway_timeout,
      job_poll_interval,
      offline_payment_check_interval,
      log_format,
    })
  }

  pub fn scheduler_settings(&self) -> SchedulerSettings {
    SchedulerSettings {
      process_jobs: self.job_poll_interval,
      check_offline_payments: self.offline_payment_check_interval,
      ..SchedulerSettings::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn config(vars: &[(&str, &str)]) -> Result<AppConfig> {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    AppConfig::from_lookup(|name| vars.get(name).cloned())
  }

  #[test]
  fn defaults_apply_when_only_database_is_set() {
    let cfg = config(&[("DATABASE_URL", "postgres://localhost/tessera")]).unwrap();
    assert_eq!(cfg.server_port, 8080);
    assert_eq!(cfg.app_base_url, "http://127.0.0.1:8080");
    assert_eq!(cfg.gateway_timeout, Duration::from_secs(15));
    assert_eq!(cfg.log_format, LogFormat::Text);
    assert_eq!(cfg.scheduler_settings().process_jobs, Duration::from_secs(5));
  }

  #[test]
  fn intervals_and_format_are_read() {
    let cfg = config(&[
      ("DATABASE_URL", "postgres://localhost/tessera"),
      ("JOB_POLL_INTERVAL_SECS", "2"),
      ("OFFLINE_PAYMENT_CHECK_INTERVAL_SECS", "600"),
      ("LOG_FORMAT", "json"),
    ])
    .unwrap();
    let settings = cfg.scheduler_settings();
    assert_eq!(settings.process_jobs, Duration::from_secs(2));
    assert_eq!(settings.check_offline_payments, Duration::from_secs(600));
    assert_eq!(cfg.log_format, LogFormat::Json);
  }

  #[test]
  fn invalid_values_are_rejected() {
    assert!(matches!(config(&[]), Err(AppError::Config(_))));
    assert!(matches!(
      config(&[("DATABASE_URL", "postgres://x"), ("GATEWAY_TIMEOUT_SECS", "0")]),
      Err(AppError::Config(_))
    ));
    assert!(matches!(
      config(&[("DATABASE_URL", "postgres://x"), ("LOG_FORMAT", "xml")]),
      Err(AppError::Config(_))
    ));
  }
}
