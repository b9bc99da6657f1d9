// server/src/main.rs

mod config;
mod db;
mod errors;
mod services;
mod state;
mod web;

use crate::config::{AppConfig, LogFormat};
use crate::db::{PgConfiguration, PgStore};
use crate::services::{InvoiceSequence, LoggingNotifications};
use crate::state::AppState;

use actix_web::{web as actix_data, App, HttpServer};
use sqlx::postgres::PgPoolOptions;
use std::io;
use std::sync::Arc;
use tessera::{Clock, JobPolicy, PaymentServices, PaymentSystem, SystemClock};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_span_events(FmtSpan::CLOSE);
  match format {
    LogFormat::Json => builder.json().init(),
    LogFormat::Text => builder.init(),
  }
}

fn startup_error(what: &str, err: impl std::fmt::Display) -> io::Error {
  tracing::error!(error = %err, "{what} failed.");
  io::Error::other(format!("{what}: {err}"))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
  let app_config = match AppConfig::from_env() {
    Ok(cfg) => Arc::new(cfg),
    Err(e) => {
      init_tracing(LogFormat::Text);
      return Err(startup_error("Loading configuration", e));
    }
  };
  init_tracing(app_config.log_format);
  tracing::info!("Starting tessera server...");

  let db_pool = PgPoolOptions::new()
    .max_connections(10)
    .connect(&app_config.database_url)
    .await
    .map_err(|e| startup_error("Connecting to the database", e))?;
  db::migrate(&db_pool)
    .await
    .map_err(|e| startup_error("Running migrations", e))?;
  tracing::info!("Database ready.");

  let clock: Arc<dyn Clock> = Arc::new(SystemClock);
  let store = Arc::new(PgStore::new(db_pool.clone()));
  let services = PaymentServices {
    reservations: store.clone(),
    transactions: store.clone(),
    audit: store.clone(),
    jobs: store.clone(),
    purchase_contexts: store.clone(),
    configuration: Arc::new(PgConfiguration::new(db_pool.clone())),
    notifications: Arc::new(LoggingNotifications::new(db_pool.clone(), clock.clone())),
    invoices: Arc::new(InvoiceSequence::new(db_pool.clone(), clock.clone())),
    inventory: store,
    clock,
  };
  let system = PaymentSystem::with_gateway_timeout(services, JobPolicy::default(), app_config.gateway_timeout)
    .map_err(|e| startup_error("Building gateway clients", e))?;

  let settings = app_config.scheduler_settings();
  let jobs = system.clone();
  let app_state = AppState {
    db_pool,
    system,
    config: app_config.clone(),
  };

  let server_address = format!("{}:{}", app_config.server_host, app_config.server_port);
  tracing::info!(address = %server_address, base_url = %app_config.app_base_url, "Binding HTTP server.");

  let server = HttpServer::new(move || {
    App::new()
      .app_data(actix_data::Data::new(app_state.clone()))
      .wrap(tracing_actix_web::TracingLogger::default())
      .configure(web::configure_app_routes)
  })
  .bind(&server_address)?
  .run();

  let scheduler = jobs.scheduler(settings).start();
  let served = server.await;
  scheduler.stop().await;
  served
}
