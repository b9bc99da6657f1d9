// server/src/web/routes.rs

use actix_web::{web, HttpResponse};
use serde_json::json;

use super::handlers::{admin_handlers, reservation_handlers, webhook_handlers};
use crate::state::AppState;

/// Liveness plus a database round trip.
async fn health_check_handler(app_state: web::Data<AppState>) -> HttpResponse {
  match sqlx::query("SELECT 1").execute(&app_state.db_pool).await {
    Ok(_) => HttpResponse::Ok().json(json!({ "status": "ok", "baseUrl": app_state.config.app_base_url })),
    Err(e) => {
      tracing::warn!(error = %e, "Health check could not reach the database.");
      HttpResponse::ServiceUnavailable().json(json!({ "status": "degraded" }))
    }
  }
}

pub fn configure_app_routes(cfg: &mut web::ServiceConfig) {
  cfg.service(
    web::scope("/api/v1")
      .route("/health", web::get().to(health_check_handler))
      .service(
        web::scope("/reservations/{id}")
          .route("", web::delete().to(reservation_handlers::cancel_reservation_handler))
          .route(
            "/payment-methods",
            web::get().to(reservation_handlers::payment_methods_handler),
          )
          .route("/payment", web::get().to(reservation_handlers::payment_summary_handler))
          .route("/payment", web::post().to(reservation_handlers::perform_payment_handler))
          .route(
            "/payment/confirm",
            web::post().to(reservation_handlers::confirm_payment_handler),
          )
          .route("/payment/reset", web::post().to(reservation_handlers::reset_payment_handler)),
      )
      .service(web::scope("/webhooks").route("/{provider}", web::post().to(webhook_handlers::webhook_handler)))
      .service(
        web::scope("/admin")
          .route(
            "/reservations/{id}/confirm-offline",
            web::post().to(admin_handlers::confirm_offline_handler),
          )
          .route("/reservations/{id}/refund", web::post().to(admin_handlers::refund_handler))
          .route("/jobs", web::post().to(admin_handlers::schedule_job_handler)),
      ),
  );
}
