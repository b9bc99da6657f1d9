// tests/webhook_tests.rs
mod common;

use common::*;
use serial_test::serial;
use tessera::model::{AuditEvent, PaymentMethod, PaymentProxy, PaymentResult, ReservationStatus, TransactionStatus};
use tessera::providers::stripe::sign_payload;
use tessera::providers::WebhookRequest;
use tessera::{CoreError, PaymentRequest, WebhookResult};

const RES: &str = "c0ffee00-0000-4000-8000-000000000042";

impl Harness {
  fn signed(&self, payload: String) -> WebhookRequest {
    let signature = sign_payload(&payload, WEBHOOK_SECRET, self.clock_now().timestamp());
    WebhookRequest {
      payload,
      signature: Some(signature),
    }
  }

  async fn start_checkout(&self) -> String {
    self.enable_stripe_checkout();
    self.pending_reservation(RES, 12_500, 1).await;
    let result = self
      .system
      .orchestrator
      .perform_payment(PaymentRequest {
        reservation_id: RES.to_string(),
        method: PaymentMethod::CreditCard,
        token: None,
        selected_offline_method: None,
      })
      .await
      .unwrap();
    assert_eq!(result, PaymentResult::redirect("https://checkout.stripe.test/cs_test_1"));
    assert_eq!(self.status(RES).await, ReservationStatus::ExternalProcessingPayment);
    "cs_test_1".to_string()
  }

  async fn deliver(&self, payload: String) -> tessera::CoreResult<WebhookResult> {
    self
      .system
      .reconciler
      .process_webhook(PaymentProxy::Stripe, self.signed(payload))
      .await
  }
}

#[tokio::test]
#[serial]
async fn test_completed_checkout_webhook_confirms_reservation() {
  setup_tracing();
  let h = Harness::new();
  let session = h.start_checkout().await;

  let result = h
    .deliver(checkout_completed_payload("evt_1", &session, RES, false))
    .await
    .unwrap();
  assert_eq!(result, WebhookResult::Successful);
  assert_eq!(h.status(RES).await, ReservationStatus::Complete);
  let tx = &h.transactions(RES).await[0];
  assert_eq!(tx.status, TransactionStatus::Complete);
  assert_eq!(tx.metadata.get("charge_id").map(String::as_str), Some("pi_test_1"));
  assert_eq!(h.notifications.count("confirmation:"), 1);
}

#[tokio::test]
#[serial]
async fn test_refund_after_webhook_uses_payment_intent() {
  setup_tracing();
  let h = Harness::new();
  let session = h.start_checkout().await;
  h.deliver(checkout_completed_payload("evt_1", &session, RES, false))
    .await
    .unwrap();

  let tx = &h.transactions(RES).await[0];
  assert_eq!(tx.gateway_id.as_deref(), Some("pi_test_1"));
  assert_eq!(tx.metadata.get("attempt_reference").map(String::as_str), Some("cs_test_1"));
  assert_eq!(tx.metadata.get("checkout_session_id").map(String::as_str), Some("cs_test_1"));

  h.system.orchestrator.refund(RES, None, "admin").await.unwrap();
  assert_eq!(*h.stripe.refunds.lock(), vec![("pi_test_1".to_string(), None)]);
}

#[tokio::test]
#[serial]
async fn test_replayed_webhook_is_not_applied_twice() {
  setup_tracing();
  let h = Harness::new();
  let session = h.start_checkout().await;
  let payload = checkout_completed_payload("evt_1", &session, RES, false);

  assert_eq!(h.deliver(payload.clone()).await.unwrap(), WebhookResult::Successful);
  assert_eq!(h.deliver(payload).await.unwrap(), WebhookResult::NotRelevant);

  let confirmations = h
    .audit_events(RES)
    .await
    .into_iter()
    .filter(|e| *e == AuditEvent::PaymentConfirmed)
    .count();
  assert_eq!(confirmations, 1);
  assert_eq!(h.notifications.count("confirmation:"), 1);
  assert_eq!(h.status(RES).await, ReservationStatus::Complete);
}

#[tokio::test]
#[serial]
async fn test_webhook_with_bad_signature_is_rejected() {
  setup_tracing();
  let h = Harness::new();
  let session = h.start_checkout().await;
  let payload = checkout_completed_payload("evt_1", &session, RES, false);
  let signature = sign_payload(&payload, "whsec_someone_else", h.clock_now().timestamp());

  let err = h
    .system
    .reconciler
    .process_webhook(
      PaymentProxy::Stripe,
      WebhookRequest {
        payload,
        signature: Some(signature),
      },
    )
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::Validation { .. }), "got {err:?}");
  assert_eq!(h.status(RES).await, ReservationStatus::ExternalProcessingPayment);
  assert_eq!(h.transactions(RES).await[0].status, TransactionStatus::Pending);
}

#[tokio::test]
#[serial]
async fn test_live_event_for_test_account_is_ignored() {
  setup_tracing();
  let h = Harness::new();
  let session = h.start_checkout().await;

  let result = h
    .deliver(checkout_completed_payload("evt_live", &session, RES, true))
    .await
    .unwrap();
  assert_eq!(result, WebhookResult::NotRelevant);
  assert_eq!(h.status(RES).await, ReservationStatus::ExternalProcessingPayment);
}

#[tokio::test]
#[serial]
async fn test_expired_session_returns_reservation_to_pending() {
  setup_tracing();
  let h = Harness::new();
  let session = h.start_checkout().await;

  let result = h.deliver(checkout_expired_payload("evt_2", &session, RES)).await.unwrap();
  assert_eq!(result, WebhookResult::Failed("checkout.session.expired".to_string()));
  assert_eq!(h.status(RES).await, ReservationStatus::Pending);
  let tx = &h.transactions(RES).await[0];
  assert_eq!(tx.status, TransactionStatus::Failed);
  assert!(h.audit_events(RES).await.contains(&AuditEvent::PaymentFailed));
}

#[tokio::test]
#[serial]
async fn test_unrelated_event_types_are_not_relevant() {
  setup_tracing();
  let h = Harness::new();
  h.start_checkout().await;
  let payload = serde_json::json!({
    "id": "evt_3",
    "type": "customer.created",
    "livemode": false,
    "data": { "object": { "id": "cus_1" } }
  })
  .to_string();

  assert_eq!(h.deliver(payload).await.unwrap(), WebhookResult::NotRelevant);
  assert_eq!(h.status(RES).await, ReservationStatus::ExternalProcessingPayment);
}

#[tokio::test]
#[serial]
async fn test_webhook_for_unknown_session_is_not_relevant() {
  setup_tracing();
  let h = Harness::new();
  h.start_checkout().await;

  let result = h
    .deliver(checkout_completed_payload("evt_4", "cs_unknown", "ffffffff-0000-4000-8000-000000000000", false))
    .await
    .unwrap();
  assert_eq!(result, WebhookResult::NotRelevant);
  assert_eq!(h.status(RES).await, ReservationStatus::ExternalProcessingPayment);
}

#[tokio::test]
#[serial]
async fn test_payment_captured_after_reset_marks_reservation_stuck() {
  setup_tracing();
  let h = Harness::new();
  let session = h.start_checkout().await;

  h.system.orchestrator.reset_payment(RES).await.unwrap();
  assert_eq!(h.status(RES).await, ReservationStatus::Pending);
  assert_eq!(h.transactions(RES).await[0].status, TransactionStatus::Cancelled);
  assert!(h.audit_events(RES).await.contains(&AuditEvent::PaymentReset));

  let result = h
    .deliver(checkout_completed_payload("evt_5", &session, RES, false))
    .await
    .unwrap();
  assert!(matches!(result, WebhookResult::Failed(_)), "got {result:?}");
  assert_eq!(h.status(RES).await, ReservationStatus::Stuck);
  assert!(h.audit_events(RES).await.contains(&AuditEvent::ReservationStuck));
  assert_eq!(h.notifications.count("confirmation:"), 0);
}

#[tokio::test]
#[serial]
async fn test_customer_return_and_webhook_settle_once() {
  setup_tracing();
  let h = Harness::new();
  let session = h.start_checkout().await;
  *h.stripe.session_payment_status.lock() = "paid".to_string();

  let returned = h.system.orchestrator.confirm_external_payment(RES, None).await.unwrap();
  assert_eq!(returned, PaymentResult::successful("pi_test_1"));
  assert_eq!(h.status(RES).await, ReservationStatus::Complete);

  let late = h
    .deliver(checkout_completed_payload("evt_6", &session, RES, false))
    .await
    .unwrap();
  assert_eq!(late, WebhookResult::NotRelevant);
  assert_eq!(h.notifications.count("confirmation:"), 1);
  let complete = h
    .transactions(RES)
    .await
    .into_iter()
    .filter(|t| t.status == TransactionStatus::Complete)
    .count();
  assert_eq!(complete, 1);
}

#[tokio::test]
#[serial]
async fn test_unpaid_return_keeps_redirect() {
  setup_tracing();
  let h = Harness::new();
  h.start_checkout().await;

  let returned = h.system.orchestrator.confirm_external_payment(RES, None).await.unwrap();
  assert_eq!(returned, PaymentResult::redirect("https://checkout.stripe.test/cs_test_1"));
  assert_eq!(h.status(RES).await, ReservationStatus::ExternalProcessingPayment);
}
