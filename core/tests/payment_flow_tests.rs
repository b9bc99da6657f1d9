// tests/payment_flow_tests.rs
mod common;

use chrono::Duration;
use common::*;
use serial_test::serial;
use tessera::model::{
  AuditEvent, EventFormat, PaymentMethod, PaymentResult, PaymentToken, ReservationStatus, TransactionStatus,
  NOT_YET_PAID_TRANSACTION_ID,
};
use tessera::orchestrator::METHOD_UNAVAILABLE_ERROR;
use tessera::providers::stripe::StripeError;
use tessera::{CompletionOutcome, ConfigKey, CoreError, PaymentRequest};

const RES: &str = "a1b2c3d4-0000-4000-8000-000000000001";

fn card_request(reservation_id: &str) -> PaymentRequest {
  PaymentRequest {
    reservation_id: reservation_id.to_string(),
    method: PaymentMethod::CreditCard,
    token: Some(PaymentToken::StripeCard {
      token: "tok_visa".to_string(),
    }),
    selected_offline_method: None,
  }
}

fn request(reservation_id: &str, method: PaymentMethod) -> PaymentRequest {
  PaymentRequest {
    reservation_id: reservation_id.to_string(),
    method,
    token: None,
    selected_offline_method: None,
  }
}

#[tokio::test]
#[serial]
async fn test_card_payment_completes_reservation() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 10_000, 2).await;

  let result = h.system.orchestrator.perform_payment(card_request(RES)).await.unwrap();

  assert_eq!(result, PaymentResult::successful("ch_test_1"));
  let reservation = h.reservation(RES).await;
  assert_eq!(reservation.status, ReservationStatus::Complete);
  assert_eq!(reservation.invoice_number.as_deref(), Some("INV-0001"));
  assert!(reservation.confirmed_at.is_some());

  let txs = h.transactions(RES).await;
  assert_eq!(txs.len(), 1);
  assert_eq!(txs[0].status, TransactionStatus::Complete);
  assert_eq!(txs[0].gateway_id.as_deref(), Some("ch_test_1"));
  assert_eq!(txs[0].amount_cts, 10_000);

  assert_eq!(h.notifications.count("confirmation:"), 1);
  assert_eq!(h.notifications.count("ticket:"), 2);
  assert_eq!(h.notifications.count("offline:"), 0);
  let events = h.audit_events(RES).await;
  for expected in [
    AuditEvent::PaymentAttempted,
    AuditEvent::PaymentConfirmed,
    AuditEvent::InvoiceAssigned,
    AuditEvent::ReservationComplete,
  ] {
    assert!(events.contains(&expected), "missing {expected}");
  }
}

#[tokio::test]
#[serial]
async fn test_declined_card_leaves_reservation_retryable() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 10_000, 1).await;
  *h.stripe.next_charge_error.lock() = Some(StripeError::Card {
    code: "card_declined".to_string(),
    message: "Your card was declined.".to_string(),
  });

  let result = h.system.orchestrator.perform_payment(card_request(RES)).await.unwrap();
  assert_eq!(result, PaymentResult::failed("error.STEP2_STRIPE_card_declined"));
  assert_eq!(h.status(RES).await, ReservationStatus::Pending);
  let txs = h.transactions(RES).await;
  assert_eq!(txs.len(), 1);
  assert_eq!(txs[0].status, TransactionStatus::Failed);
  assert_eq!(txs[0].failure_reason.as_deref(), Some("error.STEP2_STRIPE_card_declined"));
  assert!(h.audit_events(RES).await.contains(&AuditEvent::PaymentFailed));

  // Second attempt goes through on a fresh transaction.
  let retry = h.system.orchestrator.perform_payment(card_request(RES)).await.unwrap();
  assert!(retry.is_paid());
  assert_eq!(h.status(RES).await, ReservationStatus::Complete);
  let statuses: Vec<_> = h.transactions(RES).await.iter().map(|t| t.status).collect();
  assert_eq!(statuses, vec![TransactionStatus::Failed, TransactionStatus::Complete]);
}

#[tokio::test]
#[serial]
async fn test_missing_card_token_is_rejected_before_any_write() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 10_000, 1).await;

  let err = h
    .system
    .orchestrator
    .perform_payment(request(RES, PaymentMethod::CreditCard))
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::Validation { .. }), "got {err:?}");
  assert!(h.transactions(RES).await.is_empty());
  assert_eq!(h.status(RES).await, ReservationStatus::Pending);
}

#[tokio::test]
#[serial]
async fn test_gateway_timeout_keeps_attempt_open() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 10_000, 1).await;
  *h.stripe.next_charge_error.lock() = Some(StripeError::Timeout);

  let err = h.system.orchestrator.perform_payment(card_request(RES)).await.unwrap_err();
  assert!(matches!(err, CoreError::GatewayTimeout(_)));
  assert_eq!(h.status(RES).await, ReservationStatus::InPayment);
  let txs = h.transactions(RES).await;
  assert_eq!(txs.len(), 1);
  assert_eq!(txs[0].status, TransactionStatus::Pending);

  // A retry while the outcome is unknown must not charge again.
  let err = h.system.orchestrator.perform_payment(card_request(RES)).await.unwrap_err();
  assert!(matches!(err, CoreError::PaymentAlreadyInProgress(_)));
  assert_eq!(h.transactions(RES).await.len(), 1);
  assert_eq!(h.stripe.charges.lock().len(), 0);
}

#[tokio::test]
#[serial]
async fn test_reservation_expires_exactly_at_validity() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 10_000, 1).await;

  h.clock.advance(Duration::minutes(25));
  let err = h.system.orchestrator.perform_payment(card_request(RES)).await.unwrap_err();
  match err {
    CoreError::Validation { code, .. } => assert_eq!(code, "ORDER_EXPIRED"),
    other => panic!("unexpected error {other:?}"),
  }
  assert!(h.transactions(RES).await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_payment_just_before_expiry_succeeds() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 10_000, 1).await;

  h.clock.advance(Duration::minutes(25) - Duration::seconds(1));
  let result = h.system.orchestrator.perform_payment(card_request(RES)).await.unwrap();
  assert!(result.is_paid());
}

#[tokio::test]
#[serial]
async fn test_concurrent_attempts_charge_once() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 10_000, 1).await;

  let orchestrator = h.system.orchestrator.clone();
  let other = h.system.orchestrator.clone();
  let (first, second) = tokio::join!(
    orchestrator.perform_payment(card_request(RES)),
    other.perform_payment(card_request(RES)),
  );

  let successes = [&first, &second].iter().filter(|r| matches!(r, Ok(p) if p.is_paid())).count();
  assert_eq!(successes, 1, "first: {first:?}, second: {second:?}");
  assert_eq!(h.stripe.charges.lock().len(), 1);
  let complete = h
    .transactions(RES)
    .await
    .iter()
    .filter(|t| t.status == TransactionStatus::Complete)
    .count();
  assert_eq!(complete, 1);
  assert_eq!(h.status(RES).await, ReservationStatus::Complete);
}

#[tokio::test]
#[serial]
async fn test_unavailable_method_fails_without_transaction() {
  setup_tracing();
  let h = Harness::new();
  h.pending_reservation(RES, 10_000, 1).await;

  let result = h
    .system
    .orchestrator
    .perform_payment(request(RES, PaymentMethod::Paypal))
    .await
    .unwrap();
  assert_eq!(result, PaymentResult::failed(METHOD_UNAVAILABLE_ERROR));
  assert!(h.transactions(RES).await.is_empty());
  assert_eq!(h.status(RES).await, ReservationStatus::Pending);
}

#[tokio::test]
#[serial]
async fn test_blacklisted_method_is_unavailable() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.config.set(
    tessera::ConfigScope::Category(CATEGORY_ID),
    ConfigKey::BlacklistedPaymentMethods,
    r#"["CREDIT_CARD"]"#,
  );
  h.pending_reservation(RES, 10_000, 1).await;

  let result = h.system.orchestrator.perform_payment(card_request(RES)).await.unwrap();
  assert_eq!(result, PaymentResult::failed(METHOD_UNAVAILABLE_ERROR));
}

#[tokio::test]
#[serial]
async fn test_bank_transfer_waits_for_money_then_operator_confirms() {
  setup_tracing();
  let h = Harness::new();
  h.enable_bank_transfer();
  h.pending_reservation(RES, 10_000, 1).await;

  let result = h
    .system
    .orchestrator
    .perform_payment(request(RES, PaymentMethod::BankTransfer))
    .await
    .unwrap();
  assert_eq!(result, PaymentResult::successful(NOT_YET_PAID_TRANSACTION_ID));
  assert!(!result.is_paid());

  let reservation = h.reservation(RES).await;
  assert_eq!(reservation.status, ReservationStatus::OfflinePayment);
  assert_eq!(reservation.validity, start_time() + Duration::days(5));
  let txs = h.transactions(RES).await;
  assert_eq!(txs[0].status, TransactionStatus::Pending);
  assert_eq!(txs[0].gateway_id.as_deref(), Some(NOT_YET_PAID_TRANSACTION_ID));
  assert_eq!(h.notifications.count("offline:BANK_TRANSFER"), 1);
  assert_eq!(h.notifications.count("confirmation:"), 0);

  let outcome = h
    .system
    .orchestrator
    .confirm_offline_payment(RES, "operator@example.org")
    .await
    .unwrap();
  assert!(matches!(outcome, CompletionOutcome::Completed { .. }));
  assert_eq!(h.status(RES).await, ReservationStatus::Complete);
  assert_eq!(h.notifications.count("confirmation:"), 1);

  // Confirming twice is harmless.
  let again = h
    .system
    .orchestrator
    .confirm_offline_payment(RES, "operator@example.org")
    .await
    .unwrap();
  assert_eq!(again, CompletionOutcome::AlreadyComplete);
  assert_eq!(h.notifications.count("confirmation:"), 1);
}

#[tokio::test]
#[serial]
async fn test_deferred_bank_transfer_valid_until_event_start() {
  setup_tracing();
  let h = Harness::new();
  h.enable_bank_transfer();
  h.event_config(ConfigKey::DeferredBankTransferEnabled, "true");
  h.pending_reservation(RES, 10_000, 1).await;

  h.system
    .orchestrator
    .perform_payment(request(RES, PaymentMethod::BankTransfer))
    .await
    .unwrap();
  let reservation = h.reservation(RES).await;
  assert_eq!(reservation.status, ReservationStatus::DeferredOfflinePayment);
  assert_eq!(reservation.validity, purchase_context(EventFormat::InPerson).begins_at);
}

#[tokio::test]
#[serial]
async fn test_unknown_custom_offline_method_is_rejected() {
  setup_tracing();
  let h = Harness::new();
  h.event_config(
    ConfigKey::CustomOfflinePayments,
    r#"[{"id":"cash","name":"Cash at the office"},{"id":"old","name":"Retired","deleted":true}]"#,
  );
  h.pending_reservation(RES, 10_000, 1).await;

  for missing in ["wire", "old"] {
    let mut req = request(RES, PaymentMethod::CustomOffline);
    req.selected_offline_method = Some(missing.to_string());
    let err = h.system.orchestrator.perform_payment(req).await.unwrap_err();
    assert!(
      matches!(&err, CoreError::CustomOfflinePaymentMethodDoesNotExist(id) if id == missing),
      "got {err:?}"
    );
  }
  assert!(h.transactions(RES).await.is_empty());

  let mut req = request(RES, PaymentMethod::CustomOffline);
  req.selected_offline_method = Some("cash".to_string());
  let result = h.system.orchestrator.perform_payment(req).await.unwrap();
  assert_eq!(result, PaymentResult::successful(NOT_YET_PAID_TRANSACTION_ID));
  assert_eq!(h.status(RES).await, ReservationStatus::CustomOfflinePayment);
  let txs = h.transactions(RES).await;
  assert_eq!(txs[0].metadata.get("offline_method_id").map(String::as_str), Some("cash"));
}

#[tokio::test]
#[serial]
async fn test_summary_shows_offline_method_deleted_after_selection() {
  setup_tracing();
  let h = Harness::new();
  h.event_config(
    ConfigKey::CustomOfflinePayments,
    r#"[{"id":"cash","name":"Cash at the office"}]"#,
  );
  h.pending_reservation(RES, 10_000, 1).await;
  let before = h.system.orchestrator.payment_summary(RES).await.unwrap();
  assert_eq!(before.transaction_status, None);
  assert_eq!(before.offline_method, None);

  let mut req = request(RES, PaymentMethod::CustomOffline);
  req.selected_offline_method = Some("cash".to_string());
  h.system.orchestrator.perform_payment(req).await.unwrap();

  h.event_config(
    ConfigKey::CustomOfflinePayments,
    r#"[{"id":"cash","name":"Cash at the office","deleted":true}]"#,
  );
  let summary = h.system.orchestrator.payment_summary(RES).await.unwrap();
  assert_eq!(summary.reservation_status, ReservationStatus::CustomOfflinePayment);
  assert_eq!(summary.transaction_status, Some(TransactionStatus::Pending));
  assert_eq!(summary.amount_cts, 10_000);
  let method = summary.offline_method.expect("deleted method still resolvable");
  assert_eq!(method.name, "Cash at the office");
  assert!(method.deleted);
}

#[tokio::test]
#[serial]
async fn test_on_site_is_not_offered_for_online_events() {
  setup_tracing();
  let h = Harness::with_format(EventFormat::Online);
  h.event_config(ConfigKey::OnSiteEnabled, "true");
  h.pending_reservation(RES, 10_000, 1).await;

  let result = h
    .system
    .orchestrator
    .perform_payment(request(RES, PaymentMethod::OnSite))
    .await
    .unwrap();
  assert_eq!(result, PaymentResult::failed(METHOD_UNAVAILABLE_ERROR));
}

#[tokio::test]
#[serial]
async fn test_paypal_redirect_then_capture_on_return() {
  setup_tracing();
  let h = Harness::new();
  h.event_config(ConfigKey::PaypalEnabled, "true");
  h.event_config(ConfigKey::PaypalClientId, "client");
  h.event_config(ConfigKey::PaypalClientSecret, "secret");
  h.pending_reservation(RES, 10_000, 1).await;

  let result = h
    .system
    .orchestrator
    .perform_payment(request(RES, PaymentMethod::Paypal))
    .await
    .unwrap();
  assert_eq!(result, PaymentResult::redirect("https://paypal.test/approve/ORDER-1"));
  assert_eq!(h.status(RES).await, ReservationStatus::ExternalProcessingPayment);

  // An approval for some other order is refused.
  let err = h
    .system
    .orchestrator
    .confirm_external_payment(
      RES,
      Some(PaymentToken::PaypalApproval {
        order_id: "ORDER-999".to_string(),
        payer_id: "PAYER".to_string(),
      }),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::Validation { .. }));

  let confirmed = h
    .system
    .orchestrator
    .confirm_external_payment(
      RES,
      Some(PaymentToken::PaypalApproval {
        order_id: "ORDER-1".to_string(),
        payer_id: "PAYER".to_string(),
      }),
    )
    .await
    .unwrap();
  assert_eq!(confirmed, PaymentResult::successful("CAPTURE-ORDER-1"));
  assert_eq!(h.status(RES).await, ReservationStatus::Complete);
  assert_eq!(h.paypal.captures.lock().len(), 1);
}

#[tokio::test]
#[serial]
async fn test_refunds_are_bounded_by_amount_paid() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 10_000, 1).await;
  h.system.orchestrator.perform_payment(card_request(RES)).await.unwrap();

  let partial = h.system.orchestrator.refund(RES, Some(4_000), "admin").await.unwrap();
  assert_eq!(partial.refund_id, "re_test_1");
  let err = h.system.orchestrator.refund(RES, Some(6_001), "admin").await.unwrap_err();
  assert!(matches!(err, CoreError::Validation { .. }));
  h.system.orchestrator.refund(RES, None, "admin").await.unwrap();

  let refunds = h.stripe.refunds.lock().clone();
  assert_eq!(
    refunds,
    vec![("ch_test_1".to_string(), Some(4_000)), ("ch_test_1".to_string(), Some(6_000))]
  );
  let tx = &h.transactions(RES).await[0];
  assert_eq!(tx.metadata.get("refunded_cts").map(String::as_str), Some("10000"));
  assert_eq!(
    h.audit_events(RES).await.iter().filter(|e| **e == AuditEvent::Refund).count(),
    2
  );
}

#[tokio::test]
#[serial]
async fn test_offline_payment_cannot_be_refunded() {
  setup_tracing();
  let h = Harness::new();
  h.enable_bank_transfer();
  h.pending_reservation(RES, 10_000, 1).await;
  h.system
    .orchestrator
    .perform_payment(request(RES, PaymentMethod::BankTransfer))
    .await
    .unwrap();
  h.system.orchestrator.confirm_offline_payment(RES, "ops").await.unwrap();

  let err = h.system.orchestrator.refund(RES, None, "admin").await.unwrap_err();
  match err {
    CoreError::Validation { code, .. } => assert_eq!(code, "error.refund.unsupported"),
    other => panic!("unexpected {other:?}"),
  }
}
