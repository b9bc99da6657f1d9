// tests/registry_tests.rs
mod common;

use common::*;
use serial_test::serial;
use tessera::model::{EventFormat, PaymentMethod, PaymentProxy};
use tessera::providers::ProviderId;
use tessera::{ConfigKey, ConfigScope, PaymentMethodDescriptor};

const RES: &str = "0badf00d-0000-4000-8000-000000000003";

async fn offered(h: &Harness) -> Vec<PaymentMethodDescriptor> {
  let (context, request) = h.system.orchestrator.payment_context(RES).await.unwrap();
  h.system.registry.active_payment_methods(&context, &request).await.unwrap()
}

fn methods(descriptors: &[PaymentMethodDescriptor]) -> Vec<PaymentMethod> {
  descriptors.iter().map(|d| d.method).collect()
}

#[tokio::test]
#[serial]
async fn test_nothing_offered_without_configuration() {
  setup_tracing();
  let h = Harness::new();
  h.pending_reservation(RES, 8_000, 1).await;
  assert!(offered(&h).await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_card_provider_depends_on_sca_setting() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.pending_reservation(RES, 8_000, 1).await;

  let direct = offered(&h).await;
  assert_eq!(methods(&direct), vec![PaymentMethod::CreditCard]);
  assert_eq!(direct[0].provider, ProviderId::StripeCard);
  assert!(direct[0].requires_client_token);
  assert!(direct[0].supports_refund);

  h.event_config(ConfigKey::StripeEnableSca, "true");
  let hosted = offered(&h).await;
  assert_eq!(hosted[0].provider, ProviderId::StripeCheckout);
  assert_eq!(hosted[0].proxy, PaymentProxy::Stripe);
  assert!(!hosted[0].requires_client_token);
}

#[tokio::test]
#[serial]
async fn test_deferred_bank_transfer_takes_precedence() {
  setup_tracing();
  let h = Harness::new();
  h.enable_bank_transfer();
  h.pending_reservation(RES, 8_000, 1).await;
  assert_eq!(offered(&h).await[0].provider, ProviderId::BankTransfer);

  h.event_config(ConfigKey::DeferredBankTransferEnabled, "true");
  let descriptors = offered(&h).await;
  assert_eq!(methods(&descriptors), vec![PaymentMethod::BankTransfer]);
  assert_eq!(descriptors[0].provider, ProviderId::DeferredBankTransfer);
  assert!(!descriptors[0].supports_refund);
}

#[tokio::test]
#[serial]
async fn test_category_blacklist_removes_method() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.enable_bank_transfer();
  h.pending_reservation(RES, 8_000, 1).await;
  assert_eq!(
    methods(&offered(&h).await),
    vec![PaymentMethod::CreditCard, PaymentMethod::BankTransfer]
  );

  h.config.set(
    ConfigScope::Category(CATEGORY_ID),
    ConfigKey::BlacklistedPaymentMethods,
    r#"["BANK_TRANSFER"]"#,
  );
  assert_eq!(methods(&offered(&h).await), vec![PaymentMethod::CreditCard]);
}

#[tokio::test]
#[serial]
async fn test_custom_offline_lists_selected_and_allowed_methods() {
  setup_tracing();
  let h = Harness::new();
  h.event_config(
    ConfigKey::CustomOfflinePayments,
    r#"[
      {"id":"cash","name":"Cash"},
      {"id":"twint","name":"TWINT"},
      {"id":"check","name":"Cheque","deleted":true}
    ]"#,
  );
  h.event_config(ConfigKey::SelectedCustomOfflinePayments, r#"["cash","twint","check"]"#);
  h.config.set(
    ConfigScope::Category(CATEGORY_ID),
    ConfigKey::DeniedCustomOfflinePayments,
    r#"["twint"]"#,
  );
  h.pending_reservation(RES, 8_000, 1).await;

  let descriptors = offered(&h).await;
  assert_eq!(methods(&descriptors), vec![PaymentMethod::CustomOffline]);
  let ids: Vec<_> = descriptors[0].custom_methods.iter().map(|m| m.id.as_str()).collect();
  assert_eq!(ids, vec!["cash"]);
}

#[tokio::test]
#[serial]
async fn test_on_site_only_for_physical_events() {
  setup_tracing();
  for (format, expected) in [(EventFormat::InPerson, true), (EventFormat::Online, false)] {
    let h = Harness::with_format(format);
    h.event_config(ConfigKey::OnSiteEnabled, "true");
    h.pending_reservation(RES, 8_000, 1).await;
    let has_on_site = methods(&offered(&h).await).contains(&PaymentMethod::OnSite);
    assert_eq!(has_on_site, expected, "format {format:?}");
  }
}

#[tokio::test]
#[serial]
async fn test_free_reservation_needs_no_payment_method() {
  setup_tracing();
  let h = Harness::new();
  h.enable_stripe_card();
  h.enable_bank_transfer();
  h.pending_reservation(RES, 0, 1).await;
  assert!(offered(&h).await.is_empty());
}
