// tessera/src/providers/registry.rs

//! Maps payment methods to the provider that fulfils them for a given event.

use super::offline::{available_custom_methods, CustomOfflineMethod};
use super::{ConfigSnapshot, PaymentContext, PaymentProvider, ProviderId};
use crate::config::{ConfigKey, ConfigurationProvider};
use crate::error::CoreResult;
use crate::model::{PaymentMethod, PaymentProxy, TransactionRequest};
use serde::Serialize;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{event, instrument, Level};

const CATEGORY_KEYS: &[ConfigKey] = &[ConfigKey::BlacklistedPaymentMethods, ConfigKey::DeniedCustomOfflinePayments];

/// A method the customer may choose, and who will process it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentMethodDescriptor {
  pub method: PaymentMethod,
  pub provider: ProviderId,
  pub proxy: PaymentProxy,
  pub requires_client_token: bool,
  pub supports_refund: bool,
  /// For `CUSTOM_OFFLINE`, the organization methods on offer.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub custom_methods: Vec<CustomOfflineMethod>,
}

/// Providers in priority order. When several accept the same method, the
/// first registered wins.
pub struct PaymentMethodRegistry {
  providers: Vec<Arc<dyn PaymentProvider>>,
  configuration: Arc<dyn ConfigurationProvider>,
}

impl PaymentMethodRegistry {
  pub fn new(configuration: Arc<dyn ConfigurationProvider>) -> Self {
    PaymentMethodRegistry {
      providers: Vec::new(),
      configuration,
    }
  }

  pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) -> &mut Self {
    event!(Level::DEBUG, provider = %provider.id(), "Payment provider registered.");
    self.providers.push(provider);
    self
  }

  pub fn providers(&self) -> &[Arc<dyn PaymentProvider>] {
    &self.providers
  }

  pub fn by_id(&self, id: ProviderId) -> Option<Arc<dyn PaymentProvider>> {
    self.providers.iter().find(|p| p.id() == id).cloned()
  }

  /// The provider of `proxy` that receives webhooks, if any.
  pub fn webhook_provider(&self, proxy: PaymentProxy) -> Option<Arc<dyn PaymentProvider>> {
    self
      .providers
      .iter()
      .find(|p| p.proxy() == proxy && p.as_webhook_handler().is_some())
      .cloned()
  }

  /// Reads every key the registered providers need, fresh on each call.
  pub async fn snapshot(&self, context: &PaymentContext) -> CoreResult<ConfigSnapshot> {
    let mut keys: Vec<ConfigKey> = Vec::new();
    for provider in &self.providers {
      for key in provider.config_keys() {
        if !keys.contains(key) {
          keys.push(*key);
        }
      }
    }
    let event = self.configuration.get_for(&keys, &context.config_level()).await?;
    let mut categories = Vec::with_capacity(context.category_ids.len());
    for category_id in &context.category_ids {
      let values = self
        .configuration
        .get_for(CATEGORY_KEYS, &context.category_level(*category_id))
        .await?;
      categories.push((*category_id, values));
    }
    Ok(ConfigSnapshot { event, categories })
  }

  /// Methods blacklisted by any category in the reservation.
  fn blacklisted(snapshot: &ConfigSnapshot) -> BTreeSet<PaymentMethod> {
    let mut blacklisted = BTreeSet::new();
    for (category_id, values) in &snapshot.categories {
      match values.json::<Vec<String>>(ConfigKey::BlacklistedPaymentMethods) {
        Ok(Some(names)) => {
          blacklisted.extend(names.iter().filter_map(|n| PaymentMethod::from_str(n).ok()));
        }
        Ok(None) => {}
        Err(e) => event!(Level::WARN, category_id, error = %e, "Unreadable payment method blacklist."),
      }
    }
    blacklisted
  }

  fn first_accepting(
    &self,
    method: PaymentMethod,
    context: &PaymentContext,
    request: &TransactionRequest,
    snapshot: &ConfigSnapshot,
  ) -> Option<Arc<dyn PaymentProvider>> {
    self
      .providers
      .iter()
      .find(|p| p.handles(method) && p.accept(method, context, request, snapshot))
      .cloned()
  }

  #[instrument(name = "PaymentMethodRegistry::active_payment_methods", skip_all, fields(purchase_context_id = context.purchase_context.id))]
  pub async fn active_payment_methods(
    &self,
    context: &PaymentContext,
    request: &TransactionRequest,
  ) -> CoreResult<Vec<PaymentMethodDescriptor>> {
    let snapshot = self.snapshot(context).await?;
    let blacklisted = Self::blacklisted(&snapshot);
    let mut descriptors = Vec::new();
    for method in PaymentMethod::ALL.iter().copied() {
      if method == PaymentMethod::None || blacklisted.contains(&method) {
        continue;
      }
      let Some(provider) = self.first_accepting(method, context, request, &snapshot) else {
        continue;
      };
      let custom_methods = if method == PaymentMethod::CustomOffline {
        available_custom_methods(&snapshot)?
      } else {
        Vec::new()
      };
      descriptors.push(PaymentMethodDescriptor {
        method,
        provider: provider.id(),
        proxy: provider.proxy(),
        requires_client_token: provider.requires_client_token(),
        supports_refund: provider.as_refund_request().is_some(),
        custom_methods,
      });
    }
    event!(Level::DEBUG, count = descriptors.len(), "Active payment methods computed.");
    Ok(descriptors)
  }

  /// The provider that will process `method` now, or `None` if no provider
  /// accepts it (or the method is blacklisted).
  pub async fn resolve(
    &self,
    method: PaymentMethod,
    context: &PaymentContext,
    request: &TransactionRequest,
  ) -> CoreResult<Option<Arc<dyn PaymentProvider>>> {
    let snapshot = self.snapshot(context).await?;
    if Self::blacklisted(&snapshot).contains(&method) {
      return Ok(None);
    }
    Ok(self.first_accepting(method, context, request, &snapshot))
  }
}

/// Gateway clients handed to the default provider set.
#[derive(Clone)]
pub struct GatewayClients {
  pub stripe: Arc<dyn super::stripe::StripeApi>,
  pub paypal: Arc<dyn super::paypal::PaypalApi>,
}

impl PaymentMethodRegistry {
  /// Registers every built-in provider in priority order: hosted Stripe
  /// checkout before direct card charges, deferred bank transfer before the
  /// plain one.
  pub fn with_default_providers(services: crate::services::PaymentServices, gateways: GatewayClients) -> Self {
    use super::bank_transfer::{BankTransferProvider, DeferredBankTransferProvider};
    use super::offline::{CustomOfflineProvider, OnSiteProvider};
    use super::paypal::PaypalProvider;
    use super::stripe::StripeCardProvider;
    use super::stripe_checkout::StripeCheckoutProvider;

    let mut registry = PaymentMethodRegistry::new(services.configuration.clone());
    registry
      .register(Arc::new(StripeCheckoutProvider::new(services.clone(), gateways.stripe.clone())))
      .register(Arc::new(StripeCardProvider::new(services.clone(), gateways.stripe)))
      .register(Arc::new(DeferredBankTransferProvider::new(services.clone())))
      .register(Arc::new(BankTransferProvider::new(services.clone())))
      .register(Arc::new(OnSiteProvider::new(services.clone())))
      .register(Arc::new(CustomOfflineProvider::new(services.clone())))
      .register(Arc::new(PaypalProvider::new(services, gateways.paypal)));
    registry
  }
}
