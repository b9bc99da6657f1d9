// tessera/src/providers/offline.rs

//! On-site payment and organization-defined offline methods.

use super::bank_transfer::{offline_payment_deadline, start_offline_payment};
use super::{ConfigSnapshot, PaymentContext, PaymentProvider, ProviderId};
use crate::config::{ConfigKey, ConfigLevel, ConfigValues};
use crate::error::{CoreError, CoreResult};
use crate::model::{
  PaymentMethod, PaymentProxy, PaymentResult, PaymentSpecification, ReservationStatus, Transaction,
  TransactionRequest,
};
use crate::services::PaymentServices;
use crate::state_machine::ReservationStateMachine;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{event, instrument, Level};

/// Transaction metadata key holding the selected offline method.
pub const OFFLINE_METHOD_KEY: &str = "offline_method_id";
pub const ON_SITE_METHOD_ID: &str = "on-site";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomOfflineMethod {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub instructions: String,
  /// Soft-deleted methods stay in the catalog so old transactions can show them.
  #[serde(default)]
  pub deleted: bool,
}

/// The organization's catalog of offline methods.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomOfflineCatalog {
  methods: Vec<CustomOfflineMethod>,
}

impl CustomOfflineCatalog {
  pub fn new(methods: Vec<CustomOfflineMethod>) -> Self {
    CustomOfflineCatalog { methods }
  }

  pub fn from_config(values: &ConfigValues) -> CoreResult<Self> {
    Ok(CustomOfflineCatalog::new(
      values.json(ConfigKey::CustomOfflinePayments)?.unwrap_or_default(),
    ))
  }

  /// Any method, deleted or not. For displaying existing transactions.
  pub fn resolve_for_display(&self, id: &str) -> Option<&CustomOfflineMethod> {
    self.methods.iter().find(|m| m.id == id)
  }

  /// A method that may be chosen for a new payment.
  pub fn find_active(&self, id: &str) -> Option<&CustomOfflineMethod> {
    self.methods.iter().find(|m| m.id == id && !m.deleted)
  }

  /// Active methods allowed by the event allowlist (absent means all) and not
  /// denied by any of the categories.
  pub fn available(&self, selected: Option<&[String]>, denied: &[Vec<String>]) -> Vec<CustomOfflineMethod> {
    self
      .methods
      .iter()
      .filter(|m| !m.deleted)
      .filter(|m| selected.map_or(true, |ids| ids.iter().any(|id| *id == m.id)))
      .filter(|m| !denied.iter().any(|ids| ids.iter().any(|id| *id == m.id)))
      .cloned()
      .collect()
  }
}

/// Offline methods a reservation may choose from, given a config snapshot.
pub fn available_custom_methods(config: &ConfigSnapshot) -> CoreResult<Vec<CustomOfflineMethod>> {
  let catalog = CustomOfflineCatalog::from_config(&config.event)?;
  let selected: Option<Vec<String>> = config.event.json(ConfigKey::SelectedCustomOfflinePayments)?;
  let denied = config
    .categories
    .iter()
    .map(|(_, values)| {
      values
        .json::<Vec<String>>(ConfigKey::DeniedCustomOfflinePayments)
        .map(Option::unwrap_or_default)
    })
    .collect::<CoreResult<Vec<_>>>()?;
  Ok(catalog.available(selected.as_deref(), &denied))
}

fn event_level(spec: &PaymentSpecification) -> ConfigLevel {
  ConfigLevel::event(spec.purchase_context.organization_id, spec.purchase_context.id)
}

/// Payment at the venue. Not offered for online events.
pub struct OnSiteProvider {
  services: PaymentServices,
  state_machine: ReservationStateMachine,
}

impl OnSiteProvider {
  pub fn new(services: PaymentServices) -> Self {
    let state_machine = ReservationStateMachine::new(services.clone());
    OnSiteProvider { services, state_machine }
  }
}

#[async_trait]
impl PaymentProvider for OnSiteProvider {
  fn id(&self) -> ProviderId {
    ProviderId::OnSite
  }

  fn proxy(&self) -> PaymentProxy {
    PaymentProxy::OnSite
  }

  fn payment_methods(&self) -> &'static [PaymentMethod] {
    &[PaymentMethod::OnSite]
  }

  fn config_keys(&self) -> &'static [ConfigKey] {
    &[ConfigKey::OnSiteEnabled]
  }

  fn accept(
    &self,
    method: PaymentMethod,
    context: &PaymentContext,
    request: &TransactionRequest,
    config: &ConfigSnapshot,
  ) -> bool {
    self.handles(method)
      && request.amount_cts() > 0
      && !context.purchase_context.is_online()
      && config.event.bool(ConfigKey::OnSiteEnabled)
  }

  fn attempt_metadata(&self, _spec: &PaymentSpecification) -> BTreeMap<String, String> {
    BTreeMap::from([(OFFLINE_METHOD_KEY.to_string(), ON_SITE_METHOD_ID.to_string())])
  }

  async fn validate_selection(&self, spec: &PaymentSpecification) -> CoreResult<()> {
    if spec.purchase_context.is_online() {
      return Err(CoreError::validation("payment_method", "error.STEP2_ON_SITE_UNAVAILABLE"));
    }
    Ok(())
  }

  #[instrument(name = "OnSiteProvider::do_payment", skip_all, fields(reservation_id = %spec.reservation_id))]
  async fn do_payment(&self, spec: &PaymentSpecification, attempt: &Transaction) -> CoreResult<PaymentResult> {
    start_offline_payment(
      &self.services,
      &self.state_machine,
      spec,
      attempt,
      ReservationStatus::CustomOfflinePayment,
      PaymentProxy::OnSite,
      Some(spec.purchase_context.begins_at),
    )
    .await
  }
}

/// Methods defined by the organization (cash at the office, invoice, …).
pub struct CustomOfflineProvider {
  services: PaymentServices,
  state_machine: ReservationStateMachine,
}

impl CustomOfflineProvider {
  pub fn new(services: PaymentServices) -> Self {
    let state_machine = ReservationStateMachine::new(services.clone());
    CustomOfflineProvider { services, state_machine }
  }

  async fn current_snapshot(&self, spec: &PaymentSpecification) -> CoreResult<ConfigSnapshot> {
    let level = event_level(spec);
    let event = self
      .services
      .configuration
      .get_for(
        &[ConfigKey::CustomOfflinePayments, ConfigKey::SelectedCustomOfflinePayments],
        &level,
      )
      .await?;
    let mut categories = Vec::with_capacity(spec.category_ids.len());
    for category_id in &spec.category_ids {
      let values = self
        .services
        .configuration
        .get_for(&[ConfigKey::DeniedCustomOfflinePayments], &level.for_category(*category_id))
        .await?;
      categories.push((*category_id, values));
    }
    Ok(ConfigSnapshot { event, categories })
  }
}

#[async_trait]
impl PaymentProvider for CustomOfflineProvider {
  fn id(&self) -> ProviderId {
    ProviderId::CustomOffline
  }

  fn proxy(&self) -> PaymentProxy {
    PaymentProxy::CustomOffline
  }

  fn payment_methods(&self) -> &'static [PaymentMethod] {
    &[PaymentMethod::CustomOffline]
  }

  fn config_keys(&self) -> &'static [ConfigKey] {
    &[ConfigKey::CustomOfflinePayments, ConfigKey::SelectedCustomOfflinePayments]
  }

  fn accept(
    &self,
    method: PaymentMethod,
    _context: &PaymentContext,
    request: &TransactionRequest,
    config: &ConfigSnapshot,
  ) -> bool {
    if !self.handles(method) || request.amount_cts() <= 0 {
      return false;
    }
    match available_custom_methods(config) {
      Ok(methods) => !methods.is_empty(),
      Err(e) => {
        event!(Level::WARN, error = %e, "Unreadable custom offline configuration.");
        false
      }
    }
  }

  fn attempt_metadata(&self, spec: &PaymentSpecification) -> BTreeMap<String, String> {
    spec
      .selected_offline_method
      .iter()
      .map(|id| (OFFLINE_METHOD_KEY.to_string(), id.clone()))
      .collect()
  }

  /// The selected method must exist in the current catalog and not be deleted,
  /// even if it was listed when the customer picked it.
  async fn validate_selection(&self, spec: &PaymentSpecification) -> CoreResult<()> {
    let Some(selected) = spec.selected_offline_method.as_deref() else {
      return Err(CoreError::validation("selected_offline_method", "error.custom_offline.missing"));
    };
    let snapshot = self.current_snapshot(spec).await?;
    let catalog = CustomOfflineCatalog::from_config(&snapshot.event)?;
    if catalog.find_active(selected).is_none() {
      event!(Level::WARN, method_id = selected, "Selected custom offline method does not exist.");
      return Err(CoreError::CustomOfflinePaymentMethodDoesNotExist(selected.to_string()));
    }
    let available = available_custom_methods(&snapshot)?;
    if !available.iter().any(|m| m.id == selected) {
      return Err(CoreError::validation("selected_offline_method", "error.custom_offline.not_allowed"));
    }
    Ok(())
  }

  #[instrument(name = "CustomOfflineProvider::do_payment", skip_all, fields(reservation_id = %spec.reservation_id))]
  async fn do_payment(&self, spec: &PaymentSpecification, attempt: &Transaction) -> CoreResult<PaymentResult> {
    let values = self
      .services
      .configuration
      .get_for(&[ConfigKey::OfflinePaymentDays], &event_level(spec))
      .await?;
    let days = values.i64(ConfigKey::OfflinePaymentDays)?;
    let validity = offline_payment_deadline(self.services.clock.now(), days, spec.purchase_context.begins_at);
    start_offline_payment(
      &self.services,
      &self.state_machine,
      spec,
      attempt,
      ReservationStatus::CustomOfflinePayment,
      PaymentProxy::CustomOffline,
      Some(validity),
    )
    .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn method(id: &str, deleted: bool) -> CustomOfflineMethod {
    CustomOfflineMethod {
      id: id.to_string(),
      name: id.to_uppercase(),
      instructions: String::new(),
      deleted,
    }
  }

  #[test]
  fn deleted_methods_resolve_for_display_only() {
    let catalog = CustomOfflineCatalog::new(vec![method("cash", false), method("twint", true)]);
    assert!(catalog.find_active("twint").is_none());
    assert!(catalog.resolve_for_display("twint").is_some());
    assert_eq!(catalog.available(None, &[]).len(), 1);
  }

  #[test]
  fn allowlist_and_denylist_filter() {
    let catalog = CustomOfflineCatalog::new(vec![method("cash", false), method("invoice", false)]);
    let selected = vec!["invoice".to_string(), "cash".to_string()];
    let denied = vec![vec!["cash".to_string()]];
    let available = catalog.available(Some(&selected), &denied);
    assert_eq!(available, vec![method("invoice", false)]);
  }
}
