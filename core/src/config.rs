// tessera/src/config.rs

//! Hierarchical configuration lookup.
//!
//! Values live at one of four levels. A lookup at `Category` level falls back to
//! the event, then the organization, then the system, and finally to the key's
//! built-in default. Every call site asks for exactly the keys it needs and
//! asks again on the next call, so changes take effect between requests.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
  BankTransferEnabled,
  OfflinePaymentDays,
  DeferredBankTransferEnabled,
  OnSiteEnabled,
  CustomOfflinePayments,
  SelectedCustomOfflinePayments,
  DeniedCustomOfflinePayments,
  BlacklistedPaymentMethods,
  StripeCcEnabled,
  StripeEnableSca,
  StripeSecretKey,
  StripeWebhookSecret,
  StripeConnectedId,
  StripeLiveMode,
  PlatformFeePercentage,
  PlatformFeeFixedCts,
  PaypalEnabled,
  PaypalClientId,
  PaypalClientSecret,
  PaypalLiveMode,
  RevolutEnabled,
  RevolutApiKey,
  RevolutLiveMode,
  RevolutManualReview,
  RevolutAcceptOverpayment,
  RevolutLookbackDays,
  BaseUrl,
}

impl ConfigKey {
  pub fn name(&self) -> &'static str {
    match self {
      ConfigKey::BankTransferEnabled => "BANK_TRANSFER_ENABLED",
      ConfigKey::OfflinePaymentDays => "OFFLINE_PAYMENT_DAYS",
      ConfigKey::DeferredBankTransferEnabled => "DEFERRED_BANK_TRANSFER_ENABLED",
      ConfigKey::OnSiteEnabled => "ON_SITE_ENABLED",
      ConfigKey::CustomOfflinePayments => "CUSTOM_OFFLINE_PAYMENTS",
      ConfigKey::SelectedCustomOfflinePayments => "SELECTED_CUSTOM_OFFLINE_PAYMENTS",
      ConfigKey::DeniedCustomOfflinePayments => "DENIED_CUSTOM_OFFLINE_PAYMENTS",
      ConfigKey::BlacklistedPaymentMethods => "BLACKLISTED_PAYMENT_METHODS",
      ConfigKey::StripeCcEnabled => "STRIPE_CC_ENABLED",
      ConfigKey::StripeEnableSca => "STRIPE_ENABLE_SCA",
      ConfigKey::StripeSecretKey => "STRIPE_SECRET_KEY",
      ConfigKey::StripeWebhookSecret => "STRIPE_WEBHOOK_SECRET",
      ConfigKey::StripeConnectedId => "STRIPE_CONNECTED_ID",
      ConfigKey::StripeLiveMode => "STRIPE_LIVE_MODE",
      ConfigKey::PlatformFeePercentage => "PLATFORM_FEE_PERCENTAGE",
      ConfigKey::PlatformFeeFixedCts => "PLATFORM_FEE_FIXED_CTS",
      ConfigKey::PaypalEnabled => "PAYPAL_ENABLED",
      ConfigKey::PaypalClientId => "PAYPAL_CLIENT_ID",
      ConfigKey::PaypalClientSecret => "PAYPAL_CLIENT_SECRET",
      ConfigKey::PaypalLiveMode => "PAYPAL_LIVE_MODE",
      ConfigKey::RevolutEnabled => "REVOLUT_ENABLED",
      ConfigKey::RevolutApiKey => "REVOLUT_API_KEY",
      ConfigKey::RevolutLiveMode => "REVOLUT_LIVE_MODE",
      ConfigKey::RevolutManualReview => "REVOLUT_MANUAL_REVIEW",
      ConfigKey::RevolutAcceptOverpayment => "REVOLUT_ACCEPT_OVERPAYMENT",
      ConfigKey::RevolutLookbackDays => "REVOLUT_LOOKBACK_DAYS",
      ConfigKey::BaseUrl => "BASE_URL",
    }
  }

  pub fn default_value(&self) -> Option<&'static str> {
    match self {
      ConfigKey::BankTransferEnabled
      | ConfigKey::DeferredBankTransferEnabled
      | ConfigKey::OnSiteEnabled
      | ConfigKey::StripeCcEnabled
      | ConfigKey::StripeEnableSca
      | ConfigKey::StripeLiveMode
      | ConfigKey::PaypalEnabled
      | ConfigKey::PaypalLiveMode
      | ConfigKey::RevolutEnabled
      | ConfigKey::RevolutLiveMode
      | ConfigKey::RevolutAcceptOverpayment => Some("false"),
      ConfigKey::RevolutManualReview => Some("true"),
      ConfigKey::OfflinePaymentDays => Some("5"),
      ConfigKey::RevolutLookbackDays => Some("14"),
      ConfigKey::PlatformFeePercentage | ConfigKey::PlatformFeeFixedCts => Some("0"),
      ConfigKey::BaseUrl => Some("http://localhost:8080"),
      _ => None,
    }
  }

  pub fn from_name(name: &str) -> Option<ConfigKey> {
    ConfigKey::ALL.iter().copied().find(|k| k.name() == name)
  }

  pub const ALL: &'static [ConfigKey] = &[
    ConfigKey::BankTransferEnabled,
    ConfigKey::OfflinePaymentDays,
    ConfigKey::DeferredBankTransferEnabled,
    ConfigKey::OnSiteEnabled,
    ConfigKey::CustomOfflinePayments,
    ConfigKey::SelectedCustomOfflinePayments,
    ConfigKey::DeniedCustomOfflinePayments,
    ConfigKey::BlacklistedPaymentMethods,
    ConfigKey::StripeCcEnabled,
    ConfigKey::StripeEnableSca,
    ConfigKey::StripeSecretKey,
    ConfigKey::StripeWebhookSecret,
    ConfigKey::StripeConnectedId,
    ConfigKey::StripeLiveMode,
    ConfigKey::PlatformFeePercentage,
    ConfigKey::PlatformFeeFixedCts,
    ConfigKey::PaypalEnabled,
    ConfigKey::PaypalClientId,
    ConfigKey::PaypalClientSecret,
    ConfigKey::PaypalLiveMode,
    ConfigKey::RevolutEnabled,
    ConfigKey::RevolutApiKey,
    ConfigKey::RevolutLiveMode,
    ConfigKey::RevolutManualReview,
    ConfigKey::RevolutAcceptOverpayment,
    ConfigKey::RevolutLookbackDays,
    ConfigKey::BaseUrl,
  ];
}

/// A single place where a value can be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigScope {
  System,
  Organization(i64),
  Event(i64),
  Category(i64),
}

/// Where a lookup starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigLevel {
  System,
  Organization { organization_id: i64 },
  Event { organization_id: i64, event_id: i64 },
  Category { organization_id: i64, event_id: i64, category_id: i64 },
}

impl ConfigLevel {
  pub fn event(organization_id: i64, event_id: i64) -> Self {
    ConfigLevel::Event {
      organization_id,
      event_id,
    }
  }

  /// Scopes to search, most specific first.
  pub fn scopes(&self) -> Vec<ConfigScope> {
    match *self {
      ConfigLevel::System => vec![ConfigScope::System],
      ConfigLevel::Organization { organization_id } => {
        vec![ConfigScope::Organization(organization_id), ConfigScope::System]
      }
      ConfigLevel::Event {
        organization_id,
        event_id,
      } => vec![
        ConfigScope::Event(event_id),
        ConfigScope::Organization(organization_id),
        ConfigScope::System,
      ],
      ConfigLevel::Category {
        organization_id,
        event_id,
        category_id,
      } => vec![
        ConfigScope::Category(category_id),
        ConfigScope::Event(event_id),
        ConfigScope::Organization(organization_id),
        ConfigScope::System,
      ],
    }
  }

  pub fn organization_id(&self) -> Option<i64> {
    match *self {
      ConfigLevel::System => None,
      ConfigLevel::Organization { organization_id }
      | ConfigLevel::Event { organization_id, .. }
      | ConfigLevel::Category { organization_id, .. } => Some(organization_id),
    }
  }

  /// The level one step less specific than a category, used for per-event checks.
  pub fn for_category(&self, category_id: i64) -> ConfigLevel {
    match *self {
      ConfigLevel::Event {
        organization_id,
        event_id,
      }
      | ConfigLevel::Category {
        organization_id,
        event_id,
        ..
      } => ConfigLevel::Category {
        organization_id,
        event_id,
        category_id,
      },
      other => other,
    }
  }
}

/// A looked-up value, or the key's default when nothing was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaybeValue {
  pub key: ConfigKey,
  pub value: Option<String>,
  pub found_in: Option<ConfigScope>,
}

impl MaybeValue {
  pub fn effective(&self) -> Option<&str> {
    self.value.as_deref().or_else(|| self.key.default_value())
  }

  pub fn is_present(&self) -> bool {
    self.value.as_deref().map_or(false, |v| !v.trim().is_empty())
  }
}

/// Result of `get_for`: one `MaybeValue` per requested key.
#[derive(Debug, Clone, Default)]
pub struct ConfigValues(HashMap<ConfigKey, MaybeValue>);

impl ConfigValues {
  pub fn new(values: HashMap<ConfigKey, MaybeValue>) -> Self {
    ConfigValues(values)
  }

  pub fn get(&self, key: ConfigKey) -> Option<&MaybeValue> {
    self.0.get(&key)
  }

  pub fn string(&self, key: ConfigKey) -> Option<String> {
    self
      .0
      .get(&key)
      .and_then(|v| v.effective())
      .or_else(|| key.default_value())
      .map(str::to_string)
  }

  /// Fails with `MissingConfiguration` when neither a value nor a default exists.
  pub fn require(&self, key: ConfigKey) -> CoreResult<String> {
    self
      .string(key)
      .filter(|s| !s.trim().is_empty())
      .ok_or(CoreError::MissingConfiguration(key))
  }

  pub fn bool(&self, key: ConfigKey) -> bool {
    self
      .string(key)
      .map_or(false, |v| v.trim().eq_ignore_ascii_case("true"))
  }

  pub fn i64(&self, key: ConfigKey) -> CoreResult<i64> {
    let raw = self.require(key)?;
    raw.trim().parse::<i64>().map_err(|e| CoreError::InvalidConfiguration {
      key,
      message: e.to_string(),
    })
  }

  pub fn decimal(&self, key: ConfigKey) -> CoreResult<Decimal> {
    let raw = self.require(key)?;
    Decimal::from_str(raw.trim()).map_err(|e| CoreError::InvalidConfiguration {
      key,
      message: e.to_string(),
    })
  }

  /// Parses a JSON value; an absent key yields `None`.
  pub fn json<T: DeserializeOwned>(&self, key: ConfigKey) -> CoreResult<Option<T>> {
    match self.string(key) {
      Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| CoreError::InvalidConfiguration {
          key,
          message: e.to_string(),
        }),
      _ => Ok(None),
    }
  }
}

#[async_trait]
pub trait ConfigurationProvider: Send + Sync {
  async fn get_for(&self, keys: &[ConfigKey], level: &ConfigLevel) -> CoreResult<ConfigValues>;
}

/// Resolves `keys` against a scope lookup function. Shared by every provider
/// implementation so fallback order is defined once.
pub fn resolve_hierarchically(
  keys: &[ConfigKey],
  level: &ConfigLevel,
  mut lookup: impl FnMut(ConfigScope, ConfigKey) -> Option<String>,
) -> ConfigValues {
  let scopes = level.scopes();
  let values = keys
    .iter()
    .map(|key| {
      let found = scopes
        .iter()
        .find_map(|scope| lookup(*scope, *key).map(|value| (*scope, value)));
      let maybe = match found {
        Some((scope, value)) => MaybeValue {
          key: *key,
          value: Some(value),
          found_in: Some(scope),
        },
        None => MaybeValue {
          key: *key,
          value: None,
          found_in: None,
        },
      };
      (*key, maybe)
    })
    .collect();
  ConfigValues(values)
}

/// Configuration kept in memory. Values can be changed at any time.
#[derive(Debug, Default)]
pub struct InMemoryConfiguration {
  values: RwLock<HashMap<(ConfigScope, ConfigKey), String>>,
}

impl InMemoryConfiguration {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&self, scope: ConfigScope, key: ConfigKey, value: impl Into<String>) {
    self.values.write().insert((scope, key), value.into());
  }

  pub fn remove(&self, scope: ConfigScope, key: ConfigKey) {
    self.values.write().remove(&(scope, key));
  }
}

#[async_trait]
impl ConfigurationProvider for InMemoryConfiguration {
  async fn get_for(&self, keys: &[ConfigKey], level: &ConfigLevel) -> CoreResult<ConfigValues> {
    let values = self.values.read();
    Ok(resolve_hierarchically(keys, level, |scope, key| {
      values.get(&(scope, key)).cloned()
    }))
  }
}
