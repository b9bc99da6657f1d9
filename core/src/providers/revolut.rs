// tessera/src/providers/revolut.rs

//! Revolut Business statement matching.
//!
//! Not a payment path of its own: a periodic job downloads incoming
//! transfers and looks for the short reservation code in the transfer
//! reference. Matching itself is pure; applying a match is the
//! reconciler's job.

use super::http::{build_client, GatewayError, DEFAULT_GATEWAY_TIMEOUT};
use crate::config::{ConfigKey, ConfigLevel};
use crate::error::CoreResult;
use crate::model::{PaymentProxy, ReservationStatus, TransactionStatus};
use crate::services::PaymentServices;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{event, instrument, Level};

pub const REVOLUT_LIVE_BASE: &str = "https://b2b.revolut.com/api/1.0";
pub const REVOLUT_SANDBOX_BASE: &str = "https://sandbox-b2b.revolut.com/api/1.0";

/// One incoming transfer on the account statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementEntry {
  pub id: String,
  pub reference: String,
  pub amount_cts: i64,
  pub currency: String,
  pub created_at: DateTime<Utc>,
}

/// A reservation waiting for a bank transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOfflinePayment {
  pub reservation_id: String,
  pub short_id: String,
  pub purchase_context_id: i64,
  pub transaction_id: i64,
  pub amount_cts: i64,
  pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankMatch {
  pub reservation_id: String,
  pub transaction_id: i64,
  pub purchase_context_id: i64,
  pub statement_id: String,
  pub paid_cts: i64,
  /// Paid amount equals the amount due.
  pub exact: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousMatch {
  pub statement_id: String,
  pub reservation_ids: Vec<String>,
  pub reason: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
  pub matches: Vec<BankMatch>,
  pub ambiguous: Vec<AmbiguousMatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchPolicy {
  /// Transfers larger than the amount due also count as a match.
  pub accept_overpayment: bool,
}

/// Matches statement entries against pending reservations.
///
/// A reference containing a reservation's short code is a candidate; it
/// matches only when exactly one candidate exists and the currency and amount
/// agree. Anything else is reported as ambiguous and never applied.
pub fn match_statement(pending: &[PendingOfflinePayment], statement: &[StatementEntry], policy: MatchPolicy) -> MatchReport {
  let mut report = MatchReport::default();
  for entry in statement {
    let reference = entry.reference.to_uppercase();
    let candidates: Vec<&PendingOfflinePayment> = pending
      .iter()
      .filter(|p| !p.short_id.is_empty() && reference.contains(&p.short_id.to_uppercase()))
      .collect();
    match candidates.as_slice() {
      [] => {}
      [candidate] => {
        let same_currency = candidate.currency.eq_ignore_ascii_case(&entry.currency);
        let exact = entry.amount_cts == candidate.amount_cts;
        let over = policy.accept_overpayment && entry.amount_cts > candidate.amount_cts;
        if same_currency && (exact || over) {
          report.matches.push(BankMatch {
            reservation_id: candidate.reservation_id.clone(),
            transaction_id: candidate.transaction_id,
            purchase_context_id: candidate.purchase_context_id,
            statement_id: entry.id.clone(),
            paid_cts: entry.amount_cts,
            exact,
          });
        } else {
          report.ambiguous.push(AmbiguousMatch {
            statement_id: entry.id.clone(),
            reservation_ids: vec![candidate.reservation_id.clone()],
            reason: if same_currency { "amount mismatch" } else { "currency mismatch" },
          });
        }
      }
      many => report.ambiguous.push(AmbiguousMatch {
        statement_id: entry.id.clone(),
        reservation_ids: many.iter().map(|p| p.reservation_id.clone()).collect(),
        reason: "reference matches several reservations",
      }),
    }
  }

  // Two transfers for one reservation: leave both for a human.
  let mut per_reservation: HashMap<String, usize> = HashMap::new();
  for m in &report.matches {
    *per_reservation.entry(m.reservation_id.clone()).or_default() += 1;
  }
  let (kept, duplicated): (Vec<BankMatch>, Vec<BankMatch>) = report
    .matches
    .into_iter()
    .partition(|m| per_reservation.get(&m.reservation_id).copied() == Some(1));
  report.matches = kept;
  report.ambiguous.extend(duplicated.into_iter().map(|m| AmbiguousMatch {
    statement_id: m.statement_id,
    reservation_ids: vec![m.reservation_id],
    reason: "several transfers for one reservation",
  }));
  report
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevolutCredentials {
  pub api_key: String,
  pub live: bool,
}

#[async_trait]
pub trait RevolutApi: Send + Sync {
  /// Completed incoming transfers created at or after `since`.
  async fn incoming_transfers(
    &self,
    credentials: &RevolutCredentials,
    since: DateTime<Utc>,
  ) -> Result<Vec<StatementEntry>, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct RevolutTransaction {
  id: String,
  state: String,
  #[serde(default)]
  reference: Option<String>,
  created_at: DateTime<Utc>,
  #[serde(default)]
  legs: Vec<RevolutLeg>,
}

#[derive(Debug, Deserialize)]
struct RevolutLeg {
  amount: Decimal,
  currency: String,
  #[serde(default)]
  description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpRevolutApi {
  client: reqwest::Client,
}

impl HttpRevolutApi {
  pub fn new(timeout: std::time::Duration) -> Result<Self, GatewayError> {
    Ok(HttpRevolutApi {
      client: build_client(timeout)?,
    })
  }
}

#[async_trait]
impl RevolutApi for HttpRevolutApi {
  async fn incoming_transfers(
    &self,
    credentials: &RevolutCredentials,
    since: DateTime<Utc>,
  ) -> Result<Vec<StatementEntry>, GatewayError> {
    let base = if credentials.live { REVOLUT_LIVE_BASE } else { REVOLUT_SANDBOX_BASE };
    let response = self
      .client
      .get(format!("{base}/transactions"))
      .bearer_auth(&credentials.api_key)
      .query(&[("from", since.format("%Y-%m-%d").to_string()), ("type", "transfer".to_string())])
      .send()
      .await?;
    let transactions: Vec<RevolutTransaction> = super::http::error_for_status(response).await?.json().await?;
    Ok(
      transactions
        .into_iter()
        .filter(|t| t.state == "completed")
        .filter_map(|t| {
          let leg = t.legs.into_iter().find(|l| l.amount.is_sign_positive())?;
          let currency = crate::model::Currency::new(&leg.currency);
          let reference = [t.reference, leg.description].into_iter().flatten().collect::<Vec<_>>().join(" ");
          Some(StatementEntry {
            id: t.id,
            reference,
            amount_cts: currency.to_minor_units(leg.amount),
            currency: currency.code().to_string(),
            created_at: t.created_at,
          })
        })
        .collect(),
    )
  }
}

/// Settings of one Revolut account, read from the event's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevolutSettings {
  pub credentials: RevolutCredentials,
  pub manual_review: bool,
  pub policy: MatchPolicy,
  pub lookback_days: i64,
}

const REVOLUT_KEYS: &[ConfigKey] = &[
  ConfigKey::RevolutEnabled,
  ConfigKey::RevolutApiKey,
  ConfigKey::RevolutLiveMode,
  ConfigKey::RevolutManualReview,
  ConfigKey::RevolutAcceptOverpayment,
  ConfigKey::RevolutLookbackDays,
];

/// Matches found for one account, with the settings they must be applied with.
#[derive(Debug, Clone)]
pub struct AccountReport {
  pub settings: RevolutSettings,
  pub report: MatchReport,
}

/// Collects pending offline payments, downloads statements and matches them.
pub struct RevolutStatementMatcher {
  services: PaymentServices,
  api: Arc<dyn RevolutApi>,
}

impl RevolutStatementMatcher {
  pub fn new(services: PaymentServices, api: Arc<dyn RevolutApi>) -> Self {
    RevolutStatementMatcher { services, api }
  }

  pub fn with_http(services: PaymentServices) -> Result<Self, GatewayError> {
    Ok(Self::new(services, Arc::new(HttpRevolutApi::new(DEFAULT_GATEWAY_TIMEOUT)?)))
  }

  async fn settings_for(&self, organization_id: i64, context_id: i64) -> CoreResult<Option<RevolutSettings>> {
    let values = self
      .services
      .configuration
      .get_for(REVOLUT_KEYS, &ConfigLevel::event(organization_id, context_id))
      .await?;
    if !values.bool(ConfigKey::RevolutEnabled) {
      return Ok(None);
    }
    let Some(api_key) = values.string(ConfigKey::RevolutApiKey).filter(|k| !k.trim().is_empty()) else {
      event!(Level::WARN, organization_id, "Revolut enabled without API key.");
      return Ok(None);
    };
    Ok(Some(RevolutSettings {
      credentials: RevolutCredentials {
        api_key,
        live: values.bool(ConfigKey::RevolutLiveMode),
      },
      manual_review: values.bool(ConfigKey::RevolutManualReview),
      policy: MatchPolicy {
        accept_overpayment: values.bool(ConfigKey::RevolutAcceptOverpayment),
      },
      lookback_days: values.i64(ConfigKey::RevolutLookbackDays)?,
    }))
  }

  /// Reservations waiting for a bank transfer, grouped by Revolut account.
  async fn pending_by_account(&self) -> CoreResult<Vec<(RevolutSettings, Vec<PendingOfflinePayment>)>> {
    let reservations = self
      .services
      .reservations
      .find_by_status(&[ReservationStatus::OfflinePayment, ReservationStatus::DeferredOfflinePayment])
      .await?;
    let transactions = self
      .services
      .transactions
      .find_by_status(PaymentProxy::Offline, &[TransactionStatus::Pending])
      .await?;
    let by_reservation: HashMap<&str, _> = transactions.iter().map(|t| (t.reservation_id.as_str(), t)).collect();

    let mut accounts: BTreeMap<String, (RevolutSettings, Vec<PendingOfflinePayment>)> = BTreeMap::new();
    let mut settings_cache: HashMap<i64, Option<RevolutSettings>> = HashMap::new();
    for reservation in &reservations {
      let Some(tx) = by_reservation.get(reservation.id.as_str()) else {
        continue;
      };
      let settings = match settings_cache.get(&reservation.purchase_context_id) {
        Some(cached) => cached.clone(),
        None => {
          let context = self.services.load_context(reservation.purchase_context_id).await?;
          let loaded = self.settings_for(context.organization_id, context.id).await?;
          settings_cache.insert(reservation.purchase_context_id, loaded.clone());
          loaded
        }
      };
      let Some(settings) = settings else {
        continue;
      };
      let pending = PendingOfflinePayment {
        reservation_id: reservation.id.clone(),
        short_id: reservation.short_id(),
        purchase_context_id: reservation.purchase_context_id,
        transaction_id: tx.id,
        amount_cts: tx.amount_cts,
        currency: tx.currency.clone(),
      };
      accounts
        .entry(settings.credentials.api_key.clone())
        .or_insert_with(|| (settings.clone(), Vec::new()))
        .1
        .push(pending);
    }
    Ok(accounts.into_values().collect())
  }

  /// Downloads each account's recent transfers and matches them.
  #[instrument(name = "RevolutStatementMatcher::find_matches", skip(self))]
  pub async fn find_matches(&self) -> CoreResult<Vec<AccountReport>> {
    let now = self.services.clock.now();
    let mut reports = Vec::new();
    for (settings, pending) in self.pending_by_account().await? {
      let since = now - Duration::days(settings.lookback_days.max(1));
      let statement = self.api.incoming_transfers(&settings.credentials, since).await?;
      let report = match_statement(&pending, &statement, settings.policy);
      for ambiguous in &report.ambiguous {
        event!(
          Level::WARN,
          statement_id = %ambiguous.statement_id,
          reservations = ?ambiguous.reservation_ids,
          reason = ambiguous.reason,
          "Ambiguous bank transfer left for manual review."
        );
      }
      event!(Level::INFO, pending = pending.len(), statement = statement.len(), matched = report.matches.len(), "Statement matched.");
      reports.push(AccountReport { settings, report });
    }
    Ok(reports)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pending(id: &str, amount: i64) -> PendingOfflinePayment {
    PendingOfflinePayment {
      reservation_id: id.to_string(),
      short_id: crate::model::reservation::short_reservation_id(id),
      purchase_context_id: 1,
      transaction_id: 1,
      amount_cts: amount,
      currency: "CHF".to_string(),
    }
  }

  fn entry(reference: &str, amount: i64) -> StatementEntry {
    StatementEntry {
      id: format!("st-{reference}"),
      reference: reference.to_string(),
      amount_cts: amount,
      currency: "CHF".to_string(),
      created_at: Utc::now(),
    }
  }

  #[test]
  fn overpayment_only_with_policy() {
    let p = vec![pending("abcdef12-0000", 1000)];
    let s = vec![entry("ticket ABCDEF12", 1200)];
    assert!(match_statement(&p, &s, MatchPolicy::default()).matches.is_empty());
    let report = match_statement(&p, &s, MatchPolicy { accept_overpayment: true });
    assert_eq!(report.matches.len(), 1);
    assert!(!report.matches[0].exact);
  }

  #[test]
  fn two_transfers_for_one_reservation_are_ambiguous() {
    let p = vec![pending("abcdef12-0000", 1000)];
    let s = vec![entry("ABCDEF12", 1000), entry("abcdef12 again", 1000)];
    let report = match_statement(&p, &s, MatchPolicy::default());
    assert!(report.matches.is_empty());
    assert_eq!(report.ambiguous.len(), 2);
  }
}
