// tessera/src/system.rs

//! Wires the orchestrator, the reconciler and the job queue over one set of
//! services.

use crate::cache::TtlCache;
use crate::jobs::{
  AdminJobExecutor, AdminJobManager, AdminJobScheduler, CheckOfflinePaymentsExecutor, ExpireOfflinePaymentsExecutor,
  ExpirePendingReservationsExecutor, JobPolicy, RetryConfirmationEmailExecutor, SchedulerSettings,
};
use crate::orchestrator::PaymentOrchestrator;
use crate::providers::http::{GatewayError, DEFAULT_GATEWAY_TIMEOUT};
use crate::providers::paypal::HttpPaypalApi;
use crate::providers::registry::GatewayClients;
use crate::providers::revolut::{HttpRevolutApi, RevolutApi, RevolutStatementMatcher};
use crate::providers::stripe::HttpStripeApi;
use crate::providers::PaymentMethodRegistry;
use crate::services::PaymentServices;
use crate::webhook::WebhookReconciler;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

/// PayPal OAuth tokens live a little under their nine-hour lifetime.
const PAYPAL_TOKEN_TTL_MINUTES: i64 = 8 * 60;
const PAYPAL_TOKEN_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct PaymentSystem {
  pub services: PaymentServices,
  pub registry: Arc<PaymentMethodRegistry>,
  pub orchestrator: Arc<PaymentOrchestrator>,
  pub reconciler: Arc<WebhookReconciler>,
  pub jobs: Arc<AdminJobManager>,
}

impl PaymentSystem {
  pub fn new(
    services: PaymentServices,
    gateways: GatewayClients,
    revolut: Arc<dyn RevolutApi>,
    policy: JobPolicy,
  ) -> Self {
    let registry = Arc::new(PaymentMethodRegistry::with_default_providers(services.clone(), gateways));
    let orchestrator = Arc::new(PaymentOrchestrator::new(services.clone(), registry.clone()));
    let reconciler = Arc::new(WebhookReconciler::new(services.clone(), registry.clone()));

    let matcher = RevolutStatementMatcher::new(services.clone(), revolut);
    let executors: Vec<Arc<dyn AdminJobExecutor>> = vec![
      Arc::new(ExpirePendingReservationsExecutor::new(services.clone())),
      Arc::new(ExpireOfflinePaymentsExecutor::new(services.clone())),
      Arc::new(CheckOfflinePaymentsExecutor::new(matcher, reconciler.clone())),
      Arc::new(RetryConfirmationEmailExecutor::new(services.clone())),
    ];
    let jobs = Arc::new(AdminJobManager::new(services.clone(), executors, policy));

    event!(Level::INFO, providers = registry.providers().len(), "Payment system ready.");
    PaymentSystem {
      services,
      registry,
      orchestrator,
      reconciler,
      jobs,
    }
  }

  /// Same as `new` with real HTTP clients for every gateway.
  pub fn with_http_gateways(services: PaymentServices, policy: JobPolicy) -> Result<Self, GatewayError> {
    Self::with_gateway_timeout(services, policy, DEFAULT_GATEWAY_TIMEOUT)
  }

  pub fn with_gateway_timeout(
    services: PaymentServices,
    policy: JobPolicy,
    timeout: Duration,
  ) -> Result<Self, GatewayError> {
    let tokens = Arc::new(TtlCache::new(
      chrono::Duration::minutes(PAYPAL_TOKEN_TTL_MINUTES),
      PAYPAL_TOKEN_CAPACITY,
      services.clock.clone(),
    ));
    let gateways = GatewayClients {
      stripe: Arc::new(HttpStripeApi::new(timeout)?),
      paypal: Arc::new(HttpPaypalApi::new(timeout, tokens)?),
    };
    let revolut = Arc::new(HttpRevolutApi::new(timeout)?);
    Ok(Self::new(services, gateways, revolut, policy))
  }

  pub fn scheduler(&self, settings: SchedulerSettings) -> AdminJobScheduler {
    AdminJobScheduler::new(self.jobs.clone(), settings)
  }
}
