// tessera/src/lib.rs

//! Tessera: reservation lifecycle and payment coordination for event ticketing.
//!
//! The crate covers:
//!  - Price calculation in minor units with VAT and discounts.
//!  - A reservation state machine whose transitions are compare-and-set.
//!  - Pluggable payment providers (Stripe, PayPal, bank transfer, on-site,
//!    custom offline methods) with capability queries for webhooks, refunds
//!    and redirect-based flows.
//!  - A payment orchestrator and a webhook reconciler, both built on a small
//!    step-flow engine.
//!  - A persistent admin job queue for expiry, bank statement matching and
//!    email retries.
//!
//! Persistence and outbound mail are traits; `store::InMemoryStore` backs
//! tests and the demo, the server crate provides PostgreSQL.

pub mod cache;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod flow;
pub mod jobs;
pub mod model;
pub mod orchestrator;
pub mod pricing;
pub mod providers;
pub mod services;
pub mod state_machine;
pub mod store;
pub mod system;
pub mod webhook;

pub use crate::cache::TtlCache;
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{ConfigKey, ConfigLevel, ConfigScope, ConfigValues, ConfigurationProvider, InMemoryConfiguration};
pub use crate::error::{CoreError, CoreResult, ErrorKind};
pub use crate::flow::{ContextData, Flow, FlowControl, FlowError, FlowOutcome};
pub use crate::jobs::{AdminJobExecutor, AdminJobManager, AdminJobScheduler, JobPolicy, SchedulerSettings};
pub use crate::orchestrator::{PaymentOrchestrator, PaymentRequest, PaymentSummary};
pub use crate::pricing::{Discount, LineItem, PriceCalculator, PriceInput};
pub use crate::providers::{PaymentContext, PaymentMethodDescriptor, PaymentMethodRegistry, PaymentProvider};
pub use crate::services::PaymentServices;
pub use crate::state_machine::{CancellationReason, CompletionOutcome, ReservationStateMachine};
pub use crate::system::PaymentSystem;
pub use crate::webhook::{BankMatchOutcome, WebhookReconciler, WebhookResult};
