// tessera/src/flow/mod.rs

//! A small step-flow engine.
//!
//! A `Flow<TData, Err>` is an ordered list of named steps. Each step carries
//! handlers which receive a shared `ContextData<TData>` and decide whether the
//! flow continues. A step may be optional or skipped by a condition on the
//! context. The payment orchestrator and the webhook reconciler are both built
//! as flows so that every attempt is traced step by step.

pub mod context_data;
pub mod control;
pub mod definition;
pub mod execution;
pub mod step;

pub use context_data::ContextData;
pub use control::{FlowControl, FlowOutcome};
pub use definition::{Flow, Handler};
pub use step::{SkipCondition, StepDef};

use thiserror::Error;

/// Errors raised by the engine itself, independent of what handlers do.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
  #[error("Step not found in flow '{flow}': {step_name}")]
  StepNotFound { flow: String, step_name: String },

  #[error("Handler missing for non-optional step '{step_name}' in flow '{flow}'")]
  HandlerMissing { flow: String, step_name: String },
}
