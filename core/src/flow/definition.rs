// tessera/src/flow/definition.rs

//! `Flow<TData, Err>` construction and handler registration.

use super::context_data::ContextData;
use super::control::FlowControl;
use super::step::{SkipCondition, StepDef};
use super::FlowError;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// A boxed asynchronous step handler.
///
/// Handlers take a clone of the shared `ContextData<TData>`. Lock guards must be
/// released before the handler awaits anything.
pub type Handler<TData, Err> = Box<
  dyn Fn(ContextData<TData>) -> Pin<Box<dyn Future<Output = Result<FlowControl, Err>> + Send>> + Send + Sync,
>;

/// An ordered set of named steps over a shared context `TData`.
///
/// `Err` is the error type handlers return; engine failures (a mandatory step
/// without handlers) are converted into it through `From<FlowError>`.
pub struct Flow<TData, Err>
where
  TData: Send + Sync + 'static,
  Err: std::error::Error + From<FlowError> + Send + Sync + 'static,
{
  pub(crate) name: String,
  pub(crate) steps: Vec<StepDef<TData>>,
  pub(crate) handlers: HashMap<String, Vec<Handler<TData, Err>>>,
}

impl<TData, Err> Flow<TData, Err>
where
  TData: Send + Sync + 'static,
  Err: std::error::Error + From<FlowError> + Send + Sync + 'static,
{
  /// Creates a flow from `(step_name, optional, skip_if)` tuples.
  pub fn new(name: impl Into<String>, step_defs: &[(&str, bool, Option<SkipCondition<TData>>)]) -> Self {
    let steps = step_defs
      .iter()
      .map(|(step_name, optional, skip_if)| StepDef {
        name: (*step_name).to_string(),
        optional: *optional,
        skip_if: skip_if.clone(),
      })
      .collect();
    Self {
      name: name.into(),
      steps,
      handlers: HashMap::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn step_names(&self) -> Vec<&str> {
    self.steps.iter().map(|s| s.name.as_str()).collect()
  }

  /// Checks that `step_name` is declared.
  pub fn check_step(&self, step_name: &str) -> Result<(), FlowError> {
    if self.steps.iter().any(|s| s.name == step_name) {
      Ok(())
    } else {
      Err(FlowError::StepNotFound {
        flow: self.name.clone(),
        step_name: step_name.to_string(),
      })
    }
  }

  /// Registration against an undeclared step is a wiring mistake, not a
  /// runtime condition, so it panics.
  fn ensure_step_exists(&self, step_name: &str) {
    if let Err(e) = self.check_step(step_name) {
      panic!("flow setup error: {e}");
    }
  }

  /// Adds a handler to `step_name`. Handlers of one step run in registration
  /// order.
  pub fn on<F, HandlerErr>(
    &mut self,
    step_name: &str,
    handler_fn: impl Fn(ContextData<TData>) -> F + Send + Sync + 'static,
  ) where
    F: Future<Output = Result<FlowControl, HandlerErr>> + Send + 'static,
    HandlerErr: Into<Err> + Send + Sync + 'static,
  {
    self.ensure_step_exists(step_name);
    let handler: Handler<TData, Err> = Box::new(move |ctx_data| {
      let fut = handler_fn(ctx_data);
      Box::pin(async move { fut.await.map_err(Into::into) })
    });
    self.handlers.entry(step_name.to_string()).or_default().push(handler);
  }

  pub(crate) fn has_handlers(&self, step_name: &str) -> bool {
    self.handlers.get(step_name).map_or(false, |v| !v.is_empty())
  }
}
