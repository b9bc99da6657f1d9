// tessera/src/flow/execution.rs

use super::context_data::ContextData;
use super::control::{FlowControl, FlowOutcome};
use super::definition::Flow;
use super::FlowError;
use tracing::{event, Instrument, Level};

impl<TData, Err> Flow<TData, Err>
where
  TData: Send + Sync + 'static,
  Err: std::error::Error + From<FlowError> + Send + Sync + 'static,
{
  /// Runs every step in declaration order against `ctx_data`.
  ///
  /// The first handler error aborts the run and is returned as-is.
  pub async fn run(&self, ctx_data: ContextData<TData>) -> Result<FlowOutcome, Err> {
    let flow_span = tracing::info_span!("flow", flow = %self.name, num_steps = self.steps.len());
    self.run_steps(ctx_data).instrument(flow_span).await
  }

  async fn run_steps(&self, ctx_data: ContextData<TData>) -> Result<FlowOutcome, Err> {
    event!(Level::DEBUG, "Flow starting.");

    for (step_idx, step_def) in self.steps.iter().enumerate() {
      let step_name = step_def.name.as_str();

      if let Some(skip_if) = &step_def.skip_if {
        if skip_if(&ctx_data) {
          event!(Level::DEBUG, step = step_name, "Step skipped.");
          continue;
        }
      }

      if !self.has_handlers(step_name) {
        if step_def.optional {
          event!(Level::TRACE, step = step_name, "Optional step has no handlers.");
          continue;
        }
        event!(Level::ERROR, step = step_name, "Non-optional step has no handlers.");
        return Err(Err::from(FlowError::HandlerMissing {
          flow: self.name.clone(),
          step_name: step_def.name.clone(),
        }));
      }

      let step_span = tracing::debug_span!("flow_step", step = step_name, step_index = step_idx);
      let control = self.run_step(step_name, ctx_data.clone()).instrument(step_span).await?;
      if control == FlowControl::Stop {
        event!(Level::DEBUG, step = step_name, "Flow stopped by handler.");
        return Ok(FlowOutcome::Stopped);
      }
    }

    event!(Level::DEBUG, "Flow completed.");
    Ok(FlowOutcome::Completed)
  }

  async fn run_step(&self, step_name: &str, ctx_data: ContextData<TData>) -> Result<FlowControl, Err> {
    let Some(handlers) = self.handlers.get(step_name) else {
      return Ok(FlowControl::Continue);
    };
    for (handler_idx, handler) in handlers.iter().enumerate() {
      match handler(ctx_data.clone()).await {
        Ok(FlowControl::Continue) => {}
        Ok(FlowControl::Stop) => return Ok(FlowControl::Stop),
        Err(e) => {
          event!(Level::WARN, handler = handler_idx, error = %e, "Handler failed.");
          return Err(e);
        }
      }
    }
    Ok(FlowControl::Continue)
  }
}
