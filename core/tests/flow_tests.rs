// tests/flow_tests.rs
mod common;

use common::*;
use serial_test::serial;
use std::sync::Arc;
use tessera::flow::SkipCondition;
use tessera::{ContextData, CoreError, CoreResult, Flow, FlowControl, FlowError, FlowOutcome};

#[derive(Debug, Default, Clone)]
struct Trace {
  visited: Vec<String>,
  counter: u32,
}

fn record(label: &'static str) -> impl Fn(ContextData<Trace>) -> std::future::Ready<CoreResult<FlowControl>> {
  move |ctx| {
    ctx.update(|t| {
      t.visited.push(label.to_string());
      t.counter += 1;
    });
    std::future::ready(Ok(FlowControl::Continue))
  }
}

fn flow(steps: &[(&str, bool)]) -> Flow<Trace, CoreError> {
  let defs: Vec<_> = steps.iter().map(|(name, optional)| (*name, *optional, None)).collect();
  Flow::new("test", &defs)
}

#[tokio::test]
#[serial]
async fn test_steps_run_in_declaration_order() {
  setup_tracing();
  let mut f = flow(&[("load", false), ("charge", false), ("notify", false)]);
  f.on("notify", record("notify"));
  f.on("load", record("load"));
  f.on("charge", record("charge"));

  let ctx = ContextData::new(Trace::default());
  assert_eq!(f.run(ctx.clone()).await.unwrap(), FlowOutcome::Completed);
  assert_eq!(ctx.read().visited, vec!["load", "charge", "notify"]);
  assert_eq!(f.step_names(), vec!["load", "charge", "notify"]);
}

#[tokio::test]
#[serial]
async fn test_handlers_of_a_step_run_in_registration_order() {
  setup_tracing();
  let mut f = flow(&[("charge", false)]);
  f.on("charge", record("reserve"));
  f.on("charge", record("capture"));
  f.on("charge", record("audit"));

  let ctx = ContextData::new(Trace::default());
  f.run(ctx.clone()).await.unwrap();
  assert_eq!(ctx.read().visited, vec!["reserve", "capture", "audit"]);
}

#[tokio::test]
#[serial]
async fn test_stop_halts_remaining_handlers_and_steps() {
  setup_tracing();
  let mut f = flow(&[("resolve", false), ("charge", false)]);
  f.on("resolve", |ctx: ContextData<Trace>| async move {
    ctx.write().visited.push("resolve".to_string());
    Ok::<_, CoreError>(FlowControl::Stop)
  });
  f.on("resolve", record("resolve-again"));
  f.on("charge", record("charge"));

  let ctx = ContextData::new(Trace::default());
  assert_eq!(f.run(ctx.clone()).await.unwrap(), FlowOutcome::Stopped);
  assert_eq!(ctx.read().visited, vec!["resolve"]);
}

#[tokio::test]
#[serial]
async fn test_handler_error_aborts_run() {
  setup_tracing();
  let mut f = flow(&[("validate", false), ("charge", false)]);
  f.on("validate", |_ctx: ContextData<Trace>| async move {
    Err::<FlowControl, _>(CoreError::validation("token", "error.token"))
  });
  f.on("charge", record("charge"));

  let ctx = ContextData::new(Trace::default());
  let err = f.run(ctx.clone()).await.unwrap_err();
  assert!(matches!(err, CoreError::Validation { ref code, .. } if code == "error.token"));
  assert_eq!(ctx.read().counter, 0);
}

#[tokio::test]
#[serial]
async fn test_missing_handler_on_mandatory_step_is_an_error() {
  setup_tracing();
  let mut f = flow(&[("load", false), ("notify", true), ("charge", false)]);
  f.on("load", record("load"));

  let ctx = ContextData::new(Trace::default());
  let err = f.run(ctx.clone()).await.unwrap_err();
  assert!(matches!(
    err,
    CoreError::Flow(FlowError::HandlerMissing { ref step_name, .. }) if step_name == "charge"
  ));
  // The optional step without handlers was passed over silently.
  assert_eq!(ctx.read().visited, vec!["load"]);
}

#[tokio::test]
#[serial]
async fn test_skip_condition_is_evaluated_at_run_time() {
  setup_tracing();
  let after_first: SkipCondition<Trace> = Arc::new(|ctx: &ContextData<Trace>| ctx.read().counter > 0);
  let mut f: Flow<Trace, CoreError> = Flow::new("test", &[("first", false, None), ("second", false, Some(after_first))]);
  f.on("first", record("first"));
  f.on("second", record("second"));

  let ctx = ContextData::new(Trace::default());
  f.run(ctx.clone()).await.unwrap();
  assert_eq!(ctx.read().visited, vec!["first"]);
}

#[tokio::test]
#[serial]
async fn test_unknown_step_is_reported() {
  setup_tracing();
  let f = flow(&[("load", false)]);
  assert_eq!(
    f.check_step("refund"),
    Err(FlowError::StepNotFound {
      flow: "test".to_string(),
      step_name: "refund".to_string(),
    })
  );
}

#[test]
#[should_panic(expected = "flow setup error")]
fn test_registering_on_undeclared_step_panics() {
  let mut f = flow(&[("load", false)]);
  f.on("charge", record("charge"));
}
