// tessera/src/flow/control.rs

/// Returned by every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
  /// Go on with the remaining handlers and steps.
  Continue,
  /// Halt the flow right here. Nothing else runs.
  Stop,
}

/// How a whole run ended when no handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
  Completed,
  Stopped,
}
