//! External-collaborator trait contracts.
//!
//! Small traits with default method bodies so a caller only needs to
//! implement the one or two methods it actually cares about. `value_metric`
//! depends only on these traits, never on a concrete matcher/condition/state
//! implementation: matching, conditions and state are resolved by external
//! collaborators, and the producer itself never parses an atom definition.

use crate::event::{ActiveConditionState, LogEvent, StateValue};

/// Decides whether a given event satisfies a metric's "what" clause and, if
/// so, extracts the dimension-in-what field values. Implemented per metric
/// by whatever owns atom/field schemas; [`value_metric`](crate::value_metric)
/// only ever calls through this trait.
pub trait AtomMatcher {
  /// Returns the dimension-in-what tuple for `event`, or `None` if `event`
  /// does not match this metric's "what" clause.
  fn matches(&self, event: &LogEvent) -> Option<Vec<StateValue>>;
}

/// Tracks a metric's `condition` clause. `value_metric` polls
/// [`ConditionTracker::is_condition_true`] rather than evaluating any
/// predicate itself.
pub trait ConditionTracker {
  fn is_condition_true(&self) -> bool;

  /// Nanosecond timestamp of the condition's most recent true/false
  /// transition, used to compute `condition_true_ns`/`condition_correction_ns`.
  fn last_transition_ns(&self) -> i64;
}

/// Tracks one sliced-by state atom and reports the combined active/unknown
/// state for a given dimension.
pub trait StateTracker {
  fn active_state(&self, dimension: &[StateValue]) -> ActiveConditionState;

  /// The state value(s) to append to a bucket's `state_values`, or an empty
  /// vec if this metric isn't sliced by state.
  fn state_values(&self, dimension: &[StateValue]) -> Vec<StateValue>;
}

/// Periodically invoked for pulled atoms. Implementations perform the
/// actual pull (binder call, /proc read, etc.); `value_metric` only ever
/// calls [`Puller::pull`] and applies the documented pre-aggregation-by-
/// dimension quirk to the result.
pub trait Puller {
  fn pull(&self, atom_id: u32) -> Vec<LogEvent>;
}

/// Observes finalized buckets for anomaly/alert evaluation. Default no-op
/// method bodies mean most implementations only need to override the one
/// hook they actually care about.
pub trait AnomalyTracker {
  fn on_bucket_closed(&self, _metric_id: i64, _value: &crate::event::NumericValue) {}

  fn on_producer_started(&self) {}

  fn on_producer_shutdown(&self) {}
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::NumericValue;

  struct AlwaysTrue;
  impl ConditionTracker for AlwaysTrue {
    fn is_condition_true(&self) -> bool {
      true
    }
    fn last_transition_ns(&self) -> i64 {
      0
    }
  }

  struct NoopAnomaly;
  impl AnomalyTracker for NoopAnomaly {}

  #[test]
  fn default_anomaly_hooks_are_noop() {
    let tracker = NoopAnomaly;
    tracker.on_bucket_closed(1, &NumericValue::I64(5));
    tracker.on_producer_started();
    tracker.on_producer_shutdown();
  }

  #[test]
  fn condition_tracker_contract() {
    let c = AlwaysTrue;
    assert!(c.is_condition_true());
  }
}
