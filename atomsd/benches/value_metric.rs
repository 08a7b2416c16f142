//! Aggregation hot-path benchmark, exercising the matched-event diff path
//! repeatedly against one dimension within a single open bucket.

use atomsd::collector::{AtomMatcher, ConditionTracker, StateTracker};
use atomsd::event::{
  ActiveConditionState, AggregationType, Field, FieldPath, FieldValue, LogEvent, StateValue,
  ValueDirection,
};
use atomsd::value_metric::{NumericValueMetricProducer, ValueFieldSpec, ValueMetricSpec};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tabled::{Table, Tabled};

struct MatchAll;
impl AtomMatcher for MatchAll {
  fn matches(&self, _event: &LogEvent) -> Option<Vec<StateValue>> {
    Some(vec![FieldValue::I32(1)])
  }
}

struct AlwaysTrue;
impl ConditionTracker for AlwaysTrue {
  fn is_condition_true(&self) -> bool {
    true
  }
  fn last_transition_ns(&self) -> i64 {
    0
  }
}

struct NoState;
impl StateTracker for NoState {
  fn active_state(&self, _dimension: &[StateValue]) -> ActiveConditionState {
    ActiveConditionState::ActiveConditionTrue
  }
  fn state_values(&self, _dimension: &[StateValue]) -> Vec<StateValue> {
    Vec::new()
  }
}

fn event_with_value(ts_ns: i64, value: i64) -> LogEvent {
  let mut e = LogEvent::new(ts_ns, 0);
  e.set_atom_id(42);
  e.fields.push(Field {
    path: FieldPath {
      atom_id: 42,
      nested: [0, 0, 0],
      depth: 0,
    },
    value: FieldValue::I64(value),
    annotations: Vec::new(),
  });
  e
}

fn spec() -> ValueMetricSpec {
  ValueMetricSpec {
    metric_id: 1,
    bucket_size_ns: 60_000_000_000,
    value_fields: vec![ValueFieldSpec {
      field_index: 0,
      aggregation_type: AggregationType::Sum,
      value_direction: ValueDirection::Increasing,
      use_zero_default_base: false,
      use_diff: true,
      use_absolute_value_on_reset: false,
    }],
    is_pulled: false,
    pulled_atom_id: 0,
    dimension_soft_limit: 800,
    dimension_hard_limit: 1000,
    upload_threshold: None,
    condition_required: false,
    include_sample_size: false,
    max_pull_delay_ns: atomsd::value_metric::DEFAULT_MAX_PULL_DELAY_NS,
    condition_correction_threshold_ns: None,
  }
}

/// One row of the pre-benchmark bucket summary printed to stdout.
#[derive(Debug, Clone, Tabled)]
struct BucketSummaryRow {
  #[tabled(rename = "Bucket")]
  bucket: usize,
  #[tabled(rename = "Start (ns)")]
  start_ns: i64,
  #[tabled(rename = "End (ns)")]
  end_ns: i64,
  #[tabled(rename = "Aggregate")]
  aggregate: String,
}

/// Runs the same 1000-event ingestion the benchmark measures once up front
/// and prints a summary table of the resulting buckets, so a human skimming
/// benchmark output can sanity-check what's actually being measured.
fn print_bucket_summary() {
  let mut producer = NumericValueMetricProducer::new(spec(), MatchAll, AlwaysTrue, NoState, 0);
  let mut value = 0i64;
  for i in 0..1000 {
    value += 10;
    producer.on_matched_log_event(&event_with_value(i * 1000, value));
  }
  producer.dump_report(1_000_000);

  let rows: Vec<_> = producer
    .past_buckets()
    .iter()
    .enumerate()
    .map(|(i, b)| BucketSummaryRow {
      bucket: i,
      start_ns: b.start_ns,
      end_ns: b.end_ns,
      aggregate: format!("{:?}", b.aggregates),
    })
    .collect();
  println!("{}", Table::new(rows));
}

fn bench_matched_event_ingestion(c: &mut Criterion) {
  print_bucket_summary();
  c.bench_function("value_metric_matched_event", |b| {
    b.iter(|| {
      let mut producer = NumericValueMetricProducer::new(spec(), MatchAll, AlwaysTrue, NoState, 0);
      let mut value = 0i64;
      for i in 0..1000 {
        value += 10;
        producer.on_matched_log_event(black_box(&event_with_value(i * 1000, value)));
      }
      black_box(producer)
    })
  });
}

criterion_group!(benches, bench_matched_event_ingestion);
criterion_main!(benches);
