//! Hand-authored `prost::Message` structs for the report schemas. No
//! `build.rs`/`prost-build`/`protoc` step: these derive `::prost::Message`
//! directly, with field numbers assigned to match the wire layout the
//! aggregation engine and stats store are dumped in.

use prost::Message;

/// One `(agg_index, value, sample_size?)` row within a bucket
/// (`FIELD_ID_VALUE_INDEX=1, FIELD_ID_VALUE_LONG=2, FIELD_ID_VALUE_DOUBLE=3,
/// FIELD_ID_VALUE_SAMPLESIZE=4`).
#[derive(Clone, PartialEq, Message)]
pub struct ValueMetricDatum {
  #[prost(uint32, tag = "1")]
  pub value_index: u32,
  #[prost(int64, optional, tag = "2")]
  pub value_long: Option<i64>,
  #[prost(double, optional, tag = "3")]
  pub value_double: Option<f64>,
  #[prost(uint64, optional, tag = "4")]
  pub sample_size: Option<u64>,
}

/// One bucket's worth of value-metric output
/// (`FIELD_ID_BUCKET_NUM=4, FIELD_ID_START_BUCKET_ELAPSED_MILLIS=5,
/// FIELD_ID_END_BUCKET_ELAPSED_MILLIS=6, FIELD_ID_VALUES=9,
/// FIELD_ID_CONDITION_TRUE_NS=10, FIELD_ID_CONDITION_CORRECTION_NS=11`).
#[derive(Clone, PartialEq, Message)]
pub struct ValueBucketInfo {
  #[prost(int64, tag = "4")]
  pub bucket_num: i64,
  #[prost(int64, tag = "5")]
  pub start_bucket_elapsed_millis: i64,
  #[prost(int64, tag = "6")]
  pub end_bucket_elapsed_millis: i64,
  #[prost(message, repeated, tag = "9")]
  pub values: Vec<ValueMetricDatum>,
  #[prost(int64, optional, tag = "10")]
  pub condition_true_ns: Option<i64>,
  #[prost(int64, optional, tag = "11")]
  pub condition_correction_ns: Option<i64>,
}

/// `FIELD_ID_VALUE_METRICS = 7` — one producer's worth of past buckets,
/// keyed by dimension (dimension key itself is left opaque here since the
/// dimension/state schema is an external-collaborator concern; callers key
/// the outer report map by the caller's own dimension encoding).
#[derive(Clone, PartialEq, Message)]
pub struct ValueMetricData {
  #[prost(message, repeated, tag = "7")]
  pub bucket_info: Vec<ValueBucketInfo>,
}

/// Top-level `StatsLogReport`-equivalent envelope.
#[derive(Clone, PartialEq, Message)]
pub struct StatsLogReport {
  #[prost(int64, tag = "1")]
  pub metric_id: i64,
  #[prost(message, optional, tag = "2")]
  pub value_metrics: Option<ValueMetricData>,
}

/// A single `(timestamp_sec)` entry within a capped timestamp list.
#[derive(Clone, PartialEq, Message)]
pub struct TimestampList {
  #[prost(int64, repeated, tag = "1")]
  pub timestamp_sec: Vec<i64>,
}

/// Per-config health counters, covering the subset of per-config state the
/// stats store tracks directly.
#[derive(Clone, PartialEq, Message)]
pub struct ConfigStatsProto {
  #[prost(int32, tag = "1")]
  pub uid: i32,
  #[prost(int64, tag = "2")]
  pub config_id: i64,
  #[prost(int64, tag = "3")]
  pub creation_time_sec: i64,
  #[prost(int64, optional, tag = "4")]
  pub deletion_time_sec: Option<i64>,
  #[prost(message, optional, tag = "5")]
  pub broadcast_sent_time_sec: Option<TimestampList>,
}

/// Per-atom pushed/dropped counters.
#[derive(Clone, PartialEq, Message)]
pub struct AtomStatsProto {
  #[prost(int32, tag = "1")]
  pub atom_id: i32,
  #[prost(int64, tag = "2")]
  pub count: i64,
}

/// One row of the batch-read histogram.
#[derive(Clone, PartialEq, Message)]
pub struct SocketReadHistogramEntry {
  #[prost(uint32, tag = "1")]
  pub bin: u32,
  #[prost(int64, tag = "2")]
  pub count: i64,
}

/// Top-level `StatsdStatsReport`-equivalent envelope
/// (`FIELD_ID_BEGIN_TIME=1, FIELD_ID_END_TIME=2, FIELD_ID_CONFIG_STATS=3,
/// FIELD_ID_ATOM_STATS=7, FIELD_ID_OVERFLOW=18`).
#[derive(Clone, PartialEq, Message)]
pub struct StatsdStatsReport {
  #[prost(int64, tag = "1")]
  pub stats_begin_time_sec: i64,
  #[prost(int64, tag = "2")]
  pub stats_end_time_sec: i64,
  #[prost(message, repeated, tag = "3")]
  pub config_stats: Vec<ConfigStatsProto>,
  #[prost(message, repeated, tag = "7")]
  pub atom_stats: Vec<AtomStatsProto>,
  #[prost(message, repeated, tag = "17")]
  pub socket_read_histogram: Vec<SocketReadHistogramEntry>,
  #[prost(bool, tag = "18")]
  pub overflow: bool,
}

/// Encodes any `prost::Message` into its wire bytes.
pub fn encode<M: Message>(msg: &M) -> Vec<u8> {
  msg.encode_to_vec()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_round_trip_value_bucket() {
    let bucket = ValueBucketInfo {
      bucket_num: 0,
      start_bucket_elapsed_millis: 0,
      end_bucket_elapsed_millis: 1000,
      values: vec![ValueMetricDatum {
        value_index: 0,
        value_long: Some(42),
        value_double: None,
        sample_size: Some(2),
      }],
      condition_true_ns: None,
      condition_correction_ns: Some(2_000_000),
    };
    let bytes = encode(&bucket);
    let decoded = ValueBucketInfo::decode(bytes.as_slice()).unwrap();
    assert_eq!(decoded, bucket);
  }
}
