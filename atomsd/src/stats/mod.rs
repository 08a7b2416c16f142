//! Process-wide, mutex-guarded counter/histogram registry. Every `note_*`
//! entry point is `O(1)`/bounded and never calls into another component
//! while holding the lock.

use crate::event::ConfigKey;
use crate::report::{
  AtomStatsProto, ConfigStatsProto, SocketReadHistogramEntry, StatsdStatsReport, TimestampList,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

// Bound constants for every unbounded collection this store keeps; see
// DESIGN.md for how each value was chosen.
pub const MAX_TIMESTAMP_COUNT: usize = 20;
pub const MAX_ICE_BOX_SIZE: usize = 20;
pub const MAX_LOGGER_ERRORS: usize = 20;
pub const DIMENSION_KEY_SIZE_SOFT_LIMIT: usize = 500;
pub const DIMENSION_KEY_SIZE_HARD_LIMIT: usize = 800;
pub const MAX_NON_PLATFORM_PUSHED_ATOMS: usize = 100;
pub const MAX_RESTRICTED_METRIC_QUERY_COUNT: usize = 20;
pub const NUM_BINS_IN_SOCKET_BATCH_READ_HISTOGRAM: usize = 30;
pub const LARGE_BATCH_READ_THRESHOLD: i64 = 100;
pub const MAX_LARGE_BATCH_READ_ATOM_THRESHOLD: i64 = 10;
pub const MAX_LARGE_BATCH_READ_SIZE: usize = 20;

/// Per-atom dimension-guardrail override table: tighter or looser limits for
/// a handful of high-cardinality atom ids (binder calls, looper stats,
/// per-uid CPU frequency buckets) that would otherwise blow through the
/// daemon-wide defaults.
pub fn dimension_limit_override(atom_id: u32) -> Option<(usize, usize)> {
  match atom_id {
    // BINDER_CALLS
    147 => Some((6000, 10000)),
    // LOOPER_STATS
    148 => Some((1500, 2500)),
    // CPU_TIME_PER_UID_FREQ
    156 => Some((6000, 10000)),
    _ => None,
  }
}

fn now_sec() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs() as i64)
    .unwrap_or(0)
}

/// Pushes `value` onto a capped `VecDeque`, evicting the oldest entry when
/// full.
fn push_capped<T>(list: &mut VecDeque<T>, value: T, cap: usize) {
  if list.len() >= cap {
    list.pop_front();
  }
  list.push_back(value);
}

#[derive(Debug, Default)]
struct ConfigStats {
  creation_time_sec: i64,
  deletion_time_sec: Option<i64>,
  broadcast_sent_time_sec: VecDeque<i64>,
}

#[derive(Debug, Default)]
struct AtomCounters {
  logged: i64,
  skipped: i64,
  dropped: i64,
}

/// One bucket of the batch-read histogram.
#[derive(Debug, Clone, Copy)]
struct LargeBatchRecord {
  batch_size: i64,
  per_atom_counts: [(u32, i64); MAX_LARGE_BATCH_READ_ATOM_THRESHOLD as usize],
  len: usize,
}

#[derive(Debug, Default)]
struct Inner {
  stats_begin_time_sec: i64,
  configs: HashMap<ConfigKey, ConfigStats>,
  ice_box: VecDeque<(ConfigKey, ConfigStats)>,
  atom_counters: HashMap<u32, AtomCounters>,
  non_platform_pushed_atom_count: usize,
  logger_errors: VecDeque<(i64, i32)>,
  restricted_metric_query_count: usize,
  socket_loss_reported: i64,
  queue_overflow_count: i64,
  bucket_boundary_delay_ns_total: i64,
  socket_batch_read_histogram: [i64; NUM_BINS_IN_SOCKET_BATCH_READ_HISTOGRAM],
  large_batch_reads: Vec<i64>,
  overflow: bool,
  bad_value_type_count: HashMap<i64, i64>,
  pull_data_error_count: HashMap<u32, i64>,
  pull_exceed_max_delay_count: HashMap<u32, i64>,
  late_log_event_skipped_count: HashMap<i64, i64>,
  dimension_guardrail_soft_limit_count: HashMap<i64, i64>,
}

impl Inner {
  fn new() -> Self {
    Self {
      stats_begin_time_sec: now_sec(),
      ..Default::default()
    }
  }
}

/// Process-wide singleton with a single mutex, obtained through
/// [`StatsdStats::instance`]. Built once via `OnceLock` and never replaced
/// afterward.
pub struct StatsdStats {
  inner: Mutex<Inner>,
}

static INSTANCE: OnceLock<StatsdStats> = OnceLock::new();

impl StatsdStats {
  pub fn instance() -> &'static StatsdStats {
    INSTANCE.get_or_init(|| StatsdStats {
      inner: Mutex::new(Inner::new()),
    })
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
    match self.inner.lock() {
      Ok(g) => g,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  pub fn note_config_received(&self, key: ConfigKey) {
    let mut inner = self.lock();
    inner.configs.insert(
      key,
      ConfigStats {
        creation_time_sec: now_sec(),
        ..Default::default()
      },
    );
  }

  /// Removes a config and moves its record into the ice box, evicting the
  /// oldest ice-box entry if full.
  pub fn note_config_removed(&self, key: ConfigKey) {
    let mut inner = self.lock();
    if let Some(mut stats) = inner.configs.remove(&key) {
      stats.deletion_time_sec = Some(now_sec());
      if inner.ice_box.len() >= MAX_ICE_BOX_SIZE {
        inner.ice_box.pop_front();
      }
      inner.ice_box.push_back((key, stats));
    }
  }

  pub fn note_broadcast_sent(&self, key: ConfigKey, t_sec: i64) {
    let mut inner = self.lock();
    if let Some(stats) = inner.configs.get_mut(&key) {
      push_capped(&mut stats.broadcast_sent_time_sec, t_sec, MAX_TIMESTAMP_COUNT);
    }
  }

  pub fn note_atom_logged(&self, atom_id: u32) {
    let mut inner = self.lock();
    inner.atom_counters.entry(atom_id).or_default().logged += 1;
  }

  pub fn note_atom_skipped(&self, atom_id: u32) {
    let mut inner = self.lock();
    inner.atom_counters.entry(atom_id).or_default().skipped += 1;
  }

  /// Accounts one pushed-atom drop. Platform atom ids (below
  /// `MAX_NON_PLATFORM_PUSHED_ATOMS` below is a cap on *non-platform* atoms
  /// specifically) are tracked unconditionally; non-platform atom ids are
  /// capped so an unbounded set of client-defined atom ids can't grow the
  /// table without limit.
  pub fn note_atom_dropped(&self, atom_id: u32, is_platform: bool) {
    let mut inner = self.lock();
    if !is_platform && !inner.atom_counters.contains_key(&atom_id) {
      if inner.non_platform_pushed_atom_count >= MAX_NON_PLATFORM_PUSHED_ATOMS {
        return;
      }
      inner.non_platform_pushed_atom_count += 1;
    }
    inner.atom_counters.entry(atom_id).or_default().dropped += 1;
  }

  pub fn note_socket_loss_reported(&self) {
    self.lock().socket_loss_reported += 1;
  }

  pub fn note_event_queue_overflow(&self) {
    self.lock().queue_overflow_count += 1;
  }

  pub fn note_bucket_boundary_delay_ns(&self, delay_ns: i64) {
    self.lock().bucket_boundary_delay_ns_total += delay_ns;
  }

  /// A value field's raw data didn't decode to a numeric type, or a diffed
  /// value's variant stopped matching its base's (§4.F.8).
  pub fn note_bad_value_type(&self, metric_id: i64) {
    *self.lock().bad_value_type_count.entry(metric_id).or_default() += 1;
  }

  /// A pulled atom's data was missing or malformed for a registered puller.
  pub fn note_pull_data_error(&self, atom_id: u32) {
    *self.lock().pull_data_error_count.entry(atom_id).or_default() += 1;
  }

  /// A pull completed more than `max_pull_delay_ns` after it was scheduled
  /// and the bucket was invalidated rather than aggregated.
  pub fn note_pull_exceed_max_delay(&self, atom_id: u32) {
    *self
      .lock()
      .pull_exceed_max_delay_count
      .entry(atom_id)
      .or_default() += 1;
  }

  /// A pushed event arrived timestamped into an already-closed bucket and
  /// was dropped rather than aggregated.
  pub fn note_late_log_event_skipped(&self, metric_id: i64) {
    *self
      .lock()
      .late_log_event_skipped_count
      .entry(metric_id)
      .or_default() += 1;
  }

  /// A metric's tracked dimension count crossed its soft limit (still below
  /// the hard limit, so new dimensions are still admitted).
  pub fn note_dimension_guardrail_soft_limit_reached(&self, metric_id: i64) {
    *self
      .lock()
      .dimension_guardrail_soft_limit_count
      .entry(metric_id)
      .or_default() += 1;
  }

  /// Records a parse/log-loss error, capped at `MAX_LOGGER_ERRORS`,
  /// evicting the oldest on overflow.
  pub fn note_log_lost(&self, error_code: i32) {
    let mut inner = self.lock();
    push_capped(&mut inner.logger_errors, (now_sec(), error_code), MAX_LOGGER_ERRORS);
  }

  pub fn note_restricted_metric_query(&self) {
    let mut inner = self.lock();
    if inner.restricted_metric_query_count < MAX_RESTRICTED_METRIC_QUERY_COUNT {
      inner.restricted_metric_query_count += 1;
    }
  }

  /// Buckets `batch_size` into the fixed-width batch-read histogram using
  /// the binning in [`batch_read_histogram_bin`] (integer division throughout).
  pub fn note_batch_socket_read(&self, batch_size: i64) {
    let bin = batch_read_histogram_bin(batch_size);
    let mut inner = self.lock();
    inner.socket_batch_read_histogram[bin] += 1;
    if batch_size >= LARGE_BATCH_READ_THRESHOLD {
      if inner.large_batch_reads.len() >= MAX_LARGE_BATCH_READ_SIZE {
        inner.overflow = true;
      } else {
        inner.large_batch_reads.push(batch_size);
      }
    }
  }

  /// `dump(reset) -> bytes`. `reset=true` clears historical
  /// counters but retains records for configs still installed.
  pub fn dump(&self, reset: bool) -> Vec<u8> {
    let mut inner = self.lock();
    let end_time_sec = now_sec();

    let config_stats = inner
      .configs
      .iter()
      .map(|(key, stats)| ConfigStatsProto {
        uid: key.uid,
        config_id: key.config_id,
        creation_time_sec: stats.creation_time_sec,
        deletion_time_sec: stats.deletion_time_sec,
        broadcast_sent_time_sec: Some(TimestampList {
          timestamp_sec: stats.broadcast_sent_time_sec.iter().copied().collect(),
        }),
      })
      .collect();

    let atom_stats = inner
      .atom_counters
      .iter()
      .map(|(atom_id, counters)| AtomStatsProto {
        atom_id: *atom_id as i32,
        count: counters.logged,
      })
      .collect();

    let socket_read_histogram = inner
      .socket_batch_read_histogram
      .iter()
      .enumerate()
      .filter(|(_, count)| **count > 0)
      .map(|(bin, count)| SocketReadHistogramEntry {
        bin: bin as u32,
        count: *count,
      })
      .collect();

    let report = StatsdStatsReport {
      stats_begin_time_sec: inner.stats_begin_time_sec,
      stats_end_time_sec: end_time_sec,
      config_stats,
      atom_stats,
      socket_read_histogram,
      overflow: inner.overflow,
    };

    if reset {
      inner.atom_counters.clear();
      inner.non_platform_pushed_atom_count = 0;
      inner.logger_errors.clear();
      inner.restricted_metric_query_count = 0;
      inner.socket_loss_reported = 0;
      inner.queue_overflow_count = 0;
      inner.bucket_boundary_delay_ns_total = 0;
      inner.socket_batch_read_histogram = [0; NUM_BINS_IN_SOCKET_BATCH_READ_HISTOGRAM];
      inner.large_batch_reads.clear();
      inner.overflow = false;
      inner.bad_value_type_count.clear();
      inner.pull_data_error_count.clear();
      inner.pull_exceed_max_delay_count.clear();
      inner.late_log_event_skipped_count.clear();
      inner.dimension_guardrail_soft_limit_count.clear();
      inner.stats_begin_time_sec = end_time_sec;
      // Active configs are retained (reset semantics, ).
    }

    crate::report::encode(&report)
  }
}

/// Fixed-width bucketing for the batch-read histogram (integer division
/// throughout, widening bucket width as batch size grows).
pub fn batch_read_histogram_bin(size: i64) -> usize {
  let bin = if size < 0 {
    0
  } else if size < 5 {
    size
  } else if size < 10 {
    4 + size / 5
  } else if size < 100 {
    5 + size / 10
  } else if size < 1000 {
    14 + size / 100
  } else if size < 2000 {
    19 + size / 200
  } else {
    29
  };
  bin as usize
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn histogram_binning_matches_original() {
    assert_eq!(batch_read_histogram_bin(-1), 0);
    assert_eq!(batch_read_histogram_bin(0), 0);
    assert_eq!(batch_read_histogram_bin(4), 4);
    assert_eq!(batch_read_histogram_bin(5), 5);
    assert_eq!(batch_read_histogram_bin(9), 5);
    assert_eq!(batch_read_histogram_bin(10), 6);
    assert_eq!(batch_read_histogram_bin(99), 14);
    assert_eq!(batch_read_histogram_bin(100), 15);
    assert_eq!(batch_read_histogram_bin(999), 23);
    assert_eq!(batch_read_histogram_bin(1000), 24);
    assert_eq!(batch_read_histogram_bin(1999), 28);
    assert_eq!(batch_read_histogram_bin(2000), 29);
    assert_eq!(batch_read_histogram_bin(50_000), 29);
  }

  #[test]
  fn timestamp_list_evicts_oldest_past_cap() {
    let stats = StatsdStats {
      inner: Mutex::new(Inner::new()),
    };
    let key = ConfigKey {
      uid: 1,
      config_id: 1,
    };
    stats.note_config_received(key);
    for i in 0..(MAX_TIMESTAMP_COUNT as i64 + 5) {
      stats.note_broadcast_sent(key, i);
    }
    let inner = stats.lock();
    let list = &inner.configs[&key].broadcast_sent_time_sec;
    assert_eq!(list.len(), MAX_TIMESTAMP_COUNT);
    assert_eq!(*list.front().unwrap(), 5);
    assert_eq!(*list.back().unwrap(), MAX_TIMESTAMP_COUNT as i64 + 4);
  }

  #[test]
  fn dimension_override_table_has_known_rows() {
    assert_eq!(dimension_limit_override(147), Some((6000, 10000)));
    assert_eq!(dimension_limit_override(1), None);
  }
}
