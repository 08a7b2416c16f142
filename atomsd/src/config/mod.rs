//! Daemon configuration: environment-variable driven, with fixed defaults
//! used when a variable is absent. A plain struct with a `from_env`
//! constructor, read once at startup rather than parsed from a config file.

use crate::stats::dimension_limit_override;
use crate::producer_queue::QueueRoutingTable;
use std::env;

fn env_usize(name: &str, default: usize) -> usize {
  env::var(name)
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
  env::var(name)
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
  env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Resolved daemon configuration, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
  pub socket_name: String,
  pub queue_capacity: usize,
  pub default_bucket_size_ns: i64,
  pub dimension_soft_limit: usize,
  pub dimension_hard_limit: usize,
}

impl DaemonConfig {
  /// Built-in fallback when no environment overrides are present. The
  /// bucket size default (60s) and dimension guardrail defaults
  /// (soft=800, hard=1000) mirror the aggregation engine's
  /// unannotated defaults.
  pub fn defaults() -> Self {
    Self {
      socket_name: "atomsd".to_string(),
      queue_capacity: 1024,
      default_bucket_size_ns: 60_000_000_000,
      dimension_soft_limit: 800,
      dimension_hard_limit: 1000,
    }
  }

  pub fn from_env() -> Self {
    let d = Self::defaults();
    Self {
      socket_name: env_string("ATOMSD_SOCKET_NAME", &d.socket_name),
      queue_capacity: env_usize("ATOMSD_QUEUE_CAPACITY", d.queue_capacity),
      default_bucket_size_ns: env_i64("ATOMSD_DEFAULT_BUCKET_SIZE_NS", d.default_bucket_size_ns),
      dimension_soft_limit: env_usize("ATOMSD_DIMENSION_SOFT_LIMIT", d.dimension_soft_limit),
      dimension_hard_limit: env_usize("ATOMSD_DIMENSION_HARD_LIMIT", d.dimension_hard_limit),
    }
  }

  /// Resolves the effective dimension guardrail for `atom_id`, applying the
  /// per-atom override table ahead of the daemon-wide defaults.
  pub fn dimension_limits_for(&self, atom_id: u32) -> (usize, usize) {
    dimension_limit_override(atom_id).unwrap_or((self.dimension_soft_limit, self.dimension_hard_limit))
  }

  /// The fixed set of atom ids routed through the producer queue rather
  /// than written synchronously: frequently-logged, latency-sensitive atoms
  /// (binder calls, looper stats); any atom id not in this set is written
  /// inline.
  pub fn queue_routing_table(&self) -> QueueRoutingTable {
    QueueRoutingTable::new([147, 148, 156])
  }
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self::defaults()
  }
}
