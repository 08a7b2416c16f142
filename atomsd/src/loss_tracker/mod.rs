//! Per-producer accounting of failed sends, synthesized as a
//! `socket_loss_reported` atom on the next successful send.

use crate::atom::AtomBuilder;
use std::collections::HashMap;

/// Cap on distinct `(atom_id, error_code)` entries before further losses
/// roll into the overflow counter.
const MAX_LOSS_TRACKER_ENTRIES: usize = 20;

/// The reserved atom id for the synthetic loss-report atom this tracker
/// emits. Chosen arbitrarily within this crate's own atom-id space since
/// the wire contract only requires a stable schema, not a specific id
/// shared with any external registry.
pub const SOCKET_LOSS_REPORTED_ATOM_ID: u32 = 900_000;

#[derive(Debug, Clone, Copy, Default)]
struct LossRecord {
  count: u64,
  first_loss_ns: i64,
  last_loss_ns: i64,
}

/// `(atom_id, error_code) -> count`, with monotonic first/last loss
/// timestamps and an overflow counter once the table is full.
#[derive(Debug, Default)]
pub struct LossTracker {
  table: HashMap<(u32, i32), LossRecord>,
  overflow_counter: u64,
}

impl LossTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Records one failed send of `atom_id` with the given negative errno,
  /// at time `now_ns`.
  pub fn note_loss(&mut self, atom_id: u32, error_code: i32, now_ns: i64) {
    let key = (atom_id, error_code);
    if let Some(existing) = self.table.get_mut(&key) {
      existing.count += 1;
      existing.last_loss_ns = now_ns;
      return;
    }
    if self.table.len() >= MAX_LOSS_TRACKER_ENTRIES {
      self.overflow_counter += 1;
      return;
    }
    self.table.insert(
      key,
      LossRecord {
        count: 1,
        first_loss_ns: now_ns,
        last_loss_ns: now_ns,
      },
    );
  }

  pub fn is_empty(&self) -> bool {
    self.table.is_empty() && self.overflow_counter == 0
  }

  /// Encodes the current table as a `socket_loss_reported` atom record and
  /// resets it, draining on the next successful send of any atom. The
  /// caller is responsible for actually sending the returned datagram.
  pub fn drain_to_atom(&mut self, now_ns: i64) -> Option<Vec<u8>> {
    if self.is_empty() {
      return None;
    }
    let mut builder = AtomBuilder::obtain();
    builder.set_atom_id(SOCKET_LOSS_REPORTED_ATOM_ID).ok()?;
    builder.overwrite_timestamp(now_ns);

    let entries: Vec<_> = self.table.drain().collect();
    let atom_ids: Vec<i32> = entries.iter().map(|((atom_id, _), _)| *atom_id as i32).collect();
    let error_codes: Vec<i32> = entries.iter().map(|((_, err), _)| *err).collect();
    let counts: Vec<i64> = entries.iter().map(|(_, rec)| rec.count as i64).collect();
    let first_loss_ns: Vec<i64> = entries.iter().map(|(_, rec)| rec.first_loss_ns).collect();
    let last_loss_ns: Vec<i64> = entries.iter().map(|(_, rec)| rec.last_loss_ns).collect();

    builder.write_i32_array(&atom_ids);
    builder.write_i32_array(&error_codes);
    builder.write_i64_array(&counts);
    builder.write_i64_array(&first_loss_ns);
    builder.write_i64_array(&last_loss_ns);
    builder.write_i64(self.overflow_counter as i64);

    self.overflow_counter = 0;
    let (datagram, _errors) = builder.write();
    Some(datagram)
  }
}
