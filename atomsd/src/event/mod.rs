//! Parsed in-memory data model shared by the codec, matchers and the
//! aggregation engine.
//!
//! `atom::decode` turns a wire-format record into a [`LogEvent`]; everything
//! downstream (dimension projection, diffing, bucketing) operates on these
//! types rather than on raw bytes.

use smallvec::SmallVec;
use std::cmp::Ordering as CmpOrdering;
use std::hash::{Hash, Hasher};

/// One `(uid, tag)` pair in an attribution chain (length capped at 127 by
/// the codec, not by this type).
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionNode {
  pub uid: u32,
  pub tag: String,
}

/// A single typed field value, tagged by wire element type.
///
/// Arrays use `SmallVec` with an 8-element inline capacity: most atoms in
/// practice carry small arrays, and this avoids a heap allocation for the
/// common case while still supporting up to the codec's 127-element cap.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
  I32(i32),
  I64(i64),
  F32(f32),
  F64(f64),
  Bool(bool),
  String(String),
  Bytes(Vec<u8>),
  AttributionChain(Vec<AttributionNode>),
  I32Array(SmallVec<[i32; 8]>),
  I64Array(SmallVec<[i64; 8]>),
  F32Array(SmallVec<[f32; 8]>),
  F64Array(SmallVec<[f64; 8]>),
  BoolArray(SmallVec<[bool; 8]>),
  StringArray(Vec<String>),
}

impl FieldValue {
  /// Structural equality/hash/order key for dimension projection. Floats
  /// compare by bit pattern so `FieldValue` can live inside a
  /// `HashableDimensionKey` without requiring `Eq`/`Hash`/`Ord` on
  /// `f32`/`f64` themselves.
  pub fn structural_key(&self) -> Vec<u8> {
    let mut out = Vec::new();
    match self {
      FieldValue::I32(v) => {
        out.push(1);
        out.extend_from_slice(&v.to_le_bytes());
      },
      FieldValue::I64(v) => {
        out.push(2);
        out.extend_from_slice(&v.to_le_bytes());
      },
      FieldValue::F32(v) => {
        out.push(3);
        out.extend_from_slice(&v.to_bits().to_le_bytes());
      },
      FieldValue::F64(v) => {
        out.push(4);
        out.extend_from_slice(&v.to_bits().to_le_bytes());
      },
      FieldValue::Bool(v) => {
        out.push(5);
        out.push(*v as u8);
      },
      FieldValue::String(v) => {
        out.push(6);
        out.extend_from_slice(v.as_bytes());
      },
      FieldValue::Bytes(v) => {
        out.push(7);
        out.extend_from_slice(v);
      },
      FieldValue::AttributionChain(chain) => {
        out.push(8);
        for node in chain {
          out.extend_from_slice(&node.uid.to_le_bytes());
          out.extend_from_slice(node.tag.as_bytes());
          out.push(0);
        }
      },
      FieldValue::I32Array(vs) => {
        out.push(9);
        for v in vs {
          out.extend_from_slice(&v.to_le_bytes());
        }
      },
      FieldValue::I64Array(vs) => {
        out.push(10);
        for v in vs {
          out.extend_from_slice(&v.to_le_bytes());
        }
      },
      FieldValue::F32Array(vs) => {
        out.push(11);
        for v in vs {
          out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
      },
      FieldValue::F64Array(vs) => {
        out.push(12);
        for v in vs {
          out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
      },
      FieldValue::BoolArray(vs) => {
        out.push(13);
        for v in vs {
          out.push(*v as u8);
        }
      },
      FieldValue::StringArray(vs) => {
        out.push(14);
        for v in vs {
          out.extend_from_slice(v.as_bytes());
          out.push(0);
        }
      },
    }
    out
  }

  /// Extracts this field as a [`NumericValue`], for use as a metric value
  /// field or diff base. Returns `None` for anything that isn't
  /// int/long/float/double (spec: "bad value type").
  pub fn as_numeric(&self) -> Option<NumericValue> {
    match self {
      FieldValue::I32(v) => Some(NumericValue::I64(*v as i64)),
      FieldValue::I64(v) => Some(NumericValue::I64(*v)),
      FieldValue::F32(v) => Some(NumericValue::F64(*v as f64)),
      FieldValue::F64(v) => Some(NumericValue::F64(*v)),
      _ => None,
    }
  }
}

/// Annotation payload: either a bool or an i32
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnnotationValue {
  Bool(bool),
  I32(i32),
}

/// A `(annotation_id, value)` pair attached to an atom or to a single field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Annotation {
  pub id: u8,
  pub value: AnnotationValue,
}

/// Positional path of a field within its atom: up to three nested indices
/// plus a depth, `FieldValue` path description
/// (attribution-chain and repeated-message nesting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldPath {
  pub atom_id: u32,
  pub nested: [u8; 3],
  pub depth: u8,
}

/// One field within a parsed [`LogEvent`]: its positional path, value, and
/// any annotations that trailed it on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
  pub path: FieldPath,
  pub value: FieldValue,
  pub annotations: Vec<Annotation>,
}

/// The parsed in-memory form of an atom record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
  atom_id: u32,
  atom_id_set: bool,
  pub timestamp_ns: i64,
  pub logger_uid: u32,
  pub atom_annotations: Vec<Annotation>,
  pub fields: Vec<Field>,
}

impl LogEvent {
  pub fn new(timestamp_ns: i64, logger_uid: u32) -> Self {
    Self {
      atom_id: 0,
      atom_id_set: false,
      timestamp_ns,
      logger_uid,
      atom_annotations: Vec::new(),
      fields: Vec::new(),
    }
  }

  /// A `LogEvent`'s atom id is set exactly once; later calls are ignored.
  pub fn set_atom_id(&mut self, id: u32) {
    if !self.atom_id_set {
      self.atom_id = id;
      self.atom_id_set = true;
    }
  }

  pub fn atom_id(&self) -> u32 {
    self.atom_id
  }

  pub fn push_field(&mut self, path: FieldPath, value: FieldValue) {
    self.fields.push(Field {
      path,
      value,
      annotations: Vec::new(),
    });
  }

  /// Looks up a field by its shallow position (nested[0]), the common case
  /// for dimension/value-field selectors that target a top-level field.
  pub fn field_at(&self, index: usize) -> Option<&Field> {
    self.fields.get(index)
  }
}

/// Tagged numeric union used for diff bases and aggregates. Replaces the
/// original's `variant`-style value; all arithmetic dispatches on tag and
/// reports *bad value type* on a mismatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericValue {
  I64(i64),
  F64(f64),
  Unset,
}

impl NumericValue {
  pub fn is_unset(&self) -> bool {
    matches!(self, NumericValue::Unset)
  }

  /// `value - base`, requiring both sides to share a variant. Returns
  /// `None` on a variant mismatch (caller records *bad value type*).
  pub fn checked_sub(&self, base: &NumericValue) -> Option<NumericValue> {
    match (self, base) {
      (NumericValue::I64(a), NumericValue::I64(b)) => Some(NumericValue::I64(a - b)),
      (NumericValue::F64(a), NumericValue::F64(b)) => Some(NumericValue::F64(a - b)),
      _ => None,
    }
  }

  /// Ordering used by the `INCREASING`/`DECREASING` direction checks.
  /// Returns `None` on a variant mismatch.
  pub fn partial_cmp_checked(&self, other: &NumericValue) -> Option<CmpOrdering> {
    match (self, other) {
      (NumericValue::I64(a), NumericValue::I64(b)) => Some(a.cmp(b)),
      (NumericValue::F64(a), NumericValue::F64(b)) => a.partial_cmp(b),
      _ => None,
    }
  }

  pub fn add_assign_checked(&mut self, other: &NumericValue) -> bool {
    match (self, other) {
      (NumericValue::I64(a), NumericValue::I64(b)) => {
        *a += b;
        true
      },
      (NumericValue::F64(a), NumericValue::F64(b)) => {
        *a += b;
        true
      },
      _ => false,
    }
  }

  pub fn min_assign_checked(&mut self, other: &NumericValue) -> bool {
    match (self, other) {
      (NumericValue::I64(a), NumericValue::I64(b)) => {
        if b < a {
          *a = *b;
        }
        true
      },
      (NumericValue::F64(a), NumericValue::F64(b)) => {
        if b < a {
          *a = *b;
        }
        true
      },
      _ => false,
    }
  }

  pub fn max_assign_checked(&mut self, other: &NumericValue) -> bool {
    match (self, other) {
      (NumericValue::I64(a), NumericValue::I64(b)) => {
        if b > a {
          *a = *b;
        }
        true
      },
      (NumericValue::F64(a), NumericValue::F64(b)) => {
        if b > a {
          *a = *b;
        }
        true
      },
      _ => false,
    }
  }

  pub fn is_zero(&self) -> bool {
    match self {
      NumericValue::I64(v) => *v == 0,
      NumericValue::F64(v) => *v == 0.0,
      NumericValue::Unset => false,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      NumericValue::I64(v) => Some(*v as f64),
      NumericValue::F64(v) => Some(*v),
      NumericValue::Unset => None,
    }
  }
}

/// A state-tracker output value included in a dimension key. `StateTracker`
/// implementations (external, see `collector`) produce these; the core only
/// needs to project, compare and hash them.
pub type StateValue = FieldValue;

/// Structural, hashable projection of a metric's dimension selector
///. Equality and hashing are structural,
/// not identity-based, so two events with the same dimension field values
/// land in the same bucket entry.
#[derive(Debug, Clone)]
pub struct HashableDimensionKey(pub Vec<FieldValue>);

impl HashableDimensionKey {
  /// Concatenated structural keys of every projected field, used both as
  /// the `Eq`/`Hash` implementation and as a stable sort key so report
  /// output iterates dimensions in a deterministic order.
  fn sort_key(&self) -> Vec<u8> {
    let mut out = Vec::new();
    for v in &self.0 {
      let k = v.structural_key();
      out.extend_from_slice(&(k.len() as u32).to_le_bytes());
      out.extend_from_slice(&k);
    }
    out
  }
}

impl PartialEq for HashableDimensionKey {
  fn eq(&self, other: &Self) -> bool {
    self.sort_key() == other.sort_key()
  }
}
impl Eq for HashableDimensionKey {}

impl Hash for HashableDimensionKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.sort_key().hash(state);
  }
}

impl PartialOrd for HashableDimensionKey {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}
impl Ord for HashableDimensionKey {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    self.sort_key().cmp(&other.sort_key())
  }
}

/// `StateValue` wrapped with the same structural equality as
/// `HashableDimensionKey`, so it can live inside `MetricDimensionKey`'s
/// derived `Eq`/`Hash`.
#[derive(Debug, Clone)]
pub struct FieldValueKey(pub FieldValue);
impl PartialEq for FieldValueKey {
  fn eq(&self, other: &Self) -> bool {
    self.0.structural_key() == other.0.structural_key()
  }
}
impl Eq for FieldValueKey {}
impl Hash for FieldValueKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.0.structural_key().hash(state);
  }
}
impl PartialOrd for FieldValueKey {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}
impl Ord for FieldValueKey {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    self.0.structural_key().cmp(&other.0.structural_key())
  }
}

/// `(dimension_in_what, state_values)` — the full key a numeric metric
/// buckets by. Implements `Ord` (on top of the structural `Eq`/`Hash` above)
/// so a `BTreeMap<MetricDimensionKey, _>` gives deterministic iteration
/// order for report output, per spec.md §9.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricDimensionKey {
  pub dimension_in_what: HashableDimensionKey,
  pub state_values: Vec<FieldValueKey>,
}

/// Per value-field aggregate state within one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
  pub agg_index: u32,
  pub sample_size: u64,
  pub aggregate: NumericValue,
}

impl Interval {
  pub fn new(agg_index: u32) -> Self {
    Self {
      agg_index,
      sample_size: 0,
      aggregate: NumericValue::Unset,
    }
  }

  pub fn has_value(&self) -> bool {
    !self.aggregate.is_unset()
  }
}

/// Per-dimension diff-base storage: one base value
/// per configured value field, persisting across bucket rolls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DimInfo {
  pub dim_extras: Vec<NumericValue>,
}

/// Reasons a bucket can be invalidated instead of emitted normally
///. The first six reset per-dimension bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketDropReason {
  DumpReportRequested,
  EventInWrongBucket,
  ConditionUnknown,
  PullFailed,
  PullDelayed,
  DimensionGuardrailReached,
  MultipleBucketsSkipped,
  BucketTooSmall,
}

impl BucketDropReason {
  /// Whether this reason resets per-dimension bases
  /// ("the first six additionally call reset_base").
  pub fn resets_base(&self) -> bool {
    !matches!(
      self,
      BucketDropReason::MultipleBucketsSkipped | BucketDropReason::BucketTooSmall
    )
  }
}

/// A closed bucket's emitted (or skipped) state.
#[derive(Debug, Clone, PartialEq)]
pub struct PastBucket {
  pub start_ns: i64,
  pub end_ns: i64,
  pub agg_index: Vec<u32>,
  pub aggregates: Vec<NumericValue>,
  pub sample_sizes: Vec<Option<u64>>,
  pub condition_true_ns: Option<i64>,
  pub condition_correction_ns: Option<i64>,
  pub skipped_reason: Option<BucketDropReason>,
}

impl PastBucket {
  pub fn skipped(start_ns: i64, end_ns: i64, reason: BucketDropReason) -> Self {
    Self {
      start_ns,
      end_ns,
      agg_index: Vec::new(),
      aggregates: Vec::new(),
      sample_sizes: Vec::new(),
      condition_true_ns: None,
      condition_correction_ns: None,
      skipped_reason: Some(reason),
    }
  }
}

/// `(uid, config_id)`, uniquely identifying an installed configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigKey {
  pub uid: i32,
  pub config_id: i64,
}

/// Per-field aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationType {
  Sum,
  Avg,
  Min,
  Max,
}

/// Direction of the diff against the moving base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDirection {
  Increasing,
  Decreasing,
  Any,
}

/// Per-producer active/condition state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveConditionState {
  Inactive,
  ActiveConditionUnknown,
  ActiveConditionFalse,
  ActiveConditionTrue,
}

impl ActiveConditionState {
  pub fn admits_events(&self) -> bool {
    matches!(self, ActiveConditionState::ActiveConditionTrue)
  }
}

/// Bucket-level filter comparing the first interval's final value against
/// a threshold, deciding whether the bucket is worth uploading at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UploadThreshold {
  LtInt(i64),
  GtInt(i64),
  LteInt(i64),
  GteInt(i64),
  LtFloat(f64),
  GtFloat(f64),
}

impl UploadThreshold {
  /// Mirrors the aggregation engine.
  pub fn passes(&self, value: &NumericValue) -> bool {
    match (self, value) {
      (UploadThreshold::LtInt(t), NumericValue::I64(v)) => v < t,
      (UploadThreshold::GtInt(t), NumericValue::I64(v)) => v > t,
      (UploadThreshold::LteInt(t), NumericValue::I64(v)) => v <= t,
      (UploadThreshold::GteInt(t), NumericValue::I64(v)) => v >= t,
      (UploadThreshold::LtFloat(t), NumericValue::F64(v)) => v < t,
      (UploadThreshold::GtFloat(t), NumericValue::F64(v)) => v > t,
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn atom_id_set_once() {
    let mut e = LogEvent::new(0, 0);
    e.set_atom_id(10);
    e.set_atom_id(20);
    assert_eq!(e.atom_id(), 10);
  }

  #[test]
  fn structural_equality_for_dimension_keys() {
    let a = HashableDimensionKey(vec![FieldValue::I32(1), FieldValue::String("x".into())]);
    let b = HashableDimensionKey(vec![FieldValue::I32(1), FieldValue::String("x".into())]);
    let c = HashableDimensionKey(vec![FieldValue::I32(2), FieldValue::String("x".into())]);
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn threshold_gate() {
    let t = UploadThreshold::GtInt(100);
    assert!(!t.passes(&NumericValue::I64(99)));
    assert!(t.passes(&NumericValue::I64(101)));
  }

  #[test]
  fn checked_sub_mismatched_variants() {
    assert_eq!(
      NumericValue::I64(5).checked_sub(&NumericValue::F64(1.0)),
      None
    );
    assert_eq!(
      NumericValue::I64(5).checked_sub(&NumericValue::I64(2)),
      Some(NumericValue::I64(3))
    );
  }
}
