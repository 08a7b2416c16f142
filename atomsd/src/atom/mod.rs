//! The atom wire codec: a self-describing binary record format transporting
//! atoms from producer to daemon.
//!
//! Mirrors the public API surface of `AStatsEvent` in
//! `libstatssocket/include/stats_event.h`: `obtain → write_atom_id →
//! (write_field | write_annotation)* → build → write/get_buffer`.

use crate::error::CodecError;
use crate::event::{
  AnnotationValue, AttributionNode, FieldPath, FieldValue, LogEvent,
};
use smallvec::SmallVec;

/// Frame magic carried ahead of every wire record.
pub const FRAME_MAGIC: u32 = 0x737A_6E74;

/// Record format version byte.
pub const RECORD_VERSION: u8 = 0x01;

const MAX_ARRAY_LEN: usize = 127;

const TAG_I32: u8 = 0x01;
const TAG_I64: u8 = 0x02;
const TAG_F32: u8 = 0x03;
const TAG_F64: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_ATTRIBUTION: u8 = 0x07;
const TAG_BOOL: u8 = 0x08;
const TAG_I32_ARRAY: u8 = 0x09;
const TAG_I64_ARRAY: u8 = 0x0A;
const TAG_F32_ARRAY: u8 = 0x0B;
const TAG_F64_ARRAY: u8 = 0x0C;
const TAG_BOOL_ARRAY: u8 = 0x0D;
const TAG_STRING_ARRAY: u8 = 0x0E;

/// Error bits accumulated while building a record, mirroring
/// `stats_event.h`'s `AStatsEvent_getErrors()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorBits(pub u32);

pub const ERROR_LIST_TOO_LONG: u32 = 1 << 0;
pub const ERROR_OVERFLOW: u32 = 1 << 1;

impl ErrorBits {
  pub fn set(&mut self, bit: u32) {
    self.0 |= bit;
  }
  pub fn has(&self, bit: u32) -> bool {
    self.0 & bit != 0
  }
}

/// One annotation queued for the atom or the most recently written field.
#[derive(Debug, Clone, Copy)]
struct PendingAnnotation {
  id: u8,
  value: AnnotationValue,
}

/// Builder state, mirroring `AStatsEvent`'s lifecycle:
/// `obtain → set_atom_id → write_* → build → write/release`.
#[derive(Debug)]
pub struct AtomBuilder {
  atom_id: u32,
  atom_id_set: bool,
  timestamp_ns: i64,
  errors: ErrorBits,
  atom_annotations: Vec<PendingAnnotation>,
  /// Each written element paired with the annotations that trailed it.
  elements: Vec<(Element, Vec<PendingAnnotation>)>,
  built: Option<Vec<u8>>,
}

/// One logical element written onto the atom, before it is tagged with its
/// trailing annotations and serialized.
#[derive(Debug, Clone)]
enum Element {
  I32(i32),
  I64(i64),
  F32(f32),
  F64(f64),
  Str(String),
  Bytes(Vec<u8>),
  Attribution(Vec<(u32, String)>),
  Bool(bool),
  I32Array(Vec<i32>),
  I64Array(Vec<i64>),
  F32Array(Vec<f32>),
  F64Array(Vec<f64>),
  BoolArray(Vec<bool>),
  StringArray(Vec<String>),
}

impl AtomBuilder {
  /// `AStatsEvent_obtain()`.
  pub fn obtain() -> Self {
    Self {
      atom_id: 0,
      atom_id_set: false,
      timestamp_ns: 0,
      errors: ErrorBits::default(),
      atom_annotations: Vec::new(),
      elements: Vec::new(),
      built: None,
    }
  }

  /// `atom_id = 0` is reserved and rejected.
  pub fn set_atom_id(&mut self, id: u32) -> Result<(), CodecError> {
    if id == 0 {
      return Err(CodecError::ReservedAtomId);
    }
    if self.atom_id_set {
      return Err(CodecError::AtomIdAlreadySet);
    }
    self.atom_id = id;
    self.atom_id_set = true;
    Ok(())
  }

  pub fn get_atom_id(&self) -> u32 {
    self.atom_id
  }

  /// `AStatsEvent_overwriteTimestamp()` — test/internal only
  pub fn overwrite_timestamp(&mut self, ts_ns: i64) {
    self.timestamp_ns = ts_ns;
  }

  fn push(&mut self, el: Element) {
    self.elements.push((el, Vec::new()));
  }

  pub fn write_i32(&mut self, v: i32) {
    self.push(Element::I32(v));
  }
  pub fn write_i64(&mut self, v: i64) {
    self.push(Element::I64(v));
  }
  pub fn write_f32(&mut self, v: f32) {
    self.push(Element::F32(v));
  }
  pub fn write_f64(&mut self, v: f64) {
    self.push(Element::F64(v));
  }
  pub fn write_bool(&mut self, v: bool) {
    self.push(Element::Bool(v));
  }
  pub fn write_string(&mut self, v: &str) {
    self.push(Element::Str(v.to_string()));
  }
  pub fn write_byte_array(&mut self, v: &[u8]) {
    self.push(Element::Bytes(v.to_vec()));
  }

  pub fn write_attribution_chain(&mut self, uids: &[u32], tags: &[&str]) {
    debug_assert_eq!(uids.len(), tags.len());
    if uids.len() > MAX_ARRAY_LEN {
      self.errors.set(ERROR_LIST_TOO_LONG);
      return;
    }
    let chain = uids
      .iter()
      .zip(tags.iter())
      .map(|(uid, tag)| (*uid, tag.to_string()))
      .collect();
    self.push(Element::Attribution(chain));
  }

  /// Writes an `i32` array. Arrays longer than 127 elements set
  /// `ERROR_LIST_TOO_LONG` and are omitted entirely.
  pub fn write_i32_array(&mut self, v: &[i32]) {
    if v.len() > MAX_ARRAY_LEN {
      self.errors.set(ERROR_LIST_TOO_LONG);
      return;
    }
    self.push(Element::I32Array(v.to_vec()));
  }

  pub fn write_i64_array(&mut self, v: &[i64]) {
    if v.len() > MAX_ARRAY_LEN {
      self.errors.set(ERROR_LIST_TOO_LONG);
      return;
    }
    self.push(Element::I64Array(v.to_vec()));
  }

  pub fn write_f32_array(&mut self, v: &[f32]) {
    if v.len() > MAX_ARRAY_LEN {
      self.errors.set(ERROR_LIST_TOO_LONG);
      return;
    }
    self.push(Element::F32Array(v.to_vec()));
  }

  pub fn write_f64_array(&mut self, v: &[f64]) {
    if v.len() > MAX_ARRAY_LEN {
      self.errors.set(ERROR_LIST_TOO_LONG);
      return;
    }
    self.push(Element::F64Array(v.to_vec()));
  }

  pub fn write_bool_array(&mut self, v: &[bool]) {
    if v.len() > MAX_ARRAY_LEN {
      self.errors.set(ERROR_LIST_TOO_LONG);
      return;
    }
    self.push(Element::BoolArray(v.to_vec()));
  }

  pub fn write_string_array(&mut self, v: &[&str]) {
    if v.len() > MAX_ARRAY_LEN {
      self.errors.set(ERROR_LIST_TOO_LONG);
      return;
    }
    self.push(Element::StringArray(v.iter().map(|s| s.to_string()).collect()));
  }

  /// Attaches an annotation to the most recently written field, or to the
  /// atom as a whole if no field has been written yet.
  fn add_annotation(&mut self, id: u8, value: AnnotationValue) {
    let ann = PendingAnnotation { id, value };
    match self.elements.last_mut() {
      Some((_, anns)) => anns.push(ann),
      None => self.atom_annotations.push(ann),
    }
  }

  pub fn add_bool_annotation(&mut self, id: u8, v: bool) {
    self.add_annotation(id, AnnotationValue::Bool(v));
  }

  pub fn add_int32_annotation(&mut self, id: u8, v: i32) {
    self.add_annotation(id, AnnotationValue::I32(v));
  }

  pub fn get_errors(&self) -> ErrorBits {
    self.errors
  }

  /// Finalizes the record into wire bytes. Idempotent: calling it again
  /// just returns the already-built buffer.
  pub fn build(&mut self) -> &[u8] {
    if self.built.is_none() {
      self.built = Some(self.encode());
    }
    self.built.as_deref().unwrap()
  }

  fn encode(&self) -> Vec<u8> {
    let mut buf: SmallVec<[u8; 256]> = SmallVec::new();
    buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    let element_count = 1 + self.elements.len() as u8;
    buf.push(element_count);
    buf.extend_from_slice(&self.timestamp_ns.to_le_bytes());
    buf.extend_from_slice(&self.atom_id.to_le_bytes());

    buf.push(self.atom_annotations.len() as u8);
    for ann in &self.atom_annotations {
      encode_annotation(&mut buf, ann);
    }
    for (el, anns) in &self.elements {
      encode_element(&mut buf, el);
      buf.push(anns.len() as u8);
      for ann in anns {
        encode_annotation(&mut buf, ann);
      }
    }
    buf.into_vec()
  }

  /// `AStatsEvent_write()`. Returns the datagram (magic-prefixed record) to
  /// hand to the socket writer, or the accumulated errors if any were set —
  /// the record is still returned ("may still be sent even
  /// with errors set").
  pub fn write(&mut self) -> (Vec<u8>, ErrorBits) {
    let record = self.build().to_vec();
    let mut datagram = Vec::with_capacity(4 + record.len());
    datagram.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    datagram.extend_from_slice(&record);
    (datagram, self.errors)
  }
}

fn encode_annotation(buf: &mut SmallVec<[u8; 256]>, ann: &PendingAnnotation) {
  buf.push(ann.id);
  match ann.value {
    AnnotationValue::Bool(v) => {
      buf.push(0);
      buf.push(v as u8);
    },
    AnnotationValue::I32(v) => {
      buf.push(1);
      buf.extend_from_slice(&v.to_le_bytes());
    },
  }
}

fn encode_element(buf: &mut SmallVec<[u8; 256]>, el: &Element) {
  match el {
    Element::I32(v) => {
      buf.push(TAG_I32);
      buf.extend_from_slice(&v.to_le_bytes());
    },
    Element::I64(v) => {
      buf.push(TAG_I64);
      buf.extend_from_slice(&v.to_le_bytes());
    },
    Element::F32(v) => {
      buf.push(TAG_F32);
      buf.extend_from_slice(&v.to_le_bytes());
    },
    Element::F64(v) => {
      buf.push(TAG_F64);
      buf.extend_from_slice(&v.to_le_bytes());
    },
    Element::Str(s) => {
      buf.push(TAG_STRING);
      encode_string(buf, s);
    },
    Element::Bytes(b) => {
      buf.push(TAG_BYTES);
      buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
      buf.extend_from_slice(b);
    },
    Element::Attribution(chain) => {
      buf.push(TAG_ATTRIBUTION);
      buf.push(chain.len() as u8);
      for (uid, tag) in chain {
        buf.extend_from_slice(&uid.to_le_bytes());
        encode_string(buf, tag);
      }
    },
    Element::Bool(v) => {
      buf.push(TAG_BOOL);
      buf.push(*v as u8);
    },
    Element::I32Array(vs) => {
      buf.push(TAG_I32_ARRAY);
      buf.push(vs.len() as u8);
      for v in vs {
        buf.extend_from_slice(&v.to_le_bytes());
      }
    },
    Element::I64Array(vs) => {
      buf.push(TAG_I64_ARRAY);
      buf.push(vs.len() as u8);
      for v in vs {
        buf.extend_from_slice(&v.to_le_bytes());
      }
    },
    Element::F32Array(vs) => {
      buf.push(TAG_F32_ARRAY);
      buf.push(vs.len() as u8);
      for v in vs {
        buf.extend_from_slice(&v.to_le_bytes());
      }
    },
    Element::F64Array(vs) => {
      buf.push(TAG_F64_ARRAY);
      buf.push(vs.len() as u8);
      for v in vs {
        buf.extend_from_slice(&v.to_le_bytes());
      }
    },
    Element::BoolArray(vs) => {
      buf.push(TAG_BOOL_ARRAY);
      buf.push(vs.len() as u8);
      for v in vs {
        buf.push(*v as u8);
      }
    },
    Element::StringArray(vs) => {
      buf.push(TAG_STRING_ARRAY);
      buf.push(vs.len() as u8);
      for v in vs {
        encode_string(buf, v);
      }
    },
  }
}

fn encode_string(buf: &mut SmallVec<[u8; 256]>, s: &str) {
  buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
  buf.extend_from_slice(s.as_bytes());
}

/// Byte cursor used by [`decode_record`].
struct Cursor<'a> {
  data: &'a [u8],
  pos: usize,
}

impl<'a> Cursor<'a> {
  fn new(data: &'a [u8]) -> Self {
    Self { data, pos: 0 }
  }

  fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
    if self.pos + n > self.data.len() {
      return Err(CodecError::UnexpectedEof);
    }
    let s = &self.data[self.pos..self.pos + n];
    self.pos += n;
    Ok(s)
  }

  fn u8(&mut self) -> Result<u8, CodecError> {
    Ok(self.take(1)?[0])
  }
  fn i32(&mut self) -> Result<i32, CodecError> {
    Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
  }
  fn u32(&mut self) -> Result<u32, CodecError> {
    Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
  }
  fn i64(&mut self) -> Result<i64, CodecError> {
    Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
  }
  fn f32(&mut self) -> Result<f32, CodecError> {
    Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
  }
  fn f64(&mut self) -> Result<f64, CodecError> {
    Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
  }
  fn bool(&mut self) -> Result<bool, CodecError> {
    Ok(self.u8()? != 0)
  }
  fn string(&mut self) -> Result<String, CodecError> {
    let len = self.u32()? as usize;
    let bytes = self.take(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
  }

  fn annotation(&mut self) -> Result<(u8, AnnotationValue), CodecError> {
    let id = self.u8()?;
    let kind = self.u8()?;
    let value = match kind {
      0 => AnnotationValue::Bool(self.bool()?),
      1 => AnnotationValue::I32(self.i32()?),
      _ => return Err(CodecError::UnknownTag(kind)),
    };
    Ok((id, value))
  }
}

/// Parses a full datagram (`[magic][record]`) into a [`LogEvent`].
pub fn decode_datagram(datagram: &[u8], logger_uid: u32) -> Result<LogEvent, CodecError> {
  let mut c = Cursor::new(datagram);
  let magic = c.u32()?;
  if magic != FRAME_MAGIC {
    return Err(CodecError::BadMagic(magic));
  }
  decode_record(&datagram[c.pos..], logger_uid)
}

/// Parses a record body (no magic prefix) into a [`LogEvent`], including any
/// annotations attached to the atom or to individual fields. Each
/// annotation group (atom-level, then one per field) is prefixed with a
/// `u8` count so the decoder never has to guess where a field's
/// annotations end and the next field's tag begins.
pub fn decode_record(record: &[u8], logger_uid: u32) -> Result<LogEvent, CodecError> {
  let mut c = Cursor::new(record);
  let version = c.u8()?;
  if version != RECORD_VERSION {
    return Err(CodecError::BadVersion(version));
  }
  let element_count = c.u8()?;
  let timestamp_ns = c.i64()?;
  let atom_id = c.u32()?;

  let mut event = LogEvent::new(timestamp_ns, logger_uid);
  event.set_atom_id(atom_id);

  // Atom-level annotations precede the first field.
  let atom_annotation_count = c.u8()?;
  for _ in 0..atom_annotation_count {
    let (id, value) = c.annotation()?;
    event.atom_annotations.push(crate::event::Annotation { id, value });
  }

  let mut fields_seen = 0u8;
  while fields_seen < element_count.saturating_sub(1) {
    let tag = c.u8()?;
    let (path, value) = decode_field(&mut c, tag, atom_id)?;
    let field_annotation_count = c.u8()?;
    let mut annotations = Vec::with_capacity(field_annotation_count as usize);
    for _ in 0..field_annotation_count {
      let (id, ann_value) = c.annotation()?;
      annotations.push(crate::event::Annotation { id, value: ann_value });
    }
    event.fields.push(crate::event::Field {
      path,
      value,
      annotations,
    });
    fields_seen += 1;
  }

  Ok(event)
}

fn decode_field(
  c: &mut Cursor,
  tag: u8,
  atom_id: u32,
) -> Result<(FieldPath, FieldValue), CodecError> {
  let path = FieldPath {
    atom_id,
    nested: [0, 0, 0],
    depth: 0,
  };
  let value = match tag {
    TAG_I32 => FieldValue::I32(c.i32()?),
    TAG_I64 => FieldValue::I64(c.i64()?),
    TAG_F32 => FieldValue::F32(c.f32()?),
    TAG_F64 => FieldValue::F64(c.f64()?),
    TAG_STRING => FieldValue::String(c.string()?),
    TAG_BYTES => {
      let len = c.u32()? as usize;
      FieldValue::Bytes(c.take(len)?.to_vec())
    },
    TAG_ATTRIBUTION => {
      let count = c.u8()? as usize;
      let mut chain = Vec::with_capacity(count);
      for _ in 0..count {
        let uid = c.u32()?;
        let tag = c.string()?;
        chain.push(AttributionNode { uid, tag });
      }
      FieldValue::AttributionChain(chain)
    },
    TAG_BOOL => FieldValue::Bool(c.bool()?),
    TAG_I32_ARRAY => {
      let count = c.u8()? as usize;
      let mut v = SmallVec::with_capacity(count);
      for _ in 0..count {
        v.push(c.i32()?);
      }
      FieldValue::I32Array(v)
    },
    TAG_I64_ARRAY => {
      let count = c.u8()? as usize;
      let mut v = SmallVec::with_capacity(count);
      for _ in 0..count {
        v.push(c.i64()?);
      }
      FieldValue::I64Array(v)
    },
    TAG_F32_ARRAY => {
      let count = c.u8()? as usize;
      let mut v = SmallVec::with_capacity(count);
      for _ in 0..count {
        v.push(c.f32()?);
      }
      FieldValue::F32Array(v)
    },
    TAG_F64_ARRAY => {
      let count = c.u8()? as usize;
      let mut v = SmallVec::with_capacity(count);
      for _ in 0..count {
        v.push(c.f64()?);
      }
      FieldValue::F64Array(v)
    },
    TAG_BOOL_ARRAY => {
      let count = c.u8()? as usize;
      let mut v = SmallVec::with_capacity(count);
      for _ in 0..count {
        v.push(c.bool()?);
      }
      FieldValue::BoolArray(v)
    },
    TAG_STRING_ARRAY => {
      let count = c.u8()? as usize;
      let mut v = Vec::with_capacity(count);
      for _ in 0..count {
        v.push(c.string()?);
      }
      FieldValue::StringArray(v)
    },
    other => return Err(CodecError::UnknownTag(other)),
  };
  Ok((path, value))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trip_scalar_fields() {
    let mut b = AtomBuilder::obtain();
    b.set_atom_id(1001).unwrap();
    b.write_i32(42);
    b.write_string("hello");
    b.write_bool(true);
    let (datagram, errors) = b.write();
    assert_eq!(errors.0, 0);

    let event = decode_datagram(&datagram, 0).unwrap();
    assert_eq!(event.atom_id(), 1001);
    assert_eq!(event.fields.len(), 3);
    assert_eq!(event.fields[0].value, FieldValue::I32(42));
    assert_eq!(event.fields[1].value, FieldValue::String("hello".into()));
    assert_eq!(event.fields[2].value, FieldValue::Bool(true));
  }

  #[test]
  fn array_too_long_sets_error_and_is_omitted() {
    let mut b = AtomBuilder::obtain();
    b.set_atom_id(5).unwrap();
    let long: Vec<i32> = (0..200).collect();
    b.write_i32_array(&long);
    b.write_i32(7);
    let (datagram, errors) = b.write();
    assert!(errors.has(ERROR_LIST_TOO_LONG));

    let event = decode_datagram(&datagram, 0).unwrap();
    // the too-long array was never pushed; only the trailing i32 remains.
    assert_eq!(event.fields.len(), 1);
    assert_eq!(event.fields[0].value, FieldValue::I32(7));
  }

  #[test]
  fn atom_id_zero_is_rejected() {
    let mut b = AtomBuilder::obtain();
    assert_eq!(b.set_atom_id(0), Err(CodecError::ReservedAtomId));
  }

  #[test]
  fn annotations_round_trip() {
    let mut b = AtomBuilder::obtain();
    b.set_atom_id(9).unwrap();
    b.add_bool_annotation(1, true);
    b.write_i32(3);
    b.add_int32_annotation(2, 77);
    let (datagram, _) = b.write();

    let event = decode_datagram(&datagram, 0).unwrap();
    assert_eq!(event.atom_annotations.len(), 1);
    assert_eq!(event.atom_annotations[0].id, 1);
    assert_eq!(event.fields[0].annotations.len(), 1);
    assert_eq!(event.fields[0].annotations[0].id, 2);
  }

  #[test]
  fn build_is_idempotent() {
    let mut b = AtomBuilder::obtain();
    b.set_atom_id(1).unwrap();
    b.write_i32(1);
    let first = b.build().to_vec();
    let second = b.build().to_vec();
    assert_eq!(first, second);
  }
}
