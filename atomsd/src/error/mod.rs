//! Crate-wide internal error types.
//!
//! Nothing here crosses the producer ABI boundary: `atom`'s public writer API
//! returns `i32` (bytes written or negative errno) and `socket_writer`/
//! `producer_queue` collapse their errors into the same stable contract.
//! These enums exist for the internal `Result`-and-`?` plumbing between them.

use thiserror::Error;

/// Failures from building or parsing a wire-format atom record.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
  #[error("atom id 0 is reserved")]
  ReservedAtomId,
  #[error("atom id already set")]
  AtomIdAlreadySet,
  #[error("array length {0} exceeds the 127-element limit")]
  ListTooLong(usize),
  #[error("internal buffer overflow")]
  BufferOverflow,
  #[error("buffer already built")]
  AlreadyBuilt,
  #[error("buffer not yet built")]
  NotBuilt,
  #[error("unexpected end of buffer while decoding")]
  UnexpectedEof,
  #[error("unknown element tag {0:#x}")]
  UnknownTag(u8),
  #[error("invalid magic {0:#x}")]
  BadMagic(u32),
  #[error("invalid record version {0:#x}")]
  BadVersion(u8),
  #[error("invalid utf-8 string payload")]
  InvalidUtf8,
}

/// Failures from the lazy socket-writer transport.
#[derive(Debug, Error)]
pub enum WriterError {
  #[error("socket open failed: {0}")]
  OpenFailed(std::io::Error),
  #[error("send failed: {0}")]
  SendFailed(std::io::Error),
  #[error("writer is closing or closed")]
  Closed,
}

/// Failures from encoding a report into its wire bytes.
#[derive(Debug, Error)]
pub enum ReportError {
  #[error("prost encode error: {0}")]
  Encode(#[from] prost::EncodeError),
}
