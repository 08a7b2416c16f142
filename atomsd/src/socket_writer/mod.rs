//! Lazy-open datagram transport to the daemon.
//!
//! A single mutex guards the whole open/uninit state machine, not just the
//! handle inside it — "opening" is itself an observable state concurrent
//! callers must agree on.

use crate::error::WriterError;
use std::io::IoSlice;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::sync::Mutex;

use crate::atom::FRAME_MAGIC;

/// `Uninit -> Opening -> Open -> Closing -> Uninit`, guarded by a mutex so
/// concurrent callers observe the same transition.
#[derive(Debug, Default)]
enum SocketState {
  #[default]
  Uninit,
  Open(UnixDatagram),
}

/// Lazily-initialized datagram writer to an abstract-namespace socket.
///
/// The first call to [`SocketWriter::write`] opens the transport under the
/// init mutex; a failed open leaves the state `Uninit` so the *next* call
/// retries — there is no in-call retry loop.
pub struct SocketWriter {
  socket_name: String,
  state: Mutex<SocketState>,
}

impl SocketWriter {
  pub fn new(socket_name: impl Into<String>) -> Self {
    Self {
      socket_name: socket_name.into(),
      state: Mutex::new(SocketState::Uninit),
    }
  }

  fn open_locked(&self, state: &mut SocketState) -> Result<(), WriterError> {
    if matches!(state, SocketState::Open(_)) {
      return Ok(());
    }
    let addr = SocketAddr::from_abstract_name(self.socket_name.as_bytes())
      .map_err(WriterError::OpenFailed)?;
    let socket = UnixDatagram::unbound().map_err(WriterError::OpenFailed)?;
    socket.connect_addr(&addr).map_err(WriterError::OpenFailed)?;
    socket
      .set_nonblocking(true)
      .map_err(WriterError::OpenFailed)?;
    *state = SocketState::Open(socket);
    Ok(())
  }

  /// Writes one already-encoded record (without the frame magic — this
  /// function prepends it) using a scatter-gather send to avoid copying the
  /// caller's buffer. Returns bytes written, or a negative
  /// errno-style value on failure, matching the producer ABI.
  pub fn write(&self, record: &[u8]) -> i32 {
    let magic = FRAME_MAGIC.to_le_bytes();
    let mut guard = match self.state.lock() {
      Ok(g) => g,
      Err(poisoned) => poisoned.into_inner(),
    };

    if let Err(_e) = self.open_locked(&mut guard) {
      return -libc_like_errno::ECONNREFUSED;
    }

    let socket = match &*guard {
      SocketState::Open(s) => s,
      SocketState::Uninit => return -libc_like_errno::ECONNREFUSED,
    };

    let iov = [IoSlice::new(&magic), IoSlice::new(record)];
    match socket.send_vectored(&iov) {
      Ok(n) => n as i32,
      Err(e) => {
        if e.kind() == std::io::ErrorKind::WouldBlock {
          -libc_like_errno::EAGAIN
        } else {
          *guard = SocketState::Uninit;
          -libc_like_errno::EPIPE
        }
      },
    }
  }

  pub fn is_closed(&self) -> bool {
    let guard = match self.state.lock() {
      Ok(g) => g,
      Err(poisoned) => poisoned.into_inner(),
    };
    matches!(&*guard, SocketState::Uninit)
  }

  pub fn close(&self) {
    let mut guard = match self.state.lock() {
      Ok(g) => g,
      Err(poisoned) => poisoned.into_inner(),
    };
    *guard = SocketState::Uninit;
  }
}

/// A small local copy of the handful of errno values this layer needs to
/// report, so the crate doesn't need to depend on `libc` just for these
/// constants.
mod libc_like_errno {
  pub const EAGAIN: i32 = 11;
  pub const EPIPE: i32 = 32;
  pub const ECONNREFUSED: i32 = 111;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn starts_closed() {
    let w = SocketWriter::new("atomsd_test_socket_starts_closed");
    assert!(w.is_closed());
  }

  #[test]
  fn write_without_listener_reports_negative_errno() {
    let w = SocketWriter::new("atomsd_test_socket_no_listener_xyz123");
    let n = w.write(&[0u8; 4]);
    assert!(n < 0);
  }

  #[test]
  fn close_resets_to_uninit() {
    let w = SocketWriter::new("atomsd_test_socket_close");
    let _ = w.write(&[0u8; 4]);
    w.close();
    assert!(w.is_closed());
  }
}
