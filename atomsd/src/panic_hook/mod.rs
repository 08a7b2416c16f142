//! Panic-triggered best-effort dump.
//!
//! A panic on any producer or daemon thread requests the same best-effort
//! flush-and-dump a SIGINT would, via [`crate::signal_hook::DumpRequest`],
//! so in-flight bucket state isn't silently lost to an unwinding panic.

use crate::signal_hook::DumpRequest;
use crossbeam_channel::Sender;
use std::thread;
use std::time::Duration;

pub struct PanicHook {}

impl PanicHook {
  /// Installs a panic hook that requests a dump-and-exit via `sender`.
  ///
  /// Panic hooks run during unwinding and must stay lightweight: this one
  /// logs the panic, does a non-blocking `try_send` of the dump request,
  /// and sleeps briefly so the daemon's dump thread has a chance to react
  /// before the process unwinds further.
  pub fn install(sender: Sender<DumpRequest>) {
    std::panic::set_hook(Box::new(move |info| {
      tracing::error!(%info, "captured panic");

      if let Err(e) = sender.try_send(DumpRequest::DumpAndExit("panic")) {
        tracing::warn!(error = %e, "unable to enqueue dump request from panic hook");
      }

      thread::sleep(Duration::from_millis(120));
    }));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn install_does_not_panic() {
    let (tx, _rx) = crossbeam_channel::unbounded();
    PanicHook::install(tx);
    // Restore the default hook so later tests in this binary aren't
    // affected by a hook installed here.
    let _ = std::panic::take_hook();
  }
}
