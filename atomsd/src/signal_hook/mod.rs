//! Signal-driven dump/flush path.
//!
//! A `Signals` iterator thread forwards onto a `crossbeam_channel::Sender`
//! for the three signals the daemon reacts to: SIGINT/SIGTERM request a
//! best-effort flush of every open bucket plus a stats dump and then exit;
//! SIGHUP requests the same dump without exiting.

use crossbeam_channel::Sender;
use signal_hook::{
  consts::{SIGHUP, SIGINT, SIGTERM},
  iterator::Signals,
};
use std::thread;

/// A request delivered from the signal-handling thread to the daemon's main
/// loop. The daemon decides what "flush every open bucket and dump stats"
/// means for its own set of installed metric producers; this type only
/// carries the intent and which signal triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpRequest {
  DumpAndExit(&'static str),
  DumpOnly(&'static str),
}

pub struct SignalHook {}

impl SignalHook {
  /// Spawns the signal-listening thread, reacting only to the signals this
  /// daemon assigns meaning to.
  pub fn install(sender: Sender<DumpRequest>) {
    let mut signals = match Signals::new([SIGINT, SIGTERM, SIGHUP]) {
      Ok(s) => s,
      Err(e) => panic!("failed to install signal handler: {e}"),
    };

    thread::spawn(move || {
      for sig in signals.forever() {
        let request = match sig {
          SIGINT => DumpRequest::DumpAndExit("SIGINT"),
          SIGTERM => DumpRequest::DumpAndExit("SIGTERM"),
          SIGHUP => DumpRequest::DumpOnly("SIGHUP"),
          _ => continue,
        };
        tracing::info!(?request, "received shutdown/dump signal");
        if sender.send(request).is_err() {
          break;
        }
        if matches!(request, DumpRequest::DumpAndExit(_)) {
          break;
        }
      }
    });
  }
}
