//! The daemon binary: binds the abstract-namespace datagram socket,
//! decodes incoming atom records, and reacts to signal-driven dump
//! requests.
//!
//! Matching atoms against installed metric configs is an external-
//! collaborator concern (`atomsd::collector`) with no concrete
//! implementation in this crate; this binary wires the reader loop, the
//! stats store, and the signal/panic-driven dump path.

use atomsd::config::DaemonConfig;
use atomsd::event::ConfigKey;
use atomsd::panic_hook::PanicHook;
use atomsd::signal_hook::{DumpRequest, SignalHook};
use atomsd::stats::StatsdStats;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::time::Duration;

const MAX_DATAGRAM_LEN: usize = 64 * 1024;

fn main() {
  tracing_subscriber::fmt::init();

  let config = DaemonConfig::from_env();
  tracing::info!(?config, reader_thread = atomsd::utils::current_thread_id_u32(), "atomsd starting");

  let socket = bind_reader_socket(&config.socket_name);

  let (dump_tx, dump_rx) = crossbeam_channel::unbounded::<DumpRequest>();
  SignalHook::install(dump_tx.clone());
  PanicHook::install(dump_tx);

  StatsdStats::instance().note_config_received(ConfigKey {
    uid: 0,
    config_id: 0,
  });

  let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
  loop {
    if let Ok(request) = dump_rx.try_recv() {
      handle_dump_request(request);
      if matches!(request, DumpRequest::DumpAndExit(_)) {
        break;
      }
    }

    match socket.recv(&mut buf) {
      Ok(n) => {
        StatsdStats::instance().note_batch_socket_read(1);
        match atomsd::atom::decode_datagram(&buf[..n], 0) {
          Ok(event) => {
            tracing::debug!(atom_id = event.atom_id(), fields = event.fields.len(), "atom logged");
            StatsdStats::instance().note_atom_logged(event.atom_id());
          },
          Err(e) => {
            tracing::warn!(error = %e, "failed to decode atom record, skipping");
            StatsdStats::instance().note_atom_skipped(0);
          },
        }
      },
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
        continue;
      },
      Err(e) => {
        tracing::error!(error = %e, "reader socket error");
      },
    }
  }

  tracing::info!("atomsd exiting");
}

fn bind_reader_socket(name: &str) -> UnixDatagram {
  let addr = SocketAddr::from_abstract_name(name.as_bytes()).expect("invalid abstract socket name");
  let socket = UnixDatagram::unbound().expect("failed to create reader socket");
  socket.bind_addr(&addr).expect("failed to bind abstract socket");
  socket
    .set_read_timeout(Some(Duration::from_millis(200)))
    .expect("failed to set read timeout");
  socket
}

fn handle_dump_request(request: DumpRequest) {
  let label = match request {
    DumpRequest::DumpAndExit(s) => s,
    DumpRequest::DumpOnly(s) => s,
  };
  let bytes = StatsdStats::instance().dump(true);
  tracing::info!(signal = label, dump_len = bytes.len(), "stats dump complete");
}
