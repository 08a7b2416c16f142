//! System-process-only bounded queue feeding the socket writer: a bounded
//! `crossbeam_channel` drained by a dedicated writer thread.

use crate::loss_tracker::LossTracker;
use crate::socket_writer::SocketWriter;
use crate::stats::StatsdStats;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ns() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos() as i64)
    .unwrap_or(0)
}

/// Predefined internal error code for a dropped-on-overflow atom.
pub const QUEUE_OVERFLOW_ERROR_CODE: i32 = 1;

/// One queued record, tagged with the atom id it was built from so the
/// worker (and, on overflow, the caller) can attribute drops correctly.
pub struct QueuedRecord {
  pub atom_id: u32,
  pub record: Vec<u8>,
}

/// Message sent to the queue worker thread.
enum Message {
  Write(QueuedRecord),
  Shutdown,
}

/// The fixed set of atom ids routed through the queue instead of calling
/// the socket writer synchronously.
#[derive(Debug, Clone, Default)]
pub struct QueueRoutingTable(HashSet<u32>);

impl QueueRoutingTable {
  pub fn new(routed_atom_ids: impl IntoIterator<Item = u32>) -> Self {
    Self(routed_atom_ids.into_iter().collect())
  }

  pub fn should_write_via_queue(&self, atom_id: u32) -> bool {
    self.0.contains(&atom_id)
  }
}

/// Bounded producer-side queue with a dedicated draining worker thread.
pub struct ProducerQueue {
  sender: Sender<Message>,
  worker: Option<JoinHandle<()>>,
}

impl ProducerQueue {
  /// Spawns the worker thread draining into `writer`.
  pub fn spawn(capacity: usize, writer: Arc<SocketWriter>) -> Self {
    let (sender, receiver): (Sender<Message>, Receiver<Message>) =
      crossbeam_channel::bounded(capacity);
    let worker = thread::spawn(move || Self::worker_loop(receiver, writer));
    Self {
      sender,
      worker: Some(worker),
    }
  }

  /// `enqueue(buffer, size, atom_id) -> bool`. Returns
  /// `false` when the queue is full; the caller is responsible for noting
  /// the drop with [`QUEUE_OVERFLOW_ERROR_CODE`].
  pub fn enqueue(&self, atom_id: u32, record: Vec<u8>) -> bool {
    match self.sender.try_send(Message::Write(QueuedRecord { atom_id, record })) {
      Ok(()) => true,
      Err(TrySendError::Full(_)) => false,
      Err(TrySendError::Disconnected(_)) => false,
    }
  }

  /// Drains queued records to the socket, routing failed sends to a
  /// per-worker `LossTracker` and piggybacking the synthesized
  /// `socket_loss_reported` atom onto the next successful send rather than
  /// opening a second transport just to report the first one's losses.
  fn worker_loop(receiver: Receiver<Message>, writer: Arc<SocketWriter>) {
    let mut losses = LossTracker::new();
    while let Ok(msg) = receiver.recv() {
      match msg {
        Message::Write(queued) => {
          let n = writer.write(&queued.record);
          if n < 0 {
            losses.note_loss(queued.atom_id, n, now_ns());
            continue;
          }
          if let Some(loss_atom) = losses.drain_to_atom(now_ns()) {
            if writer.write(&loss_atom) >= 0 {
              StatsdStats::instance().note_socket_loss_reported();
            }
          }
        },
        Message::Shutdown => break,
      }
    }
  }
}

impl Drop for ProducerQueue {
  fn drop(&mut self) {
    let _ = self.sender.send(Message::Shutdown);
    if let Some(handle) = self.worker.take() {
      let _ = handle.join();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn routing_table_membership() {
    let table = QueueRoutingTable::new([10, 20, 30]);
    assert!(table.should_write_via_queue(20));
    assert!(!table.should_write_via_queue(99));
  }

  /// With a real listener bound, a normal send succeeds end-to-end through
  /// the queue and no synthetic loss atom is piggybacked, since nothing
  /// failed.
  #[test]
  fn successful_sends_never_synthesize_a_loss_atom() {
    use std::os::unix::net::{SocketAddr, UnixDatagram};

    let socket_name = "atomsd_test_queue_no_loss_on_success";
    let addr = SocketAddr::from_abstract_name(socket_name.as_bytes()).unwrap();
    let listener = UnixDatagram::bind_addr(&addr).unwrap();

    let writer = Arc::new(SocketWriter::new(socket_name));
    let queue = ProducerQueue::spawn(4, writer);
    assert!(queue.enqueue(1234, vec![1, 2, 3, 4]));

    let mut buf = [0u8; 64];
    listener
      .set_read_timeout(Some(std::time::Duration::from_secs(2)))
      .unwrap();
    let n = listener.recv(&mut buf).expect("queued record should arrive");
    assert!(n > 0);

    // No second datagram (the loss atom) should follow; nothing failed.
    listener
      .set_read_timeout(Some(std::time::Duration::from_millis(100)))
      .unwrap();
    assert!(listener.recv(&mut buf).is_err());
  }

  #[test]
  fn overflow_returns_false() {
    let writer = Arc::new(SocketWriter::new("atomsd_test_queue_overflow"));
    let queue = ProducerQueue::spawn(1, writer);
    // Racing the worker thread draining slot 0 is inherent to a bounded
    // queue; this asserts enqueue never panics and returns a bool either way.
    let _ = queue.enqueue(1, vec![0u8; 4]);
    let _ = queue.enqueue(1, vec![0u8; 4]);
  }
}
