//! Direct pass-through adapter for container-format sessions.
//!
//! Bytes from the session sink are forwarded unchanged; the consumer (a
//! voice-chat library) demuxes frames itself. The one subtlety is
//! *recreation*: voice-chat libraries sometimes close an empty stream
//! before extraction completes, so a closed output is treated as
//! "replace on next write", never "delete". The slot is an explicit
//! `Open | Closed` variant swapped atomically under its lock.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Output slot for the consumer-facing stream.
enum Output {
    /// Live stream the consumer is reading.
    Open(mpsc::Sender<Bytes>),
    /// Consumer closed the stream; the next write reallocates.
    Closed,
}

/// Pass-through adapter: one per consumer per attached transport.
///
/// Fresh output streams are announced on the handed-out receiver channel so
/// the consumer integration can attach each replacement as it appears.
pub struct PassthroughAdapter {
    output: Mutex<Output>,
    outputs_tx: mpsc::UnboundedSender<mpsc::Receiver<Bytes>>,
    capacity: usize,
    bytes_forwarded: AtomicU64,
}

impl PassthroughAdapter {
    /// Creates the adapter and the channel on which replacement output
    /// streams are announced. The first output is allocated lazily on the
    /// first write.
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<mpsc::Receiver<Bytes>>) {
        let (outputs_tx, outputs_rx) = mpsc::unbounded_channel();
        (
            Self {
                output: Mutex::new(Output::Closed),
                outputs_tx,
                capacity,
                bytes_forwarded: AtomicU64::new(0),
            },
            outputs_rx,
        )
    }

    /// Forwards one record to the current output, allocating a fresh
    /// stream if the consumer closed the previous one.
    pub async fn deliver(&self, bytes: Bytes) {
        let sender = self.current_or_recreate();
        let len = bytes.len() as u64;
        if sender.send(bytes).await.is_err() {
            // Consumer closed between the swap and the send; mark Closed so
            // the next packet recreates rather than being lost silently.
            log::debug!("[Client] Output closed mid-write, will recreate on next packet");
            *self.output.lock() = Output::Closed;
            return;
        }
        self.bytes_forwarded.fetch_add(len, Ordering::Relaxed);
    }

    /// Marks the output closed. Called when the consumer detaches.
    pub fn close(&self) {
        *self.output.lock() = Output::Closed;
    }

    /// Total audio bytes forwarded since creation.
    #[must_use]
    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    /// Returns a live sender, swapping in a fresh stream if needed.
    fn current_or_recreate(&self) -> mpsc::Sender<Bytes> {
        let mut slot = self.output.lock();
        if let Output::Open(sender) = &*slot {
            if !sender.is_closed() {
                return sender.clone();
            }
            log::debug!("[Client] Output stream closed by consumer, recreating");
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        // Receiver side may be gone during shutdown; writing then drops.
        let _ = self.outputs_tx.send(rx);
        *slot = Output::Open(tx.clone());
        tx
    }
}
