/// Submission Scheduler - FIFO queue + dispatch accounting
///
/// A single unbounded channel gives strict FIFO across all problems; a
/// fixed set of workers (owned by the engine) receives from it, so at most
/// `worker_count` submissions are ever in flight and each worker serves one
/// submission end-to-end.
///
/// Queue positions are live, not enqueue-time snapshots: each submission
/// gets a global sequence number, and its position is the distance between
/// that number and the dispatch counter, shrinking as earlier jobs start.
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct QueuedJob {
    pub submission_id: Uuid,
    pub seq: u64,
}

pub struct Scheduler {
    tx: async_channel::Sender<QueuedJob>,
    rx: async_channel::Receiver<QueuedJob>,
    enqueue_seq: AtomicU64,
    dispatch_seq: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Scheduler {
            tx,
            rx,
            enqueue_seq: AtomicU64::new(0),
            dispatch_seq: AtomicU64::new(0),
        }
    }

    /// Append a submission to the queue. Returns its sequence number and
    /// current position, or None if the queue has been closed for shutdown.
    pub fn enqueue(&self, submission_id: Uuid) -> Option<(u64, u64)> {
        let seq = self.enqueue_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let job = QueuedJob { submission_id, seq };
        // unbounded channel: send only fails when closed
        if self.tx.try_send(job).is_err() {
            return None;
        }
        Some((seq, self.live_position(seq).unwrap_or(1)))
    }

    /// Next job in FIFO order; None once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<QueuedJob> {
        match self.rx.recv().await {
            Ok(job) => {
                self.dispatch_seq.fetch_add(1, Ordering::SeqCst);
                Some(job)
            }
            Err(_) => None,
        }
    }

    /// Position among still-queued submissions (1 = next to run), or None
    /// once the job has been dispatched.
    pub fn live_position(&self, seq: u64) -> Option<u64> {
        let dispatched = self.dispatch_seq.load(Ordering::SeqCst);
        if seq <= dispatched {
            None
        } else {
            Some(seq - dispatched)
        }
    }

    /// Stop intake. Workers drain whatever is already queued, then exit.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
