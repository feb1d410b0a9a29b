use parking_lot::Mutex;

use super::dispatch::Dispatch;

/// Hand-off point between request handlers and the processing pass.
///
/// Producers append whole batches; the consumer swaps the pending vector out
/// in one step. The lock is never held while dispatches are aggregated.
#[derive(Debug, Default)]
pub struct IngestQueue {
    pending: Mutex<Vec<Dispatch>>,
}

impl IngestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a decoded batch. Returns the number of records queued.
    pub fn push_batch(&self, mut batch: Vec<Dispatch>) -> usize {
        let count = batch.len();
        if count == 0 {
            return 0;
        }

        let mut pending = self.pending.lock();
        if pending.is_empty() {
            // Reuse the producer's allocation.
            std::mem::swap(&mut *pending, &mut batch);
        } else {
            pending.append(&mut batch);
        }
        count
    }

    /// Takes everything queued so far, leaving the queue empty.
    pub fn take(&self) -> Vec<Dispatch> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
