//! Background writer: drains the queue and commits batches.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error};

use super::{lock, write_lock, Shared, Tick};
use crate::error::TickError;

/// Writer loop.
///
/// Per batch: wait for work, drain up to `batch_size` ticks, commit them
/// under the exclusive store lock (column appends, header flushes, index
/// inserts), then retire the batch from the pending counter. Exits when
/// stop is set and the queue is empty, or when a commit fails, in which
/// case the series is poisoned and all sync waiters are woken.
pub(crate) fn run(shared: Arc<Shared>) {
    loop {
        let batch: Vec<Tick> = {
            let mut queue = lock(&shared.queue);
            while queue.ticks.is_empty() && !queue.stop {
                queue = shared
                    .queue_cv
                    .wait(queue)
                    .unwrap_or_else(|err| err.into_inner());
            }
            if queue.ticks.is_empty() {
                return;
            }
            let take = queue.ticks.len().min(shared.batch_size);
            queue.ticks.drain(..take).collect()
        };

        let committed = if shared.fail_next_commit.swap(false, Ordering::AcqRel) {
            Err(TickError::IoError(io::Error::new(
                io::ErrorKind::Other,
                "injected commit failure",
            )))
        } else {
            let mut store = write_lock(&shared.store);
            store.commit(&batch)
        };

        if let Err(err) = committed {
            error!("tick batch commit failed, poisoning series: {err}");
            shared.poisoned.store(true, Ordering::Release);
            // Hold the pending lock across the wakeup so no sync waiter
            // re-checks the predicate between the store and the notify.
            let _pending = lock(&shared.pending);
            shared.drain_cv.notify_all();
            return;
        }

        let mut pending = lock(&shared.pending);
        *pending -= batch.len() as u64;
        if *pending == 0 {
            shared.drain_cv.notify_all();
        }
        drop(pending);

        debug!(ticks = batch.len(), "committed tick batch");
    }
}
