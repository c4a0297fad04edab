//! Update batching.
//!
//! Each queued entry does its slow work (dispose, re-import, stylesheet swap)
//! when the queue is flushed and yields an optional apply step. Apply steps
//! only run after every entry of the batch has finished, in enqueue order,
//! so observers never see a half-applied batch.

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::future::Future;

/// Deferred side of a queued update.
pub type Apply = Box<dyn FnOnce() + Send>;

type Pending = BoxFuture<'static, Option<Apply>>;

#[derive(Default)]
struct QueueState {
    pending: Vec<Pending>,
    flushing: bool,
}

#[derive(Default)]
pub struct UpdateQueue {
    state: Mutex<QueueState>,
}

impl UpdateQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add work to the next flush. Nothing runs until [`UpdateQueue::flush`].
    pub fn enqueue<F>(&self, work: F)
    where
        F: Future<Output = Option<Apply>> + Send + 'static,
    {
        self.state.lock().pending.push(Box::pin(work));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run everything queued.
    ///
    /// Only one flush runs at a time. A call made while another flush is in
    /// progress returns immediately; its entries are picked up by the running
    /// flush in its next round.
    pub async fn flush(&self) {
        {
            let mut state = self.state.lock();
            if state.flushing {
                return;
            }
            state.flushing = true;
        }

        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    state.flushing = false;
                    return;
                }
                std::mem::take(&mut state.pending)
            };
            for apply in join_all(batch).await.into_iter().flatten() {
                apply();
            }
        }
    }
}
