//! Callback-facing queue handle
//!
//! Callbacks never see a rank's internals. They get a `&mut dyn Handle`
//! that can only enqueue, dequeue and report the local size. The engine
//! passes a [`RankHandle`]; tests can pass a bare [`LocalQueue`].

use crate::engine::queue::{LocalQueue, WorkItem};
use std::cell::Cell;
use std::sync::Arc;
use tracing::debug;

/// User callback type for both the create and the process step
pub type Callback = Arc<dyn Fn(&mut dyn Handle) + Send + Sync>;

thread_local! {
    static CURRENT_RANK: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Rank of the engine thread calling this, if any
pub fn current_rank() -> Option<usize> {
    CURRENT_RANK.with(|r| r.get())
}

pub(crate) fn set_current_rank(rank: Option<usize>) {
    CURRENT_RANK.with(|r| r.set(rank));
}

/// Queue operations available to callbacks
pub trait Handle {
    /// Add an item to the local queue. Returns false if it was rejected.
    fn enqueue(&mut self, item: &[u8]) -> bool;

    /// Take an item from the local queue
    fn dequeue(&mut self) -> Option<WorkItem>;

    /// Number of items in the local queue
    fn size(&self) -> usize;

    /// Enqueue a string item
    fn enqueue_str(&mut self, item: &str) -> bool {
        self.enqueue(item.as_bytes())
    }
}

impl Handle for LocalQueue {
    fn enqueue(&mut self, item: &[u8]) -> bool {
        LocalQueue::enqueue(self, item).is_ok()
    }

    fn dequeue(&mut self) -> Option<WorkItem> {
        LocalQueue::dequeue(self)
    }

    fn size(&self) -> usize {
        self.len()
    }
}

/// Handle given to callbacks by a running rank
///
/// Records whether anything was enqueued so the termination detector can
/// mark the rank as active since its last token pass.
pub(crate) struct RankHandle<'a> {
    rank: usize,
    queue: &'a mut LocalQueue,
    enqueued: u64,
    dequeued: u64,
}

impl<'a> RankHandle<'a> {
    pub(crate) fn new(rank: usize, queue: &'a mut LocalQueue) -> Self {
        Self {
            rank,
            queue,
            enqueued: 0,
            dequeued: 0,
        }
    }

    /// Items successfully enqueued through this handle
    pub(crate) fn enqueued(&self) -> u64 {
        self.enqueued
    }

    /// Items dequeued through this handle
    pub(crate) fn dequeued(&self) -> u64 {
        self.dequeued
    }
}

impl Handle for RankHandle<'_> {
    fn enqueue(&mut self, item: &[u8]) -> bool {
        match self.queue.enqueue(item) {
            Ok(()) => {
                self.enqueued += 1;
                true
            }
            Err(e) => {
                debug!(rank = self.rank, error = %e, "Enqueue rejected");
                false
            }
        }
    }

    fn dequeue(&mut self) -> Option<WorkItem> {
        let item = self.queue.dequeue()?;
        self.dequeued += 1;
        Some(item)
    }

    fn size(&self) -> usize {
        self.queue.len()
    }
}
