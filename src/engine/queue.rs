//! Per-rank local work queue
//!
//! The local queue is the only place work items physically live. It is
//! owned by exactly one rank's control loop; other ranks only ever see its
//! items after they have been moved into a steal response.
//!
//! The owner pushes and pops at the back (LIFO, depth-first), while the
//! steal-serve path sheds the oldest items from the front. Keeping the two
//! ends apart means a stolen chunk is the work the owner would reach last.

use crate::error::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Byte that may never appear inside a work item
pub const RESERVED_DELIMITER: u8 = 0;

/// An opaque unit of work
///
/// Items are immutable and intentionally not `Clone`: at any instant an item
/// is owned by one local queue or travels inside one message.
#[derive(PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem(Vec<u8>);

impl WorkItem {
    /// Validate raw bytes against the length limit and delimiter rule
    pub fn new(bytes: Vec<u8>, max_len: usize) -> QueueResult<Self> {
        if bytes.len() > max_len {
            return Err(QueueError::ItemTooLong {
                len: bytes.len(),
                max: max_len,
            });
        }

        if let Some(offset) = bytes.iter().position(|&b| b == RESERVED_DELIMITER) {
            return Err(QueueError::ContainsDelimiter { offset });
        }

        Ok(Self(bytes))
    }

    /// Raw payload
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload as UTF-8, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Take the payload
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => write!(f, "WorkItem({:?})", s),
            None => write!(f, "WorkItem({} bytes)", self.0.len()),
        }
    }
}

/// Counters for a local queue
///
/// Single owner, so plain integers suffice.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Items accepted by `enqueue`
    pub enqueued: u64,

    /// Items handed out by `dequeue`
    pub dequeued: u64,

    /// Enqueue attempts that were rejected
    pub rejected: u64,

    /// Items received from other ranks
    pub stolen_in: u64,

    /// Items given to other ranks
    pub stolen_out: u64,

    /// Items loaded from a restart record
    pub restored: u64,
}

/// Ordered store of pending work items for one rank
pub struct LocalQueue {
    /// Pending items; the back is the owner's end
    items: VecDeque<WorkItem>,

    /// Maximum accepted item length
    max_item_len: usize,

    /// Optional bound on pending items
    capacity: Option<usize>,

    /// Counters
    stats: QueueStats,
}

impl LocalQueue {
    /// Create an empty, unbounded queue
    pub fn new(max_item_len: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_item_len,
            capacity: None,
            stats: QueueStats::default(),
        }
    }

    /// Create an empty queue that holds at most `capacity` items
    pub fn bounded(max_item_len: usize, capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            max_item_len,
            capacity: Some(capacity),
            stats: QueueStats::default(),
        }
    }

    /// Validate and push an item at the owner's end
    pub fn enqueue(&mut self, bytes: &[u8]) -> QueueResult<()> {
        if let Some(capacity) = self.capacity {
            if self.items.len() >= capacity {
                self.stats.rejected += 1;
                return Err(QueueError::QueueFull { capacity });
            }
        }

        match WorkItem::new(bytes.to_vec(), self.max_item_len) {
            Ok(item) => {
                self.items.push_back(item);
                self.stats.enqueued += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.rejected += 1;
                Err(e)
            }
        }
    }

    /// Pop the most recently pushed item
    pub fn dequeue(&mut self) -> Option<WorkItem> {
        let item = self.items.pop_back()?;
        self.stats.dequeued += 1;
        Some(item)
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum accepted item length
    pub fn max_item_len(&self) -> usize {
        self.max_item_len
    }

    /// Counters
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Shed up to `n` items from the end opposite the owner
    ///
    /// The returned chunk keeps the queue's internal order, as does the
    /// remainder.
    pub fn take_from_far(&mut self, n: usize) -> Vec<WorkItem> {
        let n = n.min(self.items.len());
        let chunk: Vec<WorkItem> = self.items.drain(..n).collect();
        self.stats.stolen_out += chunk.len() as u64;
        chunk
    }

    /// Append items received from another rank, keeping their order
    ///
    /// Stolen items were validated when first enqueued, and the capacity
    /// bound is not applied: dropping them would lose work.
    pub fn merge_stolen(&mut self, items: Vec<WorkItem>) {
        self.stats.stolen_in += items.len() as u64;
        self.items.extend(items);
    }

    /// Put back a chunk that could not be delivered
    ///
    /// The chunk returns to the far end in its original order.
    pub fn give_back(&mut self, items: Vec<WorkItem>) {
        self.stats.stolen_out -= items.len() as u64;
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    /// Load items from a restart record
    pub fn restore(&mut self, items: Vec<WorkItem>) {
        self.stats.restored += items.len() as u64;
        self.items.extend(items);
    }

    /// Iterate pending items from the far end to the owner's end
    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter()
    }
}

impl fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQueue")
            .field("len", &self.items.len())
            .field("max_item_len", &self.max_item_len)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(queue: &LocalQueue) -> Vec<&str> {
        queue.iter().map(|i| i.as_str().unwrap()).collect()
    }

    #[test]
    fn test_queue_basic() {
        let mut queue = LocalQueue::new(64);
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());

        queue.enqueue(b"/a").unwrap();
        queue.enqueue(b"/b").unwrap();
        assert_eq!(queue.len(), 2);

        // Owner end is LIFO
        assert_eq!(queue.dequeue().unwrap().as_bytes(), b"/b");
        assert_eq!(queue.dequeue().unwrap().as_bytes(), b"/a");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_enqueue_rejections() {
        let mut queue = LocalQueue::bounded(4, 2);

        assert_eq!(
            queue.enqueue(b"toolong"),
            Err(QueueError::ItemTooLong { len: 7, max: 4 })
        );
        assert_eq!(
            queue.enqueue(b"a\0b"),
            Err(QueueError::ContainsDelimiter { offset: 1 })
        );

        queue.enqueue(b"1").unwrap();
        queue.enqueue(b"2").unwrap();
        assert_eq!(
            queue.enqueue(b"3"),
            Err(QueueError::QueueFull { capacity: 2 })
        );

        assert_eq!(queue.stats().rejected, 3);
        assert_eq!(queue.stats().enqueued, 2);
    }

    #[test]
    fn test_take_from_far_preserves_order() {
        let mut queue = LocalQueue::new(16);
        for item in ["1", "2", "3", "4", "5"] {
            queue.enqueue(item.as_bytes()).unwrap();
        }

        let chunk = queue.take_from_far(2);
        let chunk: Vec<_> = chunk.iter().map(|i| i.as_str().unwrap()).collect();
        assert_eq!(chunk, vec!["1", "2"]);
        assert_eq!(contents(&queue), vec!["3", "4", "5"]);

        // Asking for more than is present drains the queue
        let rest = queue.take_from_far(10);
        assert_eq!(rest.len(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().stolen_out, 5);
    }

    #[test]
    fn test_merge_stolen_ignores_capacity() {
        let mut victim = LocalQueue::new(16);
        for item in ["a", "b", "c", "d"] {
            victim.enqueue(item.as_bytes()).unwrap();
        }

        let mut thief = LocalQueue::bounded(16, 1);
        thief.enqueue(b"x").unwrap();
        thief.merge_stolen(victim.take_from_far(2));

        assert_eq!(contents(&thief), vec!["x", "a", "b"]);
        assert_eq!(thief.stats().stolen_in, 2);
        assert_eq!(victim.len() + thief.len(), 5);
    }

    #[test]
    fn test_give_back_restores_order() {
        let mut queue = LocalQueue::new(16);
        for item in ["1", "2", "3", "4"] {
            queue.enqueue(item.as_bytes()).unwrap();
        }

        let chunk = queue.take_from_far(2);
        queue.give_back(chunk);
        assert_eq!(contents(&queue), vec!["1", "2", "3", "4"]);
        assert_eq!(queue.stats().stolen_out, 0);
    }

    #[test]
    fn test_work_item_debug() {
        let item = WorkItem::new(b"hello".to_vec(), 16).unwrap();
        assert_eq!(format!("{:?}", item), "WorkItem(\"hello\")");

        let item = WorkItem::new(vec![0xff, 0xfe], 16).unwrap();
        assert_eq!(format!("{:?}", item), "WorkItem(2 bytes)");
        assert!(item.as_str().is_none());
    }
}
