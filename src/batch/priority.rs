//! Priority Queue Implementation
//!
//! Three independent bands (high, medium, low), each ordered by priority
//! (higher first), then submission time, then insertion sequence.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Queue band a priority maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityBand {
    High,
    Medium,
    Low,
}

impl PriorityBand {
    /// Bands in dispatch order
    pub const ALL: [PriorityBand; 3] = [PriorityBand::High, PriorityBand::Medium, PriorityBand::Low];

    /// `priority >= high` is High, `priority <= low` is Low, anything between is Medium
    pub fn classify(priority: i32, high_threshold: i32, low_threshold: i32) -> Self {
        if priority >= high_threshold {
            PriorityBand::High
        } else if priority <= low_threshold {
            PriorityBand::Low
        } else {
            PriorityBand::Medium
        }
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PriorityBand::High => "high",
            PriorityBand::Medium => "medium",
            PriorityBand::Low => "low",
        };
        f.write_str(name)
    }
}

/// An item with priority for queue ordering
#[derive(Debug, Clone)]
pub struct PrioritizedItem<T> {
    /// Higher value = more urgent
    pub priority: i32,
    /// Submission instant (FIFO within the same priority)
    pub timestamp: Instant,
    /// Unique sequence number for stable ordering
    pub sequence: u64,
    pub item: T,
}

impl<T> PartialEq for PrioritizedItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for PrioritizedItem<T> {}

impl<T> PartialOrd for PrioritizedItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PrioritizedItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: greater pops first, so earlier timestamps and sequences compare greater
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Bounded priority queue
pub struct PriorityQueue<T> {
    heap: BinaryHeap<PrioritizedItem<T>>,
    sequence_counter: u64,
    max_size: usize,
}

impl<T> PriorityQueue<T> {
    /// Create a new priority queue with given maximum size
    pub fn new(max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(max_size.min(1024)),
            sequence_counter: 0,
            max_size,
        }
    }

    /// Push an item submitted now. Returns the item back when the queue is full.
    pub fn push(&mut self, item: T, priority: i32) -> std::result::Result<(), T> {
        self.push_at(item, priority, Instant::now())
    }

    /// Push an item with an explicit submission instant
    pub fn push_at(&mut self, item: T, priority: i32, timestamp: Instant) -> std::result::Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.force_push_at(item, priority, timestamp);
        Ok(())
    }

    /// Push ignoring the size bound
    pub fn force_push_at(&mut self, item: T, priority: i32, timestamp: Instant) {
        let sequence = self.sequence_counter;
        self.sequence_counter = self.sequence_counter.wrapping_add(1);
        self.heap.push(PrioritizedItem {
            priority,
            timestamp,
            sequence,
            item,
        });
    }

    /// Put back a previously popped item, keeping its ordering key.
    /// Ignores the size bound.
    pub fn requeue(&mut self, item: PrioritizedItem<T>) {
        self.heap.push(item);
    }

    /// Pop the highest priority item
    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|p| p.item)
    }

    /// Pop with priority information
    pub fn pop_with_priority(&mut self) -> Option<PrioritizedItem<T>> {
        self.heap.pop()
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|p| &p.item)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.max_size
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Change the bound. Items already queued are kept.
    pub fn set_capacity(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Drain all items in priority order
    pub fn drain_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.heap)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|p| p.item)
            .collect()
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Priority queue shared between submitters and the dispatcher
pub struct BlockingPriorityQueue<T> {
    inner: Mutex<PriorityQueue<T>>,
    available: Condvar,
}

impl<T> BlockingPriorityQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(PriorityQueue::new(max_size)),
            available: Condvar::new(),
        }
    }

    /// Enqueue and wake one waiter. Returns the item back when full.
    pub fn push(&self, item: T, priority: i32, submitted_at: Instant) -> std::result::Result<(), T> {
        self.inner.lock().push_at(item, priority, submitted_at)?;
        self.available.notify_one();
        Ok(())
    }

    /// Put back an item that was taken but not dispatched. Ignores the bound.
    pub fn restore(&self, item: T, priority: i32, submitted_at: Instant) {
        self.inner.lock().force_push_at(item, priority, submitted_at);
        self.available.notify_one();
    }

    /// Non-blocking pop
    pub fn poll(&self) -> Option<T> {
        self.inner.lock().pop()
    }

    /// Pop, waiting at most `timeout` for an item to arrive
    pub fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.lock();
        loop {
            if let Some(item) = queue.pop() {
                return Some(item);
            }
            if self.available.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop();
            }
        }
    }

    /// Pop at most `scan_limit` items under a single lock hold, keep up to
    /// `max_take` of those accepted by `accept`, and requeue the rest with
    /// their original ordering keys.
    pub fn drain_matching<F>(&self, scan_limit: usize, max_take: usize, mut accept: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut queue = self.inner.lock();
        let mut taken = Vec::new();
        let mut rejected = Vec::new();

        for _ in 0..scan_limit {
            if taken.len() >= max_take {
                break;
            }
            match queue.pop_with_priority() {
                Some(entry) if accept(&entry.item) => taken.push(entry.item),
                Some(entry) => rejected.push(entry),
                None => break,
            }
        }
        for entry in rejected {
            queue.requeue(entry);
        }
        taken
    }

    pub fn drain_all(&self) -> Vec<T> {
        self.inner.lock().drain_all()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn set_capacity(&self, max_size: usize) {
        self.inner.lock().set_capacity(max_size);
    }

    /// Wake every waiter (used on stop)
    pub fn wake_all(&self) {
        self.available.notify_all();
    }
}

/// Queue depth per band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QueueDepths {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

/// The three band queues
pub struct BandQueues<T> {
    high: BlockingPriorityQueue<T>,
    medium: BlockingPriorityQueue<T>,
    low: BlockingPriorityQueue<T>,
}

impl<T> BandQueues<T> {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            high: BlockingPriorityQueue::new(max_queue_size),
            medium: BlockingPriorityQueue::new(max_queue_size),
            low: BlockingPriorityQueue::new(max_queue_size),
        }
    }

    pub fn band(&self, band: PriorityBand) -> &BlockingPriorityQueue<T> {
        match band {
            PriorityBand::High => &self.high,
            PriorityBand::Medium => &self.medium,
            PriorityBand::Low => &self.low,
        }
    }

    pub fn push(
        &self,
        band: PriorityBand,
        item: T,
        priority: i32,
        submitted_at: Instant,
    ) -> std::result::Result<(), T> {
        self.band(band).push(item, priority, submitted_at)
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            high: self.high.len(),
            medium: self.medium.len(),
            low: self.low.len(),
        }
    }

    pub fn set_capacity(&self, max_queue_size: usize) {
        for band in PriorityBand::ALL {
            self.band(band).set_capacity(max_queue_size);
        }
    }

    /// Empty every band, high first
    pub fn drain_all(&self) -> Vec<T> {
        PriorityBand::ALL
            .iter()
            .flat_map(|&band| self.band(band).drain_all())
            .collect()
    }

    pub fn wake_all(&self) {
        for band in PriorityBand::ALL {
            self.band(band).wake_all();
        }
    }
}
