//! Size-accounted chunk queue shared by both stream sides.
//!
//! Every entry carries the size reported by the stream's size algorithm.
//! Sizes are stored in fixed point (micro-units) so the running total is an
//! exact integer sum of the entries currently present: it can never drift
//! negative and is always zero when the queue is empty, no matter how many
//! fractional sizes pass through.

use crate::error::{Error, Reason, Result};
use std::collections::VecDeque;

/// Fixed-point scale: one size unit is stored as `SIZE_SCALE` micro-units.
const SIZE_SCALE: f64 = 1_000_000.0;

/// Largest size accepted for a single chunk.
pub const MAX_CHUNK_SIZE: f64 = (u64::MAX >> 12) as f64 / SIZE_SCALE;

/// An ordered queue of `(chunk, size)` pairs with a running total size.
#[derive(Debug)]
pub struct SizedQueue<T> {
    entries: VecDeque<Entry<T>>,
    total: u64,
    total_enqueued: u64,
    total_dequeued: u64,
}

#[derive(Debug)]
struct Entry<T> {
    chunk: T,
    size: u64,
}

/// Counters logged when a stream drops its queue.
///
/// `total_enqueued` always equals `total_dequeued + current_chunks` plus
/// whatever `reset` threw away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct QueueStats {
    /// Number of chunks currently queued.
    pub(crate) current_chunks: usize,
    /// Total size of the chunks currently queued.
    pub(crate) current_size: f64,
    /// Chunks accepted by `enqueue` or `push_front` since creation.
    pub(crate) total_enqueued: u64,
    /// Chunks removed by `dequeue` since creation.
    pub(crate) total_dequeued: u64,
}

fn to_units(size: f64) -> Result<u64> {
    if !size.is_finite() || size < 0.0 {
        return Err(Error::SizeComputation(Reason::new(format!(
            "chunk size must be a finite, non-negative number (got {size})"
        ))));
    }
    if size > MAX_CHUNK_SIZE {
        return Err(Error::SizeComputation(Reason::new(format!(
            "chunk size {size} exceeds the supported maximum"
        ))));
    }
    Ok((size * SIZE_SCALE).round() as u64)
}

fn from_units(units: u64) -> f64 {
    units as f64 / SIZE_SCALE
}

impl<T> SizedQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total: 0,
            total_enqueued: 0,
            total_dequeued: 0,
        }
    }

    /// Append a chunk with its computed size.
    ///
    /// Fails with [`Error::SizeComputation`] if `size` is not a finite,
    /// non-negative number or the running total would overflow. The queue is
    /// left untouched on failure.
    pub fn enqueue(&mut self, chunk: T, size: f64) -> Result<()> {
        let size = to_units(size)?;
        let total = self.total.checked_add(size).ok_or_else(|| {
            Error::SizeComputation(Reason::new("queue total size overflow"))
        })?;
        self.entries.push_back(Entry { chunk, size });
        self.total = total;
        self.total_enqueued += 1;
        Ok(())
    }

    /// Put a chunk back at the head of the queue.
    ///
    /// Used to return a chunk that was handed to a reader which went away
    /// before taking it.
    pub fn push_front(&mut self, chunk: T, size: f64) -> Result<()> {
        let size = to_units(size)?;
        let total = self.total.checked_add(size).ok_or_else(|| {
            Error::SizeComputation(Reason::new("queue total size overflow"))
        })?;
        self.entries.push_front(Entry { chunk, size });
        self.total = total;
        self.total_enqueued += 1;
        Ok(())
    }

    /// Remove and return the oldest chunk.
    pub fn dequeue(&mut self) -> Option<T> {
        self.dequeue_with_size().map(|(chunk, _)| chunk)
    }

    /// Remove and return the oldest chunk together with its size.
    pub fn dequeue_with_size(&mut self) -> Option<(T, f64)> {
        let entry = self.entries.pop_front()?;
        self.total -= entry.size;
        self.total_dequeued += 1;
        if self.entries.is_empty() {
            debug_assert_eq!(self.total, 0);
            self.total = 0;
        }
        Some((entry.chunk, from_units(entry.size)))
    }

    /// Borrow the oldest chunk.
    pub fn peek(&self) -> Option<&T> {
        self.entries.front().map(|entry| &entry.chunk)
    }

    /// Mutably borrow the oldest chunk without changing the accounting.
    pub fn peek_mut(&mut self) -> Option<&mut T> {
        self.entries.front_mut().map(|entry| &mut entry.chunk)
    }

    /// Size of the oldest chunk.
    pub fn peek_size(&self) -> Option<f64> {
        self.entries.front().map(|entry| from_units(entry.size))
    }

    /// Discard every entry.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.total = 0;
    }

    /// Total size of the chunks currently queued.
    pub fn total_size(&self) -> f64 {
        from_units(self.total)
    }

    /// `high_water_mark - total_size()`.
    pub fn desired_size(&self, high_water_mark: f64) -> f64 {
        high_water_mark - self.total_size()
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn stats(&self) -> QueueStats {
        QueueStats {
            current_chunks: self.entries.len(),
            current_size: self.total_size(),
            total_enqueued: self.total_enqueued,
            total_dequeued: self.total_dequeued,
        }
    }

    #[cfg(test)]
    fn recomputed_total(&self) -> u64 {
        self.entries.iter().map(|entry| entry.size).sum()
    }
}

impl<T> Default for SizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_queue_fifo_order() {
        let mut queue = SizedQueue::new();
        queue.enqueue("a", 1.0).unwrap();
        queue.enqueue("b", 2.0).unwrap();
        queue.enqueue("c", 3.0).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.total_size(), 6.0);
        assert_eq!(queue.peek(), Some(&"a"));
        assert_eq!(queue.peek_size(), Some(1.0));

        assert_eq!(queue.dequeue(), Some("a"));
        assert_eq!(queue.dequeue_with_size(), Some(("b", 2.0)));
        assert_eq!(queue.total_size(), 3.0);
        assert_eq!(queue.dequeue(), Some("c"));
        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn test_queue_rejects_invalid_sizes() {
        let mut queue = SizedQueue::new();
        for size in [-1.0, f64::NAN, f64::INFINITY, f64::MAX] {
            let err = queue.enqueue(0u8, size).unwrap_err();
            assert!(matches!(err, Error::SizeComputation(_)));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn test_queue_fractional_sizes_do_not_drift() {
        let mut queue = SizedQueue::new();
        for i in 0..10_000 {
            queue.enqueue(i, 0.1).unwrap();
        }
        assert_eq!(queue.total_size(), 1000.0);
        for _ in 0..9_999 {
            queue.dequeue();
        }
        assert_eq!(queue.total_size(), 0.1);
        queue.dequeue();
        assert_eq!(queue.total_size(), 0.0);
        assert_eq!(queue.desired_size(1.0), 1.0);
    }

    #[test]
    fn test_queue_reset_and_stats() {
        let mut queue = SizedQueue::new();
        queue.enqueue(1, 4.0).unwrap();
        queue.enqueue(2, 4.0).unwrap();
        queue.dequeue();

        let stats = queue.stats();
        assert_eq!(stats.current_chunks, 1);
        assert_eq!(stats.current_size, 4.0);
        assert_eq!(stats.total_enqueued, 2);
        assert_eq!(stats.total_dequeued, 1);

        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);
        assert_eq!(queue.desired_size(2.0), 2.0);
    }

    #[test]
    fn test_push_front_counts_as_enqueued() {
        let mut queue = SizedQueue::new();
        queue.enqueue(2, 1.0).unwrap();
        queue.push_front(1, 1.0).unwrap();
        assert_eq!(queue.dequeue(), Some(1));

        let stats = queue.stats();
        assert_eq!(stats.total_enqueued, 2);
        assert_eq!(stats.total_dequeued, 1);
        assert_eq!(
            stats.total_enqueued,
            stats.total_dequeued + stats.current_chunks as u64
        );
    }

    #[test]
    fn test_queue_peek_mut_keeps_accounting() {
        let mut queue = SizedQueue::new();
        queue.enqueue(Some(5), 2.5).unwrap();
        let taken = queue.peek_mut().and_then(Option::take);
        assert_eq!(taken, Some(5));
        assert_eq!(queue.total_size(), 2.5);
        assert_eq!(queue.dequeue(), Some(None));
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn test_queue_push_front() {
        let mut queue = SizedQueue::new();
        queue.enqueue("b", 1.0).unwrap();
        queue.push_front("a", 0.5).unwrap();
        assert_eq!(queue.total_size(), 1.5);
        assert_eq!(queue.dequeue(), Some("a"));
        assert_eq!(queue.dequeue(), Some("b"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(f64),
        Dequeue,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0.0f64..1_000.0).prop_map(Op::Enqueue),
            Just(Op::Dequeue),
        ]
    }

    proptest! {
        #[test]
        fn prop_total_matches_live_entries(ops in proptest::collection::vec(op(), 0..200)) {
            let mut queue = SizedQueue::new();
            for op in ops {
                match op {
                    Op::Enqueue(size) => queue.enqueue((), size).unwrap(),
                    Op::Dequeue => {
                        queue.dequeue();
                    }
                }
                prop_assert_eq!(queue.total, queue.recomputed_total());
                prop_assert!(queue.total_size() >= 0.0);
                if queue.is_empty() {
                    prop_assert_eq!(queue.total_size(), 0.0);
                }
            }
        }
    }
}
