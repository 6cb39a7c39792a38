//! Per-destination delivery buffer.
//!
//! Each sink owns exactly one `DeliveryBuffer`. The fan-out stage inserts with
//! `offer`, the sink's flush controller removes with `drain` and gives back
//! undelivered batches with `requeue`. Occupancy never exceeds capacity; what
//! happens when an insert would exceed it is the buffer's `OverflowPolicy`.
//!
//! Delivery through a buffer is at-least-once while failures clear before the
//! buffer fills, and degrades to at-most-once under sustained failure: a
//! requeue that would overflow drops the oldest metrics, counting them.

use crate::metric::Metric;
use crate::thread::{Latch, POLL_INTERVAL};
use std::collections::VecDeque;
use std::error;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

/// What to do when a metric is offered to a full buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum OverflowPolicy {
    /// Suspend the offering thread until the flush controller makes room.
    #[serde(rename = "block-producer")]
    BlockProducer,
    /// Evict the oldest retained metric to admit the new one.
    #[serde(rename = "drop-oldest")]
    DropOldest,
}

impl Default for OverflowPolicy {
    fn default() -> OverflowPolicy {
        OverflowPolicy::DropOldest
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<OverflowPolicy, String> {
        match s {
            "block-producer" => Ok(OverflowPolicy::BlockProducer),
            "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(format!(
                "unknown overflow policy '{}', expected block-producer or drop-oldest",
                other
            )),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OverflowPolicy::BlockProducer => write!(f, "block-producer"),
            OverflowPolicy::DropOldest => write!(f, "drop-oldest"),
        }
    }
}

/// An ordered run of metrics drained from a buffer for one delivery attempt.
///
/// A batch is read-only once drained; the flush controller either
/// acknowledges it, hands it back with `requeue`, or drops it.
#[derive(Debug, Default, PartialEq)]
pub struct Batch {
    metrics: Vec<Metric>,
}

impl Batch {
    /// Consume the batch, returning its metrics in order.
    pub fn into_vec(self) -> Vec<Metric> {
        self.metrics
    }
}

impl Deref for Batch {
    type Target = [Metric];

    fn deref(&self) -> &[Metric] {
        &self.metrics
    }
}

/// Why an offer did not insert its metric. The metric is handed back.
#[derive(Debug, PartialEq)]
pub enum OfferError {
    /// The caller's cancellation latch was set while waiting for room.
    Cancelled(Metric),
}

impl fmt::Display for OfferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OfferError::Cancelled(_) => write!(f, "offer cancelled while buffer full"),
        }
    }
}

impl error::Error for OfferError {}

/// A point-in-time view of a buffer's counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferStats {
    /// Metrics accepted by `offer` since creation.
    pub added: usize,
    /// Metrics acknowledged as delivered since creation.
    pub written: usize,
    /// Metrics dropped for any reason since creation.
    pub dropped: usize,
    /// Metrics currently held.
    pub len: usize,
    /// Maximum metrics held.
    pub capacity: usize,
}

/// See module documentation.
pub struct DeliveryBuffer {
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    queue: Mutex<VecDeque<Metric>>,
    not_full: Condvar,
    added: AtomicUsize,
    written: AtomicUsize,
    dropped: AtomicUsize,
    dropped_since_report: AtomicUsize,
}

impl DeliveryBuffer {
    /// Create a buffer for the sink `name`. A zero capacity is treated as one.
    pub fn new<S>(name: S, capacity: usize, policy: OverflowPolicy) -> DeliveryBuffer
    where
        S: Into<String>,
    {
        let capacity = capacity.max(1);
        DeliveryBuffer {
            name: name.into(),
            capacity,
            policy,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            added: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            dropped_since_report: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<VecDeque<Metric>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn count_dropped(&self, n: usize) {
        if n > 0 {
            self.dropped.fetch_add(n, Ordering::Relaxed);
            self.dropped_since_report.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Insert `metric`, applying the overflow policy if the buffer is full.
    ///
    /// Under `BlockProducer` this suspends until room is made or `cancel` is
    /// set. Under `DropOldest` it never suspends.
    pub fn offer(&self, metric: Metric, cancel: &Latch) -> Result<(), OfferError> {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    while queue.len() >= self.capacity {
                        queue.pop_front();
                        self.count_dropped(1);
                    }
                }
                OverflowPolicy::BlockProducer => {
                    while queue.len() >= self.capacity {
                        if cancel.is_set() {
                            return Err(OfferError::Cancelled(metric));
                        }
                        queue = match self.not_full.wait_timeout(queue, POLL_INTERVAL) {
                            Ok((guard, _)) => guard,
                            Err(poisoned) => poisoned.into_inner().0,
                        };
                    }
                }
            }
        }
        queue.push_back(metric);
        self.added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Atomically remove up to `max` metrics from the front, in FIFO order.
    pub fn drain(&self, max: usize) -> Batch {
        let mut queue = self.lock();
        let n = max.min(queue.len());
        let metrics: Vec<Metric> = queue.drain(..n).collect();
        if n > 0 {
            self.not_full.notify_all();
        }
        Batch { metrics }
    }

    /// Reinsert an undelivered batch at the front, preserving its order.
    ///
    /// If that overflows the buffer the oldest metrics, which may include
    /// some of the batch itself, are dropped and counted. Never suspends.
    /// Returns the number of metrics dropped.
    pub fn requeue(&self, batch: Batch) -> usize {
        let mut queue = self.lock();
        for metric in batch.metrics.into_iter().rev() {
            queue.push_front(metric);
        }
        let mut dropped = 0;
        while queue.len() > self.capacity {
            queue.pop_front();
            dropped += 1;
        }
        self.count_dropped(dropped);
        if dropped > 0 {
            warn!(
                "[{}] buffer overflow on requeue, dropped {} metrics",
                self.name, dropped
            );
        }
        dropped
    }

    /// Record a batch as delivered.
    pub fn accept(&self, batch: Batch) {
        self.written.fetch_add(batch.len(), Ordering::Relaxed);
    }

    /// Record a batch as dropped without delivery.
    pub fn reject(&self, batch: Batch) {
        self.count_dropped(batch.len());
    }

    /// Count `n` metrics as dropped that were held outside the buffer, such as
    /// a batch lost inside a write that never returned.
    pub fn count_lost(&self, n: usize) {
        self.count_dropped(n);
    }

    /// Remove and drop everything held, returning how many metrics that was.
    pub fn discard(&self) -> usize {
        let mut queue = self.lock();
        let n = queue.len();
        queue.clear();
        self.count_dropped(n);
        self.not_full.notify_all();
        n
    }

    /// Metrics currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no metrics are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum metrics held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The configured overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// The owning sink's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metrics dropped since the previous call.
    pub fn take_dropped_since_report(&self) -> usize {
        self.dropped_since_report.swap(0, Ordering::Relaxed)
    }

    /// Snapshot of the buffer's counters.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            added: self.added.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn m(i: i64) -> Metric {
        Metric::new("cpu").field("value", i).time(i)
    }

    fn times(batch: &Batch) -> Vec<i64> {
        batch.iter().map(|m| m.timestamp()).collect()
    }

    #[derive(Clone, Debug)]
    enum Op {
        Offer,
        Drain(u8),
        RequeueLast,
    }

    impl quickcheck::Arbitrary for Op {
        fn arbitrary<G: quickcheck::Gen>(g: &mut G) -> Op {
            let choice: u8 = quickcheck::Arbitrary::arbitrary(g);
            match choice % 3 {
                0 => Op::Offer,
                1 => Op::Drain(quickcheck::Arbitrary::arbitrary(g)),
                _ => Op::RequeueLast,
            }
        }
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        fn inner(capacity: u8, ops: Vec<Op>) -> TestResult {
            if capacity == 0 {
                return TestResult::discard();
            }
            let buffer = DeliveryBuffer::new("qc", capacity as usize, OverflowPolicy::DropOldest);
            let cancel = Latch::new();
            let mut last: Option<Batch> = None;
            let mut idx = 0;
            for op in ops {
                match op {
                    Op::Offer => {
                        buffer.offer(m(idx), &cancel).unwrap();
                        idx += 1;
                    }
                    Op::Drain(n) => last = Some(buffer.drain(n as usize)),
                    Op::RequeueLast => {
                        if let Some(batch) = last.take() {
                            buffer.requeue(batch);
                        }
                    }
                }
                if buffer.len() > buffer.capacity() {
                    return TestResult::failed();
                }
            }
            TestResult::passed()
        }
        QuickCheck::new()
            .tests(1000)
            .quickcheck(inner as fn(u8, Vec<Op>) -> TestResult);
    }

    #[test]
    fn drain_is_fifo_without_drops() {
        fn inner(capacity: u8, count: u8, batch: u8) -> TestResult {
            if capacity == 0 || batch == 0 || count > capacity {
                return TestResult::discard();
            }
            let buffer = DeliveryBuffer::new("qc", capacity as usize, OverflowPolicy::DropOldest);
            let cancel = Latch::new();
            for i in 0..i64::from(count) {
                buffer.offer(m(i), &cancel).unwrap();
            }
            let mut seen = Vec::new();
            loop {
                let b = buffer.drain(batch as usize);
                if b.is_empty() {
                    break;
                }
                seen.extend(times(&b));
            }
            let expected: Vec<i64> = (0..i64::from(count)).collect();
            TestResult::from_bool(seen == expected)
        }
        QuickCheck::new()
            .tests(1000)
            .quickcheck(inner as fn(u8, u8, u8) -> TestResult);
    }

    #[test]
    fn drop_oldest_keeps_newest() {
        let buffer = DeliveryBuffer::new("test", 2, OverflowPolicy::DropOldest);
        let cancel = Latch::new();
        buffer.offer(m(1), &cancel).unwrap();
        buffer.offer(m(2), &cancel).unwrap();
        buffer.offer(m(3), &cancel).unwrap();

        assert_eq!(2, buffer.len());
        assert_eq!(1, buffer.stats().dropped);
        assert_eq!(vec![2, 3], times(&buffer.drain(10)));
    }

    #[test]
    fn drain_zero_and_empty() {
        let buffer = DeliveryBuffer::new("test", 5, OverflowPolicy::DropOldest);
        assert!(buffer.drain(3).is_empty());
        buffer.offer(m(1), &Latch::new()).unwrap();
        assert!(buffer.drain(0).is_empty());
        assert_eq!(1, buffer.len());
    }

    #[test]
    fn requeue_goes_to_front_in_order() {
        let buffer = DeliveryBuffer::new("test", 10, OverflowPolicy::DropOldest);
        let cancel = Latch::new();
        for i in 0..5 {
            buffer.offer(m(i), &cancel).unwrap();
        }
        let batch = buffer.drain(3);
        buffer.offer(m(5), &cancel).unwrap();
        assert_eq!(0, buffer.requeue(batch));
        assert_eq!(vec![0, 1, 2, 3, 4, 5], times(&buffer.drain(10)));
    }

    #[test]
    fn requeue_overflow_drops_oldest() {
        let buffer = DeliveryBuffer::new("test", 4, OverflowPolicy::DropOldest);
        let cancel = Latch::new();
        for i in 0..4 {
            buffer.offer(m(i), &cancel).unwrap();
        }
        let batch = buffer.drain(3);
        for i in 4..7 {
            buffer.offer(m(i), &cancel).unwrap();
        }
        // 0 1 2 requeued ahead of 3 4 5 6, capacity 4: 0 1 2 go.
        assert_eq!(3, buffer.requeue(batch));
        assert_eq!(vec![3, 4, 5, 6], times(&buffer.drain(10)));
        assert_eq!(3, buffer.stats().dropped);
    }

    #[test]
    fn requeue_overflow_under_block_producer_does_not_block() {
        let buffer = DeliveryBuffer::new("test", 2, OverflowPolicy::BlockProducer);
        let cancel = Latch::new();
        buffer.offer(m(0), &cancel).unwrap();
        buffer.offer(m(1), &cancel).unwrap();
        let batch = buffer.drain(2);
        buffer.offer(m(2), &cancel).unwrap();
        buffer.offer(m(3), &cancel).unwrap();
        assert_eq!(2, buffer.requeue(batch));
        assert_eq!(vec![2, 3], times(&buffer.drain(10)));
    }

    #[test]
    fn block_producer_waits_for_drain() {
        let buffer = Arc::new(DeliveryBuffer::new("test", 1, OverflowPolicy::BlockProducer));
        let cancel = Latch::new();
        buffer.offer(m(0), &cancel).unwrap();

        let remote = Arc::clone(&buffer);
        let producer = thread::spawn(move || remote.offer(m(1), &Latch::new()));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(1, buffer.len());
        assert_eq!(vec![0], times(&buffer.drain(1)));
        producer.join().unwrap().unwrap();
        assert_eq!(vec![1], times(&buffer.drain(1)));
        assert_eq!(0, buffer.stats().dropped);
    }

    #[test]
    fn block_producer_honors_cancel() {
        let buffer = DeliveryBuffer::new("test", 1, OverflowPolicy::BlockProducer);
        let cancel = Latch::new();
        buffer.offer(m(0), &cancel).unwrap();
        let remote = cancel.clone();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.set();
        });
        let start = Instant::now();
        match buffer.offer(m(1), &cancel) {
            Err(OfferError::Cancelled(metric)) => assert_eq!(1, metric.timestamp()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        setter.join().unwrap();
    }

    #[test]
    fn counters() {
        let buffer = DeliveryBuffer::new("test", 3, OverflowPolicy::DropOldest);
        let cancel = Latch::new();
        for i in 0..5 {
            buffer.offer(m(i), &cancel).unwrap();
        }
        let batch = buffer.drain(2);
        buffer.accept(batch);
        let batch = buffer.drain(1);
        buffer.reject(batch);
        let stats = buffer.stats();
        assert_eq!(5, stats.added);
        assert_eq!(2, stats.written);
        assert_eq!(3, stats.dropped);
        assert_eq!(0, stats.len);
        assert_eq!(3, buffer.take_dropped_since_report());
        assert_eq!(0, buffer.take_dropped_since_report());
    }

    #[test]
    fn discard_counts() {
        let buffer = DeliveryBuffer::new("test", 3, OverflowPolicy::BlockProducer);
        let cancel = Latch::new();
        for i in 0..3 {
            buffer.offer(m(i), &cancel).unwrap();
        }
        assert_eq!(3, buffer.discard());
        assert_eq!(3, buffer.stats().dropped);
        assert!(buffer.is_empty());
    }
}
