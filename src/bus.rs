//! The metric bus: a bounded, multi-producer hand-off queue between source
//! tasks and the processing loop.
//!
//! Producers suspend when the bus is full. The queue is a single FIFO so each
//! producer's metrics come out in the order that producer published them;
//! nothing is promised about interleaving between producers.

use crate::metric::Metric;
use crate::thread::{Latch, POLL_INTERVAL};
use std::collections::VecDeque;
use std::error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Why a publish did not enqueue its metric. The metric is handed back.
#[derive(Debug, PartialEq)]
pub enum PublishError {
    /// The bus has been closed to new publishes.
    Closed(Metric),
    /// The caller's cancellation latch was set while waiting for room.
    Cancelled(Metric),
    /// The bus was full and the caller would not wait.
    Full(Metric),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PublishError::Closed(_) => write!(f, "metric bus is closed"),
            PublishError::Cancelled(_) => write!(f, "publish cancelled"),
            PublishError::Full(_) => write!(f, "metric bus is full"),
        }
    }
}

impl error::Error for PublishError {}

struct State {
    queue: VecDeque<Metric>,
    closed: bool,
}

/// See module documentation.
pub struct MetricBus {
    capacity: usize,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    published: AtomicUsize,
}

impl MetricBus {
    /// Create a bus holding at most `capacity` metrics. A zero capacity is
    /// treated as one.
    pub fn new(capacity: usize) -> MetricBus {
        let capacity = capacity.max(1);
        MetricBus {
            capacity,
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            published: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue `metric`, suspending while the bus is full.
    ///
    /// Fails once the bus is closed, or when `cancel` is set while waiting for
    /// room.
    pub fn publish(&self, metric: Metric, cancel: &Latch) -> Result<(), PublishError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(PublishError::Closed(metric));
            }
            if state.queue.len() < self.capacity {
                state.queue.push_back(metric);
                self.published.fetch_add(1, Ordering::Relaxed);
                self.not_empty.notify_one();
                return Ok(());
            }
            if cancel.is_set() {
                return Err(PublishError::Cancelled(metric));
            }
            state = match self.not_full.wait_timeout(state, POLL_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Enqueue `metric` only if there is room right now. Never suspends.
    pub fn try_publish(&self, metric: Metric) -> Result<(), PublishError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PublishError::Closed(metric));
        }
        if state.queue.len() >= self.capacity {
            return Err(PublishError::Full(metric));
        }
        state.queue.push_back(metric);
        self.published.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the next metric, suspending while the bus is empty. Returns
    /// `None` once the bus is closed and fully drained.
    pub fn consume(&self) -> Option<Metric> {
        let mut state = self.lock();
        loop {
            if let Some(metric) = state.queue.pop_front() {
                self.not_full.notify_one();
                return Some(metric);
            }
            if state.closed {
                return None;
            }
            state = match self.not_empty.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Close the bus to new publishes. Metrics already queued remain
    /// consumable.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Remove everything still queued, returning how many metrics that was.
    pub fn discard(&self) -> usize {
        let mut state = self.lock();
        let n = state.queue.len();
        state.queue.clear();
        self.not_full.notify_all();
        n
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Metrics currently queued.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no metrics are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total metrics ever accepted by `publish`.
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}
