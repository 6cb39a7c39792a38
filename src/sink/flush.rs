//! The flush controller: one thread per destination moving batches from the
//! delivery buffer into the `Sink`.
//!
//! ```text
//!            tick / forced / batch ready
//!   Idle ─────────────────────────────────▶ Flushing
//!    ▲                                        │  │
//!    │◀──────── success, fatal error ─────────┘  │ retryable error
//!    │                                           ▼
//!    └──── tick / forced / delay elapsed ─── BackingOff
//!
//!   any ── shutdown ──▶ Draining (terminal)
//! ```
//!
//! A flush started by the timer or a forced flush writes at most as many
//! batches as were buffered when it began. A flush started because a full
//! batch became available writes only full batches. A forced flush cancels a
//! pending backoff.

use crate::buffer::{Batch, DeliveryBuffer};
use crate::sink::{RunningSink, Sink, SinkConfig, SinkError};
use crate::thread::{self, ThreadHandle};
use crate::time;
use std::io;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// The states of a flush controller. See module documentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushState {
    /// Waiting for the next reason to flush.
    Idle,
    /// Writing batches.
    Flushing,
    /// Waiting out the delay after a retryable error.
    BackingOff,
    /// Final flush during shutdown.
    Draining,
}

#[derive(Debug, PartialEq)]
enum Reason {
    Timer,
    Forced,
    BatchReady,
    Drain(Instant),
}

#[derive(Default)]
struct Signals {
    forced: bool,
    batch_ready: bool,
    drain: Option<Instant>,
}

/// Signals a flush controller waits on besides its timer.
#[derive(Default)]
pub struct Wake {
    signals: Mutex<Signals>,
    cond: Condvar,
}

impl Wake {
    /// Create a wake with no pending signal.
    pub fn new() -> Wake {
        Wake::default()
    }

    fn lock(&self) -> MutexGuard<Signals> {
        match self.signals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Request an immediate flush of everything buffered.
    pub fn force(&self) {
        self.lock().forced = true;
        self.cond.notify_all();
    }

    /// Signal that a full batch is buffered.
    pub fn batch_ready(&self) {
        let mut signals = self.lock();
        if !signals.batch_ready {
            signals.batch_ready = true;
            self.cond.notify_all();
        }
    }

    /// Whether a batch-ready signal is pending.
    pub fn is_batch_ready(&self) -> bool {
        self.lock().batch_ready
    }

    /// Request the final flush, bounded by `deadline`.
    pub fn drain(&self, deadline: Instant) {
        self.lock().drain = Some(deadline);
        self.cond.notify_all();
    }

    fn wait_until(&self, deadline: Instant) -> Reason {
        let mut signals = self.lock();
        loop {
            if let Some(d) = signals.drain {
                return Reason::Drain(d);
            }
            if signals.forced {
                signals.forced = false;
                signals.batch_ready = false;
                return Reason::Forced;
            }
            if signals.batch_ready {
                signals.batch_ready = false;
                return Reason::BatchReady;
            }
            let now = Instant::now();
            if now >= deadline {
                return Reason::Timer;
            }
            signals = match self.cond.wait_timeout(signals, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// The batch inside `Sink::write`, if any. Once `abandoned` is set the
/// handle has counted that batch as dropped and the controller must neither
/// acknowledge nor requeue it.
#[derive(Default)]
struct InFlight {
    count: usize,
    abandoned: bool,
}

fn lock_in_flight(in_flight: &Mutex<InFlight>) -> MutexGuard<InFlight> {
    match in_flight.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// How a single batch write ended. The buffer has already been settled.
enum Attempt {
    Written,
    Failed(SinkError),
    Abandoned,
}

/// See module documentation.
pub struct FlushController {
    name: String,
    sink: Box<dyn Sink>,
    buffer: Arc<DeliveryBuffer>,
    wake: Arc<Wake>,
    interval: Duration,
    jitter: Duration,
    batch_size: usize,
    retry_base: Duration,
    retry_max: Duration,
    attempts: u32,
    retry_at: Option<Instant>,
    state: Arc<Mutex<FlushState>>,
    in_flight: Arc<Mutex<InFlight>>,
}

impl FlushController {
    /// Create the controller of the destination fed by `running`.
    pub fn new(config: &SinkConfig, sink: Box<dyn Sink>, running: &RunningSink) -> FlushController {
        FlushController {
            name: config.name.clone(),
            sink,
            buffer: running.buffer(),
            wake: running.wake(),
            interval: config.flush_interval,
            jitter: config.flush_jitter,
            batch_size: config.batch_size.max(1),
            retry_base: config.retry_base,
            retry_max: config.retry_max,
            attempts: 0,
            retry_at: None,
            state: Arc::new(Mutex::new(FlushState::Idle)),
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    fn set_state(&self, state: FlushState) {
        let mut cur = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *cur != state {
            trace!("[{}] {:?} -> {:?}", self.name, *cur, state);
            *cur = state;
        }
    }

    /// Start the controller on its own thread.
    pub fn spawn(self) -> io::Result<FlushHandle> {
        let name = self.name.clone();
        let wake = Arc::clone(&self.wake);
        let buffer = Arc::clone(&self.buffer);
        let state = Arc::clone(&self.state);
        let in_flight = Arc::clone(&self.in_flight);
        let thread = thread::spawn(format!("{}.flush", name), move || self.run())?;
        Ok(FlushHandle {
            name,
            wake,
            buffer,
            state,
            in_flight,
            thread,
        })
    }

    fn run(mut self) {
        let mut next_flush = Instant::now() + self.interval + time::jitter(self.jitter);
        loop {
            let wake_at = match self.retry_at {
                Some(retry_at) if retry_at < next_flush => retry_at,
                _ => next_flush,
            };
            match self.wake.wait_until(wake_at) {
                Reason::Drain(deadline) => {
                    self.drain(deadline);
                    return;
                }
                Reason::Forced => {
                    if self.retry_at.take().is_some() {
                        debug!("[{}] forced flush cancels backoff", self.name);
                    }
                    self.flush(false);
                }
                Reason::BatchReady => {
                    if self.retry_at.is_none() {
                        self.flush(true);
                    }
                }
                Reason::Timer => {
                    let now = Instant::now();
                    if now >= next_flush {
                        next_flush = advance(next_flush, self.interval, now);
                        self.retry_at = None;
                        self.flush(false);
                    } else if self.retry_at.map_or(false, |r| now >= r) {
                        self.retry_at = None;
                        self.flush(false);
                    }
                }
            }
            let now = Instant::now();
            if now >= next_flush {
                warn!(
                    "[{}] did not complete within its flush interval of {:?}",
                    self.name, self.interval
                );
                next_flush = advance(next_flush, self.interval, now);
            }
        }
    }

    /// Write buffered batches. With `full_only` only complete batches are
    /// written; otherwise everything buffered at the start is. Stops at the
    /// first error.
    fn flush(&mut self, full_only: bool) {
        let len = self.buffer.len();
        if len == 0 {
            return;
        }
        let budget = if full_only {
            len / self.batch_size
        } else {
            (len + self.batch_size - 1) / self.batch_size
        };
        self.set_state(FlushState::Flushing);
        let start = Instant::now();
        let mut written = 0;
        for _ in 0..budget {
            if full_only && self.buffer.len() < self.batch_size {
                break;
            }
            let batch = self.buffer.drain(self.batch_size);
            if batch.is_empty() {
                break;
            }
            let n = batch.len();
            match self.write_batch(batch) {
                Attempt::Written => written += n,
                Attempt::Failed(e) => {
                    self.fail(n, e);
                    return;
                }
                Attempt::Abandoned => return,
            }
        }
        self.attempts = 0;
        self.set_state(FlushState::Idle);
        debug!(
            "[{}] wrote {} metrics in {:?}, buffer fullness: {} / {} metrics",
            self.name,
            written,
            start.elapsed(),
            self.buffer.len(),
            self.buffer.capacity()
        );
        let dropped = self.buffer.take_dropped_since_report();
        if dropped > 0 {
            warn!("[{}] metric buffer overflow; {} metrics have been dropped", self.name, dropped);
        }
    }

    /// Write `batch` and settle it in the buffer: acknowledged on success,
    /// requeued on a retryable error, dropped on a fatal one. The settling
    /// happens under the in-flight lock so it cannot race `FlushHandle::finish`.
    fn write_batch(&mut self, batch: Batch) -> Attempt {
        lock_in_flight(&self.in_flight).count = batch.len();
        let res = self.sink.write(&batch);
        let mut in_flight = lock_in_flight(&self.in_flight);
        if in_flight.abandoned {
            debug!(
                "[{}] write of {} metrics returned after shutdown gave up on it",
                self.name,
                batch.len()
            );
            return Attempt::Abandoned;
        }
        in_flight.count = 0;
        match res {
            Ok(()) => {
                self.buffer.accept(batch);
                Attempt::Written
            }
            Err(e) => {
                match e {
                    SinkError::Retryable(_) => {
                        self.buffer.requeue(batch);
                    }
                    SinkError::Fatal(_) => self.buffer.reject(batch),
                }
                Attempt::Failed(e)
            }
        }
    }

    fn fail(&mut self, n: usize, err: SinkError) {
        match err {
            SinkError::Retryable(ref e) => {
                self.attempts = self.attempts.saturating_add(1);
                let delay = time::backoff(self.attempts, self.retry_base, self.retry_max);
                self.retry_at = Some(Instant::now() + delay);
                warn!(
                    "[{}] error writing batch of {} metrics, retry {} in {:?}: {}",
                    self.name, n, self.attempts, delay, e
                );
                self.set_state(FlushState::BackingOff);
            }
            SinkError::Fatal(ref e) => {
                self.attempts = 0;
                self.retry_at = None;
                error!("[{}] dropped batch of {} metrics: {}", self.name, n, e);
                self.set_state(FlushState::Idle);
            }
        }
    }

    fn drain(&mut self, deadline: Instant) {
        self.set_state(FlushState::Draining);
        self.retry_at = None;
        while Instant::now() < deadline {
            let batch = self.buffer.drain(self.batch_size);
            if batch.is_empty() {
                break;
            }
            let n = batch.len();
            match self.write_batch(batch) {
                Attempt::Written => {}
                Attempt::Failed(SinkError::Retryable(e)) => {
                    warn!("[{}] final flush of {} metrics failed: {}", self.name, n, e);
                    break;
                }
                Attempt::Failed(SinkError::Fatal(e)) => {
                    error!("[{}] final flush dropped {} metrics: {}", self.name, n, e);
                }
                Attempt::Abandoned => break,
            }
        }
        self.sink.close();
        debug!("[{}] closed with {} metrics unsent", self.name, self.buffer.len());
    }
}

fn advance(mut next: Instant, interval: Duration, now: Instant) -> Instant {
    while next <= now {
        next += interval;
    }
    next
}

/// Control side of a running flush controller.
pub struct FlushHandle {
    name: String,
    wake: Arc<Wake>,
    buffer: Arc<DeliveryBuffer>,
    state: Arc<Mutex<FlushState>>,
    in_flight: Arc<Mutex<InFlight>>,
    thread: ThreadHandle,
}

impl FlushHandle {
    /// The destination's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The controller's current state.
    pub fn state(&self) -> FlushState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Request an immediate flush.
    pub fn force(&self) {
        self.wake.force();
    }

    /// Signal the final flush without waiting for it.
    pub fn drain(&self, deadline: Instant) {
        self.wake.drain(deadline);
    }

    /// Drain and wait for the controller, up to `deadline`. Whatever is still
    /// buffered afterwards, and a batch stuck inside a write that did not
    /// return in time, is dropped. Returns the number of metrics so dropped.
    ///
    /// A write abandoned here that returns later changes no counter.
    pub fn finish(self, deadline: Instant) -> usize {
        self.wake.drain(deadline);
        let (lost, discarded) = if self.thread.join_until(deadline) {
            (0, self.buffer.discard())
        } else {
            let mut in_flight = lock_in_flight(&self.in_flight);
            in_flight.abandoned = true;
            let lost = mem::replace(&mut in_flight.count, 0);
            self.buffer.count_lost(lost);
            (lost, self.buffer.discard())
        };
        if lost + discarded > 0 {
            warn!(
                "[{}] dropped {} metrics at shutdown ({} in flight)",
                self.name,
                lost + discarded,
                lost
            );
        }
        lost + discarded
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffer::OverflowPolicy;
    use crate::metric::Metric;
    use crate::thread::Latch;
    use std::collections::VecDeque;

    /// Records every write; fails according to a script.
    struct Scripted {
        script: Arc<Mutex<VecDeque<Result<(), SinkError>>>>,
        writes: Arc<Mutex<Vec<Vec<i64>>>>,
    }

    impl Sink for Scripted {
        fn write(&mut self, batch: &[Metric]) -> Result<(), SinkError> {
            let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            self.writes
                .lock()
                .unwrap()
                .push(batch.iter().map(|m| m.timestamp()).collect());
            outcome
        }
    }

    struct Fixture {
        running: RunningSink,
        controller: FlushController,
        writes: Arc<Mutex<Vec<Vec<i64>>>>,
    }

    fn fixture(config: SinkConfig, script: Vec<Result<(), SinkError>>) -> Fixture {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let sink = Scripted {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            writes: Arc::clone(&writes),
        };
        let running = RunningSink::new(&config);
        let controller = FlushController::new(&config, Box::new(sink), &running);
        Fixture {
            running,
            controller,
            writes,
        }
    }

    fn config(batch_size: usize) -> SinkConfig {
        let mut config = SinkConfig::new("outputs.scripted");
        config.batch_size = batch_size;
        config.buffer_limit = 100;
        config.overflow_policy = OverflowPolicy::DropOldest;
        config.flush_interval = Duration::from_secs(3_600);
        config.retry_base = Duration::from_secs(3_600);
        config
    }

    fn fill(running: &RunningSink, range: ::std::ops::Range<i64>) {
        let cancel = Latch::new();
        for i in range {
            running.add_metric(Metric::new("m").field("v", i).time(i), &cancel).unwrap();
        }
    }

    fn wait_for<F: Fn() -> bool>(f: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "condition not reached");
            ::std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn flush_writes_only_what_was_buffered() {
        let mut f = fixture(config(2), vec![]);
        fill(&f.running, 0..5);
        f.controller.flush(false);
        assert_eq!(vec![vec![0, 1], vec![2, 3], vec![4]], *f.writes.lock().unwrap());
        assert_eq!(5, f.running.buffer().stats().written);
    }

    #[test]
    fn batch_ready_writes_full_batches_only() {
        let mut f = fixture(config(2), vec![]);
        fill(&f.running, 0..5);
        f.controller.flush(true);
        assert_eq!(vec![vec![0, 1], vec![2, 3]], *f.writes.lock().unwrap());
        assert_eq!(1, f.running.buffer().len());
    }

    #[test]
    fn retryable_error_requeues_and_backs_off() {
        let mut f = fixture(config(2), vec![Err(SinkError::Retryable("down".into()))]);
        fill(&f.running, 0..3);
        f.controller.flush(false);
        assert_eq!(FlushState::BackingOff, *f.controller.state.lock().unwrap());
        assert!(f.controller.retry_at.is_some());
        assert_eq!(3, f.running.buffer().len());

        f.controller.flush(false);
        assert_eq!(FlushState::Idle, *f.controller.state.lock().unwrap());
        let writes = f.writes.lock().unwrap();
        assert_eq!(vec![vec![0, 1], vec![0, 1], vec![2]], *writes);
        assert_eq!(0, f.running.buffer().stats().dropped);
    }

    #[test]
    fn fatal_error_drops_batch_without_retry() {
        let mut f = fixture(config(2), vec![Err(SinkError::Fatal("bad".into()))]);
        fill(&f.running, 0..3);
        f.controller.flush(false);
        assert!(f.controller.retry_at.is_none());
        assert_eq!(FlushState::Idle, *f.controller.state.lock().unwrap());
        let stats = f.running.buffer().stats();
        assert_eq!(2, stats.dropped);
        assert_eq!(1, stats.len);
        assert_eq!(1, f.writes.lock().unwrap().len());
    }

    #[test]
    fn forced_flush_cancels_backoff() {
        let f = fixture(config(10), vec![Err(SinkError::Retryable("down".into()))]);
        let writes = Arc::clone(&f.writes);
        let running = f.running;
        let handle = f.controller.spawn().unwrap();
        fill(&running, 0..3);
        handle.force();
        wait_for(|| handle.state() == FlushState::BackingOff);
        // backoff is an hour; only the forced flush can get us out
        handle.force();
        wait_for(|| running.buffer().is_empty());
        assert_eq!(vec![vec![0, 1, 2], vec![0, 1, 2]], *writes.lock().unwrap());
        assert_eq!(0, handle.finish(Instant::now() + Duration::from_secs(5)));
    }

    #[test]
    fn batch_ready_wakes_controller() {
        let f = fixture(config(4), vec![]);
        let writes = Arc::clone(&f.writes);
        let running = f.running;
        let handle = f.controller.spawn().unwrap();
        fill(&running, 0..5);
        wait_for(|| !writes.lock().unwrap().is_empty());
        assert_eq!(vec![vec![0, 1, 2, 3]], *writes.lock().unwrap());
        assert_eq!(0, handle.finish(Instant::now() + Duration::from_secs(5)));
        // the final flush writes the remainder
        assert_eq!(vec![vec![0, 1, 2, 3], vec![4]], *writes.lock().unwrap());
    }

    #[test]
    fn timer_flushes() {
        let mut c = config(100);
        c.flush_interval = Duration::from_millis(20);
        let f = fixture(c, vec![]);
        let writes = Arc::clone(&f.writes);
        let running = f.running;
        let handle = f.controller.spawn().unwrap();
        fill(&running, 0..3);
        wait_for(|| !writes.lock().unwrap().is_empty());
        assert_eq!(vec![vec![0, 1, 2]], *writes.lock().unwrap());
        handle.finish(Instant::now() + Duration::from_secs(5));
    }

    /// Writes block until released, then report `outcome`.
    struct Hang {
        release: Latch,
        returned: Latch,
        outcome: Result<(), SinkError>,
    }

    impl Hang {
        fn new(outcome: Result<(), SinkError>) -> Hang {
            Hang {
                release: Latch::new(),
                returned: Latch::new(),
                outcome,
            }
        }
    }

    impl Sink for Hang {
        fn write(&mut self, _batch: &[Metric]) -> Result<(), SinkError> {
            self.release.wait_timeout(Duration::from_secs(3_600));
            self.returned.set();
            self.outcome.clone()
        }
    }

    #[test]
    fn finish_abandons_hung_write() {
        let c = config(2);
        let running = RunningSink::new(&c);
        let handle = FlushController::new(&c, Box::new(Hang::new(Ok(()))), &running)
            .spawn()
            .unwrap();
        fill(&running, 0..5);
        let start = Instant::now();
        let dropped = handle.finish(Instant::now() + Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(5, dropped);
        let stats = running.buffer().stats();
        assert_eq!(5, stats.dropped);
        assert_eq!(0, stats.written);
    }

    #[test]
    fn late_write_after_finish_changes_nothing() {
        let outcomes = vec![Ok(()), Err(SinkError::Retryable("late".into()))];
        for outcome in outcomes {
            let c = config(2);
            let running = RunningSink::new(&c);
            let hang = Hang::new(outcome);
            let release = hang.release.clone();
            let returned = hang.returned.clone();
            let handle = FlushController::new(&c, Box::new(hang), &running)
                .spawn()
                .unwrap();
            fill(&running, 0..5);
            handle.force();
            wait_for(|| running.buffer().len() < 5);

            let dropped = handle.finish(Instant::now() + Duration::from_millis(100));
            assert_eq!(5, dropped);
            release.set();
            assert!(returned.wait_timeout(Duration::from_secs(5)));
            ::std::thread::sleep(Duration::from_millis(50));

            let stats = running.buffer().stats();
            assert_eq!(0, stats.written);
            assert_eq!(5, stats.dropped);
            assert_eq!(0, stats.len);
        }
    }
}
