//! The aggregation stage.
//!
//! Aggregators accumulate metrics over fixed wall-clock windows and emit
//! derived metrics when a window closes. Each configured aggregator is wrapped
//! in a `RunningAggregator` which owns the window bounds and serializes access
//! to the plugin behind a mutex, so `add` may be called from the processing
//! thread while the stage's timer thread pushes.
//!
//! A window `[start, end)` accepts metrics whose timestamp falls within
//! `[start, end + delay)`. It is pushed once wall time passes `end + delay`,
//! after which the next window starts at `end`. Because the accepted range only
//! ever moves forward a pushed window never re-opens: late metrics are
//! rejected and counted instead.

use crate::filter::{NameModifier, Selector};
use crate::metric::Metric;
use crate::thread::{self, Latch, ThreadHandle};
use crate::time;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

mod basicstats;

pub use self::basicstats::{BasicStats, BasicStatsConfig};

/// The aggregator contract.
pub trait Aggregator: Send {
    /// Fold `metric` into the current window. Never fails; metrics the
    /// aggregator cannot use are ignored.
    fn add(&mut self, metric: &Metric);
    /// Emit the derived metrics of the current window onto `acc`.
    fn push(&mut self, acc: &mut Vec<Metric>);
    /// Forget the current window.
    fn reset(&mut self);
}

/// Settings of a `RunningAggregator`, already validated.
#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// Unique name, e.g. `aggregators.basicstats`.
    pub name: String,
    /// Window length.
    pub period: Duration,
    /// Grace period after a window ends during which late metrics are still
    /// accepted.
    pub delay: Duration,
    /// Whether accepted metrics are withheld from the destinations.
    pub drop_original: bool,
    /// Which metrics the aggregator sees.
    pub selector: Selector,
    /// Renaming applied to pushed metrics.
    pub modifier: NameModifier,
}

struct Window {
    aggregator: Box<dyn Aggregator>,
    start: i64,
    end: i64,
}

/// An aggregator plus its window. See module documentation.
pub struct RunningAggregator {
    name: String,
    period: i64,
    delay: i64,
    drop_original: bool,
    selector: Selector,
    modifier: NameModifier,
    window: Mutex<Window>,
    rejected: AtomicUsize,
}

impl RunningAggregator {
    /// Wrap `aggregator`. The first window starts at `start_ns`, in
    /// nanoseconds since the epoch; when `round` is set it is truncated to a
    /// multiple of the period first.
    pub fn new(
        config: AggregatorConfig,
        aggregator: Box<dyn Aggregator>,
        start_ns: i64,
        round: bool,
    ) -> RunningAggregator {
        let period = (time::duration_ns(config.period) as i64).max(1);
        let start = if round {
            start_ns - start_ns.rem_euclid(period)
        } else {
            start_ns
        };
        RunningAggregator {
            name: config.name,
            period,
            delay: time::duration_ns(config.delay) as i64,
            drop_original: config.drop_original,
            selector: config.selector,
            modifier: config.modifier,
            window: Mutex::new(Window {
                aggregator,
                start,
                end: start + period,
            }),
            rejected: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<Window> {
        match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The aggregator's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offer `metric` to the current window. Returns true when the metric was
    /// accepted and the original should be withheld from destinations.
    pub fn add(&self, metric: &Metric) -> bool {
        if !self.selector.accepts(metric) {
            return false;
        }
        let mut window = self.lock();
        let ts = metric.timestamp();
        if ts < window.start || ts >= window.end + self.delay {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            trace!(
                "[{}] {} at {} outside window [{}, {})",
                self.name,
                metric.name(),
                ts,
                window.start,
                window.end
            );
            return false;
        }
        match self.selector.select(metric.clone()) {
            Some(selected) => window.aggregator.add(&selected),
            None => return false,
        }
        self.drop_original
    }

    /// Wall-clock time, in nanoseconds, at which the current window is due.
    pub fn due_ns(&self) -> i64 {
        let window = self.lock();
        window.end + self.delay
    }

    /// Emit the current window and reset it, as one step, then advance to the
    /// next window. Derived metrics carry the window start as timestamp.
    pub fn push(&self, acc: &mut Vec<Metric>) {
        let mut window = self.lock();
        let mut out = Vec::new();
        window.aggregator.push(&mut out);
        window.aggregator.reset();
        let start = window.start;
        window.start = window.end;
        window.end += self.period;
        drop(window);
        debug!("[{}] pushed {} metrics for window at {}", self.name, out.len(), start);
        acc.extend(out.into_iter().map(|m| self.modifier.apply(m.time(start))));
    }

    /// Push every window that is due at `now_ns`. Windows skipped while
    /// nothing was due (e.g. a suspended host) are pushed empty.
    pub fn push_due(&self, now_ns: i64, acc: &mut Vec<Metric>) {
        while self.due_ns() <= now_ns {
            self.push(acc);
        }
    }

    /// Metrics refused for falling outside the window.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }
}

fn add_all(aggregators: &[Arc<RunningAggregator>], metric: &Metric) -> bool {
    let mut consumed = false;
    for agg in aggregators {
        consumed |= agg.add(metric);
    }
    consumed
}

/// Shareable handle offering metrics to every aggregator of a stage.
#[derive(Clone)]
pub struct AggregateFeed {
    aggregators: Vec<Arc<RunningAggregator>>,
}

impl AggregateFeed {
    /// Offer `metric` to every aggregator. Returns true when the original
    /// should not be forwarded.
    pub fn add(&self, metric: &Metric) -> bool {
        add_all(&self.aggregators, metric)
    }

    /// Whether there are no aggregators.
    pub fn is_empty(&self) -> bool {
        self.aggregators.is_empty()
    }

    /// Total metrics refused by aggregators for falling outside their window.
    pub fn rejected(&self) -> usize {
        self.aggregators.iter().map(|a| a.rejected()).sum()
    }
}

/// The set of running aggregators and the timer thread pushing them.
pub struct AggregateStage {
    aggregators: Vec<Arc<RunningAggregator>>,
    timer: Option<(Latch, ThreadHandle)>,
}

impl AggregateStage {
    /// Create a stage over `aggregators`. No timer runs until `start`.
    pub fn new(aggregators: Vec<RunningAggregator>) -> AggregateStage {
        AggregateStage {
            aggregators: aggregators.into_iter().map(Arc::new).collect(),
            timer: None,
        }
    }

    /// Whether there are no aggregators.
    pub fn is_empty(&self) -> bool {
        self.aggregators.is_empty()
    }

    /// The `add` side of the stage, for use by the processing thread.
    pub fn feed(&self) -> AggregateFeed {
        AggregateFeed {
            aggregators: self.aggregators.clone(),
        }
    }

    /// Offer `metric` to every aggregator. Returns true when the original
    /// should not be forwarded.
    pub fn add(&self, metric: &Metric) -> bool {
        add_all(&self.aggregators, metric)
    }

    /// Total metrics refused by aggregators for falling outside their window.
    pub fn rejected(&self) -> usize {
        self.aggregators.iter().map(|a| a.rejected()).sum()
    }

    /// Start the timer thread. Each pushed batch of derived metrics is handed
    /// to `emit`.
    pub fn start<F>(&mut self, mut emit: F) -> ::std::io::Result<()>
    where
        F: FnMut(Vec<Metric>) + Send + 'static,
    {
        if self.aggregators.is_empty() || self.timer.is_some() {
            return Ok(());
        }
        let cancel = Latch::new();
        let aggregators = self.aggregators.clone();
        let remote = cancel.clone();
        let handle = thread::spawn("aggregators", move || loop {
            let now = time::now_ns();
            let next = aggregators.iter().map(|a| a.due_ns()).min().unwrap_or(now);
            if next > now && remote.wait_timeout(Duration::from_nanos((next - now) as u64)) {
                return;
            }
            if remote.is_set() {
                return;
            }
            let now = time::now_ns();
            let mut out = Vec::new();
            for agg in &aggregators {
                agg.push_due(now, &mut out);
            }
            if !out.is_empty() {
                emit(out);
            }
        })?;
        self.timer = Some((cancel, handle));
        Ok(())
    }

    /// Stop the timer thread, if running, and push every aggregator's partial
    /// window.
    pub fn finish(&mut self) -> Vec<Metric> {
        if let Some((cancel, handle)) = self.timer.take() {
            cancel.set();
            handle.join();
        }
        let mut out = Vec::new();
        for agg in &self.aggregators {
            agg.push(&mut out);
        }
        out
    }
}
