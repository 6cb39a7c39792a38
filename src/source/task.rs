//! Source task runner.
//!
//! Every source gets two threads. The scheduler thread owns the timer: it
//! parks on the task's cancellation latch until the next tick. The collector
//! thread owns the `Source` and runs one collection per tick it is handed.
//! Splitting them lets the scheduler notice, and skip, a tick that arrives
//! while the previous collection is still running; a source never runs
//! concurrently with itself and missed ticks are not queued.

use crate::bus::{MetricBus, PublishError};
use crate::metric::{Metric, TagMap};
use crate::source::{Source, SourceConfig};
use crate::thread::{self, Latch, ThreadHandle};
use crate::time;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters describing a source's collections.
#[derive(Debug, Default)]
pub struct SourceStats {
    in_flight: AtomicBool,
    /// Collections started.
    pub gathers: AtomicUsize,
    /// Collections finished, successful or not.
    pub completed: AtomicUsize,
    /// Collections which returned an error.
    pub errors: AtomicUsize,
    /// Ticks skipped because a collection was still running.
    pub overruns: AtomicUsize,
    /// Metrics published onto the bus.
    pub metrics: AtomicUsize,
    /// Metrics gathered but not published because of cancellation or a
    /// closed bus.
    pub dropped: AtomicUsize,
    /// Duration of the latest collection, in nanoseconds.
    pub gather_time_ns: AtomicUsize,
}

impl SourceStats {
    /// Whether a collection is running right now.
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Runs collections for one source and publishes the results.
///
/// Usually owned by a `SourceTask`'s collector thread, but usable directly
/// when a single synchronous collection is wanted.
pub struct Collector {
    name: String,
    source: Box<dyn Source>,
    bus: Arc<MetricBus>,
    tags: TagMap,
    global_tags: Arc<TagMap>,
    precision_ns: i64,
    stats: Arc<SourceStats>,
}

impl Collector {
    /// Create a collector for `source`, publishing onto `bus`.
    pub fn new(
        config: &SourceConfig,
        source: Box<dyn Source>,
        bus: Arc<MetricBus>,
        global_tags: Arc<TagMap>,
    ) -> Collector {
        let precision = config
            .precision
            .unwrap_or_else(|| time::precision_for(config.interval));
        Collector {
            name: config.name.clone(),
            source,
            bus,
            tags: config.tags.clone(),
            global_tags,
            precision_ns: time::duration_ns(precision) as i64,
            stats: Arc::new(SourceStats::default()),
        }
    }

    /// The collector's counters.
    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    fn decorate(&self, metric: Metric) -> Metric {
        metric
            .merge_tags_from_map(&self.tags)
            .merge_tags_from_map(&self.global_tags)
            .round_time(self.precision_ns)
    }

    /// Run one collection and publish what it produced. Publishing stops at
    /// the first metric refused by the bus; the remainder is counted as
    /// dropped.
    pub fn collect(&mut self, cancel: &Latch) {
        let mut acc = Vec::new();
        let start = Instant::now();
        self.stats.gathers.fetch_add(1, Ordering::Relaxed);
        let res = self.source.gather(&mut acc);
        self.stats
            .gather_time_ns
            .store(time::elapsed_ns(start) as usize, Ordering::Relaxed);
        if let Err(e) = res {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            error!("[{}] error in collection: {}", self.name, e);
        }

        let total = acc.len();
        for (idx, metric) in acc.into_iter().enumerate() {
            let metric = self.decorate(metric);
            match self.bus.publish(metric, cancel) {
                Ok(()) => {
                    self.stats.metrics.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let lost = total - idx;
                    self.stats.dropped.fetch_add(lost, Ordering::Relaxed);
                    match e {
                        PublishError::Closed(_) => {
                            warn!("[{}] bus closed, dropped {} metrics", self.name, lost)
                        }
                        PublishError::Cancelled(_) => {
                            debug!("[{}] publish cancelled, dropped {} metrics", self.name, lost)
                        }
                        PublishError::Full(_) => {
                            warn!("[{}] bus full, dropped {} metrics", self.name, lost)
                        }
                    }
                    break;
                }
            }
        }
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        trace!("[{}] collected {} metrics", self.name, total);
    }
}

/// A running source: its scheduler and collector threads.
pub struct SourceTask {
    name: String,
    cancel: Latch,
    scheduler: ThreadHandle,
    collector: ThreadHandle,
    stats: Arc<SourceStats>,
}

fn first_tick(config: &SourceConfig) -> Instant {
    let now = Instant::now();
    let until = if config.round_interval {
        time::until_aligned(time::now_ns(), config.interval)
    } else {
        config.interval
    };
    now + until + time::jitter(config.jitter)
}

fn run_ticker(
    name: &str,
    interval: Duration,
    mut next: Instant,
    cancel: &Latch,
    stats: &SourceStats,
    ticks: &mpsc::SyncSender<Instant>,
) {
    let mut warned = false;
    loop {
        if cancel.wait_until(next) {
            return;
        }
        if stats.in_flight.swap(true, Ordering::SeqCst) {
            stats.overruns.fetch_add(1, Ordering::Relaxed);
            if warned {
                debug!(
                    "[{}] previous collection has not completed; scheduled collection skipped",
                    name
                );
            } else {
                warn!(
                    "[{}] collection took longer than expected; not complete after interval of {:?}",
                    name, interval
                );
                warned = true;
            }
        } else {
            warned = false;
            match ticks.try_send(Instant::now()) {
                Ok(()) => {}
                Err(mpsc::TrySendError::Full(_)) => {
                    // unreachable while in_flight guards the channel
                    stats.overruns.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::TrySendError::Disconnected(_)) => return,
            }
        }
        let now = Instant::now();
        next += interval;
        while next <= now {
            next += interval;
        }
    }
}

impl SourceTask {
    /// Begin driving `source` on its own timer. Collections publish onto
    /// `bus`.
    pub fn start(
        config: SourceConfig,
        source: Box<dyn Source>,
        bus: Arc<MetricBus>,
        global_tags: Arc<TagMap>,
    ) -> io::Result<SourceTask> {
        let cancel = Latch::new();
        let mut collector = Collector::new(&config, source, bus, global_tags);
        let stats = collector.stats();
        let (tx, rx) = mpsc::sync_channel::<Instant>(1);

        let collector_cancel = cancel.clone();
        let collector_stats = Arc::clone(&stats);
        let collector_thread = thread::spawn(format!("{}.collector", config.name), move || {
            for _tick in rx.iter() {
                collector.collect(&collector_cancel);
                collector_stats.in_flight.store(false, Ordering::SeqCst);
                if collector_cancel.is_set() {
                    break;
                }
            }
        })?;

        let next = first_tick(&config);
        let ticker_cancel = cancel.clone();
        let ticker_stats = Arc::clone(&stats);
        let name = config.name.clone();
        let interval = config.interval;
        let scheduler_thread = thread::spawn(format!("{}.scheduler", config.name), move || {
            run_ticker(&name, interval, next, &ticker_cancel, &ticker_stats, &tx);
        });
        let scheduler_thread = match scheduler_thread {
            Ok(handle) => handle,
            Err(e) => {
                cancel.set();
                return Err(e);
            }
        };

        debug!("[{}] started, interval {:?}", config.name, config.interval);
        Ok(SourceTask {
            name: config.name,
            cancel,
            scheduler: scheduler_thread,
            collector: collector_thread,
            stats,
        })
    }

    /// The source's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source's counters.
    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    /// Request termination without waiting.
    pub fn cancel(&self) {
        self.cancel.set();
    }

    /// Request termination and wait for the in-flight collection, if any, up
    /// to `deadline`. A collection still running at the deadline is abandoned.
    /// Returns true if both threads stopped in time.
    pub fn stop(self, deadline: Instant) -> bool {
        self.cancel.set();
        let scheduler_ok = self.scheduler.join_until(deadline);
        let collector_ok = self.collector.join_until(deadline);
        if scheduler_ok && collector_ok {
            debug!("[{}] stopped", self.name);
        }
        scheduler_ok && collector_ok
    }
}

/// The set of running source tasks.
pub struct Scheduler {
    bus: Arc<MetricBus>,
    global_tags: Arc<TagMap>,
    tasks: Vec<SourceTask>,
}

impl Scheduler {
    /// Create a scheduler whose tasks publish onto `bus` and add
    /// `global_tags` to every metric.
    pub fn new(bus: Arc<MetricBus>, global_tags: Arc<TagMap>) -> Scheduler {
        Scheduler {
            bus,
            global_tags,
            tasks: Vec::new(),
        }
    }

    /// Start driving `source` with `config`.
    pub fn start(&mut self, config: SourceConfig, source: Box<dyn Source>) -> io::Result<Arc<SourceStats>> {
        let task = SourceTask::start(
            config,
            source,
            Arc::clone(&self.bus),
            Arc::clone(&self.global_tags),
        )?;
        let stats = task.stats();
        self.tasks.push(task);
        Ok(stats)
    }

    /// Stop the named source, waiting up to `deadline`. Returns `None` if no
    /// such source runs, otherwise whether it stopped in time.
    pub fn stop(&mut self, name: &str, deadline: Instant) -> Option<bool> {
        let idx = self.tasks.iter().position(|t| t.name() == name)?;
        let task = self.tasks.swap_remove(idx);
        Some(task.stop(deadline))
    }

    /// Stop every source. All are cancelled first so they wind down in
    /// parallel, then each is waited on up to `deadline`. Returns the number
    /// of sources abandoned.
    pub fn stop_all(&mut self, deadline: Instant) -> usize {
        for task in &self.tasks {
            task.cancel();
        }
        let mut abandoned = 0;
        for task in self.tasks.drain(..) {
            if !task.stop(deadline) {
                abandoned += 1;
            }
        }
        abandoned
    }

    /// Names and counters of every running source.
    pub fn stats(&self) -> Vec<(String, Arc<SourceStats>)> {
        self.tasks
            .iter()
            .map(|t| (t.name().to_string(), t.stats()))
            .collect()
    }

    /// Whether every running source has finished at least one collection.
    pub fn first_collections_done(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| t.stats.completed.load(Ordering::Relaxed) > 0)
    }

    /// Number of running sources.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no sources run.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
