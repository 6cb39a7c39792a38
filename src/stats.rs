//! Registry of the agent's own counters, read by the `internal` source for
//! self-telemetry and by the shutdown report.

use crate::buffer::{BufferStats, DeliveryBuffer};
use crate::source::SourceStats;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Counters of the processing loop.
#[derive(Debug, Default)]
pub struct ProcessStats {
    /// Metrics taken off the bus.
    pub consumed: AtomicUsize,
    /// Metrics a processor dropped, by choice or on error.
    pub dropped: AtomicUsize,
    /// Processor errors.
    pub errors: AtomicUsize,
    /// Metrics an aggregator refused because they fell outside its window.
    pub out_of_window: AtomicUsize,
}

/// See module documentation.
#[derive(Default)]
pub struct AgentStats {
    sources: Mutex<Vec<(String, Arc<SourceStats>)>>,
    buffers: Mutex<Vec<Arc<DeliveryBuffer>>>,
    /// Processing loop counters.
    pub process: ProcessStats,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl AgentStats {
    /// Create an empty registry.
    pub fn new() -> AgentStats {
        AgentStats::default()
    }

    /// Record a running source's counters.
    pub fn register_source<S>(&self, name: S, stats: Arc<SourceStats>)
    where
        S: Into<String>,
    {
        lock(&self.sources).push((name.into(), stats));
    }

    /// Record a destination's delivery buffer.
    pub fn register_buffer(&self, buffer: Arc<DeliveryBuffer>) {
        lock(&self.buffers).push(buffer);
    }

    /// Snapshot of every registered source's counters.
    pub fn sources(&self) -> Vec<SourceSnapshot> {
        lock(&self.sources)
            .iter()
            .map(|&(ref name, ref s)| SourceSnapshot {
                name: name.clone(),
                gathers: s.gathers.load(Ordering::Relaxed),
                errors: s.errors.load(Ordering::Relaxed),
                overruns: s.overruns.load(Ordering::Relaxed),
                metrics: s.metrics.load(Ordering::Relaxed),
                dropped: s.dropped.load(Ordering::Relaxed),
                gather_time_ns: s.gather_time_ns.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Snapshot of every delivery buffer's counters, keyed by destination.
    pub fn buffers(&self) -> Vec<(String, BufferStats)> {
        lock(&self.buffers)
            .iter()
            .map(|b| (b.name().to_string(), b.stats()))
            .collect()
    }

    /// Metrics dropped by sources and delivery buffers combined.
    pub fn total_dropped(&self) -> usize {
        let sources: usize = lock(&self.sources)
            .iter()
            .map(|&(_, ref s)| s.dropped.load(Ordering::Relaxed))
            .sum();
        let buffers: usize = lock(&self.buffers).iter().map(|b| b.stats().dropped).sum();
        sources + buffers
    }
}

/// Point-in-time copy of a source's counters.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceSnapshot {
    /// Source name.
    pub name: String,
    /// Collections started.
    pub gathers: usize,
    /// Collections which failed.
    pub errors: usize,
    /// Ticks skipped.
    pub overruns: usize,
    /// Metrics published.
    pub metrics: usize,
    /// Metrics not published.
    pub dropped: usize,
    /// Duration of the latest collection.
    pub gather_time_ns: usize,
}
