use crate::metric::Metric;
use crate::source::{Source, SourceError};
use crate::stats::AgentStats;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// 'Internal' is a Source which allows the agent to self-telemeter. Each
/// collection reads the agent's counters and emits them as ordinary metrics,
/// which then flow through processors and to destinations like anything else.
///
/// Emitted series:
///
///  * `internal_gather`, tagged `input`: gathers, errors, overruns, metrics
///    gathered and latest gather time.
///  * `internal_write`, tagged `output`: metrics added, written and dropped
///    plus current buffer size and limit.
///  * `internal_agent`: bus and processor counters.
pub struct Internal {
    stats: Arc<AgentStats>,
}

/// The configuration struct for 'Internal'. It has no settings of its own;
/// interval and tags are taken from the common input keys.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InternalConfig {}

impl Internal {
    /// Create a new Internal reading from `stats`.
    pub fn new(stats: Arc<AgentStats>, _config: InternalConfig) -> Internal {
        Internal { stats }
    }
}

impl Source for Internal {
    fn gather(&mut self, acc: &mut Vec<Metric>) -> Result<(), SourceError> {
        for s in self.stats.sources() {
            acc.push(
                Metric::new("internal_gather")
                    .overlay_tag("input", s.name)
                    .field("gathers", s.gathers)
                    .field("errors", s.errors)
                    .field("overruns", s.overruns)
                    .field("metrics_gathered", s.metrics)
                    .field("metrics_dropped", s.dropped)
                    .field("gather_time_ns", s.gather_time_ns),
            );
        }
        for (name, b) in self.stats.buffers() {
            acc.push(
                Metric::new("internal_write")
                    .overlay_tag("output", name)
                    .field("metrics_added", b.added)
                    .field("metrics_written", b.written)
                    .field("metrics_dropped", b.dropped)
                    .field("buffer_size", b.len)
                    .field("buffer_limit", b.capacity),
            );
        }
        let p = &self.stats.process;
        acc.push(
            Metric::new("internal_agent")
                .field("metrics_consumed", p.consumed.load(Ordering::Relaxed))
                .field("processor_dropped", p.dropped.load(Ordering::Relaxed))
                .field("processor_errors", p.errors.load(Ordering::Relaxed))
                .field("aggregator_out_of_window", p.out_of_window.load(Ordering::Relaxed)),
        );
        Ok(())
    }
}
