//! Wiring and lifecycle of a running agent.
//!
//! `Agent::new` builds every configured plugin through the registry.
//! `Agent::start` connects outputs and starts, from the bottom up, the flush
//! controllers and feeders of every destination, the processing thread with
//! its fan-out, the aggregation timer and finally the source tasks.
//! `RunningAgent::shutdown` tears the same pieces down top-down within a
//! single deadline:
//!
//!  1. stop every source task;
//!  2. close the metric bus and let the processing thread empty it;
//!  3. push the aggregators' partial windows;
//!  4. close every destination's inbox and, as soon as its feeder is done,
//!     drain its flush controller with a final flush;
//!  5. count whatever is still held anywhere as dropped.

use crate::aggregate::{AggregateStage, Aggregator, AggregatorConfig, RunningAggregator};
use crate::bus::MetricBus;
use crate::config::{Args, ConfigError};
use crate::filter::Chain;
use crate::metric::{Metric, TagMap};
use crate::registry::{PluginContext, Registry};
use crate::sink::{FlushController, FlushHandle, RunningSink, Sink, SinkConfig, SinkError};
use crate::source::{Collector, Scheduler, Source, SourceConfig};
use crate::stats::AgentStats;
use crate::thread::{self, Latch, ThreadHandle, POLL_INTERVAL};
use crate::time;
use std::error;
use std::fmt;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Delay before the single retry of a failed output connect.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Errors building or starting an agent. Nothing that goes wrong once the
/// agent runs is reported this way; those conditions are logged and counted.
#[derive(Debug)]
pub enum AgentError {
    /// The configuration names something unusable.
    Config(ConfigError),
    /// A plugin's constructor refused its table.
    Plugin {
        /// The plugin's name.
        name: String,
        /// The constructor's complaint.
        reason: String,
    },
    /// An output could not connect.
    Connect {
        /// The output's name.
        name: String,
        /// The last connect error.
        error: SinkError,
    },
    /// A thread could not be spawned.
    Io(io::Error),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AgentError::Config(ref e) => write!(f, "{}", e),
            AgentError::Plugin { ref name, ref reason } => {
                write!(f, "could not create {}: {}", name, reason)
            }
            AgentError::Connect { ref name, ref error } => {
                write!(f, "could not connect {}: {}", name, error)
            }
            AgentError::Io(ref e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for AgentError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            AgentError::Config(ref e) => Some(e),
            AgentError::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> AgentError {
        AgentError::Config(e)
    }
}

impl From<io::Error> for AgentError {
    fn from(e: io::Error) -> AgentError {
        AgentError::Io(e)
    }
}

fn unknown(section: &'static str, kind: &str) -> AgentError {
    AgentError::Config(ConfigError::UnknownPlugin {
        section,
        kind: kind.to_string(),
    })
}

fn plugin_error(name: &str) -> impl FnOnce(String) -> AgentError + '_ {
    move |reason| AgentError::Plugin {
        name: name.to_string(),
        reason,
    }
}

/// A fully built, not yet running, agent.
pub struct Agent {
    tags: TagMap,
    round_interval: bool,
    bus_capacity: usize,
    shutdown_timeout: Duration,
    stats: Arc<AgentStats>,
    inputs: Vec<(SourceConfig, Box<dyn Source>)>,
    chain: Chain,
    aggregators: Vec<(AggregatorConfig, Box<dyn Aggregator>)>,
    outputs: Vec<(SinkConfig, Box<dyn Sink>)>,
    connect_retry_delay: Duration,
}

impl Agent {
    /// Build every plugin named in `args` from `registry`.
    pub fn new(args: Args, registry: &Registry) -> Result<Agent, AgentError> {
        let stats = Arc::new(AgentStats::new());
        let ctx = PluginContext {
            stats: Arc::clone(&stats),
        };

        let mut inputs = Vec::new();
        for entry in args.inputs {
            let factory = registry
                .input(&entry.kind)
                .ok_or_else(|| unknown("inputs", &entry.kind))?;
            let source = factory(&entry.table, &ctx).map_err(plugin_error(&entry.source.name))?;
            inputs.push((entry.source, source));
        }

        let mut chain = Chain::new();
        for entry in args.processors {
            let factory = registry
                .processor(&entry.kind)
                .ok_or_else(|| unknown("processors", &entry.kind))?;
            let filter = factory(&entry.table, &ctx).map_err(plugin_error(&entry.name))?;
            chain.push(entry.name, filter);
        }

        let mut aggregators = Vec::new();
        for entry in args.aggregators {
            let factory = registry
                .aggregator(&entry.kind)
                .ok_or_else(|| unknown("aggregators", &entry.kind))?;
            let agg = factory(&entry.table, &ctx).map_err(plugin_error(&entry.aggregator.name))?;
            aggregators.push((entry.aggregator, agg));
        }

        let mut outputs = Vec::new();
        for entry in args.outputs {
            let factory = registry
                .output(&entry.kind)
                .ok_or_else(|| unknown("outputs", &entry.kind))?;
            let sink = factory(&entry.table, &ctx).map_err(plugin_error(&entry.sink.name))?;
            outputs.push((entry.sink, sink));
        }

        Ok(Agent {
            tags: args.tags,
            round_interval: args.agent.round_interval,
            bus_capacity: args.agent.bus_capacity,
            shutdown_timeout: args.agent.shutdown_timeout,
            stats,
            inputs,
            chain,
            aggregators,
            outputs,
            connect_retry_delay: CONNECT_RETRY_DELAY,
        })
    }

    /// Add an already constructed input.
    pub fn add_input(&mut self, config: SourceConfig, source: Box<dyn Source>) {
        self.inputs.push((config, source));
    }

    /// Add an already constructed output.
    pub fn add_output(&mut self, config: SinkConfig, sink: Box<dyn Sink>) {
        self.outputs.push((config, sink));
    }

    /// Change the delay before the retry of a failed output connect.
    pub fn set_connect_retry_delay(&mut self, delay: Duration) {
        self.connect_retry_delay = delay;
    }

    /// The configured bound on `RunningAgent::shutdown`.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// The agent's counters.
    pub fn stats(&self) -> Arc<AgentStats> {
        Arc::clone(&self.stats)
    }

    fn connect(&mut self) -> Result<(), AgentError> {
        for &mut (ref config, ref mut sink) in &mut self.outputs {
            match sink.connect() {
                Ok(()) => continue,
                Err(SinkError::Retryable(e)) => {
                    error!(
                        "[{}] failed to connect: {}, retrying in {:?}",
                        config.name, e, self.connect_retry_delay
                    );
                    ::std::thread::sleep(self.connect_retry_delay);
                    sink.connect().map_err(|error| AgentError::Connect {
                        name: config.name.clone(),
                        error,
                    })?;
                }
                Err(error) => {
                    return Err(AgentError::Connect {
                        name: config.name.clone(),
                        error,
                    })
                }
            }
        }
        Ok(())
    }

    /// Start everything but the source tasks, handing back the inputs.
    fn launch(mut self) -> Result<(RunningAgent, Vec<(SourceConfig, Box<dyn Source>)>), AgentError> {
        self.connect()?;

        let bus = Arc::new(MetricBus::new(self.bus_capacity));
        let cancel = Latch::new();

        let mut sinks = Vec::new();
        let mut flushers = Vec::new();
        let mut feeders = Vec::new();
        for (config, sink) in self.outputs {
            let running = RunningSink::new(&config);
            self.stats.register_buffer(running.buffer());
            flushers.push(FlushController::new(&config, sink, &running).spawn()?);
            feeders.push(running.spawn_feeder(cancel.clone())?);
            sinks.push(running);
        }
        let sinks = Arc::new(sinks);

        let start_ns = time::now_ns();
        let round = self.round_interval;
        let mut stage = AggregateStage::new(
            self.aggregators
                .into_iter()
                .map(|(config, agg)| RunningAggregator::new(config, agg, start_ns, round))
                .collect(),
        );
        {
            let sinks = Arc::clone(&sinks);
            stage.start(move |metrics| {
                for metric in metrics {
                    fan_out(&sinks, metric);
                }
            })?;
        }

        let processing = {
            let bus = Arc::clone(&bus);
            let sinks = Arc::clone(&sinks);
            let stats = Arc::clone(&self.stats);
            let feed = stage.feed();
            let mut chain = self.chain;
            thread::spawn("processing", move || {
                let mut out = Vec::new();
                while let Some(metric) = bus.consume() {
                    stats.process.consumed.fetch_add(1, Ordering::Relaxed);
                    chain.apply(metric, &mut out, &stats.process);
                    for metric in out.drain(..) {
                        if !feed.is_empty() {
                            let withheld = feed.add(&metric);
                            stats
                                .process
                                .out_of_window
                                .store(feed.rejected(), Ordering::Relaxed);
                            if withheld {
                                continue;
                            }
                        }
                        fan_out(&sinks, metric);
                    }
                }
                debug!("processing finished, bus closed and empty");
            })?
        };

        let scheduler = Scheduler::new(Arc::clone(&bus), Arc::new(self.tags.clone()));
        let running = RunningAgent {
            tags: Arc::new(self.tags),
            shutdown_timeout: self.shutdown_timeout,
            stats: self.stats,
            bus,
            cancel,
            processing: Some(processing),
            stage,
            sinks,
            flushers,
            feeders,
            scheduler,
        };
        Ok((running, self.inputs))
    }

    /// Connect outputs and start the whole pipeline.
    pub fn start(self) -> Result<RunningAgent, AgentError> {
        let (mut running, inputs) = self.launch()?;
        for (config, source) in inputs {
            let name = config.name.clone();
            let stats = running.scheduler.start(config, source)?;
            running.stats.register_source(name, stats);
        }
        info!(
            "tally started: {} inputs, {} outputs",
            running.scheduler.len(),
            running.flushers.len()
        );
        Ok(running)
    }

    /// Gather every input exactly once, then shut down, flushing everything
    /// gathered. Aggregators emit their partial windows.
    pub fn once(self) -> Result<ShutdownReport, AgentError> {
        let timeout = self.shutdown_timeout;
        let (running, inputs) = self.launch()?;
        let cancel = Latch::new();
        for (config, source) in inputs {
            let mut collector =
                Collector::new(&config, source, Arc::clone(&running.bus), Arc::clone(&running.tags));
            running.stats.register_source(config.name.clone(), collector.stats());
            collector.collect(&cancel);
        }
        Ok(running.shutdown(timeout))
    }
}

/// Hand `metric` to every destination's inbox. Never waits; a destination
/// whose inbox is full counts the metric as dropped.
fn fan_out(sinks: &[RunningSink], metric: Metric) {
    let last = match sinks.len() {
        0 => return,
        n => n - 1,
    };
    for sink in &sinks[..last] {
        sink.hand_off(metric.clone());
    }
    sinks[last].hand_off(metric);
}

/// What `RunningAgent::shutdown` had to give up on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShutdownReport {
    /// Source tasks whose collection did not end by the deadline.
    pub sources_abandoned: usize,
    /// Whether the processing thread did not finish by the deadline.
    pub processing_abandoned: bool,
    /// Metrics left on the bus.
    pub dropped_on_bus: usize,
    /// Metrics each destination dropped while shutting down: left in its
    /// inbox or buffer, refused by a full buffer after the deadline, or stuck
    /// in a write.
    pub dropped_in_buffers: Vec<(String, usize)>,
    /// Wall time the shutdown took.
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Every metric dropped during shutdown.
    pub fn total_dropped(&self) -> usize {
        self.dropped_on_bus + self.dropped_in_buffers.iter().map(|&(_, n)| n).sum::<usize>()
    }

    /// Whether anything had to be abandoned or dropped.
    pub fn is_clean(&self) -> bool {
        self.sources_abandoned == 0 && !self.processing_abandoned && self.total_dropped() == 0
    }
}

/// A started agent. Dropping it without `shutdown` leaves its threads
/// running.
pub struct RunningAgent {
    tags: Arc<TagMap>,
    shutdown_timeout: Duration,
    stats: Arc<AgentStats>,
    bus: Arc<MetricBus>,
    cancel: Latch,
    processing: Option<ThreadHandle>,
    stage: AggregateStage,
    sinks: Arc<Vec<RunningSink>>,
    flushers: Vec<FlushHandle>,
    feeders: Vec<ThreadHandle>,
    scheduler: Scheduler,
}

impl RunningAgent {
    /// The agent's counters.
    pub fn stats(&self) -> Arc<AgentStats> {
        Arc::clone(&self.stats)
    }

    /// The configured bound on `shutdown`.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Ask every flush controller to flush now, cancelling any backoff.
    pub fn flush_now(&self) {
        info!("flushing all outputs");
        for f in &self.flushers {
            f.force();
        }
    }

    /// Whether every source task has completed at least one collection.
    pub fn first_collections_done(&self) -> bool {
        self.scheduler.first_collections_done()
    }

    /// Stop the agent, waiting at most `timeout`. See module documentation
    /// for the sequence.
    pub fn shutdown(mut self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut report = ShutdownReport::default();
        let dropped_before: Vec<usize> = self
            .sinks
            .iter()
            .map(|s| s.buffer().stats().dropped)
            .collect();

        // Past the deadline every blocked offer gives up.
        let finished = Latch::new();
        let watchdog = {
            let cancel = self.cancel.clone();
            let finished = finished.clone();
            thread::spawn("shutdown-watchdog", move || {
                if !finished.wait_until(deadline) {
                    cancel.set();
                }
            })
        };
        let watchdog = match watchdog {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("could not start shutdown watchdog: {}", e);
                None
            }
        };

        info!("stopping {} inputs", self.scheduler.len());
        report.sources_abandoned = self.scheduler.stop_all(deadline);
        if report.sources_abandoned > 0 {
            warn!(
                "{} inputs did not stop in time and were abandoned",
                report.sources_abandoned
            );
        }

        self.bus.close();
        if let Some(processing) = self.processing.take() {
            if !processing.join_until(deadline) {
                warn!("processing did not finish in time, abandoning");
                report.processing_abandoned = true;
            }
        }
        report.dropped_on_bus = self.bus.discard();
        self.stats
            .process
            .dropped
            .fetch_add(report.dropped_on_bus, Ordering::Relaxed);

        let partial = self.stage.finish();
        if !partial.is_empty() {
            debug!("fanning out {} metrics from partial windows", partial.len());
        }
        for metric in partial {
            fan_out(&self.sinks, metric);
        }

        for sink in self.sinks.iter() {
            sink.close();
        }
        // a destination's final flush starts once its feeder has placed
        // everything it can
        let mut feeders: Vec<Option<ThreadHandle>> = self.feeders.drain(..).map(Some).collect();
        loop {
            let mut pending = 0;
            for (slot, flusher) in feeders.iter_mut().zip(&self.flushers) {
                if slot.as_ref().map_or(false, |f| f.is_finished()) {
                    if let Some(feeder) = slot.take() {
                        feeder.join();
                    }
                    flusher.drain(deadline);
                }
                if slot.is_some() {
                    pending += 1;
                }
            }
            if pending == 0 || Instant::now() >= deadline {
                break;
            }
            ::std::thread::sleep(POLL_INTERVAL);
        }
        // past the deadline a feeder only counts what it cannot place
        self.cancel.set();
        for (slot, flusher) in feeders.iter_mut().zip(&self.flushers) {
            if let Some(feeder) = slot.take() {
                feeder.join();
                flusher.drain(deadline);
            }
        }

        for f in self.flushers.drain(..) {
            f.finish(deadline);
        }
        for (sink, before) in self.sinks.iter().zip(dropped_before) {
            let dropped = sink.buffer().stats().dropped - before;
            report.dropped_in_buffers.push((sink.name().to_string(), dropped));
        }

        finished.set();
        if let Some(watchdog) = watchdog {
            watchdog.join();
        }

        report.elapsed = started.elapsed();
        if report.is_clean() {
            info!("shutdown complete in {:?}", report.elapsed);
        } else {
            warn!(
                "shutdown complete in {:?}, {} metrics dropped",
                report.elapsed,
                report.total_dropped()
            );
        }
        report
    }
}
