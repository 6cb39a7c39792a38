//! Sinks deliver metrics to their destinations.
//!
//! Every configured destination is a `RunningSink` with its own inbox, a
//! feeder thread moving the inbox into the `DeliveryBuffer`, and a flush
//! controller thread which owns the `Sink` itself. The processing loop hands
//! each metric to every inbox without waiting; only the feeder suspends on a
//! full `block-producer` buffer, so destinations never wait on one another.
//! A metric that finds its destination's inbox full is counted as dropped by
//! that destination.

use crate::buffer::{DeliveryBuffer, OfferError, OverflowPolicy};
use crate::bus::MetricBus;
use crate::filter::{NameModifier, Selector};
use crate::metric::Metric;
use crate::thread::{self, Latch, ThreadHandle};
use std::error;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

mod console;
mod flush;
mod influxdb;
mod null;

pub use self::console::{Console, ConsoleConfig, Format};
pub use self::flush::{FlushController, FlushHandle, FlushState, Wake};
pub use self::influxdb::{InfluxDB, InfluxDBConfig};
pub use self::null::{Null, NullConfig};

/// Errors a sink may report from `connect` or `write`.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkError {
    /// The attempt may succeed later. A failed batch is requeued and retried
    /// after a backoff.
    Retryable(String),
    /// The attempt will never succeed. A failed batch is dropped.
    Fatal(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SinkError::Retryable(ref s) => write!(f, "retryable: {}", s),
            SinkError::Fatal(ref s) => write!(f, "fatal: {}", s),
        }
    }
}

impl error::Error for SinkError {}

/// The output contract.
///
/// A sink is driven by exactly one flush controller thread, so at most one
/// `write` is in flight per destination.
pub trait Sink: Send {
    /// Establish whatever the sink needs before the first write.
    fn connect(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Deliver `batch`. On success the batch is considered written.
    fn write(&mut self, batch: &[Metric]) -> Result<(), SinkError>;

    /// Release resources. Called once, after the final flush.
    fn close(&mut self) {}
}

/// Settings of a destination, already validated.
#[derive(Clone, Debug)]
pub struct SinkConfig {
    /// Unique name, e.g. `outputs.console`.
    pub name: String,
    /// Time between scheduled flushes.
    pub flush_interval: Duration,
    /// Upper bound of the random offset of the first flush.
    pub flush_jitter: Duration,
    /// Maximum metrics per write.
    pub batch_size: usize,
    /// Delivery buffer capacity.
    pub buffer_limit: usize,
    /// What a full delivery buffer does.
    pub overflow_policy: OverflowPolicy,
    /// First retry delay after a retryable error.
    pub retry_base: Duration,
    /// Upper bound of the retry delay.
    pub retry_max: Duration,
    /// Which metrics the destination receives.
    pub selector: Selector,
    /// Renaming applied before buffering.
    pub modifier: NameModifier,
}

impl SinkConfig {
    /// A config with defaults matching the `[agent]` defaults.
    pub fn new<S>(name: S) -> SinkConfig
    where
        S: Into<String>,
    {
        SinkConfig {
            name: name.into(),
            flush_interval: Duration::from_secs(10),
            flush_jitter: Duration::from_secs(0),
            batch_size: 1_000,
            buffer_limit: 10_000,
            overflow_policy: OverflowPolicy::default(),
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(30),
            selector: Selector::default(),
            modifier: NameModifier::default(),
        }
    }
}

/// The fan-out side of a destination: selection, renaming, the inbox and
/// buffering.
pub struct RunningSink {
    name: String,
    selector: Selector,
    modifier: NameModifier,
    batch_size: usize,
    inbox: Arc<MetricBus>,
    buffer: Arc<DeliveryBuffer>,
    wake: Arc<Wake>,
}

impl RunningSink {
    /// Create the fan-out side for `config`, together with the buffer and
    /// wake signal its flush controller will share. The inbox holds as many
    /// metrics as the buffer.
    pub fn new(config: &SinkConfig) -> RunningSink {
        RunningSink {
            name: config.name.clone(),
            selector: config.selector.clone(),
            modifier: config.modifier.clone(),
            batch_size: config.batch_size.max(1),
            inbox: Arc::new(MetricBus::new(config.buffer_limit)),
            buffer: Arc::new(DeliveryBuffer::new(
                config.name.clone(),
                config.buffer_limit,
                config.overflow_policy,
            )),
            wake: Arc::new(Wake::new()),
        }
    }

    /// The destination's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The destination's delivery buffer.
    pub fn buffer(&self) -> Arc<DeliveryBuffer> {
        Arc::clone(&self.buffer)
    }

    /// The wake signal of the destination's flush controller.
    pub fn wake(&self) -> Arc<Wake> {
        Arc::clone(&self.wake)
    }

    fn prepare(&self, metric: Metric) -> Option<Metric> {
        self.selector.select(metric).map(|m| self.modifier.apply(m))
    }

    /// Offer `metric` straight to the destination's buffer, suspending under
    /// `block-producer` until there is room or `cancel` is set. Metrics the
    /// selector rejects are silently skipped. Wakes the flush controller once
    /// a full batch is buffered.
    pub fn add_metric(&self, metric: Metric, cancel: &Latch) -> Result<(), OfferError> {
        match self.prepare(metric) {
            Some(m) => offer(&self.buffer, &self.wake, self.batch_size, m, cancel),
            None => Ok(()),
        }
    }

    /// Queue `metric` for the feeder thread without ever suspending. Returns
    /// false if the metric was dropped, and counted, because the inbox is
    /// full or closed.
    pub fn hand_off(&self, metric: Metric) -> bool {
        let metric = match self.prepare(metric) {
            Some(m) => m,
            None => return true,
        };
        match self.inbox.try_publish(metric) {
            Ok(()) => true,
            Err(e) => {
                trace!("[{}] {}, metric dropped", self.name, e);
                self.buffer.count_lost(1);
                false
            }
        }
    }

    /// Start the feeder thread. It moves the inbox into the buffer until the
    /// inbox is closed and empty. Once `cancel` is set, every metric it cannot
    /// place immediately is counted as dropped.
    pub fn spawn_feeder(&self, cancel: Latch) -> io::Result<ThreadHandle> {
        let name = self.name.clone();
        let inbox = Arc::clone(&self.inbox);
        let buffer = Arc::clone(&self.buffer);
        let wake = Arc::clone(&self.wake);
        let batch_size = self.batch_size;
        thread::spawn(format!("{}.feed", name), move || {
            let mut cancelled = 0;
            while let Some(metric) = inbox.consume() {
                if let Err(OfferError::Cancelled(_)) =
                    offer(&buffer, &wake, batch_size, metric, &cancel)
                {
                    buffer.count_lost(1);
                    cancelled += 1;
                }
            }
            if cancelled > 0 {
                warn!("[{}] buffer full at shutdown, dropped {} metrics", name, cancelled);
            }
        })
    }

    /// Close the inbox. The feeder finishes once it has placed what is queued.
    pub fn close(&self) {
        self.inbox.close();
    }
}

fn offer(
    buffer: &DeliveryBuffer,
    wake: &Wake,
    batch_size: usize,
    metric: Metric,
    cancel: &Latch,
) -> Result<(), OfferError> {
    buffer.offer(metric, cancel)?;
    if buffer.len() >= batch_size {
        wake.batch_ready();
    }
    Ok(())
}
