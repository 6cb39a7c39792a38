//! Sources produce metrics. Each configured source is driven by its own
//! `SourceTask` which calls `Source::gather` on a fixed cadence and publishes
//! the result onto the metric bus.

use crate::metric::{Metric, TagMap};
use std::error;
use std::fmt;
use std::io;
use std::time::Duration;

mod internal;
mod loadavg;
mod task;

pub use self::internal::{Internal, InternalConfig};
pub use self::loadavg::{LoadAvg, LoadAvgConfig};
pub use self::task::{Collector, Scheduler, SourceStats, SourceTask};

/// Errors a source may report from a collection.
#[derive(Debug)]
pub enum SourceError {
    /// An I/O failure while collecting.
    Io(io::Error),
    /// Collected data could not be understood.
    Parse(String),
    /// Anything else the source wishes to report.
    Other(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SourceError::Io(ref e) => write!(f, "i/o error: {}", e),
            SourceError::Parse(ref s) => write!(f, "parse error: {}", s),
            SourceError::Other(ref s) => write!(f, "{}", s),
        }
    }
}

impl error::Error for SourceError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            SourceError::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SourceError {
    fn from(e: io::Error) -> SourceError {
        SourceError::Io(e)
    }
}

/// The input contract.
///
/// `gather` is called at most once at a time for a given source and must not
/// block indefinitely. Metrics pushed onto `acc` before an error is returned
/// are still published.
pub trait Source: Send {
    /// Collect metrics into `acc`.
    fn gather(&mut self, acc: &mut Vec<Metric>) -> Result<(), SourceError>;
}

/// Scheduling configuration of a single source, already validated.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// The source's unique name, e.g. `inputs.loadavg`.
    pub name: String,
    /// Time between collections.
    pub interval: Duration,
    /// Upper bound of the random offset applied once at start.
    pub jitter: Duration,
    /// Timestamp rounding. `None` derives it from `interval`.
    pub precision: Option<Duration>,
    /// Align ticks to wall-clock multiples of `interval`.
    pub round_interval: bool,
    /// Tags added to every metric the source emits, unless already present.
    pub tags: TagMap,
}

impl SourceConfig {
    /// A config with the given name and interval and no jitter, tags or
    /// alignment.
    pub fn new<S>(name: S, interval: Duration) -> SourceConfig
    where
        S: Into<String>,
    {
        SourceConfig {
            name: name.into(),
            interval,
            jitter: Duration::from_secs(0),
            precision: None,
            round_interval: false,
            tags: TagMap::default(),
        }
    }
}
