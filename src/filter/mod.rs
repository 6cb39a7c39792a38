//! Processors transform the metric stream between the bus and fan-out.
//!
//! A `Filter` receives one metric and pushes zero or more metrics onto its
//! result vector. Filters are composed into a `Chain` which runs them in
//! order; a metric dropped by a stage is not seen by later stages.

use crate::metric::Metric;
use crate::stats::ProcessStats;
use std::error;
use std::fmt;
use std::mem;
use std::sync::atomic::Ordering;

mod delay_filter;
mod select;
mod tag_filter;

pub use self::delay_filter::{DelayFilter, DelayFilterConfig};
pub use self::select::{NameModifier, SelectConfig, SelectFilter, Selector, SelectorConfig};
pub use self::tag_filter::{TagFilter, TagFilterConfig};

/// Errors a processor may report. The metric being processed is lost.
#[derive(Debug)]
pub enum FilterError {
    /// The metric could not be processed.
    Failed(String),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FilterError::Failed(ref s) => write!(f, "processing failed: {}", s),
        }
    }
}

impl error::Error for FilterError {}

/// The processor contract.
pub trait Filter: Send {
    /// Process `metric`, pushing whatever should continue onto `res`.
    fn process(&mut self, metric: Metric, res: &mut Vec<Metric>) -> Result<(), FilterError>;
}

/// An ordered sequence of named filters.
#[derive(Default)]
pub struct Chain {
    stages: Vec<(String, Box<dyn Filter>)>,
    scratch: Vec<Metric>,
}

impl Chain {
    /// Create an empty chain, which passes every metric through untouched.
    pub fn new() -> Chain {
        Chain::default()
    }

    /// Append a stage to the end of the chain.
    pub fn push<S>(&mut self, name: S, filter: Box<dyn Filter>)
    where
        S: Into<String>,
    {
        self.stages.push((name.into(), filter));
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `metric` through every stage, appending the survivors to `out`.
    /// Errors are logged and counted in `stats`; the metric that caused one
    /// goes no further.
    pub fn apply(&mut self, metric: Metric, out: &mut Vec<Metric>, stats: &ProcessStats) {
        let mut current = vec![metric];
        for &mut (ref name, ref mut filter) in &mut self.stages {
            let mut next = mem::replace(&mut self.scratch, Vec::new());
            for m in current.drain(..) {
                if let Err(e) = filter.process(m, &mut next) {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    error!("[{}] {}", name, e);
                }
            }
            self.scratch = current;
            current = next;
            if current.is_empty() {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        out.append(&mut current);
        self.scratch = current;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Split;

    impl Filter for Split {
        fn process(&mut self, metric: Metric, res: &mut Vec<Metric>) -> Result<(), FilterError> {
            res.push(metric.clone().rename("left"));
            res.push(metric.rename("right"));
            Ok(())
        }
    }

    struct DropRight(usize);

    impl Filter for DropRight {
        fn process(&mut self, metric: Metric, res: &mut Vec<Metric>) -> Result<(), FilterError> {
            self.0 += 1;
            if metric.name() == "right" {
                return Err(FilterError::Failed("right".to_string()));
            }
            res.push(metric);
            Ok(())
        }
    }

    struct Nothing;

    impl Filter for Nothing {
        fn process(&mut self, _metric: Metric, _res: &mut Vec<Metric>) -> Result<(), FilterError> {
            Ok(())
        }
    }

    #[test]
    fn empty_chain_passes_through() {
        let stats = ProcessStats::default();
        let mut chain = Chain::new();
        let mut out = Vec::new();
        chain.apply(Metric::new("a"), &mut out, &stats);
        assert_eq!(1, out.len());
        assert_eq!("a", out[0].name());
    }

    #[test]
    fn stages_run_in_order_and_errors_are_local() {
        let stats = ProcessStats::default();
        let mut chain = Chain::new();
        chain.push("processors.split", Box::new(Split));
        chain.push("processors.drop", Box::new(DropRight(0)));
        let mut out = Vec::new();
        chain.apply(Metric::new("a"), &mut out, &stats);
        chain.apply(Metric::new("b"), &mut out, &stats);
        assert_eq!(2, out.len());
        assert!(out.iter().all(|m| m.name() == "left"));
        assert_eq!(2, stats.errors.load(Ordering::Relaxed));
        assert_eq!(0, stats.dropped.load(Ordering::Relaxed));
    }

    #[test]
    fn dropped_metric_short_circuits() {
        let stats = ProcessStats::default();
        let mut chain = Chain::new();
        chain.push("processors.nothing", Box::new(Nothing));
        chain.push("processors.split", Box::new(Split));
        let mut out = Vec::new();
        chain.apply(Metric::new("a"), &mut out, &stats);
        assert!(out.is_empty());
        assert_eq!(1, stats.dropped.load(Ordering::Relaxed));
    }
}
