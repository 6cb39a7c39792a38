//! Filter streams to within a bounded interval of current time.
//!
//! This filter is intended to remove metrics from the stream which are too
//! old, or too far in the future, as defined by the current time and the
//! configured `tolerance`. That is, if for some time `T`,
//! `(T - time::now_ns()).abs() >= tolerance` the metric associated with `T`
//! will be rejected.

use crate::filter;
use crate::metric::Metric;
use crate::time;
use std::time::Duration;

/// Filter streams to within a bounded interval of current time.
///
/// See module documentation.
pub struct DelayFilter {
    tolerance: i64,
    accepted: usize,
    rejected: usize,
}

/// Configuration for `DelayFilter`
#[derive(Clone, Debug, Deserialize)]
pub struct DelayFilterConfig {
    /// The delay tolerance of the filter.
    #[serde(deserialize_with = "crate::config::deserialize_duration")]
    pub tolerance: Duration,
}

impl DelayFilter {
    /// Create a new DelayFilter
    pub fn new(config: &DelayFilterConfig) -> DelayFilter {
        DelayFilter {
            tolerance: time::duration_ns(config.tolerance) as i64,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Total metrics accepted and rejected so far.
    pub fn counts(&self) -> (usize, usize) {
        (self.accepted, self.rejected)
    }
}

impl filter::Filter for DelayFilter {
    fn process(
        &mut self,
        metric: Metric,
        res: &mut Vec<Metric>,
    ) -> Result<(), filter::FilterError> {
        if (metric.timestamp() - time::now_ns()).abs() < self.tolerance {
            self.accepted += 1;
            res.push(metric);
        } else {
            self.rejected += 1;
            trace!(
                "[processors.delay] rejected {} at {}",
                metric.name(),
                metric.timestamp()
            );
        }
        Ok(())
    }
}
