use crate::metric::Metric;
use crate::sink::{Sink, SinkError};

/// Null sink
///
/// This sink is intended for testing and demonstration. Every batch it
/// receives is deallocated and reported as written.
pub struct Null {}

impl Null {
    /// Create a new Null sink
    pub fn new(_config: &NullConfig) -> Null {
        Null {}
    }
}

/// Configuration for the `Null` sink
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NullConfig {}

impl Sink for Null {
    fn write(&mut self, _batch: &[Metric]) -> Result<(), SinkError> {
        // discard batch
        Ok(())
    }
}
