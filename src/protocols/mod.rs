//! The wire protocols tally must produce. These modules are used by the
//! sinks to do their work.

pub mod line;
