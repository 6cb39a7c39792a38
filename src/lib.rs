//! Tally is a telemetry collection agent. It gathers metrics from many
//! independently scheduled inputs, runs them through an ordered chain of
//! processors and optional windowed aggregators, and delivers them in batches
//! to many independently flushed outputs. Every output has its own bounded
//! buffer and its own flush loop, so one slow or failing destination never
//! holds up another.
//!
//! Why you might choose to use tally:
//!
//!  * You need to collect host telemetry on a fixed cadence.
//!  * You need to multiplex telemetry over several destinations.
//!  * You want bounded memory with an explicit, observable overflow policy.
//!  * You want roll-ups computed before the data leaves the host.
#![allow(unknown_lints)]
#![deny(trivial_numeric_casts, missing_docs, unstable_features, unused_import_braces)]

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate serde_json;

#[cfg(test)]
extern crate quickcheck;

pub mod agent;
pub mod aggregate;
pub mod buckets;
pub mod buffer;
pub mod bus;
pub mod config;
pub mod filter;
pub mod metric;
pub mod protocols;
pub mod registry;
pub mod sink;
pub mod source;
pub mod stats;
pub mod thread;
pub mod time;
