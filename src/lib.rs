//! Aggregates GPU kernel-dispatch traces into time-binned cumulative
//! metrics and pushes them to a time-series backend.

pub mod agent;
pub mod clock;
pub mod config;
pub mod server;
pub mod sink;
pub mod trace;
