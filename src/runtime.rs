//! Runtime glue: clock, configuration, telemetry, and the long-running runner.

pub mod clock;
pub mod config;
pub mod runner;
pub mod telemetry;
