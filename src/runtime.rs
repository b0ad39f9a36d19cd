//! Runtime glue: configuration, the bootstrap sequencer, shutdown coordination,
//! retry backoff and telemetry.

pub(crate) mod backoff;
pub mod bootstrap;
pub mod config;
pub mod fatal;
pub mod telemetry;
