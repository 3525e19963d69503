//! Shared infrastructure: errors, CLI arguments, benchmark counters

pub mod cli;
pub mod error;
pub mod metrics;

pub use cli::{CommonArgs, DumpArgs, HostArgs};
pub use error::{DaqError, DaqResult};
pub use metrics::BenchmarkCounters;
