//! Process control for trialbench.
//!
//! Spawns build and run commands with their output captured to log files,
//! waits for applications to become ready, samples their resource usage and
//! tears them down together with every process they started.

pub mod command;
pub mod os_metrics;
pub mod readiness;
pub mod supervisor;
pub mod terminate;

pub use os_metrics::{ExternalTools, MetricsSampler};
pub use readiness::{parse_port, wait_for_content, wait_for_port_closed};
pub use supervisor::{BuildOutcome, BuildQueue, ProcessState, RunFailure, RunHandle, Supervisor};
