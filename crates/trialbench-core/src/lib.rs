//! trialbench core library
//!
//! Pattern library, log analysis, threshold gating, measurement recording and
//! the application catalog. Nothing in this crate spawns processes.

pub mod archive;
pub mod error;
pub mod log_scan;
pub mod measurement;
pub mod metrics;
pub mod obs;
pub mod patterns;
pub mod profile;
pub mod telemetry;
pub mod threshold;

pub use archive::{ArchiveLayout, Report};
pub use error::{BenchError, Result};
pub use log_scan::{
    check_listening_host, check_log, extract_start_stop, scan_for_offending_lines,
    verify_listening_host, StartStop,
};
pub use measurement::{append_record, append_summary, trimmed_mean, Field, MeasurementRecord};
pub use patterns::{platform_whitelist, Whitelist};
pub use profile::{
    load_thresholds, override_name, AppProfile, Catalog, ModeCategory, ModeProfile, Overrides,
    Platform, Probe, TrialSettings,
};
pub use threshold::{
    check_threshold, evaluate_thresholds, Measured, Metric, OsFamily, ThresholdVerdict, Violation,
};
