//! Error taxonomy for trialbench.

use std::path::PathBuf;
use std::time::Duration;

use crate::threshold::Violation;

/// Errors raised while configuring, running or judging a trial.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("timeout {}s was reached waiting for {url}. {detail}", .timeout.as_secs())]
    ReadinessTimeout {
        url: String,
        timeout: Duration,
        detail: String,
    },

    #[error("{host}:{port} still accepts connections after {}s", .timeout.as_secs())]
    PortStillOpen {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error(
        "{mode} log should not contain error or warning lines that are not whitelisted. \
         See {} and check these offending lines:\n{}",
        .archived.display(),
        .lines.join("\n")
    )]
    LogConformance {
        mode: String,
        archived: PathBuf,
        lines: Vec<String>,
    },

    #[error(
        "{mode} log should contain the expected listening host. See {} and check the listening host.",
        .archived.display()
    )]
    ListeningHost { mode: String, archived: PathBuf },

    #[error("threshold violated: {}", render_violations(.violations))]
    ThresholdViolation { violations: Vec<Violation> },

    #[error("{method} {uri} answered {actual}, expected {expected}")]
    UnexpectedStatus {
        method: String,
        uri: String,
        expected: u16,
        actual: u16,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process control failed for pid {pid}: {reason}")]
    ProcessControl { pid: u32, reason: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),
}

impl BenchError {
    /// Whether the error is a verdict about the application under test rather
    /// than a problem with the harness or its configuration.
    pub fn is_trial_failure(&self) -> bool {
        matches!(
            self,
            BenchError::ReadinessTimeout { .. }
                | BenchError::PortStillOpen { .. }
                | BenchError::LogConformance { .. }
                | BenchError::ListeningHost { .. }
                | BenchError::ThresholdViolation { .. }
                | BenchError::UnexpectedStatus { .. }
        )
    }
}

fn render_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result type for trialbench operations.
pub type Result<T> = std::result::Result<T, BenchError>;
