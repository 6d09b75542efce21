//! Resident memory and open file descriptor sampling.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use trialbench_core::{BenchError, Result};

/// Samples resource usage of a running process.
///
/// `Ok(None)` means the tool ran but reported nothing for the pid.
#[async_trait]
pub trait MetricsSampler: Send + Sync {
    async fn rss_kb(&self, pid: u32) -> Result<Option<i64>>;

    async fn open_fds(&self, pid: u32) -> Result<Option<i64>>;
}

/// Sampler backed by `ps`/`lsof`, or `wmic` on Windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalTools;

async fn capture(program: &str, args: &[String]) -> Result<String> {
    let mut command = Command::new(program);
    command.args(args);
    if let Some(path) = std::env::var_os("PATH") {
        command.env("PATH", path);
    }
    let output = command.output().await.map_err(|source| BenchError::Spawn {
        command: format!("{program} {}", args.join(" ")),
        source,
    })?;
    debug!(program, status = ?output.status, "sampling tool finished");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// First line consisting only of digits.
fn first_number(text: &str) -> Option<i64> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && l.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|l| l.parse().ok())
}

fn wmic_args(pid: u32, property: &str) -> Vec<String> {
    vec![
        "process".into(),
        "where".into(),
        format!("processid={pid}"),
        "get".into(),
        property.into(),
    ]
}

#[async_trait]
impl MetricsSampler for ExternalTools {
    async fn rss_kb(&self, pid: u32) -> Result<Option<i64>> {
        if cfg!(windows) {
            let out = capture("wmic", &wmic_args(pid, "WorkingSetSize")).await?;
            Ok(first_number(&out).map(|bytes| bytes / 1024))
        } else {
            let args = ["-p".to_string(), pid.to_string(), "-o".into(), "rss=".into()];
            Ok(first_number(&capture("ps", &args).await?))
        }
    }

    async fn open_fds(&self, pid: u32) -> Result<Option<i64>> {
        if cfg!(windows) {
            let out = capture("wmic", &wmic_args(pid, "HandleCount")).await?;
            Ok(first_number(&out))
        } else {
            let args = ["-F0n".to_string(), "-p".into(), pid.to_string()];
            let out = capture("lsof", &args).await?;
            let count = out.lines().count() as i64;
            Ok((count > 0).then_some(count))
        }
    }
}
