//! Building, launching and stopping applications under test.
//!
//! Builds go through a single-slot [`BuildQueue`]; a launched application is
//! owned by a [`RunHandle`] whose [`ProcessState`] only moves forward:
//!
//! ```text
//! Running -> TerminationRequested -> Exited | ForceKilled
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use trialbench_core::obs::emit_build_finished;
use trialbench_core::{AppProfile, BenchError, Probe, Result};

use crate::command::spawn_logged;
use crate::readiness::wait_for_content;
use crate::terminate;

/// Upper bound on waiting for a queued build job, queueing included.
pub const BUILD_QUEUE_CEILING: Duration = Duration::from_secs(30 * 60);
/// Timeout of the first, timed, readiness probe.
pub const FIRST_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout of every other readiness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a gracefully stopped application may take to exit.
pub const GRACE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Runs jobs one at a time, each on its own task.
#[derive(Debug, Clone)]
pub struct BuildQueue {
    slot: Arc<Semaphore>,
}

impl Default for BuildQueue {
    fn default() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }
}

impl BuildQueue {
    /// An empty queue with one slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` once the slot is free.
    ///
    /// Returns `Ok(None)` if the job has not finished within
    /// [`BUILD_QUEUE_CEILING`]; it keeps running detached in that case.
    pub async fn submit<F, T>(&self, job: F) -> Result<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = self.slot.clone();
        let task = tokio::spawn(async move {
            let _permit = slot.acquire_owned().await;
            job.await
        });
        match tokio::time::timeout(BUILD_QUEUE_CEILING, task).await {
            Ok(Ok(output)) => Ok(Some(output)),
            Ok(Err(e)) => Err(BenchError::Io(std::io::Error::other(format!(
                "build job failed: {e}"
            )))),
            Err(_) => {
                warn!(
                    ceiling_s = BUILD_QUEUE_CEILING.as_secs(),
                    "build job did not finish in time"
                );
                Ok(None)
            }
        }
    }
}

/// Result of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub elapsed: Duration,
    pub build_log: PathBuf,
    /// Always 0: the build tool's exit status is only logged, not propagated.
    pub exit_code: i32,
}

impl BuildOutcome {
    /// Wall time of the build in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        self.elapsed.as_millis() as i64
    }
}

/// Termination state of a launched application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    TerminationRequested,
    Exited,
    ForceKilled,
}

impl ProcessState {
    /// Whether the process is known to be gone.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Exited | ProcessState::ForceKilled)
    }
}

/// A launched application.
#[derive(Debug)]
pub struct RunHandle {
    child: Child,
    pid: u32,
    run_log: PathBuf,
    time_to_first_ok: Option<Duration>,
    state: ProcessState,
    /// Every descendant seen while the application was alive.
    descendants: Vec<u32>,
}

impl RunHandle {
    /// Pid of the launched command.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Log receiving the merged output of the application.
    pub fn run_log(&self) -> &Path {
        &self.run_log
    }

    /// Current termination state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Time until the first probe answered, once readiness was awaited.
    pub fn time_to_first_ok(&self) -> Option<Duration> {
        self.time_to_first_ok
    }

    /// [`time_to_first_ok`](Self::time_to_first_ok) in milliseconds.
    pub fn time_to_first_ok_ms(&self) -> Option<i64> {
        self.time_to_first_ok.map(|d| d.as_millis() as i64)
    }

    /// Descendants recorded so far, parents before their children.
    pub fn descendants(&self) -> &[u32] {
        &self.descendants
    }

    /// Add descendants spawned since the last look.
    fn track_descendants(&mut self) {
        for pid in terminate::descendants(self.pid) {
            if !self.descendants.contains(&pid) {
                self.descendants.push(pid);
            }
        }
    }

    /// Kill recorded descendants that outlived the application.
    fn kill_strays(&self) {
        for &pid in &self.descendants {
            if !terminate::is_alive(pid) {
                continue;
            }
            match terminate::kill(pid) {
                Ok(()) => warn!(parent = self.pid, pid, "killed process left behind"),
                Err(e) => warn!(parent = self.pid, pid, error = %e, "failed to kill process left behind"),
            }
        }
    }
}

/// [`Supervisor::run`] failed after the process was spawned.
///
/// The handle is handed back so the caller can still stop the process.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    pub error: BenchError,
    pub handle: Option<RunHandle>,
}

impl From<BenchError> for RunFailure {
    fn from(error: BenchError) -> Self {
        Self {
            error,
            handle: None,
        }
    }
}

/// Builds, launches and stops applications.
#[derive(Debug, Clone)]
pub struct Supervisor {
    queue: BuildQueue,
    grace: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            queue: BuildQueue::new(),
            grace: GRACE_PERIOD,
        }
    }
}

impl Supervisor {
    /// A supervisor with its own build queue and the default grace period.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how long a graceful stop waits before escalating.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Build the application, waiting at most `timeout` for the build tool.
    pub async fn build(&self, profile: &AppProfile, timeout: Duration) -> Result<BuildOutcome> {
        let argv = profile.mode.build.clone();
        let dir = profile.dir.clone();
        let log = profile.build_log();
        let job_log = log.clone();

        info!(app = %profile.name, command = %argv.join(" "), "building");
        let started = Instant::now();
        let finished = self
            .queue
            .submit(async move { run_to_completion(&argv, &dir, &job_log, timeout).await })
            .await?;
        let elapsed = started.elapsed();

        match finished.transpose()? {
            Some(Some(status)) if !status.success() => {
                warn!(app = %profile.name, %status, "build tool reported failure")
            }
            Some(None) => warn!(
                app = %profile.name,
                timeout_s = timeout.as_secs(),
                "build timed out and was killed"
            ),
            _ => {}
        }

        if !log.exists() {
            return Err(BenchError::MissingArtifact(log));
        }
        emit_build_finished(&profile.name, elapsed.as_millis() as u64);
        Ok(BuildOutcome {
            elapsed,
            build_log: log,
            exit_code: 0,
        })
    }

    /// Spawn the run command. The application is not yet known to be ready.
    pub async fn launch(&self, profile: &AppProfile) -> Result<RunHandle> {
        let run_log = profile.run_log();
        let child = spawn_logged(&profile.mode.run, &profile.dir, &run_log)?;
        let pid = child.id().ok_or_else(|| BenchError::ProcessControl {
            pid: 0,
            reason: "process exited before its pid was read".to_string(),
        })?;
        info!(app = %profile.name, pid, command = %profile.mode.run.join(" "), "launched");
        Ok(RunHandle {
            child,
            pid,
            run_log,
            time_to_first_ok: None,
            state: ProcessState::Running,
            descendants: Vec::new(),
        })
    }

    /// Probe until every probe answers, timing the first one.
    pub async fn await_readiness(&self, handle: &mut RunHandle, probes: &[Probe]) -> Result<()> {
        let first = probes
            .first()
            .ok_or_else(|| BenchError::Config("no readiness probes configured".to_string()))?;
        handle.time_to_first_ok =
            wait_for_content(&first.url, FIRST_PROBE_TIMEOUT, &first.expected, true).await?;
        info!(pid = handle.pid, time_to_first_ok_ms = ?handle.time_to_first_ok_ms(), "first OK request");

        for probe in probes {
            wait_for_content(&probe.url, PROBE_TIMEOUT, &probe.expected, false).await?;
        }
        Ok(())
    }

    /// Launch the application and wait for it to become ready.
    pub async fn run(&self, profile: &AppProfile) -> std::result::Result<RunHandle, RunFailure> {
        let mut handle = self.launch(profile).await?;
        match self.await_readiness(&mut handle, &profile.probes).await {
            Ok(()) => Ok(handle),
            Err(error) => Err(RunFailure {
                error,
                handle: Some(handle),
            }),
        }
    }

    /// Stop the application and everything it spawned.
    ///
    /// Graceful stops wait for the application to exit and kill it when the
    /// grace period runs out. Descendants still alive once the application
    /// is gone are killed. Stopping a stopped handle only kills such
    /// descendants, and only when forced.
    pub async fn stop(&self, handle: &mut RunHandle, force: bool) -> Result<ProcessState> {
        if handle.state.is_terminal() {
            if force {
                handle.kill_strays();
            }
            return Ok(handle.state);
        }
        if let Some(status) = handle.child.try_wait()? {
            info!(pid = handle.pid, %status, "application had already exited");
            handle.kill_strays();
            handle.state = ProcessState::Exited;
            return Ok(handle.state);
        }

        let graceful = !force && terminate::supports_graceful();
        handle.state = ProcessState::TerminationRequested;
        handle.track_descendants();

        if graceful {
            signal_tree(handle.pid, handle.descendants(), terminate::terminate)?;
            match tokio::time::timeout(self.grace, handle.child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    info!(pid = handle.pid, %status, "application exited");
                    handle.kill_strays();
                    handle.state = ProcessState::Exited;
                    return Ok(handle.state);
                }
                Err(_) => warn!(
                    pid = handle.pid,
                    grace_s = self.grace.as_secs(),
                    "application did not exit after SIGTERM, killing"
                ),
            }
        }

        handle.track_descendants();
        signal_tree(handle.pid, handle.descendants(), terminate::kill)?;
        handle.child.wait().await?;
        handle.kill_strays();
        info!(pid = handle.pid, "application killed");
        handle.state = ProcessState::ForceKilled;
        Ok(handle.state)
    }

    /// Pin the application to the first `cores` CPUs with `taskset`.
    #[cfg(unix)]
    pub async fn set_cpu_affinity(&self, handle: &RunHandle, cores: usize) -> Result<()> {
        if cores == 0 {
            return Err(BenchError::Config("cores must be at least 1".to_string()));
        }
        let list = format!("0-{}", cores - 1);
        let output = tokio::process::Command::new("taskset")
            .args(["-cpa", &list, &handle.pid.to_string()])
            .output()
            .await
            .map_err(|source| BenchError::Spawn {
                command: "taskset".to_string(),
                source,
            })?;
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        let failure = |reason: String| BenchError::ProcessControl {
            pid: handle.pid,
            reason,
        };
        verify_affinity_output(&text, &expected_affinity(cores)).map_err(failure)?;
        if !output.status.success() {
            return Err(failure(format!("taskset exited with {}", output.status)));
        }
        info!(pid = handle.pid, cores, "CPU affinity set");
        Ok(())
    }

    /// CPU affinity needs `taskset`; always a configuration error here.
    #[cfg(not(unix))]
    pub async fn set_cpu_affinity(&self, _handle: &RunHandle, _cores: usize) -> Result<()> {
        Err(BenchError::Config(
            "CPU affinity is only supported on POSIX systems".to_string(),
        ))
    }
}

/// Affinity list `taskset` prints for the first `cores` CPUs.
#[cfg(unix)]
fn expected_affinity(cores: usize) -> String {
    match cores {
        1 => "0".to_string(),
        2 => "0,1".to_string(),
        _ => format!("0-{}", cores - 1),
    }
}

/// Every `new affinity list` line of `taskset -a` output must name exactly
/// `expected`; there is one such line per thread.
#[cfg(unix)]
fn verify_affinity_output(text: &str, expected: &str) -> std::result::Result<(), String> {
    let lists: Vec<&str> = text
        .lines()
        .filter(|l| l.contains("new affinity list"))
        .map(|l| l.rsplit(':').next().unwrap_or_default().trim())
        .collect();
    if lists.is_empty() {
        return Err(format!("new CPU affinity not set: {}", text.trim()));
    }
    match lists.iter().find(|list| **list != expected) {
        Some(list) => Err(format!("expected affinity list {expected}, got {list}")),
        None => Ok(()),
    }
}

/// Signal `descendants`, then `pid` itself.
///
/// Failures on descendants are logged; only a failure on `pid` is returned.
fn signal_tree(pid: u32, descendants: &[u32], signal: fn(u32) -> Result<()>) -> Result<()> {
    for &child in descendants {
        if let Err(e) = signal(child) {
            warn!(parent = pid, pid = child, error = %e, "failed to signal child process");
        }
    }
    signal(pid)
}

/// Run a command to completion; `Ok(None)` if it was killed on timeout.
async fn run_to_completion(
    argv: &[String],
    dir: &Path,
    log: &Path,
    timeout: Duration,
) -> Result<Option<ExitStatus>> {
    let mut child = spawn_logged(argv, dir, log)?;
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Ok(Some(status?)),
        Err(_) => {
            if let Some(pid) = child.id() {
                signal_tree(pid, &terminate::descendants(pid), terminate::kill)?;
            }
            child.wait().await?;
            Ok(None)
        }
    }
}
