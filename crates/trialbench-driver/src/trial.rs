//! The start/stop trial and the steps it shares with the load trial.
//!
//! A trial builds the application once, then repeatedly launches it, waits
//! for readiness, samples it and stops it, checking its log after each
//! round. Whatever happens, the application is killed, its logs archived and
//! the report written before the trial returns.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn, Instrument};

use trialbench_core::obs::{
    emit_cleanup_error, emit_threshold_evaluated, emit_trial_finished, emit_trial_started,
    trial_span,
};
use trialbench_core::metrics::METRICS;
use trialbench_core::{
    append_record, append_summary, check_listening_host, check_log, evaluate_thresholds,
    extract_start_stop, AppProfile, ArchiveLayout, BenchError, Field, Measured, MeasurementRecord,
    OsFamily, Report, Result, StartStop, ThresholdVerdict, TrialSettings,
};
use trialbench_process::command::platform_command;
use trialbench_process::{
    parse_port, wait_for_port_closed, BuildOutcome, ExternalTools, MetricsSampler, RunFailure,
    Supervisor,
};

/// How long a stopped application may keep its port open.
pub const PORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Names the archive directories of a trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialContext {
    pub suite: String,
    pub case: String,
}

impl TrialContext {
    /// Archive under `<suite>/<case>`.
    pub fn new(suite: impl Into<String>, case: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            case: case.into(),
        }
    }
}

/// Result of a successful start/stop trial.
#[derive(Debug, Clone, Serialize)]
pub struct TrialSummary {
    pub trial_id: String,
    pub trials: Vec<MeasurementRecord>,
    pub summary: MeasurementRecord,
    pub verdict: ThresholdVerdict,
}

/// Everything cleanup needs, filled in as the trial progresses.
#[derive(Debug, Default)]
pub(crate) struct TrialState {
    pub(crate) build_log: Option<PathBuf>,
    pub(crate) run_log: Option<PathBuf>,
    pub(crate) handle: Option<trialbench_process::RunHandle>,
    pub(crate) report: Report,
}

/// Runs trials against resolved application profiles.
#[derive(Clone)]
pub struct TrialDriver {
    pub(crate) supervisor: Supervisor,
    pub(crate) sampler: Arc<dyn MetricsSampler>,
    pub(crate) archive: ArchiveLayout,
    pub(crate) settings: TrialSettings,
    pub(crate) os: OsFamily,
    pub(crate) port_close_timeout: Duration,
}

impl TrialDriver {
    /// A driver sampling with external tools and its own supervisor.
    pub fn new(settings: TrialSettings) -> Self {
        Self {
            supervisor: Supervisor::new(),
            sampler: Arc::new(ExternalTools),
            archive: ArchiveLayout::new(settings.archive_dir.clone()),
            settings,
            os: OsFamily::current(),
            port_close_timeout: PORT_CLOSE_TIMEOUT,
        }
    }

    /// Replace the resource sampler.
    pub fn with_sampler(mut self, sampler: Arc<dyn MetricsSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Replace the supervisor, e.g. to shorten the grace period.
    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// How long a stopped application may keep its port open.
    pub fn with_port_close_timeout(mut self, timeout: Duration) -> Self {
        self.port_close_timeout = timeout;
        self
    }

    /// Where logs, CSVs and reports are written.
    pub fn archive(&self) -> &ArchiveLayout {
        &self.archive
    }

    /// Build, then start and stop the application `iterations` times.
    pub async fn start_stop(
        &self,
        ctx: &TrialContext,
        profile: &AppProfile,
    ) -> Result<TrialSummary> {
        let trial_id = uuid::Uuid::new_v4().to_string();
        let span = trial_span(&trial_id, &profile.name, &profile.mode.name);
        async {
            let started = self.begin(&trial_id, "start-stop");
            let mut state = TrialState::default();
            let outcome = self
                .start_stop_rounds(&trial_id, ctx, profile, &mut state)
                .await;
            self.finish(&trial_id, ctx, &mut state, started, &outcome)
                .await;
            outcome
        }
        .instrument(span)
        .await
    }

    pub(crate) fn begin(&self, trial_id: &str, kind: &str) -> Instant {
        METRICS.inc_trials_started();
        emit_trial_started(trial_id, kind, self.settings.iterations);
        Instant::now()
    }

    /// Cleanup, then report how the trial went.
    pub(crate) async fn finish<T>(
        &self,
        trial_id: &str,
        ctx: &TrialContext,
        state: &mut TrialState,
        started: Instant,
        outcome: &Result<T>,
    ) {
        self.cleanup(trial_id, ctx, state).await;
        if let Err(e) = outcome {
            warn!(trial_id, error = %e, trial_failure = e.is_trial_failure(), "trial failed");
        }
        emit_trial_finished(
            trial_id,
            started.elapsed().as_millis() as u64,
            outcome.is_ok(),
        );
    }

    async fn start_stop_rounds(
        &self,
        trial_id: &str,
        ctx: &TrialContext,
        profile: &AppProfile,
        state: &mut TrialState,
    ) -> Result<TrialSummary> {
        let build = self.build(ctx, profile, state).await?;
        let measurements = self.archive.measurements_csv(&ctx.suite, &ctx.case)?;

        let mut trials = Vec::with_capacity(self.settings.iterations);
        for round in 1..=self.settings.iterations {
            info!(round, of = self.settings.iterations, "starting application");
            let (pid, first_ok_ms) = self.launch(profile, state).await?;
            let rss_kb = self.sample_rss(pid).await;
            let open_fds = self.sample_fds(pid).await;
            let durations = self.stop_and_verify(ctx, profile, state).await?;

            let record = MeasurementRecord::new(&profile.name, &profile.mode.name)
                .with(Field::BuildTimeMs, Some(build.elapsed_ms()))
                .with(Field::TimeToFirstOkRequestMs, first_ok_ms)
                .with(Field::StartedInMs, durations.started_ms())
                .with(Field::StoppedInMs, durations.stopped_ms())
                .with(Field::RssKb, rss_kb)
                .with(Field::OpenFds, open_fds);
            append_record(&record, &measurements)?;
            append_measurements(&mut state.report, &record);
            trials.push(record);
        }

        let summary = MeasurementRecord::summarize(&profile.name, &profile.mode.name, &trials);
        append_summary(&summary, &self.archive.summary_csv(&ctx.suite)?)?;
        info!(
            rss_kb = ?summary.rss_kb,
            time_to_first_ok_ms = ?summary.time_to_first_ok_ms,
            "trimmed means"
        );

        let measured = Measured {
            time_to_first_ok_ms: summary.time_to_first_ok_ms,
            rss_kb: summary.rss_kb,
            time_to_reload_ms: None,
        };
        let verdict = self.gate(profile, &measured)?;
        Ok(TrialSummary {
            trial_id: trial_id.to_string(),
            trials,
            summary,
            verdict,
        })
    }

    /// Evaluate thresholds, failing on any violation.
    pub(crate) fn gate(&self, profile: &AppProfile, measured: &Measured) -> Result<ThresholdVerdict> {
        let verdict = evaluate_thresholds(profile, self.os, measured)?;
        emit_threshold_evaluated(
            &profile.name,
            &verdict.prefix,
            verdict.violations.len(),
            verdict.skipped.len(),
        );
        if verdict.passed() {
            Ok(verdict)
        } else {
            Err(BenchError::ThresholdViolation {
                violations: verdict.violations,
            })
        }
    }

    /// Clean old output, build and check the build log.
    pub(crate) async fn build(
        &self,
        ctx: &TrialContext,
        profile: &AppProfile,
        state: &mut TrialState,
    ) -> Result<BuildOutcome> {
        clean_target(profile);
        fs::create_dir_all(profile.logs_dir())?;

        state.report = Report::titled(&ctx.suite, &ctx.case);
        state.report.appendln(profile.dir.display().to_string());
        state
            .report
            .append_section(platform_command(&profile.mode.build).join(" "));

        let build_log = profile.build_log();
        state.build_log = Some(build_log.clone());
        let outcome = self
            .supervisor
            .build(profile, self.settings.build_timeout)
            .await?;
        let archived = self.archive.archived_path(&ctx.suite, &ctx.case, &build_log)?;
        check_log(profile, &outcome.build_log, &archived)?;
        Ok(outcome)
    }

    /// Launch and wait for readiness; the handle is kept in `state` either way.
    pub(crate) async fn launch(
        &self,
        profile: &AppProfile,
        state: &mut TrialState,
    ) -> Result<(u32, Option<i64>)> {
        state.report.appendln(profile.dir.display().to_string());
        state
            .report
            .append_section(platform_command(&profile.mode.run).join(" "));
        state.run_log = Some(profile.run_log());

        match self.supervisor.run(profile).await {
            Ok(handle) => {
                let ready = (handle.pid(), handle.time_to_first_ok_ms());
                state.handle = Some(handle);
                Ok(ready)
            }
            Err(RunFailure { error, handle }) => {
                state.handle = handle;
                Err(error)
            }
        }
    }

    /// Stop gracefully, wait for the port to close and check the run log.
    pub(crate) async fn stop_and_verify(
        &self,
        ctx: &TrialContext,
        profile: &AppProfile,
        state: &mut TrialState,
    ) -> Result<StartStop> {
        if let Some(handle) = state.handle.as_mut() {
            self.supervisor.stop(handle, false).await?;
        }

        let port = parse_port(&profile.primary_probe()?.url)?;
        if !wait_for_port_closed("localhost", port, self.port_close_timeout).await? {
            return Err(BenchError::PortStillOpen {
                host: "localhost".to_string(),
                port,
                timeout: self.port_close_timeout,
            });
        }

        let run_log = profile.run_log();
        let archived = self.archive.archived_path(&ctx.suite, &ctx.case, &run_log)?;
        check_log(profile, &run_log, &archived)?;
        check_listening_host(profile, &run_log, &archived)?;
        extract_start_stop(&run_log, profile.platform)
    }

    pub(crate) async fn sample_rss(&self, pid: u32) -> Option<i64> {
        match self.sampler.rss_kb(pid).await {
            Ok(value) => value,
            Err(e) => {
                warn!(pid, error = %e, "could not sample RSS");
                None
            }
        }
    }

    pub(crate) async fn sample_fds(&self, pid: u32) -> Option<i64> {
        match self.sampler.open_fds(pid).await {
            Ok(value) => value,
            Err(e) => {
                warn!(pid, error = %e, "could not count open file descriptors");
                None
            }
        }
    }

    /// Kill the application, archive logs and write the report.
    async fn cleanup(&self, trial_id: &str, ctx: &TrialContext, state: &mut TrialState) {
        if let Some(handle) = state.handle.as_mut() {
            if let Err(e) = self.supervisor.stop(handle, true).await {
                emit_cleanup_error(trial_id, "stop", &e);
            }
        }
        for log in [&state.build_log, &state.run_log] {
            if let Err(e) = self
                .archive
                .archive_log(&ctx.suite, &ctx.case, log.as_deref())
            {
                emit_cleanup_error(trial_id, "archive", &e);
            }
        }
        if !state.report.is_empty() {
            if let Err(e) = self
                .archive
                .write_report(&ctx.suite, &ctx.case, &state.report)
            {
                emit_cleanup_error(trial_id, "report", &e);
            }
        }
    }
}

pub(crate) fn append_measurements(report: &mut Report, record: &MeasurementRecord) {
    report.appendln("Measurements:");
    report.appendln(format!(
        "{}\n{}",
        record.header_markdown(),
        record.line_markdown()
    ));
}

/// Remove build output and logs left by a previous trial.
fn clean_target(profile: &AppProfile) {
    for dir in [profile.dir.join("target"), profile.logs_dir()] {
        if !dir.exists() {
            continue;
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => info!(dir = %dir.display(), "cleaned"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "failed to clean"),
        }
    }
}
