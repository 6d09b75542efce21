//! Structured lifecycle events for trials.
//!
//! [`trial_span`] tags everything logged during a trial with the trial id,
//! app and mode; the `emit_*` functions mark the milestones.

use tracing::info;

/// Span tagging everything logged during a trial.
///
/// Attach it with [`tracing::Instrument`] so trial futures stay `Send`.
pub fn trial_span(trial_id: &str, app: &str, mode: &str) -> tracing::Span {
    tracing::info_span!("trialbench.trial", trial_id = %trial_id, app = %app, mode = %mode)
}

/// A trial began.
pub fn emit_trial_started(trial_id: &str, kind: &str, iterations: usize) {
    info!(event = "trial.started", trial_id = %trial_id, kind = %kind, iterations = iterations);
}

/// The build job finished, successfully or not.
pub fn emit_build_finished(app: &str, duration_ms: u64) {
    info!(event = "build.finished", app = %app, duration_ms = duration_ms);
}

/// A trial ended, after cleanup.
pub fn emit_trial_finished(trial_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "trial.finished",
        trial_id = %trial_id,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Thresholds were compared with the averaged measurements.
pub fn emit_threshold_evaluated(app: &str, prefix: &str, violations: usize, skipped: usize) {
    info!(
        event = "threshold.evaluated",
        app = %app,
        prefix = %prefix,
        violations = violations,
        skipped = skipped,
        passed = violations == 0,
    );
}

/// Cleanup step failure; the trial's own outcome is unaffected.
pub fn emit_cleanup_error(trial_id: &str, step: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "trial.cleanup_error", trial_id = %trial_id, step = %step, error = %error);
}
