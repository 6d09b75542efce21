//! Threshold evaluation of averaged measurements.
//!
//! Keys are looked up as `<os>.<category><suffix>`, e.g.
//! `linux.jvm.RSS.threshold.kB`. A metric with no measurement or no
//! configured threshold is skipped, never failed.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BenchError, Result};
use crate::profile::AppProfile;

/// Operating-system family used in threshold keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
}

impl OsFamily {
    /// Family of the running OS.
    pub fn current() -> Self {
        if cfg!(windows) {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        }
    }

    /// Leading segment of threshold properties.
    pub fn key(&self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::Windows => "windows",
        }
    }
}

/// A gated metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TimeToFirstOkRequest,
    Rss,
    TimeToReload,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::TimeToFirstOkRequest, Metric::Rss, Metric::TimeToReload];

    /// Property suffix after `<os>.<category>.`.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Metric::TimeToFirstOkRequest => ".time.to.first.ok.request.threshold.ms",
            Metric::Rss => ".RSS.threshold.kB",
            Metric::TimeToReload => ".time.to.reload.threshold.ms",
        }
    }
}

/// Averaged values to gate. `None` means the metric was not measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Measured {
    pub time_to_first_ok_ms: Option<i64>,
    pub rss_kb: Option<i64>,
    pub time_to_reload_ms: Option<i64>,
}

impl Measured {
    /// Measured value of `metric`, if any.
    pub fn get(&self, metric: Metric) -> Option<i64> {
        match metric {
            Metric::TimeToFirstOkRequest => self.time_to_first_ok_ms,
            Metric::Rss => self.rss_kb,
            Metric::TimeToReload => self.time_to_reload_ms,
        }
    }
}

/// One metric over its threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub app: String,
    pub mode: String,
    pub metric: Metric,
    pub measured: i64,
    pub threshold: i64,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Violation {
            app,
            mode,
            measured,
            threshold,
            ..
        } = self;
        match self.metric {
            Metric::TimeToFirstOkRequest => write!(
                f,
                "Application {app} in {mode} mode took {measured} ms to get the first OK request, \
                 which is over {threshold} ms threshold."
            ),
            Metric::Rss => write!(
                f,
                "Application {app} in {mode} mode consumed {measured} kB, which is over {threshold} kB threshold."
            ),
            Metric::TimeToReload => write!(
                f,
                "Application {app} in {mode} mode took {measured} ms to get the first OK request after reload, \
                 which is over {threshold} ms threshold."
            ),
        }
    }
}

/// Outcome of gating one measurement set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdVerdict {
    pub prefix: String,
    pub violations: Vec<Violation>,
    pub skipped: Vec<Metric>,
}

impl ThresholdVerdict {
    /// True when no threshold was exceeded.
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// `linux.jvm`, `windows.native`, ...
pub fn threshold_prefix(os: OsFamily, profile: &AppProfile) -> Result<String> {
    let category = profile.mode.category.ok_or_else(|| {
        BenchError::Config(format!(
            "mode {} has no threshold category (jvm, native or dev)",
            profile.mode.name
        ))
    })?;
    Ok(format!("{}.{}", os.key(), category.key()))
}

/// Compare every measured metric with its configured threshold.
pub fn evaluate_thresholds(
    profile: &AppProfile,
    os: OsFamily,
    measured: &Measured,
) -> Result<ThresholdVerdict> {
    let prefix = threshold_prefix(os, profile)?;
    let mut violations = Vec::new();
    let mut skipped = Vec::new();

    for metric in Metric::ALL {
        let Some(value) = measured.get(metric) else {
            skipped.push(metric);
            continue;
        };
        let key = format!("{prefix}{}", metric.key_suffix());
        let Some(&threshold) = profile.thresholds.get(&key) else {
            warn!(app = %profile.name, key = %key, "no threshold configured, skipping check");
            skipped.push(metric);
            continue;
        };
        info!(app = %profile.name, key = %key, measured = value, threshold, "checking threshold");
        if value > threshold {
            violations.push(Violation {
                app: profile.name.clone(),
                mode: profile.mode.name.clone(),
                metric,
                measured: value,
                threshold,
            });
        }
    }

    Ok(ThresholdVerdict {
        prefix,
        violations,
        skipped,
    })
}

/// Like [`evaluate_thresholds`], failing when any metric is over its threshold.
pub fn check_threshold(
    profile: &AppProfile,
    os: OsFamily,
    measured: &Measured,
) -> Result<ThresholdVerdict> {
    let verdict = evaluate_thresholds(profile, os, measured)?;
    if verdict.passed() {
        Ok(verdict)
    } else {
        Err(BenchError::ThresholdViolation {
            violations: verdict.violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::Whitelist;
    use crate::profile::{ModeCategory, ModeProfile, Platform};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn profile(category: Option<ModeCategory>, thresholds: &[(&str, i64)]) -> AppProfile {
        AppProfile {
            name: "SMARTHOUSE_02_QUARKUS_JVM".into(),
            dir: PathBuf::from("."),
            platform: Platform::Quarkus,
            mode: ModeProfile {
                name: "JVM".into(),
                category,
                build: vec!["true".into()],
                run: vec!["true".into()],
                listening_line: true,
            },
            probes: Vec::new(),
            whitelist: Whitelist::default(),
            thresholds: thresholds
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_rss_over_threshold() {
        let p = profile(Some(ModeCategory::Jvm), &[("linux.jvm.RSS.threshold.kB", 4000)]);
        let measured = Measured {
            rss_kb: Some(5000),
            ..Measured::default()
        };
        let err = check_threshold(&p, OsFamily::Linux, &measured).unwrap_err();
        let BenchError::ThresholdViolation { violations } = &err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].measured, 5000);
        assert_eq!(violations[0].threshold, 4000);
        let msg = err.to_string();
        assert!(msg.contains("SMARTHOUSE_02_QUARKUS_JVM"));
        assert!(msg.contains("JVM mode"));
    }

    #[test]
    fn test_equal_to_threshold_passes() {
        let p = profile(Some(ModeCategory::Jvm), &[("linux.jvm.RSS.threshold.kB", 4000)]);
        let measured = Measured {
            rss_kb: Some(4000),
            ..Measured::default()
        };
        assert!(check_threshold(&p, OsFamily::Linux, &measured).unwrap().passed());
    }

    #[test]
    fn test_missing_key_and_value_are_skipped() {
        let p = profile(
            Some(ModeCategory::Native),
            &[("linux.native.time.to.first.ok.request.threshold.ms", 100)],
        );
        let measured = Measured {
            rss_kb: Some(99_999),
            time_to_first_ok_ms: None,
            time_to_reload_ms: None,
        };
        let verdict = evaluate_thresholds(&p, OsFamily::Linux, &measured).unwrap();
        assert!(verdict.passed());
        assert_eq!(verdict.skipped.len(), 3);
        assert_eq!(verdict.prefix, "linux.native");
    }

    #[test]
    fn test_all_violations_reported() {
        let p = profile(
            Some(ModeCategory::Dev),
            &[
                ("windows.dev.RSS.threshold.kB", 10),
                ("windows.dev.time.to.first.ok.request.threshold.ms", 10),
            ],
        );
        let measured = Measured {
            rss_kb: Some(11),
            time_to_first_ok_ms: Some(12),
            time_to_reload_ms: None,
        };
        let verdict = evaluate_thresholds(&p, OsFamily::Windows, &measured).unwrap();
        assert_eq!(verdict.violations.len(), 2);
    }

    #[test]
    fn test_uncategorised_mode_is_config_error() {
        let p = profile(None, &[]);
        let err = evaluate_thresholds(&p, OsFamily::Linux, &Measured::default()).unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }
}
