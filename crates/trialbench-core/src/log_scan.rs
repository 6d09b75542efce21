//! Build and run log analysis.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{BenchError, Result};
use crate::patterns::{
    platform_whitelist, Whitelist, DEFAULT_HOST, DEV_HOST, LISTENING, STARTED, STARTED_COLOUR,
    STOPPED, STOPPED_COLOUR, WARN_ERROR,
};
use crate::profile::{AppProfile, Platform};

/// Calls `f` for every line of `path`, decoding invalid UTF-8 lossily.
fn for_each_line(path: &Path, mut f: impl FnMut(&str)) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        f(&String::from_utf8_lossy(&buf));
    }
}

/// Error and warning lines that neither whitelist accepts.
pub fn scan_for_offending_lines(
    log: &Path,
    whitelist: &Whitelist,
    platform: &Whitelist,
) -> Result<BTreeSet<String>> {
    let mut offending = BTreeSet::new();
    for_each_line(log, |line| {
        if !WARN_ERROR.is_match(line) {
            return;
        }
        match whitelist.matching(line).or_else(|| platform.matching(line)) {
            Some(pattern) => {
                info!(log = %log.display(), pattern, "whitelisted line: {line}")
            }
            None => {
                offending.insert(line.to_string());
            }
        }
    })?;
    Ok(offending)
}

/// Fail with every offending line of `log`.
///
/// `archived` is where the log ends up after the trial, quoted in the error.
pub fn check_log(profile: &AppProfile, log: &Path, archived: &Path) -> Result<()> {
    let offending = scan_for_offending_lines(
        log,
        &profile.whitelist,
        platform_whitelist(profile.platform),
    )?;
    if offending.is_empty() {
        return Ok(());
    }
    Err(BenchError::LogConformance {
        mode: profile.mode.name.clone(),
        archived: archived.to_path_buf(),
        lines: offending.into_iter().collect(),
    })
}

/// Whether the last `Listening on:` line names the expected host.
///
/// No listening line at all is non-conforming.
pub fn verify_listening_host(log: &Path, dev_mode: bool) -> Result<bool> {
    let expected = if dev_mode { &*DEV_HOST } else { &*DEFAULT_HOST };
    let mut conforming = false;
    for_each_line(log, |line| {
        if LISTENING.is_match(line) {
            conforming = expected.is_match(line);
        }
    })?;
    Ok(conforming)
}

/// [`verify_listening_host`] for modes that print a listening line.
pub fn check_listening_host(profile: &AppProfile, log: &Path, archived: &Path) -> Result<()> {
    if !profile.mode.listening_line {
        info!(mode = %profile.mode.name, "mode does not print a listening line, skipping host check");
        return Ok(());
    }
    if verify_listening_host(log, profile.mode.is_dev())? {
        Ok(())
    } else {
        Err(BenchError::ListeningHost {
            mode: profile.mode.name.clone(),
            archived: archived.to_path_buf(),
        })
    }
}

/// Startup and shutdown durations reported by the application, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StartStop {
    pub started_s: Option<f64>,
    pub stopped_s: Option<f64>,
}

impl StartStop {
    /// Startup time in milliseconds, rounded.
    pub fn started_ms(&self) -> Option<i64> {
        self.started_s.map(seconds_to_ms)
    }

    /// Shutdown time in milliseconds, rounded.
    pub fn stopped_ms(&self) -> Option<i64> {
        self.stopped_s.map(seconds_to_ms)
    }
}

fn seconds_to_ms(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

fn capture_seconds(re: &regex::Regex, line: &str) -> Option<f64> {
    re.captures(line)?.get(1)?.as_str().parse().ok()
}

/// First reported startup and shutdown time in `log`.
pub fn extract_start_stop(log: &Path, platform: Platform) -> Result<StartStop> {
    let mut durations = StartStop::default();
    for_each_line(log, |line| {
        if durations.started_s.is_none() {
            if let Some(s) = capture_seconds(&STARTED_COLOUR, line)
                .or_else(|| capture_seconds(&STARTED, line))
            {
                durations.started_s = Some(s);
                return;
            }
        }
        if durations.stopped_s.is_none() {
            durations.stopped_s = capture_seconds(&STOPPED_COLOUR, line)
                .or_else(|| capture_seconds(&STOPPED, line));
        }
    })?;

    if durations.started_s.is_none() {
        error!(log = %log.display(), "start time not found in the log");
    }
    if durations.stopped_s.is_none() && platform.reports_stop_time() {
        error!(log = %log.display(), "stop time not found in the log");
    }
    Ok(durations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn log_with(dir: &TempDir, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("run.log");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_whitelisted_lines_are_not_offending() {
        let dir = TempDir::new().unwrap();
        let log = log_with(
            &dir,
            b"INFO fine\nWARN benign thing\nERROR real problem\nwarn benign thing but more\n",
        );
        let whitelist = Whitelist::new(["WARN benign thing"]).unwrap();
        let offending =
            scan_for_offending_lines(&log, &whitelist, &Whitelist::default()).unwrap();
        assert_eq!(
            offending.into_iter().collect::<Vec<_>>(),
            vec!["ERROR real problem", "warn benign thing but more"]
        );
    }

    #[test]
    fn test_invalid_utf8_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, b"ERROR bad \xff byte\r\n");
        let offending =
            scan_for_offending_lines(&log, &Whitelist::default(), &Whitelist::default()).unwrap();
        assert_eq!(offending.len(), 1);
        assert!(offending.iter().next().unwrap().starts_with("ERROR bad"));
    }

    #[test]
    fn test_missing_log_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = scan_for_offending_lines(
            &dir.path().join("absent.log"),
            &Whitelist::default(),
            &Whitelist::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BenchError::Io(_)));
    }

    #[test]
    fn test_last_listening_line_decides() {
        let dir = TempDir::new().unwrap();
        let log = log_with(
            &dir,
            b"Listening on: http://localhost:8080\nListening on: http://0.0.0.0:8080\n",
        );
        assert!(verify_listening_host(&log, false).unwrap());
        assert!(!verify_listening_host(&log, true).unwrap());
    }

    #[test]
    fn test_no_listening_line_is_non_conforming() {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, b"INFO nothing here\n");
        assert!(!verify_listening_host(&log, false).unwrap());
    }

    #[test]
    fn test_started_only() {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, b"Started in 1.228s.\n");
        let durations = extract_start_stop(&log, Platform::Quarkus).unwrap();
        assert_eq!(durations.started_s, Some(1.228));
        assert_eq!(durations.stopped_s, None);
        assert_eq!(durations.started_ms(), Some(1228));
    }

    #[test]
    fn test_first_match_wins_and_colour_stop() {
        let dir = TempDir::new().unwrap();
        let log = log_with(
            &dir,
            "app started in 0.900s. Listening on: http://0.0.0.0:8080\n\
             app started in 5.000s.\n\
             app stopped in \u{1b}[38;5;188m0.024\u{1b}[39ms\n\
             app stopped in 9.000s\n"
                .as_bytes(),
        );
        let durations = extract_start_stop(&log, Platform::Quarkus).unwrap();
        assert_eq!(durations.started_s, Some(0.9));
        assert_eq!(durations.stopped_s, Some(0.024));
        assert_eq!(durations.stopped_ms(), Some(24));
    }
}
