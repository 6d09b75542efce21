//! Archived logs and per-case reports.
//!
//! Layout under the archive root:
//!
//! ```text
//! <root>/aggregated-report.md
//! <root>/<suite>/measurementsSummary.csv
//! <root>/<suite>/<case>/measurements.csv
//! <root>/<suite>/<case>/report.md
//! <root>/<suite>/<case>/<archived logs>
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{BenchError, Result};

const AGGREGATED_REPORT: &str = "aggregated-report.md";
const AGGREGATED_HEADER: &str = "# Aggregated Report\n\n";

/// Markdown report assembled during a trial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    text: String,
}

impl Report {
    /// An empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report opening with the case title and the current time.
    pub fn titled(suite: &str, case: &str) -> Self {
        let mut report = Self::new();
        report.appendln(format!("# {suite}, {case}"));
        report.appendln(chrono::Utc::now().to_rfc2822());
        report
    }

    /// Append a paragraph.
    pub fn appendln(&mut self, text: impl AsRef<str>) {
        self.text.push_str(text.as_ref());
        self.text.push_str("\n\n");
    }

    /// Append a paragraph followed by a horizontal rule.
    pub fn append_section(&mut self, text: impl AsRef<str>) {
        self.text.push_str(text.as_ref());
        self.text.push_str("\n\n---\n");
    }

    /// The markdown written so far.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Where a trial's artifacts are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    /// Layout rooted at the archive directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The archive directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn suite_path(&self, suite: &str) -> Result<PathBuf> {
        if suite.trim().is_empty() {
            return Err(BenchError::Config("suite name must not be blank".into()));
        }
        Ok(self.root.join(suite))
    }

    fn case_path(&self, suite: &str, case: &str) -> Result<PathBuf> {
        if case.trim().is_empty() {
            return Err(BenchError::Config("case name must not be blank".into()));
        }
        Ok(self.suite_path(suite)?.join(case))
    }

    /// Case directory, created on demand.
    pub fn case_dir(&self, suite: &str, case: &str) -> Result<PathBuf> {
        let dir = self.case_path(suite, case)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Where `log` will be stored once archived. Nothing is created.
    pub fn archived_path(&self, suite: &str, case: &str, log: &Path) -> Result<PathBuf> {
        let name = log.file_name().ok_or_else(|| {
            BenchError::Config(format!("{} has no file name", log.display()))
        })?;
        Ok(self.case_path(suite, case)?.join(name))
    }

    /// `<root>/<suite>/<case>/measurements.csv`, creating the case directory.
    pub fn measurements_csv(&self, suite: &str, case: &str) -> Result<PathBuf> {
        Ok(self.case_dir(suite, case)?.join("measurements.csv"))
    }

    /// `<root>/<suite>/measurementsSummary.csv`, creating the suite directory.
    pub fn summary_csv(&self, suite: &str) -> Result<PathBuf> {
        let dir = self.suite_path(suite)?;
        fs::create_dir_all(&dir)?;
        Ok(dir.join("measurementsSummary.csv"))
    }

    /// Copy `log` into the case directory. A missing log is skipped.
    pub fn archive_log(&self, suite: &str, case: &str, log: Option<&Path>) -> Result<()> {
        let Some(log) = log else {
            warn!(suite, case, "no log to archive");
            return Ok(());
        };
        if !log.exists() {
            warn!(suite, case, log = %log.display(), "log does not exist, nothing to archive");
            return Ok(());
        }
        let target = self.archived_path(suite, case, log)?;
        self.case_dir(suite, case)?;
        fs::copy(log, &target)?;
        info!(from = %log.display(), to = %target.display(), "log archived");
        Ok(())
    }

    /// Write `report.md` for the case and append it to the aggregated report.
    pub fn write_report(&self, suite: &str, case: &str, report: &Report) -> Result<()> {
        let path = self.case_dir(suite, case)?.join("report.md");
        fs::write(&path, report.as_str())?;

        let aggregated = self.root.join(AGGREGATED_REPORT);
        let fresh = !aggregated.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&aggregated)?;
        if fresh {
            file.write_all(AGGREGATED_HEADER.as_bytes())?;
        }
        file.write_all(report.as_str().as_bytes())?;
        info!(report = %path.display(), "report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_report_formatting() {
        let mut report = Report::new();
        report.appendln("dir");
        report.append_section("mvn package");
        assert_eq!(report.as_str(), "dir\n\nmvn package\n\n---\n");
    }

    #[test]
    fn test_archive_missing_log_is_skipped() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path());
        layout
            .archive_log("Suite", "case", Some(&dir.path().join("absent.log")))
            .unwrap();
        layout.archive_log("Suite", "case", None).unwrap();
        assert!(!dir.path().join("Suite").join("case").join("absent.log").exists());
    }

    #[test]
    fn test_blank_case_rejected() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path());
        assert!(layout.case_dir("Suite", " ").is_err());
    }

    #[test]
    fn test_aggregated_report_header_written_once() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path());
        let mut report = Report::new();
        report.appendln("one");
        layout.write_report("Suite", "a", &report).unwrap();
        layout.write_report("Suite", "b", &report).unwrap();
        let aggregated = fs::read_to_string(dir.path().join(AGGREGATED_REPORT)).unwrap();
        assert_eq!(aggregated, "# Aggregated Report\n\none\n\none\n\n");
    }
}
