//! Measurement records and the CSV files they are written to.
//!
//! Every trial appends one row to a per-case `measurements.csv`. The averaged
//! result of a case goes into a suite-wide summary CSV whose header grows as
//! new columns appear; rows already written are padded, never rewritten.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;

pub const APP_COLUMN: &str = "App";
pub const MODE_COLUMN: &str = "Mode";

/// A recorded quantity. The order of [`Field::ALL`] is the column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Field {
    BuildTimeMs,
    TimeToFirstOkRequestMs,
    StartedInMs,
    StoppedInMs,
    RssKb,
    RssKbFinal,
    OpenFds,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::BuildTimeMs,
        Field::TimeToFirstOkRequestMs,
        Field::StartedInMs,
        Field::StoppedInMs,
        Field::RssKb,
        Field::RssKbFinal,
        Field::OpenFds,
    ];

    /// CSV column name.
    pub fn column(&self) -> &'static str {
        match self {
            Field::BuildTimeMs => "buildTimeMs",
            Field::TimeToFirstOkRequestMs => "timeToFirstOKRequestMs",
            Field::StartedInMs => "startedInMs",
            Field::StoppedInMs => "stoppedInMs",
            Field::RssKb => "RSSKb",
            Field::RssKbFinal => "RSSKbFinal",
            Field::OpenFds => "FDs",
        }
    }

    /// Field written under `column`, if any.
    pub fn from_column(column: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.column() == column)
    }
}

/// Values measured for one app in one mode. Absent fields are not written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeasurementRecord {
    pub app: String,
    pub mode: String,
    pub build_time_ms: Option<i64>,
    pub time_to_first_ok_ms: Option<i64>,
    pub started_in_ms: Option<i64>,
    pub stopped_in_ms: Option<i64>,
    pub rss_kb: Option<i64>,
    pub rss_kb_final: Option<i64>,
    pub open_fds: Option<i64>,
}

impl MeasurementRecord {
    /// An empty record for `app` in `mode`.
    pub fn new(app: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            mode: mode.into(),
            ..Self::default()
        }
    }

    /// Value of `field`, if measured.
    pub fn get(&self, field: Field) -> Option<i64> {
        match field {
            Field::BuildTimeMs => self.build_time_ms,
            Field::TimeToFirstOkRequestMs => self.time_to_first_ok_ms,
            Field::StartedInMs => self.started_in_ms,
            Field::StoppedInMs => self.stopped_in_ms,
            Field::RssKb => self.rss_kb,
            Field::RssKbFinal => self.rss_kb_final,
            Field::OpenFds => self.open_fds,
        }
    }

    /// Store or clear the value of `field`.
    pub fn set(&mut self, field: Field, value: Option<i64>) {
        let slot = match field {
            Field::BuildTimeMs => &mut self.build_time_ms,
            Field::TimeToFirstOkRequestMs => &mut self.time_to_first_ok_ms,
            Field::StartedInMs => &mut self.started_in_ms,
            Field::StoppedInMs => &mut self.stopped_in_ms,
            Field::RssKb => &mut self.rss_kb,
            Field::RssKbFinal => &mut self.rss_kb_final,
            Field::OpenFds => &mut self.open_fds,
        };
        *slot = value;
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, field: Field, value: Option<i64>) -> Self {
        self.set(field, value);
        self
    }

    /// Average of every field over `trials`.
    ///
    /// Three or more values use [`trimmed_mean`]; fewer fall back to the plain
    /// truncated mean. A field absent from all trials stays absent.
    pub fn summarize(app: &str, mode: &str, trials: &[MeasurementRecord]) -> Self {
        let mut summary = Self::new(app, mode);
        for field in Field::ALL {
            let values: Vec<i64> = trials.iter().filter_map(|t| t.get(field)).collect();
            let average = match values.len() {
                0 => None,
                1 | 2 => Some(mean(&values)),
                _ => Some(trimmed_mean(&values)),
            };
            summary.set(field, average);
        }
        summary
    }

    fn present_fields(&self) -> impl Iterator<Item = Field> + '_ {
        Field::ALL.into_iter().filter(|f| self.get(*f).is_some())
    }

    /// `App`, `Mode`, then the present fields in canonical order.
    pub fn columns(&self) -> Vec<&'static str> {
        [APP_COLUMN, MODE_COLUMN]
            .into_iter()
            .chain(self.present_fields().map(|f| f.column()))
            .collect()
    }

    /// Cell for a column name; empty when the record lacks it.
    pub fn value_for(&self, column: &str) -> String {
        match column {
            APP_COLUMN => self.app.clone(),
            MODE_COLUMN => self.mode.clone(),
            other => Field::from_column(other)
                .and_then(|f| self.get(f))
                .map(|v| v.to_string())
                .unwrap_or_default(),
        }
    }

    fn values(&self) -> Vec<String> {
        self.columns().iter().map(|c| self.value_for(c)).collect()
    }

    /// CSV header of the present columns.
    pub fn header_csv(&self) -> String {
        self.columns().join(",")
    }

    /// CSV row matching [`header_csv`](Self::header_csv).
    pub fn line_csv(&self) -> String {
        self.values().join(",")
    }

    /// Markdown table header with its separator row.
    pub fn header_markdown(&self) -> String {
        let columns = self.columns();
        format!(
            "|{}|\n|{}|",
            columns.join("|"),
            vec!["---"; columns.len()].join("|")
        )
    }

    /// Markdown table row matching [`header_markdown`](Self::header_markdown).
    pub fn line_markdown(&self) -> String {
        format!("|{}|", self.values().join("|"))
    }
}

/// Mean after dropping one minimum and one maximum, truncated.
///
/// Returns `i64::MAX` when fewer than three values are given.
pub fn trimmed_mean(values: &[i64]) -> i64 {
    if values.len() < 3 {
        return i64::MAX;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    mean(&sorted[1..sorted.len() - 1])
}

fn mean(values: &[i64]) -> i64 {
    let sum: i128 = values.iter().map(|&v| i128::from(v)).sum();
    (sum / values.len() as i128) as i64
}

/// Append `record` to a per-trial CSV laid out by the file's header.
///
/// The first record writes the header. Cells of absent fields are left
/// empty; a field no earlier record had extends the header and pads the rows
/// already written.
pub fn append_record(record: &MeasurementRecord, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let existing = if path.exists() {
        fs::read_to_string(path)?
    } else {
        String::new()
    };
    let Some(first) = existing.lines().next().filter(|l| !l.trim().is_empty()) else {
        fs::write(
            path,
            format!("{}\n{}\n", record.header_csv(), record.line_csv()),
        )?;
        info!(path = %path.display(), "\n{}\n{}", record.header_csv(), record.line_csv());
        return Ok(());
    };

    let mut header = split_row(first);
    let grown = extend_header(&mut header, record);
    let row = row_by_header(&header, record);

    if grown {
        let mut content = header.join(",");
        content.push('\n');
        for line in existing.lines().skip(1) {
            let mut cells = split_row(line);
            cells.resize(header.len(), String::new());
            content.push_str(&cells.join(","));
            content.push('\n');
        }
        content.push_str(&row);
        content.push('\n');
        fs::write(path, content)?;
    } else {
        let mut file = OpenOptions::new().append(true).open(path)?;
        writeln!(file, "{row}")?;
    }
    info!(path = %path.display(), "\n{}\n{}", header.join(","), row);
    Ok(())
}

/// Exclusive advisory lock on `<path>.lock`, held until dropped.
struct SummaryLock {
    file: File,
}

impl SummaryLock {
    fn acquire(path: &Path) -> Result<Self> {
        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(PathBuf::from(lock_path))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for SummaryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Merge `record` into the evolving summary CSV at `path`.
///
/// New columns extend the header. When the last row is for the same app and
/// mode and is shorter than the header, the missing cells are filled in on
/// that row; otherwise a new row laid out by the header is appended.
pub fn append_summary(record: &MeasurementRecord, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let _lock = SummaryLock::acquire(path)?;

    let existing = if path.exists() {
        fs::read_to_string(path)?
    } else {
        String::new()
    };
    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();

    if lines.is_empty() {
        fs::write(
            path,
            format!("{}\n{}\n", record.header_csv(), record.line_csv()),
        )?;
        debug!(path = %path.display(), "summary created");
        return Ok(());
    }

    let mut header: Vec<String> = split_row(&lines[0]);
    extend_header(&mut header, record);
    lines[0] = header.join(",");

    let last = lines.len() - 1;
    let mut row = split_row(&lines[last]);
    let same_case = last > 0
        && row.first().map(String::as_str) == Some(record.app.as_str())
        && row.get(1).map(String::as_str) == Some(record.mode.as_str());

    if same_case && row.len() < header.len() {
        for column in &header[row.len()..] {
            row.push(record.value_for(column));
        }
        lines[last] = row.join(",");
    } else {
        lines.push(row_by_header(&header, record));
    }

    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content)?;
    info!(path = %path.display(), "summary updated:\n{}\n{}", lines[0], lines[lines.len() - 1]);
    Ok(())
}

fn split_row(line: &str) -> Vec<String> {
    line.split(',').map(str::to_string).collect()
}

/// Add the columns of `record` missing from `header`; true if any were added.
fn extend_header(header: &mut Vec<String>, record: &MeasurementRecord) -> bool {
    let before = header.len();
    for column in record.columns() {
        if !header.iter().any(|h| h == column) {
            header.push(column.to_string());
        }
    }
    header.len() > before
}

fn row_by_header(header: &[String], record: &MeasurementRecord) -> String {
    header
        .iter()
        .map(|c| record.value_for(c))
        .collect::<Vec<_>>()
        .join(",")
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_trimmed_mean() {
        assert_eq!(trimmed_mean(&[10, 20, 30]), 20);
        assert_eq!(trimmed_mean(&[30, 10, 21, 22]), 21);
        assert_eq!(trimmed_mean(&[5, 5]), i64::MAX);
        assert_eq!(trimmed_mean(&[]), i64::MAX);
    }

    #[test]
    fn test_columns_follow_present_fields() {
        let record = MeasurementRecord::new("APP", "JVM")
            .with(Field::RssKb, Some(100))
            .with(Field::BuildTimeMs, Some(2000));
        assert_eq!(record.header_csv(), "App,Mode,buildTimeMs,RSSKb");
        assert_eq!(record.line_csv(), "APP,JVM,2000,100");
    }

    #[test]
    fn test_markdown_rendering() {
        let record = MeasurementRecord::new("APP", "JVM").with(Field::OpenFds, Some(12));
        assert_eq!(record.header_markdown(), "|App|Mode|FDs|\n|---|---|---|");
        assert_eq!(record.line_markdown(), "|APP|JVM|12|");
    }

    #[test]
    fn test_summarize_keeps_absent_fields_absent() {
        let trials = vec![
            MeasurementRecord::new("A", "M").with(Field::RssKb, Some(10)),
            MeasurementRecord::new("A", "M").with(Field::RssKb, Some(20)),
            MeasurementRecord::new("A", "M").with(Field::RssKb, Some(30)),
        ];
        let summary = MeasurementRecord::summarize("A", "M", &trials);
        assert_eq!(summary.rss_kb, Some(20));
        assert_eq!(summary.stopped_in_ms, None);

        let single = MeasurementRecord::summarize("A", "M", &trials[..1]);
        assert_eq!(single.rss_kb, Some(10));
    }

    #[test]
    fn test_append_record_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("case").join("measurements.csv");
        let record = MeasurementRecord::new("A", "M").with(Field::RssKb, Some(1));
        append_record(&record, &path).unwrap();
        append_record(&record, &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "App,Mode,RSSKb\nA,M,1\nA,M,1\n");
    }

    #[test]
    fn test_append_record_keeps_cells_under_their_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("measurements.csv");
        let full = MeasurementRecord::new("A", "JVM")
            .with(Field::RssKb, Some(5000))
            .with(Field::OpenFds, Some(40));
        let partial = MeasurementRecord::new("A", "JVM").with(Field::OpenFds, Some(41));
        append_record(&full, &path).unwrap();
        append_record(&partial, &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "App,Mode,RSSKb,FDs\nA,JVM,5000,40\nA,JVM,,41\n");
    }

    #[test]
    fn test_append_record_extends_header_and_pads_old_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("measurements.csv");
        let partial = MeasurementRecord::new("A", "JVM").with(Field::OpenFds, Some(41));
        let full = MeasurementRecord::new("A", "JVM")
            .with(Field::RssKb, Some(5000))
            .with(Field::OpenFds, Some(40));
        append_record(&partial, &path).unwrap();
        append_record(&full, &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "App,Mode,FDs,RSSKb\nA,JVM,41,\nA,JVM,40,5000\n");
    }
}
