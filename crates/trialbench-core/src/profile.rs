//! Application profiles and the `bench.toml` catalog they are resolved from.
//!
//! A catalog names execution modes (build and run commands) and the
//! applications benchmarked under them. [`Catalog::resolve`] turns one catalog
//! entry into an immutable [`AppProfile`] with its whitelist compiled and its
//! thresholds loaded, overrides applied.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BenchError, Result};
use crate::patterns::Whitelist;

/// Framework of the application under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Quarkus,
    SpringBoot,
}

impl Platform {
    /// Spring Boot does not log how long shutdown took.
    pub fn reports_stop_time(&self) -> bool {
        !matches!(self, Platform::SpringBoot)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Quarkus => write!(f, "quarkus"),
            Platform::SpringBoot => write!(f, "spring_boot"),
        }
    }
}

/// Threshold family of an execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeCategory {
    Jvm,
    Native,
    Dev,
}

impl ModeCategory {
    /// Key segment used in threshold properties.
    pub fn key(&self) -> &'static str {
        match self {
            ModeCategory::Jvm => "jvm",
            ModeCategory::Native => "native",
            ModeCategory::Dev => "dev",
        }
    }
}

/// How an application is built and launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeProfile {
    pub name: String,
    pub category: Option<ModeCategory>,
    pub build: Vec<String>,
    pub run: Vec<String>,
    /// Whether the running application prints a `Listening on:` line.
    pub listening_line: bool,
}

impl ModeProfile {
    /// Whether the mode is a development mode listening on localhost.
    pub fn is_dev(&self) -> bool {
        self.category == Some(ModeCategory::Dev)
    }

    /// `jvm-build.log`, `native-run.log`, ...
    pub fn log_name(&self, kind: &str) -> String {
        format!("{}-{kind}.log", self.name.to_lowercase())
    }
}

/// A readiness probe: GET `url` until the body contains `expected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub url: String,
    pub expected: String,
}

impl Probe {
    /// A probe expecting `expected` in the body of `url`.
    pub fn new(url: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expected: expected.into(),
        }
    }
}

/// Everything needed to benchmark one application in one mode.
#[derive(Debug, Clone)]
pub struct AppProfile {
    pub name: String,
    pub dir: PathBuf,
    pub platform: Platform,
    pub mode: ModeProfile,
    pub probes: Vec<Probe>,
    pub whitelist: Whitelist,
    pub thresholds: BTreeMap<String, i64>,
}

impl AppProfile {
    /// `<app dir>/logs`.
    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join("logs")
    }

    /// Build log of the current mode.
    pub fn build_log(&self) -> PathBuf {
        self.logs_dir().join(self.mode.log_name("build"))
    }

    /// Run log of the current mode.
    pub fn run_log(&self) -> PathBuf {
        self.logs_dir().join(self.mode.log_name("run"))
    }

    /// The probe whose port the application serves on.
    pub fn primary_probe(&self) -> Result<&Probe> {
        self.probes.first().ok_or_else(|| {
            BenchError::Config(format!("{} has no readiness probes configured", self.name))
        })
    }
}

/// Sources that may replace a value read from `threshold.toml`.
///
/// Explicit overrides win over environment variables.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    env: HashMap<String, String>,
    explicit: HashMap<String, String>,
}

impl Overrides {
    /// Overrides taken from the process environment.
    pub fn from_env() -> Self {
        Self::with_env(std::env::vars())
    }

    /// Overrides taken from the given variables instead of the environment.
    pub fn with_env<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            env: vars.into_iter().collect(),
            explicit: HashMap::new(),
        }
    }

    /// Add an override given on the command line, keyed by override name.
    pub fn with_explicit(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.explicit.insert(name.into(), value.into());
        self
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.explicit
            .get(name)
            .or_else(|| self.env.get(name))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Name of the variable that overrides `property` for the app in `app_dir`.
///
/// `smarthouse-02-quarkus` + `linux.jvm.RSS.threshold.kB` becomes
/// `SMARTHOUSE_02_QUARKUS_LINUX_JVM_RSS_THRESHOLD_KB`.
pub fn override_name(app_dir: &str, property: &str) -> String {
    let normalise = |s: &str| s.to_uppercase().replace(['-', '.'], "_");
    format!("{}_{}", normalise(app_dir), normalise(property))
}

/// Read `threshold.toml`, flatten it to dotted keys and apply overrides.
pub fn load_thresholds(
    path: &Path,
    app_dir: &str,
    overrides: &Overrides,
) -> Result<BTreeMap<String, i64>> {
    if !path.exists() {
        return Err(BenchError::Config(format!(
            "couldn't find {}",
            path.display()
        )));
    }
    let table: toml::Table = toml::from_str(&fs::read_to_string(path)?)?;

    let mut raw = BTreeMap::new();
    flatten("", &table, &mut raw)?;

    let mut thresholds = BTreeMap::new();
    for (key, value) in raw {
        let name = override_name(app_dir, &key);
        let value = match overrides.lookup(&name) {
            Some(v) => {
                info!(property = %key, variable = %name, "threshold overridden");
                v.trim().to_string()
            }
            None => value,
        };
        let parsed = value.parse::<i64>().map_err(|_| {
            BenchError::Config(format!(
                "{key} = {value:?} in {}: all threshold values must be integers; \
                 check threshold.toml and the override variables (upper case, underscores instead of dots)",
                path.display()
            ))
        })?;
        thresholds.insert(key, parsed);
    }
    debug!(path = %path.display(), count = thresholds.len(), "thresholds loaded");
    Ok(thresholds)
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) -> Result<()> {
    for (key, value) in table {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten(&key, inner, out)?,
            toml::Value::Integer(i) => {
                out.insert(key, i.to_string());
            }
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            other => {
                return Err(BenchError::Config(format!(
                    "{key} must be an integer, found {}",
                    other.type_str()
                )))
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------
// Catalog
// ------------------------------------------------------------------

/// Trial-wide settings from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialSettings {
    pub iterations: usize,
    pub build_timeout: Duration,
    pub archive_dir: PathBuf,
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            build_timeout: Duration::from_secs(default_build_timeout_minutes() * 60),
            archive_dir: default_archive_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    apps_dir: PathBuf,
    thresholds_dir: Option<PathBuf>,
    #[serde(default = "default_archive_dir")]
    archive_dir: PathBuf,
    #[serde(default = "default_iterations")]
    iterations: usize,
    #[serde(default = "default_build_timeout_minutes")]
    build_timeout_minutes: u64,
    #[serde(default)]
    modes: BTreeMap<String, ModeEntry>,
    #[serde(default)]
    apps: Vec<AppEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModeEntry {
    category: Option<ModeCategory>,
    build: Vec<String>,
    run: Vec<String>,
    #[serde(default = "default_true")]
    listening_line: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AppEntry {
    name: String,
    dir: String,
    platform: Platform,
    mode: String,
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    probes: Vec<Probe>,
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("archived-logs")
}

fn default_iterations() -> usize {
    3
}

fn default_build_timeout_minutes() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

/// Parsed and validated `bench.toml`.
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    file: CatalogFile,
    overrides: Overrides,
}

impl Catalog {
    /// Load a catalog file. Relative directories resolve against its parent.
    pub fn load(path: &Path, overrides: Overrides) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BenchError::Config(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&content, root, overrides)
    }

    /// Parse catalog text; relative directories resolve against `root`.
    pub fn parse(content: &str, root: impl Into<PathBuf>, overrides: Overrides) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        let catalog = Self {
            root: root.into(),
            file,
            overrides,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        if self.file.iterations == 0 {
            return Err(BenchError::Config("iterations must be at least 1".into()));
        }
        for (name, mode) in &self.file.modes {
            if mode.build.is_empty() || mode.run.is_empty() {
                return Err(BenchError::Config(format!(
                    "mode {name} needs non-empty build and run commands"
                )));
            }
        }
        for app in &self.file.apps {
            // CSV rows are split on commas without quoting.
            if app.name.contains(',') || app.mode.contains(',') {
                return Err(BenchError::Config(format!(
                    "app {:?} and its mode must not contain commas",
                    app.name
                )));
            }
            if !self.file.modes.contains_key(&app.mode) {
                return Err(BenchError::Config(format!(
                    "app {} refers to unknown mode {}",
                    app.name, app.mode
                )));
            }
        }
        Ok(())
    }

    /// Names of every app, in catalog order.
    pub fn app_names(&self) -> impl Iterator<Item = &str> {
        self.file.apps.iter().map(|a| a.name.as_str())
    }

    /// Trial-wide settings with the archive directory resolved.
    pub fn settings(&self) -> TrialSettings {
        TrialSettings {
            iterations: self.file.iterations,
            build_timeout: Duration::from_secs(self.file.build_timeout_minutes * 60),
            archive_dir: self.root.join(&self.file.archive_dir),
        }
    }

    fn apps_dir(&self) -> PathBuf {
        self.root.join(&self.file.apps_dir)
    }

    fn thresholds_dir(&self) -> PathBuf {
        match &self.file.thresholds_dir {
            Some(dir) => self.root.join(dir),
            None => self.apps_dir(),
        }
    }

    /// Build the immutable profile for the app called `name`.
    pub fn resolve(&self, name: &str) -> Result<AppProfile> {
        let entry = self
            .file
            .apps
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| BenchError::Config(format!("no app named {name} in catalog")))?;
        let mode = &self.file.modes[&entry.mode];

        let dir = self.apps_dir().join(&entry.dir);
        if !dir.is_dir() {
            return Err(BenchError::Config(format!(
                "application directory {} does not exist",
                dir.display()
            )));
        }

        let threshold_file = self.thresholds_dir().join(&entry.dir).join("threshold.toml");
        let thresholds = load_thresholds(&threshold_file, &entry.dir, &self.overrides)?;

        Ok(AppProfile {
            name: entry.name.clone(),
            dir,
            platform: entry.platform,
            mode: ModeProfile {
                name: entry.mode.clone(),
                category: mode.category,
                build: mode.build.clone(),
                run: mode.run.clone(),
                listening_line: mode.listening_line,
            },
            probes: entry.probes.clone(),
            whitelist: Whitelist::new(&entry.whitelist)?,
            thresholds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_override_name() {
        assert_eq!(
            override_name("smarthouse-02-quarkus", "linux.jvm.RSS.threshold.kB"),
            "SMARTHOUSE_02_QUARKUS_LINUX_JVM_RSS_THRESHOLD_KB"
        );
    }

    #[test]
    fn test_load_thresholds_flattens_and_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threshold.toml");
        fs::write(
            &path,
            "[linux.jvm]\n\"RSS.threshold.kB\" = 4000\n\"time.to.first.ok.request.threshold.ms\" = 1500\n",
        )
        .unwrap();

        let overrides = Overrides::with_env([(
            "APP_LINUX_JVM_RSS_THRESHOLD_KB".to_string(),
            "4500".to_string(),
        )]);
        let thresholds = load_thresholds(&path, "app", &overrides).unwrap();
        assert_eq!(thresholds["linux.jvm.RSS.threshold.kB"], 4500);
        assert_eq!(thresholds["linux.jvm.time.to.first.ok.request.threshold.ms"], 1500);

        let explicit = overrides.with_explicit("APP_LINUX_JVM_RSS_THRESHOLD_KB", "4700");
        let thresholds = load_thresholds(&path, "app", &explicit).unwrap();
        assert_eq!(thresholds["linux.jvm.RSS.threshold.kB"], 4700);
    }

    #[test]
    fn test_load_thresholds_rejects_non_integer_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threshold.toml");
        fs::write(&path, "linux.jvm.\"RSS.threshold.kB\" = 4000\n").unwrap();

        let overrides = Overrides::default()
            .with_explicit("APP_LINUX_JVM_RSS_THRESHOLD_KB", "lots");
        let err = load_thresholds(&path, "app", &overrides).unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }

    #[test]
    fn test_missing_threshold_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = load_thresholds(&dir.path().join("nope.toml"), "app", &Overrides::default())
            .unwrap_err();
        assert!(err.to_string().contains("couldn't find"));
    }

    #[test]
    fn test_catalog_rejects_unknown_mode() {
        let content = r#"
apps_dir = "apps"

[[apps]]
name = "A"
dir = "a"
platform = "quarkus"
mode = "missing"
"#;
        let err = Catalog::parse(content, ".", Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("unknown mode"));
    }

    #[test]
    fn test_mode_log_names() {
        let mode = ModeProfile {
            name: "JVM".into(),
            category: Some(ModeCategory::Jvm),
            build: vec!["true".into()],
            run: vec!["true".into()],
            listening_line: true,
        };
        assert_eq!(mode.log_name("build"), "jvm-build.log");
        assert!(!mode.is_dev());
    }
}
