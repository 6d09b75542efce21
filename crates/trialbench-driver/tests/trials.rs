//! End-to-end trials against small scripted applications.
#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::net::TcpListener;

use trialbench_core::{BenchError, Catalog, Overrides, Result};
use trialbench_driver::{HttpRequestSpec, TrialContext, TrialDriver};
use trialbench_process::MetricsSampler;

struct FixedSampler {
    rss_kb: i64,
    fds: i64,
}

#[async_trait]
impl MetricsSampler for FixedSampler {
    async fn rss_kb(&self, _pid: u32) -> Result<Option<i64>> {
        Ok(Some(self.rss_kb))
    }

    async fn open_fds(&self, _pid: u32) -> Result<Option<i64>> {
        Ok(Some(self.fds))
    }
}

const SERVER: &str = r#"
import http.server, signal, sys

port = int(sys.argv[1])

class Handler(http.server.BaseHTTPRequestHandler):
    def do_GET(self):
        self._answer()

    def do_POST(self):
        length = int(self.headers.get("Content-Length", 0))
        self.rfile.read(length)
        self._answer()

    def _answer(self):
        body = b"ok"
        self.send_response(200)
        self.send_header("Content-Length", str(len(body)))
        self.end_headers()
        self.wfile.write(body)

    def log_message(self, *args):
        pass

def stop(*_):
    print("app stopped in 0.010s", flush=True)
    sys.exit(0)

server = http.server.HTTPServer(("0.0.0.0", port), Handler)
signal.signal(signal.SIGTERM, stop)
print("app started in 0.250s. Listening on: http://0.0.0.0:%d" % port, flush=True)
server.serve_forever()
"#;

fn has_python() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Writes a catalog with one app and returns the catalog path.
fn scaffold(root: &Path, build: &str, run: &[String], port: u16, rss_threshold: i64) -> PathBuf {
    let app = root.join("apps/demo-app");
    fs::create_dir_all(&app).unwrap();
    fs::write(app.join("server.py"), SERVER).unwrap();
    fs::write(
        app.join("threshold.toml"),
        format!("linux.jvm.\"RSS.threshold.kB\" = {rss_threshold}\n"),
    )
    .unwrap();

    let run = run
        .iter()
        .map(|a| format!("{a:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    let catalog = format!(
        r#"
apps_dir = "apps"
archive_dir = "archived-logs"
iterations = 3
build_timeout_minutes = 1

[modes.JVM]
category = "jvm"
build = ["sh", "-c", {build:?}]
run = [{run}]

[[apps]]
name = "DEMO_APP_JVM"
dir = "demo-app"
platform = "quarkus"
mode = "JVM"
probes = [{{ url = "http://127.0.0.1:{port}/", expected = "ok" }}]
"#
    );
    let path = root.join("bench.toml");
    fs::write(&path, catalog).unwrap();
    path
}

fn driver(catalog: &Catalog) -> TrialDriver {
    TrialDriver::new(catalog.settings())
        .with_sampler(Arc::new(FixedSampler {
            rss_kb: 5000,
            fds: 40,
        }))
        .with_port_close_timeout(Duration::from_secs(5))
}

fn python_run(port: u16) -> Vec<String> {
    vec!["python3".into(), "server.py".into(), port.to_string()]
}

#[tokio::test]
async fn start_stop_records_every_round_and_passes_thresholds() {
    if !has_python() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let port = free_port().await;
    let path = scaffold(dir.path(), "echo '[INFO] BUILD SUCCESS'", &python_run(port), port, 6000);
    let catalog = Catalog::load(&path, Overrides::default()).unwrap();
    let profile = catalog.resolve("DEMO_APP_JVM").unwrap();
    let ctx = TrialContext::new("StartStopTest", "demo");

    let summary = driver(&catalog).start_stop(&ctx, &profile).await.unwrap();

    assert_eq!(summary.trials.len(), 3);
    assert!(summary.verdict.passed());
    assert_eq!(summary.summary.rss_kb, Some(5000));
    assert_eq!(summary.summary.open_fds, Some(40));
    assert_eq!(summary.summary.started_in_ms, Some(250));
    assert_eq!(summary.summary.stopped_in_ms, Some(10));
    assert!(summary.summary.time_to_first_ok_ms.is_some());

    let archive = dir.path().join("archived-logs");
    let case = archive.join("StartStopTest/demo");
    let measurements = fs::read_to_string(case.join("measurements.csv")).unwrap();
    assert_eq!(measurements.lines().count(), 4);
    assert!(measurements.starts_with(
        "App,Mode,buildTimeMs,timeToFirstOKRequestMs,startedInMs,stoppedInMs,RSSKb,FDs\n"
    ));
    let summary_csv =
        fs::read_to_string(archive.join("StartStopTest/measurementsSummary.csv")).unwrap();
    assert_eq!(summary_csv.lines().count(), 2);
    assert!(case.join("jvm-build.log").exists());
    assert!(case.join("jvm-run.log").exists());
    let report = fs::read_to_string(case.join("report.md")).unwrap();
    assert!(report.starts_with("# StartStopTest, demo"));
    assert!(report.contains("|App|Mode|"));
    assert!(archive.join("aggregated-report.md").exists());
}

#[tokio::test]
async fn rss_over_threshold_fails_after_recording() {
    if !has_python() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let port = free_port().await;
    let path = scaffold(dir.path(), "true", &python_run(port), port, 4000);
    let catalog = Catalog::load(&path, Overrides::default()).unwrap();
    let profile = catalog.resolve("DEMO_APP_JVM").unwrap();
    let ctx = TrialContext::new("StartStopTest", "over");

    let err = driver(&catalog).start_stop(&ctx, &profile).await.unwrap_err();
    let BenchError::ThresholdViolation { violations } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(violations[0].app, "DEMO_APP_JVM");
    assert_eq!(violations[0].measured, 5000);
    assert_eq!(violations[0].threshold, 4000);
    assert!(dir
        .path()
        .join("archived-logs/StartStopTest/measurementsSummary.csv")
        .exists());
}

#[tokio::test]
async fn load_trial_records_final_rss() {
    if !has_python() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let port = free_port().await;
    let path = scaffold(dir.path(), "true", &python_run(port), port, 6000);
    let catalog = Catalog::load(&path, Overrides::default()).unwrap();
    let profile = catalog.resolve("DEMO_APP_JVM").unwrap();
    let ctx = TrialContext::new("LoadTest", "demo");
    let request = HttpRequestSpec::post(format!("http://127.0.0.1:{port}/"), "{}")
        .with_header("Content-Type", "application/json");

    let summary = driver(&catalog)
        .load(&ctx, &profile, &request, 20)
        .await
        .unwrap();
    assert_eq!(summary.requests, 20);
    assert_eq!(summary.record.rss_kb_final, Some(5000));

    let summary_csv =
        fs::read_to_string(dir.path().join("archived-logs/LoadTest/measurementsSummary.csv"))
            .unwrap();
    assert_eq!(summary_csv, "App,Mode,RSSKbFinal\nDEMO_APP_JVM,JVM,5000\n");
}

#[tokio::test]
async fn offending_build_log_fails_before_launch() {
    let dir = TempDir::new().unwrap();
    let port = free_port().await;
    let path = scaffold(
        dir.path(),
        "echo '[ERROR] compilation failed'",
        &["sleep".to_string(), "30".to_string()],
        port,
        6000,
    );
    let catalog = Catalog::load(&path, Overrides::default()).unwrap();
    let profile = catalog.resolve("DEMO_APP_JVM").unwrap();
    let ctx = TrialContext::new("StartStopTest", "broken-build");

    let err = driver(&catalog).start_stop(&ctx, &profile).await.unwrap_err();
    let BenchError::LogConformance { lines, archived, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(lines, &vec!["[ERROR] compilation failed".to_string()]);
    assert!(archived.ends_with("StartStopTest/broken-build/jvm-build.log"));
    // Cleanup archived the build log the error points at.
    assert!(archived.exists());
}

#[tokio::test]
async fn readiness_failure_still_cleans_up() {
    let dir = TempDir::new().unwrap();
    let port = free_port().await;
    let path = scaffold(
        dir.path(),
        "true",
        &["sh".to_string(), "-c".to_string(), "echo $$ > app.pid; exec sleep 30".to_string()],
        port,
        6000,
    );
    let catalog = Catalog::load(&path, Overrides::default()).unwrap();
    let profile = catalog.resolve("DEMO_APP_JVM").unwrap();
    let ctx = TrialContext::new("StartStopTest", "never-ready");

    let err = driver(&catalog).start_stop(&ctx, &profile).await.unwrap_err();
    assert!(matches!(err, BenchError::ReadinessTimeout { .. }), "{err}");
    assert!(err.is_trial_failure());

    let pid: u32 = fs::read_to_string(profile.dir.join("app.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!trialbench_process::terminate::is_alive(pid));

    let case = dir.path().join("archived-logs/StartStopTest/never-ready");
    assert!(case.join("jvm-run.log").exists());
    assert!(case.join("report.md").exists());
}
