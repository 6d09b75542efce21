//! Load trial: memory growth of an application under a burst of requests.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::Method;
use serde::Serialize;
use tracing::{info, Instrument};

use trialbench_core::obs::trial_span;
use trialbench_core::{
    append_record, append_summary, AppProfile, BenchError, Field, MeasurementRecord, Result,
};

use crate::trial::{append_measurements, TrialContext, TrialDriver, TrialState};

/// The request repeated during a load trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestSpec {
    pub uri: String,
    pub method: String,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub expected_status: u16,
}

impl HttpRequestSpec {
    /// A GET expecting 200.
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: "GET".to_string(),
            body: None,
            headers: BTreeMap::new(),
            expected_status: 200,
        }
    }

    /// A POST of `body` expecting 200.
    pub fn post(uri: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            body: Some(body.into()),
            ..Self::get(uri)
        }
    }

    /// Add or replace a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Status every response must carry.
    pub fn expect_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }
}

/// Result of a successful load trial.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub trial_id: String,
    pub record: MeasurementRecord,
    pub requests: usize,
    pub first_response_ms: f64,
    pub average_response_ms: f64,
}

impl TrialDriver {
    /// Start the application, send `count` requests and record memory before and after.
    pub async fn load(
        &self,
        ctx: &TrialContext,
        profile: &AppProfile,
        request: &HttpRequestSpec,
        count: usize,
    ) -> Result<LoadSummary> {
        let trial_id = uuid::Uuid::new_v4().to_string();
        let span = trial_span(&trial_id, &profile.name, &profile.mode.name);
        async {
            let started = self.begin(&trial_id, "load");
            let mut state = TrialState::default();
            let outcome = self
                .load_round(&trial_id, ctx, profile, request, count, &mut state)
                .await;
            self.finish(&trial_id, ctx, &mut state, started, &outcome)
                .await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn load_round(
        &self,
        trial_id: &str,
        ctx: &TrialContext,
        profile: &AppProfile,
        request: &HttpRequestSpec,
        count: usize,
        state: &mut TrialState,
    ) -> Result<LoadSummary> {
        if count == 0 {
            return Err(BenchError::Config("request count must be at least 1".into()));
        }
        let build = self.build(ctx, profile, state).await?;
        let (pid, first_ok_ms) = self.launch(profile, state).await?;
        let rss_kb = self.sample_rss(pid).await;

        let timings = send_requests(request, count).await?;

        let rss_kb_final = self.sample_rss(pid).await;
        let open_fds = self.sample_fds(pid).await;
        let durations = self.stop_and_verify(ctx, profile, state).await?;

        let record = MeasurementRecord::new(&profile.name, &profile.mode.name)
            .with(Field::BuildTimeMs, Some(build.elapsed_ms()))
            .with(Field::TimeToFirstOkRequestMs, first_ok_ms)
            .with(Field::StartedInMs, durations.started_ms())
            .with(Field::StoppedInMs, durations.stopped_ms())
            .with(Field::RssKb, rss_kb)
            .with(Field::RssKbFinal, rss_kb_final)
            .with(Field::OpenFds, open_fds);
        append_record(
            &record,
            &self.archive.measurements_csv(&ctx.suite, &ctx.case)?,
        )?;
        append_measurements(&mut state.report, &record);

        let summary = MeasurementRecord::new(&profile.name, &profile.mode.name)
            .with(Field::RssKbFinal, rss_kb_final);
        append_summary(&summary, &self.archive.summary_csv(&ctx.suite)?)?;

        Ok(LoadSummary {
            trial_id: trial_id.to_string(),
            record,
            requests: timings.len(),
            first_response_ms: millis(timings[0]),
            average_response_ms: millis(timings.iter().sum::<Duration>()) / timings.len() as f64,
        })
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Send `request` `count` times, failing on the first unexpected status.
async fn send_requests(request: &HttpRequestSpec, count: usize) -> Result<Vec<Duration>> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| BenchError::Config(format!("invalid HTTP method {}", request.method)))?;
    let client = reqwest::Client::new();

    let mut timings = Vec::with_capacity(count);
    for _ in 0..count {
        let mut builder = client.request(method.clone(), &request.uri);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| BenchError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        response
            .bytes()
            .await
            .map_err(|e| BenchError::Http(e.to_string()))?;
        timings.push(started.elapsed());

        if status != request.expected_status {
            return Err(BenchError::UnexpectedStatus {
                method: request.method.clone(),
                uri: request.uri.clone(),
                expected: request.expected_status,
                actual: status,
            });
        }
    }

    let ms: Vec<f64> = timings.iter().map(|d| millis(*d)).collect();
    info!(
        requests = ms.len(),
        first_ms = ms.first().copied(),
        second_ms = ms.get(1).copied(),
        third_ms = ms.get(2).copied(),
        average_ms = ms.iter().sum::<f64>() / ms.len() as f64,
        "load finished"
    );
    Ok(timings)
}
