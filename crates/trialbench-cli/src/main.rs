//! trialbench CLI
//!
//! Run start/stop and load trials against the applications of a catalog.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use trialbench_core::metrics::METRICS;
use trialbench_core::telemetry::init_tracing;
use trialbench_core::threshold::threshold_prefix;
use trialbench_core::{
    platform_whitelist, scan_for_offending_lines, AppProfile, Catalog, OsFamily, Overrides,
};
use trialbench_driver::{HttpRequestSpec, TrialContext, TrialDriver};

#[derive(Parser)]
#[command(
    name = "trialbench",
    author = "Stevedores Org",
    version = env!("CARGO_PKG_VERSION"),
    about = "Build, start, probe and stop applications while recording how they behave"
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Catalog describing applications and run modes
    #[arg(long, global = true, env = "TRIALBENCH_CATALOG", default_value = "bench.toml")]
    catalog: PathBuf,

    /// Threshold override NAME=VALUE, e.g. DEMO_APP_LINUX_JVM_RSS_THRESHOLD_KB=6000
    #[arg(long = "threshold", global = true, value_parser = parse_key_val)]
    thresholds: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an application, then start and stop it several times
    StartStop {
        /// Application name from the catalog
        #[arg(long)]
        app: String,

        /// Suite directory under the archive root
        #[arg(long, default_value = "StartStopTest")]
        suite: String,

        /// Case directory under the suite; defaults to the application name
        #[arg(long)]
        case: Option<String>,
    },

    /// Start an application and measure its footprint under a burst of requests
    Load {
        /// Application name from the catalog
        #[arg(long)]
        app: String,

        /// Request target
        #[arg(long)]
        uri: String,

        /// HTTP method
        #[arg(long, default_value = "POST")]
        method: String,

        /// File whose content is sent as the request body
        #[arg(long)]
        body_file: Option<PathBuf>,

        /// Request header NAME:VALUE
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Status every response must carry
        #[arg(long, default_value_t = 200)]
        status: u16,

        /// Number of requests to send
        #[arg(long, default_value_t = 20000)]
        count: usize,

        /// Suite directory under the archive root
        #[arg(long, default_value = "LoadTest")]
        suite: String,

        /// Case directory under the suite; defaults to the application name
        #[arg(long)]
        case: Option<String>,
    },

    /// Scan a log for error and warning lines the application does not allow
    CheckLog {
        /// Application name from the catalog
        #[arg(long)]
        app: String,

        /// Log file to scan
        #[arg(long)]
        log: PathBuf,
    },

    /// Show the thresholds that apply to an application on this OS
    Thresholds {
        /// Application name from the catalog
        #[arg(long)]
        app: String,
    },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got `{s}`"))
}

fn parse_header(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected NAME:VALUE, got `{s}`"))
}

/// Archive case name for an application: `DEMO_APP_JVM` becomes `demo-app-jvm`.
fn default_case(app: &str) -> String {
    app.to_lowercase().replace('_', "-")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let outcome = dispatch(cli).await;
    METRICS.flush();
    outcome
}

async fn dispatch(cli: Cli) -> Result<()> {
    let overrides = cli
        .thresholds
        .into_iter()
        .fold(Overrides::from_env(), |o, (name, value)| {
            o.with_explicit(name, value)
        });
    let catalog = Catalog::load(&cli.catalog, overrides)
        .with_context(|| format!("failed to load catalog {}", cli.catalog.display()))?;

    match cli.command {
        Commands::StartStop { app, suite, case } => {
            let profile = resolve(&catalog, &app)?;
            let ctx = TrialContext::new(suite, case.unwrap_or_else(|| default_case(&app)));
            let summary = TrialDriver::new(catalog.settings())
                .start_stop(&ctx, &profile)
                .await
                .with_context(|| format!("start/stop trial of {app} failed"))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Load {
            app,
            uri,
            method,
            body_file,
            headers,
            status,
            count,
            suite,
            case,
        } => {
            let profile = resolve(&catalog, &app)?;
            let mut request = HttpRequestSpec::get(uri).expect_status(status);
            request.method = method.to_uppercase();
            if let Some(path) = body_file {
                let body = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read body file {}", path.display()))?;
                request.body = Some(body);
            }
            for (name, value) in headers {
                request = request.with_header(name, value);
            }

            let ctx = TrialContext::new(suite, case.unwrap_or_else(|| default_case(&app)));
            let summary = TrialDriver::new(catalog.settings())
                .load(&ctx, &profile, &request, count)
                .await
                .with_context(|| format!("load trial of {app} failed"))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::CheckLog { app, log } => {
            let profile = resolve(&catalog, &app)?;
            let offending = scan_for_offending_lines(
                &log,
                &profile.whitelist,
                platform_whitelist(profile.platform),
            )
            .with_context(|| format!("failed to scan {}", log.display()))?;
            if !offending.is_empty() {
                for line in &offending {
                    println!("{line}");
                }
                bail!(
                    "{} contains {} offending line(s)",
                    log.display(),
                    offending.len()
                );
            }
            println!("{} is clean", log.display());
        }
        Commands::Thresholds { app } => {
            let profile = resolve(&catalog, &app)?;
            let prefix = threshold_prefix(OsFamily::current(), &profile)?;
            let scope = format!("{prefix}.");
            let applicable: BTreeMap<&str, i64> = profile
                .thresholds
                .iter()
                .filter(|(key, _)| key.starts_with(&scope))
                .map(|(key, value)| (key.as_str(), *value))
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "app": profile.name,
                    "prefix": prefix,
                    "thresholds": applicable,
                }))?
            );
        }
    }

    Ok(())
}

fn resolve(catalog: &Catalog, app: &str) -> Result<AppProfile> {
    catalog.resolve(app).with_context(|| {
        let known: Vec<&str> = catalog.app_names().collect();
        format!("cannot resolve application {app} (known: {})", known.join(", "))
    })
}
