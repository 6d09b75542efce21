//! Spawning build and run commands with output captured to a log file.

use std::fs::{self, File};
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

use trialbench_core::{BenchError, Result};

/// Prefix `argv` with `cmd /C` on Windows so scripts like `mvnw.cmd` resolve.
pub fn platform_command(argv: &[String]) -> Vec<String> {
    if cfg!(windows) {
        ["cmd", "/C"]
            .into_iter()
            .map(String::from)
            .chain(argv.iter().cloned())
            .collect()
    } else {
        argv.to_vec()
    }
}

/// Spawn `argv` in `dir` with stdout and stderr both appended to `log`.
///
/// The log file is truncated first. `PATH` is forwarded explicitly.
pub fn spawn_logged(argv: &[String], dir: &Path, log: &Path) -> Result<Child> {
    if argv.is_empty() {
        return Err(BenchError::Config("empty command".to_string()));
    }
    let argv = platform_command(argv);
    let (program, args) = (&argv[0], &argv[1..]);

    if let Some(parent) = log.parent() {
        fs::create_dir_all(parent)?;
    }
    let out = File::create(log)?;
    let err = out.try_clone()?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));
    if let Some(path) = std::env::var_os("PATH") {
        command.env("PATH", path);
    }

    debug!(command = %argv.join(" "), dir = %dir.display(), log = %log.display(), "spawning");
    command.spawn().map_err(|source| BenchError::Spawn {
        command: argv.join(" "),
        source,
    })
}
