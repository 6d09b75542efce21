//! Compiled log patterns shared by the log analyzer.
//!
//! Everything here is compiled once on first use. Detectors are matched
//! anywhere in a line; whitelist entries must match the whole line.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::Result;
use crate::profile::Platform;

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in pattern must compile")
}

/// Lines carrying an error or warning marker.
pub static WARN_ERROR: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)(ERROR|WARN|SLF4J:)"));

/// The line announcing the bound HTTP address.
pub static LISTENING: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)Listening on:"));

/// Host expected on the listening line in dev mode.
pub static DEV_HOST: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)localhost:"));

/// Host expected on the listening line in every other mode.
pub static DEFAULT_HOST: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)0\.0\.0\.0:"));

/// `... started in 1.228s.` / `Started Application in 2.5 seconds`.
pub static STARTED: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?:^|.* )[Ss]tarted.* in ([0-9.]+)(?:s| seconds)"));

/// Startup line where the number sits behind a 256-colour escape.
pub static STARTED_COLOUR: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"(?:^|.* )[Ss]tarted.* in .*188m([0-9.]+)(?:\x1b\[[0-9;]*m)?(?:s| seconds)")
});

/// `... stopped in 0.024s`.
pub static STOPPED: LazyLock<Regex> = LazyLock::new(|| compile(r".* stopped in ([0-9.]+)s"));

/// Shutdown line where the number sits behind a 256-colour escape.
pub static STOPPED_COLOUR: LazyLock<Regex> =
    LazyLock::new(|| compile(r".* stopped in .*188m([0-9.]+)"));

const QUARKUS_BENIGN: &[&str] = &[
    r".*Unrecognized configuration key.*",
    r".*Detected bean archive with a dependency.*",
    r".*Using the default Vert.x .* this is not recommended in production.*",
    r".*SLF4J: Failed to load class .org\.slf4j\.impl\.StaticLoggerBinder.*",
    r".*SLF4J: Defaulting to no-operation \(NOP\) logger implementation.*",
    r".*SLF4J: See http://www\.slf4j\.org/codes\.html#StaticLoggerBinder for further details.*",
];

const SPRING_BOOT_BENIGN: &[&str] = &[
    r".*WARNING: An illegal reflective access operation has occurred.*",
    r".*WARNING: Illegal reflective access by .*",
    r".*WARNING: Please consider reporting this to the maintainers of .*",
    r".*WARNING: Use --illegal-access=warn to enable warnings of further illegal reflective access operations.*",
    r".*WARNING: All illegal access operations will be denied in a future release.*",
    r".*spring\.jpa\.open-in-view is enabled by default.*",
];

static QUARKUS_WHITELIST: LazyLock<Whitelist> = LazyLock::new(|| builtin(QUARKUS_BENIGN));
static SPRING_BOOT_WHITELIST: LazyLock<Whitelist> = LazyLock::new(|| builtin(SPRING_BOOT_BENIGN));

fn builtin(patterns: &[&str]) -> Whitelist {
    Whitelist {
        patterns: patterns.iter().map(|p| compile(&anchor(p))).collect(),
    }
}

fn anchor(pattern: &str) -> String {
    format!("^(?:{pattern})$")
}

/// Known-benign log lines shipped with the harness for a platform.
pub fn platform_whitelist(platform: Platform) -> &'static Whitelist {
    match platform {
        Platform::Quarkus => &QUARKUS_WHITELIST,
        Platform::SpringBoot => &SPRING_BOOT_WHITELIST,
    }
}

/// A set of full-line patterns whose matching lines are tolerated.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    patterns: Vec<Regex>,
}

impl Whitelist {
    /// Compile a whitelist. Each pattern must match an entire line.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(&anchor(p.as_ref())))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Returns the pattern that accepts `line`, if any.
    pub fn matching(&self, line: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|re| re.is_match(line))
            .map(Regex::as_str)
    }

    /// Whether any pattern accepts `line`.
    pub fn is_whitelisted(&self, line: &str) -> bool {
        self.matching(line).is_some()
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether there are no patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
