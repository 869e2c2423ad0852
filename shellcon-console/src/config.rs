//! Console options and resolved settings.
//!
//! Follows the same pattern for every concern:
//! - `ConsoleOptions`: all `Option<T>` fields, loadable from `shellcon.yaml`
//! - `ConsoleSettings`: plain Rust with concrete types
//! - `ConsoleSettings::resolve()`: takes options by value, fills in defaults

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConsoleError;

pub const CONFIG_FILE: &str = "shellcon.yaml";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_DEBUG_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WARMUP: Duration = Duration::from_millis(50);
const DEFAULT_KILL_SETTLE: Duration = Duration::from_millis(100);
const DEFAULT_ASYNC_END_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_TRIM_WINDOW: usize = 200;
const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_PRIVILEGED_SHELL: &str = "su";

/// Combine two values, preferring `self` (higher precedence).
pub trait Combine: Sized {
    fn combine(self, other: Self) -> Self;
}

impl<T> Combine for Option<T> {
    fn combine(self, other: Self) -> Self {
        self.or(other)
    }
}

impl<T> Combine for Vec<T> {
    /// Prefer self if non-empty; fall back to other.
    fn combine(self, other: Self) -> Self {
        if !self.is_empty() { self } else { other }
    }
}

impl<K: Ord, V> Combine for BTreeMap<K, V> {
    /// Entries of self win; missing keys come from other.
    fn combine(mut self, other: Self) -> Self {
        for (key, value) in other {
            self.entry(key).or_insert(value);
        }
        self
    }
}

/// Raw, partially specified console options.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ConsoleOptions {
    pub debug: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub debug_timeout_ms: Option<u64>,
    pub max_timeout_ms: Option<u64>,
    pub warmup_ms: Option<u64>,
    pub kill_settle_ms: Option<u64>,
    pub async_end_timeout_ms: Option<u64>,
    pub trim_window: Option<usize>,
    pub working_dir: Option<PathBuf>,
    pub shell: Option<String>,
    #[serde(default)]
    pub shell_args: Vec<String>,
    pub privileged_shell: Option<String>,
    #[serde(default)]
    pub privileged_args: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub prefer_privileged: Option<bool>,
}

impl ConsoleOptions {
    /// Parse options from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConsoleError> {
        serde_yaml::from_str(text).map_err(|e| ConsoleError::Config(e.to_string()))
    }

    /// Load options from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConsoleError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConsoleError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Load `shellcon.yaml` from `dir` if it exists.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>, ConsoleError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }
}

impl Combine for ConsoleOptions {
    fn combine(self, other: Self) -> Self {
        ConsoleOptions {
            debug: self.debug.combine(other.debug),
            timeout_ms: self.timeout_ms.combine(other.timeout_ms),
            debug_timeout_ms: self.debug_timeout_ms.combine(other.debug_timeout_ms),
            max_timeout_ms: self.max_timeout_ms.combine(other.max_timeout_ms),
            warmup_ms: self.warmup_ms.combine(other.warmup_ms),
            kill_settle_ms: self.kill_settle_ms.combine(other.kill_settle_ms),
            async_end_timeout_ms: self.async_end_timeout_ms.combine(other.async_end_timeout_ms),
            trim_window: self.trim_window.combine(other.trim_window),
            working_dir: self.working_dir.combine(other.working_dir),
            shell: self.shell.combine(other.shell),
            shell_args: self.shell_args.combine(other.shell_args),
            privileged_shell: self.privileged_shell.combine(other.privileged_shell),
            privileged_args: self.privileged_args.combine(other.privileged_args),
            environment: self.environment.combine(other.environment),
            prefer_privileged: self.prefer_privileged.combine(other.prefer_privileged),
        }
    }
}

/// Resolved console settings.
///
/// Produced by `ConsoleSettings::resolve(ConsoleOptions)` as a pure function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleSettings {
    pub debug: bool,
    /// Length of one wait slice before a command is considered stuck.
    pub timeout: Duration,
    /// Hard ceiling for programs that keep waiting while data arrives.
    pub max_timeout: Duration,
    /// Pause after starting the readers, before the first probe.
    pub warmup: Duration,
    /// Pause after signalling a command so the signal can propagate.
    pub kill_settle: Duration,
    /// Bound on waiting for an async dispatch worker to drain.
    pub async_end_timeout: Duration,
    /// Trailing bytes kept in the buffers of async programs.
    pub trim_window: usize,
    pub working_dir: PathBuf,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub privileged_shell: String,
    pub privileged_args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub prefer_privileged: bool,
}

impl ConsoleSettings {
    pub fn resolve(options: ConsoleOptions) -> Self {
        let debug = options.debug.unwrap_or(false);
        let timeout = if debug {
            options
                .debug_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_DEBUG_TIMEOUT)
        } else {
            options
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TIMEOUT)
        };
        let max_timeout = options
            .max_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MAX_TIMEOUT)
            .max(timeout);

        Self {
            debug,
            timeout,
            max_timeout,
            warmup: options
                .warmup_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_WARMUP),
            kill_settle: options
                .kill_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_KILL_SETTLE),
            async_end_timeout: options
                .async_end_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_ASYNC_END_TIMEOUT),
            trim_window: options.trim_window.unwrap_or(DEFAULT_TRIM_WINDOW),
            working_dir: options.working_dir.unwrap_or_else(|| PathBuf::from("/")),
            shell: options.shell.unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            shell_args: options.shell_args,
            privileged_shell: options
                .privileged_shell
                .unwrap_or_else(|| DEFAULT_PRIVILEGED_SHELL.to_string()),
            privileged_args: options.privileged_args,
            environment: options.environment,
            prefer_privileged: options.prefer_privileged.unwrap_or(false),
        }
    }
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self::resolve(ConsoleOptions::default())
    }
}
