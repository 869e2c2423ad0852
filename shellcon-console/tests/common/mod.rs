//! Shared test utilities for shellcon-console integration tests.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use shellcon_console::programs::join_args;
use shellcon_console::{
    AsyncProgram, AsyncResultListener, ConsoleError, ConsoleOptions, ConsoleSettings, PosixShell,
    Program, Shell, ShellConsole, SyncResultProgram,
};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Test context that owns a temp directory used as the shell's working dir.
pub struct TestContext {
    pub temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn touch(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, b"").expect("Failed to create file");
        path
    }

    /// Settings tuned for fast tests.
    pub fn settings(&self) -> ConsoleSettings {
        ConsoleSettings::resolve(ConsoleOptions {
            timeout_ms: Some(5_000),
            warmup_ms: Some(10),
            kill_settle_ms: Some(50),
            working_dir: Some(self.path().to_path_buf()),
            ..Default::default()
        })
    }

    /// An allocated unprivileged console.
    pub fn console(&self) -> ShellConsole {
        self.console_with(self.settings())
    }

    pub fn console_with(&self, settings: ConsoleSettings) -> ShellConsole {
        let console = ShellConsole::new(PosixShell::from_settings(&settings), settings);
        console.alloc().expect("Failed to allocate console");
        console
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// ============================================================================
// Programs
// ============================================================================

/// Runs a script with `sh -c` and keeps its output.
pub struct Script {
    script: String,
    pub stdout: String,
    pub stderr: String,
}

impl Script {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

impl Program for Script {
    fn id(&self) -> &str {
        "script"
    }

    fn command(&self) -> &str {
        "sh"
    }

    fn arguments(&self) -> String {
        join_args(&["-c", &self.script])
    }
}

impl SyncResultProgram for Script {
    fn parse(&mut self, stdout: &str, stderr: &str) -> Result<(), ConsoleError> {
        self.stdout = stdout.to_string();
        self.stderr = stderr.to_string();
        Ok(())
    }
}

/// Runs a line directly in the console's shell, so builtins write to the
/// shell's own stdout and stderr.
pub struct Inline {
    line: String,
    exit_on_stderr: bool,
    pub stdout: String,
    pub stderr: String,
}

impl Inline {
    pub fn new(line: &str) -> Self {
        Self {
            line: line.to_string(),
            exit_on_stderr: false,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Stop on the first stderr output; any exit code is accepted.
    pub fn exit_on_stderr(mut self) -> Self {
        self.exit_on_stderr = true;
        self
    }
}

impl Program for Inline {
    fn id(&self) -> &str {
        "inline"
    }

    fn command(&self) -> &str {
        &self.line
    }

    fn arguments(&self) -> String {
        String::new()
    }

    fn check_exit_code(&self, exit_code: i32) -> Result<(), ConsoleError> {
        if self.exit_on_stderr || exit_code == 0 {
            Ok(())
        } else {
            Err(ConsoleError::Execution(format!("inline exited with {exit_code}")))
        }
    }

    fn exit_on_stderr_output(&self) -> bool {
        self.exit_on_stderr
    }
}

impl SyncResultProgram for Inline {
    fn parse(&mut self, stdout: &str, stderr: &str) -> Result<(), ConsoleError> {
        self.stdout = stdout.to_string();
        self.stderr = stderr.to_string();
        Ok(())
    }
}

/// Streams the lines a script prints.
pub struct Lines {
    script: String,
    expects_end_frame: bool,
    listener: Box<dyn AsyncResultListener<String>>,
}

impl Lines {
    pub fn new(script: &str, listener: Box<dyn AsyncResultListener<String>>) -> Self {
        Self {
            script: script.to_string(),
            expects_end_frame: true,
            listener,
        }
    }

    pub fn without_end_frame(mut self) -> Self {
        self.expects_end_frame = false;
        self
    }
}

impl Program for Lines {
    fn id(&self) -> &str {
        "lines"
    }

    fn command(&self) -> &str {
        "sh"
    }

    fn arguments(&self) -> String {
        join_args(&["-c", &self.script])
    }

    fn wait_on_new_data(&self) -> bool {
        true
    }
}

impl AsyncProgram for Lines {
    fn expects_end_frame(&self) -> bool {
        self.expects_end_frame
    }

    fn on_start_parse_partial_result(&mut self) {
        self.listener.on_async_start();
    }

    fn on_parse_partial_result(&mut self, partial: &str) {
        for line in partial.lines() {
            self.listener.on_partial_result(line.to_string());
        }
    }

    fn on_end_parse_partial_result(&mut self, cancelled: bool) {
        self.listener.on_async_end(cancelled);
    }

    fn on_exit_code(&mut self, exit_code: i32) {
        self.listener.on_async_exit_code(exit_code);
    }

    fn on_exception(&mut self, error: &ConsoleError) {
        self.listener.on_exception(error);
    }
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<T> {
    Start,
    Partial(T),
    End(bool),
    ExitCode(i32),
    Exception(String),
}

/// Records every listener callback in order.
pub struct Recorder<T> {
    events: Arc<Mutex<Vec<Event<T>>>>,
}

impl<T> Recorder<T> {
    pub fn new() -> (Self, Arc<Mutex<Vec<Event<T>>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: Arc::clone(&events),
            },
            events,
        )
    }
}

impl<T: Send> AsyncResultListener<T> for Recorder<T> {
    fn on_async_start(&mut self) {
        self.events.lock().unwrap().push(Event::Start);
    }

    fn on_partial_result(&mut self, result: T) {
        self.events.lock().unwrap().push(Event::Partial(result));
    }

    fn on_async_end(&mut self, cancelled: bool) {
        self.events.lock().unwrap().push(Event::End(cancelled));
    }

    fn on_async_exit_code(&mut self, exit_code: i32) {
        self.events.lock().unwrap().push(Event::ExitCode(exit_code));
    }

    fn on_exception(&mut self, error: &ConsoleError) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Exception(error.to_string()));
    }
}

// ============================================================================
// Fault injection
// ============================================================================

/// A POSIX shell whose stdin rejects writes containing `trigger` while
/// failures remain, and which counts how often it was spawned.
pub struct FlakyShell {
    inner: PosixShell,
    trigger: String,
    failures: Arc<AtomicUsize>,
    pub spawns: Arc<AtomicUsize>,
}

impl FlakyShell {
    pub fn new(trigger: &str, failures: usize) -> Self {
        Self {
            inner: PosixShell::default(),
            trigger: trigger.to_string(),
            failures: Arc::new(AtomicUsize::new(failures)),
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Shell for FlakyShell {
    fn id(&self) -> &str {
        "flaky"
    }

    fn command(&self) -> &str {
        self.inner.command()
    }

    fn arguments(&self) -> &[String] {
        self.inner.arguments()
    }

    fn environment(&self) -> &BTreeMap<String, String> {
        self.inner.environment()
    }

    fn is_privileged(&self) -> bool {
        false
    }

    fn spawn(&self, working_dir: &Path) -> Result<shellcon_console::shell::ShellProcess, ConsoleError> {
        let mut process = self.inner.spawn(working_dir)?;
        self.spawns.fetch_add(1, Ordering::SeqCst);
        process.stdin = Box::new(FlakyStdin {
            inner: process.stdin,
            trigger: self.trigger.clone().into_bytes(),
            failures: Arc::clone(&self.failures),
        });
        Ok(process)
    }
}

struct FlakyStdin {
    inner: Box<dyn Write + Send>,
    trigger: Vec<u8>,
    failures: Arc<AtomicUsize>,
}

impl Write for FlakyStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let triggered = buf.windows(self.trigger.len()).any(|w| w == self.trigger);
        if triggered
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected failure"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
