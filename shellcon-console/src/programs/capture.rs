use crate::error::ConsoleError;
use crate::program::{Program, SyncResultProgram};

use super::join_args;

/// Runs an arbitrary command and keeps its raw output.
///
/// Every exit code is accepted and stderr is not classified; callers
/// inspect the captured output and the returned exit code themselves.
#[derive(Debug)]
pub struct CaptureProgram {
    command: String,
    args: Vec<String>,
    trace: bool,
    stdout: String,
    stderr: String,
}

impl CaptureProgram {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            trace: false,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }
}

impl Program for CaptureProgram {
    fn id(&self) -> &str {
        &self.command
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn arguments(&self) -> String {
        join_args(&self.args)
    }

    fn check_exit_code(&self, _exit_code: i32) -> Result<(), ConsoleError> {
        Ok(())
    }

    fn ignore_shell_stderr_check(&self) -> bool {
        true
    }

    fn is_trace(&self) -> bool {
        self.trace
    }
}

impl SyncResultProgram for CaptureProgram {
    fn parse(&mut self, stdout: &str, stderr: &str) -> Result<(), ConsoleError> {
        self.stdout = stdout.to_string();
        self.stderr = stderr.to_string();
        Ok(())
    }
}
