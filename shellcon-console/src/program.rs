//! Program abstractions consumed by the console.

use crate::error::{ConsoleError, RelaunchRequest};

/// Read chunk size used when a program does not ask for another one.
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// A single command invocation: what to run and how to judge the outcome.
pub trait Program: Send {
    /// Short identifier used in logs and relaunch requests (e.g. `ls`).
    fn id(&self) -> &str;

    /// Command path or name as the shell should resolve it.
    fn command(&self) -> &str;

    /// Already formatted and quoted argument string.
    fn arguments(&self) -> String;

    /// Validate the numeric exit code. The default accepts only `0`.
    fn check_exit_code(&self, exit_code: i32) -> Result<(), ConsoleError> {
        if exit_code == 0 {
            Ok(())
        } else {
            Err(ConsoleError::Execution(format!(
                "{} exited with code {exit_code}",
                self.id()
            )))
        }
    }

    /// Program-specific stderr inspection, run after the shell's own check.
    fn check_stderr(&self, _exit_code: i32, _stderr: &str) -> Result<(), ConsoleError> {
        Ok(())
    }

    /// Skip the shell's phrase based stderr classification.
    fn ignore_shell_stderr_check(&self) -> bool {
        false
    }

    /// Log command line, exit code and output.
    fn is_trace(&self) -> bool {
        false
    }

    /// Wait without any timeout (used for elevation prompts).
    fn wait_indefinitely(&self) -> bool {
        false
    }

    /// Keep waiting past a timeout slice while new output keeps arriving.
    fn wait_on_new_data(&self) -> bool {
        false
    }

    /// Treat any stderr output as completion.
    fn exit_on_stderr_output(&self) -> bool {
        false
    }

    fn buffer_size(&self) -> usize {
        DEFAULT_BUFFER_SIZE
    }

    /// The command line without framing, as typed into the shell.
    fn command_line(&self) -> String {
        let args = self.arguments();
        if args.is_empty() {
            self.command().to_string()
        } else {
            format!("{} {}", self.command(), args)
        }
    }

    fn relaunch_request(&self) -> RelaunchRequest {
        RelaunchRequest {
            program_id: self.id().to_string(),
            command_line: self.command_line(),
        }
    }
}

/// A program that parses its complete output into a typed result.
pub trait SyncResultProgram: Program {
    fn parse(&mut self, stdout: &str, stderr: &str) -> Result<(), ConsoleError>;
}

/// What the console executes synchronously.
pub enum Executable<'a> {
    /// Runs to completion; output is only used for validation.
    Program(&'a mut dyn Program),
    /// Runs to completion, then parses stdout and stderr.
    SyncResult(&'a mut dyn SyncResultProgram),
}

impl Executable<'_> {
    pub fn program(&self) -> &dyn Program {
        match self {
            Executable::Program(p) => &**p,
            Executable::SyncResult(p) => &**p,
        }
    }
}

impl<'a> From<&'a mut dyn SyncResultProgram> for Executable<'a> {
    fn from(program: &'a mut dyn SyncResultProgram) -> Self {
        Executable::SyncResult(program)
    }
}

impl<'a> From<&'a mut dyn Program> for Executable<'a> {
    fn from(program: &'a mut dyn Program) -> Self {
        Executable::Program(program)
    }
}

/// Outcome of a finished invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub exit_code: i32,
    pub cancelled: bool,
}

impl Completion {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == 0
    }
}
