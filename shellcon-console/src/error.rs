//! Error taxonomy for console allocation and program execution.

use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

/// A command that failed for lack of privileges and may be resubmitted on an
/// elevated console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaunchRequest {
    /// Program identifier (e.g. `ls`).
    pub program_id: String,
    /// The command line as it was sent to the shell, without framing.
    pub command_line: String,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConsoleError {
    #[error("failed to allocate console: {0}")]
    #[diagnostic(code(shellcon::console_alloc))]
    ConsoleAlloc(String),

    #[error("insufficient permissions: {message}")]
    #[diagnostic(
        code(shellcon::insufficient_permissions),
        help("retry on a privileged console")
    )]
    InsufficientPermissions {
        message: String,
        relaunch: Vec<RelaunchRequest>,
    },

    #[error("command not found: {0}")]
    #[diagnostic(
        code(shellcon::command_not_found),
        help("check that the command is installed and on the shell's PATH")
    )]
    CommandNotFound(String),

    #[error("no such file or directory: {0}")]
    #[diagnostic(code(shellcon::no_such_file_or_directory))]
    NoSuchFileOrDirectory(String),

    #[error("read-only file system: {0}")]
    #[diagnostic(code(shellcon::read_only_filesystem))]
    ReadOnlyFilesystem(String),

    #[error("operation timed out after {elapsed:?}: {command}")]
    #[diagnostic(code(shellcon::operation_timeout))]
    OperationTimeout { command: String, elapsed: Duration },

    #[error("execution failed: {0}")]
    #[diagnostic(code(shellcon::execution))]
    Execution(String),

    #[error("invalid configuration: {0}")]
    #[diagnostic(code(shellcon::config))]
    Config(String),
}

impl ConsoleError {
    /// Build an `InsufficientPermissions` error for a single command.
    pub fn insufficient_permissions(message: impl Into<String>, relaunch: RelaunchRequest) -> Self {
        ConsoleError::InsufficientPermissions {
            message: message.into(),
            relaunch: vec![relaunch],
        }
    }

    /// Whether the failed work can be resubmitted once privileges are elevated.
    pub fn is_relaunchable(&self) -> bool {
        matches!(self, ConsoleError::InsufficientPermissions { relaunch, .. } if !relaunch.is_empty())
    }

    /// Queue another command for relaunch. No-op for other variants.
    pub fn add_relaunchable(&mut self, request: RelaunchRequest) {
        if let ConsoleError::InsufficientPermissions { relaunch, .. } = self {
            relaunch.push(request);
        }
    }

    /// Commands queued for relaunch, if any.
    pub fn relaunchable(&self) -> &[RelaunchRequest] {
        match self {
            ConsoleError::InsufficientPermissions { relaunch, .. } => relaunch,
            _ => &[],
        }
    }
}

/// Internal failure of a single protocol attempt.
///
/// I/O failures are recoverable once through reallocation; everything else is
/// surfaced as-is.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Io(std::io::Error),
    Console(ConsoleError),
}

impl From<ConsoleError> for AttemptError {
    fn from(e: ConsoleError) -> Self {
        AttemptError::Console(e)
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(e: std::io::Error) -> Self {
        AttemptError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> RelaunchRequest {
        RelaunchRequest {
            program_id: id.to_string(),
            command_line: format!("{id} /data"),
        }
    }

    #[test]
    fn test_relaunch_queue() {
        let mut err = ConsoleError::insufficient_permissions("Permission denied", request("ls"));
        assert!(err.is_relaunchable());
        err.add_relaunchable(request("cp"));
        let ids: Vec<_> = err
            .relaunchable()
            .iter()
            .map(|r| r.program_id.as_str())
            .collect();
        assert_eq!(ids, vec!["ls", "cp"]);
    }

    #[test]
    fn test_other_variants_are_not_relaunchable() {
        let mut err = ConsoleError::Execution("exit code 2".into());
        err.add_relaunchable(request("ls"));
        assert!(!err.is_relaunchable());
        assert!(err.relaunchable().is_empty());
    }

    #[test]
    fn test_display() {
        let err = ConsoleError::OperationTimeout {
            command: "sleep 10".into(),
            elapsed: Duration::from_secs(3),
        };
        assert_eq!(err.to_string(), "operation timed out after 3s: sleep 10");
    }
}
