//! Shell flavours the console can drive.
//!
//! A [`Shell`] describes how to launch the subprocess and how to frame a
//! command so its output and exit code can be found again in the stream.

mod posix;
mod superuser;

pub use posix::PosixShell;
pub use superuser::SuperuserShell;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::error::ConsoleError;
use crate::program::Program;

/// Prints the start frame on stdout and its first token on stderr; the
/// tokens are passed as `printf` arguments.
pub const START_PROBE: &str = "printf '/#%s#//#%s#/' {0} {1}; printf '/#%s#/' {0} >&2;";

/// Prints the end frame carrying the exit code of the preceding command,
/// then its second token on stderr.
pub const EXIT_PROBE: &str = "; printf '/#%s#/%d/#%s#/' {0} $? {1}; printf '/#%s#/' {1} >&2";

/// Exit code the shell reports for a command it cannot execute.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Exit code the shell reports for a command it cannot find.
pub const EXIT_NOT_FOUND: i32 = 127;

/// How to spawn and frame commands for one shell flavour.
pub trait Shell: Send + Sync {
    /// Identifier for display/logging (e.g. "sh", "su").
    fn id(&self) -> &str;

    /// Executable to launch.
    fn command(&self) -> &str;

    fn arguments(&self) -> &[String];

    /// Variables added to the inherited environment.
    fn environment(&self) -> &BTreeMap<String, String>;

    /// Whether commands run with elevated privileges.
    fn is_privileged(&self) -> bool;

    /// Start probe template with `{0}` and `{1}` placeholders.
    ///
    /// Must print `/#{0}#//#{1}#/` on stdout and `/#{0}#/` on stderr.
    fn start_probe(&self) -> &str {
        START_PROBE
    }

    /// Exit code probe template with `{0}` and `{1}` placeholders.
    ///
    /// Must print `/#{0}#/<code>/#{1}#/` on stdout, then `/#{1}#/` on stderr.
    fn exit_probe(&self) -> &str {
        EXIT_PROBE
    }

    /// Classify stderr output of a finished command.
    ///
    /// Shells are not reliable about propagating failure codes, so known
    /// failure phrases win over a successful exit code.
    fn check_stderr(
        &self,
        program: &dyn Program,
        exit_code: i32,
        stderr: &str,
    ) -> Result<(), ConsoleError> {
        classify_stderr(program, exit_code, stderr)
    }

    /// Shell-level exit codes that mean the command never ran.
    fn check_exit_code(&self, program: &dyn Program, exit_code: i32) -> Result<(), ConsoleError> {
        match exit_code {
            EXIT_NOT_EXECUTABLE => Err(ConsoleError::insufficient_permissions(
                format!("{} is not executable", program.command()),
                program.relaunch_request(),
            )),
            EXIT_NOT_FOUND => Err(ConsoleError::CommandNotFound(program.command().to_string())),
            _ => Ok(()),
        }
    }

    /// Launch the subprocess rooted at `working_dir`.
    fn spawn(&self, working_dir: &Path) -> Result<ShellProcess, ConsoleError> {
        ShellProcess::spawn(self, working_dir)
    }
}

/// A running shell and its three standard streams.
pub struct ShellProcess {
    pub child: Child,
    pub stdin: Box<dyn Write + Send>,
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Box<dyn Read + Send>,
}

impl ShellProcess {
    /// Spawn `shell` with piped streams in its own process group.
    pub fn spawn<S: Shell + ?Sized>(shell: &S, working_dir: &Path) -> Result<Self, ConsoleError> {
        let mut command = Command::new(shell.command());
        command
            .args(shell.arguments())
            .envs(shell.environment())
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Keep terminal signals aimed at the caller away from the shell.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| {
            ConsoleError::ConsoleAlloc(format!("failed to spawn {}: {e}", shell.command()))
        })?;

        let streams = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = streams else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ConsoleError::ConsoleAlloc(format!(
                "{}: standard streams unavailable",
                shell.command()
            )));
        };

        tracing::debug!(
            "spawned shell {} ({}) pid={}",
            shell.id(),
            shell.command(),
            child.id()
        );

        Ok(Self {
            child,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }
}

/// Phrase based stderr classification shared by the bundled shells.
///
/// The bundled shells run with `LC_ALL=C` so the phrases are stable.
pub fn classify_stderr(
    program: &dyn Program,
    exit_code: i32,
    stderr: &str,
) -> Result<(), ConsoleError> {
    if stderr.is_empty() {
        return Ok(());
    }
    let lower = stderr.to_lowercase();
    let message = || stderr.trim().to_string();

    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        return Err(ConsoleError::insufficient_permissions(
            message(),
            program.relaunch_request(),
        ));
    }
    if exit_code == EXIT_NOT_FOUND || lower.contains("command not found") {
        return Err(ConsoleError::CommandNotFound(message()));
    }
    if lower.contains("read-only file system") {
        return Err(ConsoleError::ReadOnlyFilesystem(message()));
    }
    if lower.contains("no such file or directory") || lower.contains("not found") {
        return Err(ConsoleError::NoSuchFileOrDirectory(message()));
    }
    Ok(())
}

pub(crate) fn default_environment(overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([("LC_ALL".to_string(), "C".to_string())]);
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
