use crate::error::ConsoleError;
use crate::program::{Program, SyncResultProgram};

/// Prints the pid of the shell itself.
#[derive(Debug, Default)]
pub struct ShellPidProgram {
    pid: Option<i32>,
}

impl ShellPidProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }
}

impl Program for ShellPidProgram {
    fn id(&self) -> &str {
        "pid"
    }

    fn command(&self) -> &str {
        "echo"
    }

    fn arguments(&self) -> String {
        "$$".to_string()
    }
}

impl SyncResultProgram for ShellPidProgram {
    fn parse(&mut self, stdout: &str, _stderr: &str) -> Result<(), ConsoleError> {
        let text = stdout.trim();
        let pid = text
            .parse()
            .map_err(|_| ConsoleError::Execution(format!("unexpected pid output: {text:?}")))?;
        self.pid = Some(pid);
        Ok(())
    }
}
