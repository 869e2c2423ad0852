use crate::error::ConsoleError;
use crate::program::{Program, SyncResultProgram};

/// Lists direct children of a process with `pgrep -P`.
#[derive(Debug)]
pub struct ChildPidsProgram {
    parent: i32,
    children: Vec<i32>,
}

impl ChildPidsProgram {
    pub fn new(parent: i32) -> Self {
        Self {
            parent,
            children: Vec::new(),
        }
    }

    pub fn children(&self) -> &[i32] {
        &self.children
    }
}

impl Program for ChildPidsProgram {
    fn id(&self) -> &str {
        "pgrep"
    }

    fn command(&self) -> &str {
        "pgrep"
    }

    fn arguments(&self) -> String {
        format!("-P {}", self.parent)
    }

    /// `pgrep` exits with 1 when nothing matched.
    fn check_exit_code(&self, exit_code: i32) -> Result<(), ConsoleError> {
        match exit_code {
            0 | 1 => Ok(()),
            code => Err(ConsoleError::Execution(format!("pgrep exited with code {code}"))),
        }
    }
}

impl SyncResultProgram for ChildPidsProgram {
    fn parse(&mut self, stdout: &str, _stderr: &str) -> Result<(), ConsoleError> {
        self.children = stdout
            .split_whitespace()
            .map(|p| {
                p.parse()
                    .map_err(|_| ConsoleError::Execution(format!("invalid pid from pgrep: {p}")))
            })
            .collect::<Result<_, _>>()?;
        Ok(())
    }
}
