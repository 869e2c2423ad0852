use std::path::{Path, PathBuf};

use super::quote_path;
use crate::error::ConsoleError;
use crate::program::{Program, SyncResultProgram};

/// Names of the entries in a directory, one per line from `ls -1`.
#[derive(Debug)]
pub struct ListDirectoryProgram {
    dir: PathBuf,
    show_hidden: bool,
    entries: Vec<String>,
}

impl ListDirectoryProgram {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            show_hidden: false,
            entries: Vec::new(),
        }
    }

    /// Include dot entries other than `.` and `..`.
    pub fn show_hidden(mut self, show: bool) -> Self {
        self.show_hidden = show;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }
}

impl Program for ListDirectoryProgram {
    fn id(&self) -> &str {
        "ls"
    }

    fn command(&self) -> &str {
        "ls"
    }

    fn arguments(&self) -> String {
        let flags = if self.show_hidden { "-1A" } else { "-1" };
        format!("{flags} {}", quote_path(&self.dir))
    }
}

impl SyncResultProgram for ListDirectoryProgram {
    fn parse(&mut self, stdout: &str, _stderr: &str) -> Result<(), ConsoleError> {
        self.entries = stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments() {
        let program = ListDirectoryProgram::new("/data/my files");
        assert_eq!(program.command_line(), "ls -1 '/data/my files'");
        let program = ListDirectoryProgram::new("/").show_hidden(true);
        assert_eq!(program.arguments(), "-1A /");
    }

    #[test]
    fn test_parse() {
        let mut program = ListDirectoryProgram::new("/");
        program.parse("file1\nfile2\n", "").unwrap();
        assert_eq!(program.into_entries(), vec!["file1", "file2"]);
    }
}
