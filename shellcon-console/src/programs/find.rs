use std::path::PathBuf;

use super::{quote, quote_path};
use crate::async_program::{AsyncProgram, AsyncResultListener};
use crate::error::ConsoleError;
use crate::program::Program;

/// Streams the paths printed by `find`, one partial result per path.
pub struct FindProgram {
    root: PathBuf,
    name: Option<String>,
    listener: Box<dyn AsyncResultListener<PathBuf>>,
}

impl FindProgram {
    pub fn new(root: impl Into<PathBuf>, listener: Box<dyn AsyncResultListener<PathBuf>>) -> Self {
        Self {
            root: root.into(),
            name: None,
            listener,
        }
    }

    /// Only report entries whose name matches the glob `pattern`.
    pub fn name(mut self, pattern: impl Into<String>) -> Self {
        self.name = Some(pattern.into());
        self
    }
}

impl Program for FindProgram {
    fn id(&self) -> &str {
        "find"
    }

    fn command(&self) -> &str {
        "find"
    }

    fn arguments(&self) -> String {
        match &self.name {
            Some(pattern) => format!("{} -name {}", quote_path(&self.root), quote(pattern)),
            None => quote_path(&self.root),
        }
    }

    fn wait_on_new_data(&self) -> bool {
        true
    }
}

impl AsyncProgram for FindProgram {
    fn on_start_parse_partial_result(&mut self) {
        self.listener.on_async_start();
    }

    fn on_parse_partial_result(&mut self, partial: &str) {
        for line in partial.lines().filter(|l| !l.is_empty()) {
            self.listener.on_partial_result(PathBuf::from(line));
        }
    }

    fn on_parse_error_partial_result(&mut self, partial: &str) {
        tracing::debug!("find: {}", partial.trim_end());
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
