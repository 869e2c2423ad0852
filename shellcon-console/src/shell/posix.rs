use super::{Shell, default_environment};
use crate::config::ConsoleSettings;
use std::collections::BTreeMap;

/// Unprivileged POSIX shell reading commands from stdin (`/bin/sh`).
pub struct PosixShell {
    command: String,
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
}

impl PosixShell {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: Vec::new(),
            environment: default_environment(&BTreeMap::new()),
        }
    }

    pub fn from_settings(settings: &ConsoleSettings) -> Self {
        Self {
            command: settings.shell.clone(),
            arguments: settings.shell_args.clone(),
            environment: default_environment(&settings.environment),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

impl Default for PosixShell {
    fn default() -> Self {
        Self::from_settings(&ConsoleSettings::default())
    }
}

impl Shell for PosixShell {
    fn id(&self) -> &str {
        "sh"
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn arguments(&self) -> &[String] {
        &self.arguments
    }

    fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    fn is_privileged(&self) -> bool {
        false
    }
}
