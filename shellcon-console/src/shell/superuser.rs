use super::{Shell, default_environment};
use crate::config::ConsoleSettings;
use std::collections::BTreeMap;

/// Privileged shell obtained through `su` (or any configured elevation
/// command that ends up reading commands from stdin).
///
/// The first command sent through it may block on an elevation prompt, which
/// is why the console probes it without a timeout.
pub struct SuperuserShell {
    command: String,
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
}

impl SuperuserShell {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: Vec::new(),
            environment: default_environment(&BTreeMap::new()),
        }
    }

    pub fn from_settings(settings: &ConsoleSettings) -> Self {
        Self {
            command: settings.privileged_shell.clone(),
            arguments: settings.privileged_args.clone(),
            environment: default_environment(&settings.environment),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Shell for SuperuserShell {
    fn id(&self) -> &str {
        "su"
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
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsoleOptions;

    #[test]
    fn test_from_settings() {
        let settings = ConsoleSettings::resolve(ConsoleOptions {
            privileged_shell: Some("sudo".into()),
            privileged_args: vec!["-n".into(), "sh".into()],
            ..Default::default()
        });
        let shell = SuperuserShell::from_settings(&settings);
        assert_eq!(shell.command(), "sudo");
        assert_eq!(shell.arguments(), ["-n".to_string(), "sh".to_string()]);
        assert!(shell.is_privileged());
        assert_eq!(shell.environment()["LC_ALL"], "C");
    }
}
