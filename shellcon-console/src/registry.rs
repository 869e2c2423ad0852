//! The process-wide set of consoles: the current one and the privileged side
//! channel used to signal commands of privileged consoles.

use std::sync::{Arc, Mutex, PoisonError};

use crate::config::ConsoleSettings;
use crate::console::ShellConsole;
use crate::error::ConsoleError;
use crate::kill::ConsoleKiller;
use crate::shell::{PosixShell, SuperuserShell};

pub struct ConsoleRegistry {
    settings: ConsoleSettings,
    current: Mutex<Option<ShellConsole>>,
    side_channel: Arc<ConsoleKiller>,
}

impl ConsoleRegistry {
    pub fn new(settings: ConsoleSettings) -> Self {
        Self {
            side_channel: Arc::new(ConsoleKiller::new(settings.clone())),
            settings,
            current: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ConsoleSettings {
        &self.settings
    }

    /// The current console, creating the default one on first use.
    pub fn get(&self) -> Result<ShellConsole, ConsoleError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(console) = current.as_ref() {
            return Ok(console.clone());
        }
        let console = self.create_default()?;
        *current = Some(console.clone());
        Ok(console)
    }

    /// Install `console` as current and deallocate the previous one.
    pub fn replace(&self, console: ShellConsole) {
        let previous = self.current.lock().unwrap_or_else(PoisonError::into_inner).replace(console);
        if let Some(previous) = previous {
            previous.dealloc();
        }
    }

    /// Deallocate the current console and the side channel.
    pub fn destroy(&self) {
        if let Some(console) = self.current.lock().unwrap_or_else(PoisonError::into_inner).take() {
            console.dealloc();
        }
        self.side_channel.dealloc();
    }

    /// A privileged console when preferred and available, otherwise an
    /// unprivileged one.
    pub fn create_default(&self) -> Result<ShellConsole, ConsoleError> {
        if self.settings.prefer_privileged {
            match self.create_privileged() {
                Ok(console) => return Ok(console),
                Err(e) => tracing::warn!("privileged console unavailable, falling back: {e}"),
            }
        }
        self.create_unprivileged()
    }

    pub fn create_unprivileged(&self) -> Result<ShellConsole, ConsoleError> {
        let console = ShellConsole::new(
            PosixShell::from_settings(&self.settings),
            self.settings.clone(),
        );
        console.alloc()?;
        Ok(console)
    }

    /// An allocated privileged console whose commands are signalled through
    /// the side channel.
    pub fn create_privileged(&self) -> Result<ShellConsole, ConsoleError> {
        let console = ShellConsole::new(
            SuperuserShell::from_settings(&self.settings),
            self.settings.clone(),
        );
        console.set_killer(self.side_channel.clone());
        console.alloc()?;
        Ok(console)
    }

    /// The privileged side channel, allocating it if needed.
    pub fn side_channel(&self) -> Result<ShellConsole, ConsoleError> {
        self.side_channel.console()
    }
}

impl Drop for ConsoleRegistry {
    fn drop(&mut self) {
        self.destroy();
    }
}
