//! Signalling the command a console is running.
//!
//! Commands run as descendants of the console's shell, so killing one means
//! enumerating the shell's descendants and signalling each of them while
//! leaving the shell itself alive.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::ConsoleSettings;
use crate::console::ShellConsole;
use crate::error::ConsoleError;
use crate::program::{Executable, Program};
use crate::programs::{ChildPidsProgram, SendSignalProgram};
use crate::shell::SuperuserShell;

/// Delivers a signal to every descendant of a shell.
pub trait ProcessKiller: Send + Sync {
    /// Returns the number of processes signalled.
    fn signal_descendants(&self, shell_pid: i32, signal: Signal) -> Result<usize, ConsoleError>;
}

/// Signals descendants directly from this process.
///
/// Only works when this process may signal the shell's children, i.e. for
/// unprivileged consoles.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalKiller;

impl ProcessKiller for LocalKiller {
    fn signal_descendants(&self, shell_pid: i32, signal: Signal) -> Result<usize, ConsoleError> {
        let pids = descendants(shell_pid)
            .map_err(|e| ConsoleError::Execution(format!("failed to list processes: {e}")))?;
        let mut signalled = 0;
        for pid in pids {
            match signal::kill(Pid::from_raw(pid), signal) {
                Ok(()) => signalled += 1,
                Err(Errno::ESRCH) => {}
                Err(Errno::EPERM) => {
                    return Err(ConsoleError::insufficient_permissions(
                        format!("not allowed to signal pid {pid}"),
                        SendSignalProgram::new(signal, vec![pid]).relaunch_request(),
                    ));
                }
                Err(e) => {
                    return Err(ConsoleError::Execution(format!(
                        "failed to signal pid {pid}: {e}"
                    )));
                }
            }
        }
        Ok(signalled)
    }
}

/// All descendants of `root`, parents before children.
#[cfg(target_os = "linux")]
fn descendants(root: i32) -> std::io::Result<Vec<i32>> {
    let mut parents = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        // Processes may exit between listing and reading.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parent_from_stat(&stat) {
            parents.push((pid, ppid));
        }
    }
    Ok(walk(root, |pid| {
        parents
            .iter()
            .filter(|(_, ppid)| *ppid == pid)
            .map(|(child, _)| *child)
            .collect()
    }))
}

#[cfg(not(target_os = "linux"))]
fn descendants(root: i32) -> std::io::Result<Vec<i32>> {
    use std::process::Command;

    let mut failure = None;
    let pids = walk(root, |pid| {
        match Command::new("pgrep").arg("-P").arg(pid.to_string()).output() {
            Ok(out) => String::from_utf8_lossy(&out.stdout)
                .split_whitespace()
                .filter_map(|p| p.parse().ok())
                .collect(),
            Err(e) => {
                failure.get_or_insert(e);
                Vec::new()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(pids),
    }
}

/// Parent pid from the contents of `/proc/<pid>/stat`.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are read after the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parent_from_stat(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// Breadth-first walk of the process tree below `root`.
fn walk(root: i32, mut children_of: impl FnMut(i32) -> Vec<i32>) -> Vec<i32> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for child in children_of(pid) {
            if child != root && !found.contains(&child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found
}

/// Signals descendants through a separate privileged console.
///
/// Used for privileged consoles whose commands this process cannot signal
/// itself. The side channel is allocated on first use and kept afterwards.
pub struct ConsoleKiller {
    settings: ConsoleSettings,
    console: Mutex<Option<ShellConsole>>,
}

impl ConsoleKiller {
    /// Lazily allocate a privileged side channel from `settings`.
    pub fn new(settings: ConsoleSettings) -> Self {
        Self {
            settings,
            console: Mutex::new(None),
        }
    }

    /// Use an already allocated console as the side channel.
    pub fn with_console(console: ShellConsole) -> Self {
        Self {
            settings: ConsoleSettings::default(),
            console: Mutex::new(Some(console)),
        }
    }

    /// The side channel console, allocating it if needed.
    pub fn console(&self) -> Result<ShellConsole, ConsoleError> {
        let mut slot = self.console.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(console) = slot.as_ref().filter(|c| c.is_active()) {
            return Ok(console.clone());
        }
        let console = ShellConsole::new(
            SuperuserShell::from_settings(&self.settings),
            self.settings.clone(),
        );
        console.set_killer(Arc::new(LocalKiller));
        console.alloc()?;
        tracing::debug!("allocated privileged side channel console");
        *slot = Some(console.clone());
        Ok(console)
    }

    /// Release the side channel, if one was allocated.
    pub fn dealloc(&self) {
        if let Some(console) = self.console.lock().unwrap_or_else(PoisonError::into_inner).take() {
            console.dealloc();
        }
    }
}

impl ProcessKiller for ConsoleKiller {
    fn signal_descendants(&self, shell_pid: i32, signal: Signal) -> Result<usize, ConsoleError> {
        let console = self.console()?;

        let mut pids = Vec::new();
        let mut queue = VecDeque::from([shell_pid]);
        while let Some(pid) = queue.pop_front() {
            let mut program = ChildPidsProgram::new(pid);
            console.execute(Executable::SyncResult(&mut program))?;
            for &child in program.children() {
                if child != shell_pid && !pids.contains(&child) {
                    pids.push(child);
                    queue.push_back(child);
                }
            }
        }
        if pids.is_empty() {
            return Ok(0);
        }

        let count = pids.len();
        let mut program = SendSignalProgram::new(signal, pids);
        console.execute(Executable::Program(&mut program))?;
        Ok(count)
    }
}

/// Forcefully terminate a shell started in its own process group.
pub(crate) fn kill_process_group(pgid: u32) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match signal::killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!("killpg({pgid}) failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_parent_from_stat() {
        assert_eq!(parent_from_stat("123 (sh) S 45 123 123 0 -1"), Some(45));
        assert_eq!(
            parent_from_stat("124 (my (odd) name) R 123 124 123 0 -1"),
            Some(123)
        );
        assert_eq!(parent_from_stat("garbage"), None);
    }

    #[test]
    fn test_walk_collects_grandchildren() {
        let tree = HashMap::from([(1, vec![2, 3]), (2, vec![4]), (4, vec![5])]);
        let found = walk(1, |pid| tree.get(&pid).cloned().unwrap_or_default());
        assert_eq!(found, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_walk_ignores_cycles() {
        let tree = HashMap::from([(1, vec![2]), (2, vec![1, 2])]);
        let found = walk(1, |pid| tree.get(&pid).cloned().unwrap_or_default());
        assert_eq!(found, vec![2]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_local_killer_signals_children() {
        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & wait")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;

        // Give the shell time to fork `sleep`.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while descendants(pid).unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let signalled = LocalKiller.signal_descendants(pid, Signal::SIGTERM).unwrap();
        assert_eq!(signalled, 1);
        child.wait().unwrap();
    }
}
