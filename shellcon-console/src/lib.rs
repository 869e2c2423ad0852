//! Persistent shell consoles for shellcon.
//!
//! This crate drives a long-lived shell subprocess (privileged or not),
//! serializes program invocations through it and recovers each program's
//! output and exit code from sentinel-framed stdout. Programs either parse
//! their complete output or stream partial results to a listener.

mod async_program;
mod config;
mod console;
mod error;
mod identity;
mod kill;
mod marker;
mod program;
pub mod programs;
mod registry;
pub mod shell;

// Program contracts
pub use async_program::{AsyncProgram, AsyncResultListener};
pub use program::{Completion, DEFAULT_BUFFER_SIZE, Executable, Program, SyncResultProgram};

// Console
pub use console::{AsyncCanceller, AsyncExecution, InvocationState, ShellConsole};
pub use marker::CANCELLED_EXIT_CODE;
pub use registry::ConsoleRegistry;

// Killing running commands
pub use kill::{ConsoleKiller, LocalKiller, ProcessKiller};

// Shells
pub use shell::{PosixShell, Shell, SuperuserShell};

// Configuration
pub use config::{CONFIG_FILE, Combine, ConsoleOptions, ConsoleSettings};

// Errors
pub use error::{ConsoleError, RelaunchRequest};

pub use identity::Identity;

// Re-export for implementors of `AsyncProgram::end_signal`
pub use nix::sys::signal::Signal;
