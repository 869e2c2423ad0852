//! Programs shipped with the console.

mod capture;
mod child_pids;
mod find;
mod identity;
mod list_directory;
mod process_id;
mod send_signal;

pub use capture::CaptureProgram;
pub use child_pids::ChildPidsProgram;
pub use find::FindProgram;
pub use identity::{GroupsProgram, IdentityProgram};
pub use list_directory::ListDirectoryProgram;
pub use process_id::ShellPidProgram;
pub use send_signal::SendSignalProgram;

use std::borrow::Cow;
use std::path::Path;

/// Quote one argument for a POSIX shell.
pub fn quote(arg: &str) -> String {
    shell_escape::escape(Cow::Borrowed(arg)).into_owned()
}

pub(crate) fn quote_path(path: &Path) -> String {
    shell_escape::escape(path.to_string_lossy()).into_owned()
}

/// Quote and join arguments.
pub fn join_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
