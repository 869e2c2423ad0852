use nix::sys::signal::Signal;

use crate::program::Program;

/// Delivers a signal to a set of pids with `kill -s`.
#[derive(Debug)]
pub struct SendSignalProgram {
    signal: Signal,
    pids: Vec<i32>,
}

impl SendSignalProgram {
    pub fn new(signal: Signal, pids: Vec<i32>) -> Self {
        Self { signal, pids }
    }
}

impl Program for SendSignalProgram {
    fn id(&self) -> &str {
        "kill"
    }

    fn command(&self) -> &str {
        "kill"
    }

    fn arguments(&self) -> String {
        let name = self.signal.as_str();
        let mut args = format!("-s {}", name.strip_prefix("SIG").unwrap_or(name));
        for pid in &self.pids {
            args.push(' ');
            args.push_str(&pid.to_string());
        }
        args
    }
}
