//! Reader threads and the stream scanning they drive.

use std::io::{self, ErrorKind, Read};
use std::sync::Weak;
use std::time::Instant;

use super::{ActiveCommand, Inner, InvocationState, State};
use crate::async_program::Source;
use crate::marker::{EndScan, NeedleScanner};

/// Upper bound for a single read, whatever the program asks for.
pub(super) const MAX_READ_CHUNK: usize = 64 * 1024;

/// Output kept while waiting for a start frame that has not shown up.
const MAX_PRESTART_NOISE: usize = 64 * 1024;

/// Start one reader thread per output stream of the shell.
pub(super) fn spawn(
    inner: Weak<Inner>,
    generation: u64,
    stdout: Box<dyn Read + Send>,
    stderr: Box<dyn Read + Send>,
) -> io::Result<()> {
    spawn_reader(inner.clone(), generation, stdout, Source::Stdout)?;
    spawn_reader(inner, generation, stderr, Source::Stderr)
}

fn spawn_reader(
    inner: Weak<Inner>,
    generation: u64,
    stream: Box<dyn Read + Send>,
    source: Source,
) -> io::Result<()> {
    let name = match source {
        Source::Stdout => "shellcon-stdout",
        Source::Stderr => "shellcon-stderr",
    };
    std::thread::Builder::new()
        .name(name.into())
        .spawn(move || read_loop(&inner, generation, stream, source))?;
    Ok(())
}

fn read_loop(inner: &Weak<Inner>, generation: u64, mut stream: Box<dyn Read + Send>, source: Source) {
    let mut buf = vec![0u8; MAX_READ_CHUNK];
    loop {
        // Only hold a strong reference between reads, so dropping the last
        // console handle still tears the shell down.
        let chunk = match inner.upgrade() {
            Some(inner) => match inner.read_chunk(generation) {
                Some(chunk) => chunk,
                None => break,
            },
            None => break,
        };

        let result = stream.read(&mut buf[..chunk]);
        let Some(inner) = inner.upgrade() else { break };
        match result {
            Ok(0) => {
                inner.on_closed(generation, source, None);
                break;
            }
            Ok(n) => {
                if !inner.on_output(generation, source, &buf[..n]) {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                inner.on_closed(generation, source, Some(e));
                break;
            }
        }
    }
    tracing::trace!("{source:?} reader of generation {generation} exited");
}

impl Inner {
    /// How much the next read may take, or `None` once the shell was replaced.
    fn read_chunk(&self, generation: u64) -> Option<usize> {
        let state = self.lock_state();
        (state.generation == generation).then_some(state.read_chunk)
    }

    /// Returns `false` when the reader belongs to a replaced shell.
    fn on_output(&self, generation: u64, source: Source, bytes: &[u8]) -> bool {
        let mut state = self.lock_state();
        if state.generation != generation {
            return false;
        }
        state.last_activity = Instant::now();
        let trim_window = self.settings.trim_window;
        let completed = match source {
            Source::Stdout => state.on_stdout(bytes, trim_window),
            Source::Stderr => state.on_stderr(bytes, trim_window),
        };
        if completed {
            self.changed.notify_all();
        }
        true
    }

    fn on_closed(&self, generation: u64, source: Source, error: Option<io::Error>) {
        let mut state = self.lock_state();
        if state.generation != generation {
            return;
        }
        match error {
            Some(e) => tracing::warn!("{} shell {source:?} failed: {e}", self.shell.id()),
            None => tracing::debug!("{} shell closed {source:?}", self.shell.id()),
        }
        if source == Source::Stdout {
            state.alive = false;
            self.changed.notify_all();
        }
    }
}

impl State {
    /// Returns `true` when the active command just finished.
    fn on_stdout(&mut self, bytes: &[u8], trim_window: usize) -> bool {
        let State {
            stdout, command, ..
        } = self;
        let Some(command) = command.as_mut() else {
            // Nobody is listening; stray output of an abandoned command.
            stdout.clear();
            return false;
        };
        if command.exit_code.is_some() {
            // Prompt or echo after the end frame.
            return false;
        }
        stdout.extend_from_slice(bytes);
        scan_stdout(stdout, command, trim_window)
    }

    /// Returns `true` when the active command just finished or tripped on
    /// stderr output.
    fn on_stderr(&mut self, bytes: &[u8], trim_window: usize) -> bool {
        let State {
            stderr, command, ..
        } = self;
        let Some(command) = command
            .as_mut()
            .filter(|c| c.is_running() && !c.stderr_frame.done)
        else {
            return false;
        };
        stderr.extend_from_slice(bytes);
        scan_stderr(stderr, command, trim_window)
    }
}

impl ActiveCommand {
    pub(super) fn is_running(&self) -> bool {
        matches!(
            self.phase,
            InvocationState::Sent | InvocationState::Started | InvocationState::Streaming
        )
    }

    /// Finished once both the stdout end frame and the stderr end token
    /// were seen.
    fn finish_if_complete(&mut self) -> bool {
        if self.exit_code.is_some() && self.stderr_frame.done {
            self.phase = InvocationState::Finished;
            true
        } else {
            false
        }
    }

    fn forward_stderr(&mut self, stderr: &[u8], limit: usize) {
        if let Some(sink) = &self.sink
            && limit > self.stderr_frame.forwarded
        {
            sink.push(Source::Stderr, &stderr[self.stderr_frame.forwarded..limit]);
            self.stderr_frame.forwarded = limit;
        }
    }

    /// Hand stdout up to `limit` to the async program, if there is one.
    fn forward(&mut self, stdout: &[u8], limit: usize) {
        if let Some(sink) = &self.sink
            && limit > self.forwarded
        {
            sink.push(Source::Stdout, &stdout[self.forwarded..limit]);
            self.forwarded = limit;
            self.phase = InvocationState::Streaming;
        }
    }
}

fn scan_stdout(stdout: &mut Vec<u8>, command: &mut ActiveCommand, trim_window: usize) -> bool {
    if !command.is_running() {
        return false;
    }

    if command.phase == InvocationState::Sent {
        match command.start.find(stdout) {
            Some(pos) => {
                stdout.drain(..pos + command.start.len());
                command.phase = InvocationState::Started;
            }
            None => {
                discard_noise(stdout, &mut command.start);
                return false;
            }
        }
    }

    let limit = match command.end.as_mut() {
        None => stdout.len(),
        Some(end) => match end.scan(stdout) {
            EndScan::Found { at, exit_code, .. } => {
                command.forward(stdout, at);
                // Drops the frame and anything the shell printed after it.
                stdout.truncate(at);
                command.exit_code = Some(exit_code);
                return command.finish_if_complete();
            }
            EndScan::Partial { at } => at,
            EndScan::NotFound { safe_len } => safe_len,
        },
    };

    if command.sink.is_some() {
        command.forward(stdout, limit);
        if command.forwarded > trim_window {
            let drop = command.forwarded - trim_window;
            stdout.drain(..drop);
            command.forwarded -= drop;
            if let Some(end) = command.end.as_mut() {
                end.shift(drop);
            }
        }
    }
    false
}

fn scan_stderr(stderr: &mut Vec<u8>, command: &mut ActiveCommand, trim_window: usize) -> bool {
    let frame = &mut command.stderr_frame;
    if !frame.started {
        match frame.start.find(stderr) {
            Some(pos) => {
                stderr.drain(..pos + frame.start.len());
                frame.started = true;
            }
            None => {
                discard_noise(stderr, &mut frame.start);
                return false;
            }
        }
    }

    let limit = match frame.end.as_mut() {
        None => stderr.len(),
        Some(end) => match end.find(stderr) {
            Some(at) => {
                command.forward_stderr(stderr, at);
                stderr.truncate(at);
                command.stderr_frame.done = true;
                return command.finish_if_complete();
            }
            // The end token may begin inside the last `end.len() - 1` bytes.
            None => stderr.len().saturating_sub(end.len() - 1),
        },
    };

    let tripped = command.exit_on_stderr && !command.stderr_tripped && limit > 0;
    if tripped {
        command.stderr_tripped = true;
    }

    if command.sink.is_some() {
        command.forward_stderr(stderr, limit);
        let frame = &mut command.stderr_frame;
        if frame.forwarded > trim_window {
            let drop = frame.forwarded - trim_window;
            stderr.drain(..drop);
            frame.forwarded -= drop;
            if let Some(end) = frame.end.as_mut() {
                end.shift(drop);
            }
        }
    }
    tripped
}

/// Bound what is kept while a start frame has not shown up.
fn discard_noise(buf: &mut Vec<u8>, start: &mut NeedleScanner) {
    if buf.len() > MAX_PRESTART_NOISE {
        let drop = buf.len() - start.len();
        buf.drain(..drop);
        start.shift(drop);
    }
}
