//! Streaming programs and the worker that feeds them partial output.
//!
//! Reader threads never call into program code. They hand raw bytes to a
//! [`PartialDispatcher`], which buffers them (by line, unless the program asks
//! otherwise) and delivers them in order on a dedicated worker thread.

use nix::sys::signal::Signal;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::ConsoleError;
use crate::program::Program;

/// A program whose output is consumed while it is still running.
pub trait AsyncProgram: Program + 'static {
    /// Whether the command prints an end frame. Programs without one finish
    /// when ended or cancelled, and report exit code `0` when ended.
    fn expects_end_frame(&self) -> bool {
        true
    }

    /// Deliver stdout only in complete lines.
    fn parse_only_complete_lines(&self) -> bool {
        true
    }

    /// Signal sent to the command by `end()`.
    fn end_signal(&self) -> Signal {
        Signal::SIGINT
    }

    fn on_start_parse_partial_result(&mut self) {}

    /// A chunk of stdout.
    fn on_parse_partial_result(&mut self, partial: &str);

    /// A chunk of stderr.
    fn on_parse_error_partial_result(&mut self, _partial: &str) {}

    /// No more partial results will follow.
    fn on_end_parse_partial_result(&mut self, _cancelled: bool) {}

    fn on_exit_code(&mut self, _exit_code: i32) {}

    fn on_exception(&mut self, _error: &ConsoleError) {}
}

/// Receives typed results from an [`AsyncProgram`].
pub trait AsyncResultListener<T>: Send {
    fn on_async_start(&mut self) {}

    fn on_partial_result(&mut self, result: T);

    fn on_async_end(&mut self, _cancelled: bool) {}

    fn on_async_exit_code(&mut self, _exit_code: i32) {}

    fn on_exception(&mut self, _error: &ConsoleError) {}
}

/// Shared handle to a program driven by the console and its worker.
pub type SharedAsyncProgram = Arc<Mutex<Box<dyn AsyncProgram>>>;

pub(crate) fn lock_program(program: &SharedAsyncProgram) -> MutexGuard<'_, Box<dyn AsyncProgram>> {
    // A listener that panicked mid-callback must not wedge the console.
    program.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Stdout,
    Stderr,
}

#[derive(Default)]
struct Queue {
    entries: VecDeque<(Source, String)>,
    stopping: bool,
    abandoned: bool,
    exited: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    drained: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Pending {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Ordered delivery of partial output to one async program.
pub(crate) struct PartialDispatcher {
    program: SharedAsyncProgram,
    shared: Arc<Shared>,
    line_mode: bool,
    pending: Mutex<Pending>,
    worker: Mutex<Option<JoinHandle<()>>>,
    end_timeout: Duration,
}

impl PartialDispatcher {
    pub(crate) fn new(program: SharedAsyncProgram, end_timeout: Duration) -> Self {
        let line_mode = lock_program(&program).parse_only_complete_lines();
        Self {
            program,
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    exited: true,
                    ..Default::default()
                }),
                available: Condvar::new(),
                drained: Condvar::new(),
            }),
            line_mode,
            pending: Mutex::new(Pending::default()),
            worker: Mutex::new(None),
            end_timeout,
        }
    }

    pub(crate) fn program(&self) -> &SharedAsyncProgram {
        &self.program
    }

    /// Notify the program and start the worker.
    pub(crate) fn start(&self) -> Result<(), ConsoleError> {
        guarded("on_start_parse_partial_result", || {
            lock_program(&self.program).on_start_parse_partial_result()
        });

        self.shared.lock().exited = false;
        let shared = Arc::clone(&self.shared);
        let program = Arc::clone(&self.program);
        let handle = std::thread::Builder::new()
            .name("shellcon-dispatch".into())
            .spawn(move || dispatch_loop(&shared, &program))
            .map_err(|e| {
                self.shared.lock().exited = true;
                ConsoleError::Execution(format!("failed to start dispatch worker: {e}"))
            })?;
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Buffer raw output and queue whatever can be delivered.
    pub(crate) fn push(&self, source: Source, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let chunk = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let buf = match source {
                Source::Stdout => &mut pending.stdout,
                Source::Stderr => &mut pending.stderr,
            };
            buf.extend_from_slice(bytes);
            take_deliverable(buf, self.line_mode && source == Source::Stdout)
        };
        if let Some(chunk) = chunk {
            self.enqueue(source, chunk);
        }
    }

    fn enqueue(&self, source: Source, chunk: String) {
        let mut queue = self.shared.lock();
        if queue.abandoned {
            return;
        }
        queue.entries.push_back((source, chunk));
        self.shared.available.notify_one();
    }

    /// Flush leftovers, drain the worker within the end timeout and report the
    /// end of partial results.
    pub(crate) fn finish(&self, cancelled: bool) {
        let leftovers = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            [
                (Source::Stdout, std::mem::take(&mut pending.stdout)),
                (Source::Stderr, std::mem::take(&mut pending.stderr)),
            ]
        };
        for (source, bytes) in leftovers {
            if !bytes.is_empty() {
                self.enqueue(source, String::from_utf8_lossy(&bytes).into_owned());
            }
        }

        let deadline = Instant::now() + self.end_timeout;
        let drained = {
            let mut queue = self.shared.lock();
            queue.stopping = true;
            self.shared.available.notify_all();
            loop {
                if queue.exited {
                    break true;
                }
                let now = Instant::now();
                if now >= deadline {
                    queue.abandoned = true;
                    queue.entries.clear();
                    self.shared.available.notify_all();
                    break false;
                }
                queue = self
                    .shared
                    .drained
                    .wait_timeout(queue, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) if drained => {
                let _ = handle.join();
            }
            Some(_) => {
                tracing::warn!(
                    "dispatch worker still busy after {:?}, abandoning it",
                    self.end_timeout
                );
            }
            None => {}
        }

        guarded("on_end_parse_partial_result", || {
            lock_program(&self.program).on_end_parse_partial_result(cancelled)
        });
    }
}

/// Split off the part of `buf` that can be delivered now.
fn take_deliverable(buf: &mut Vec<u8>, line_mode: bool) -> Option<String> {
    let end = if line_mode {
        buf.iter().rposition(|&b| b == b'\n')? + 1
    } else {
        match std::str::from_utf8(buf) {
            Ok(_) => buf.len(),
            // Hold back a multi-byte character split across reads.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => buf.len(),
        }
    };
    if end == 0 {
        return None;
    }
    let rest = buf.split_off(end);
    let chunk = std::mem::replace(buf, rest);
    Some(String::from_utf8_lossy(&chunk).into_owned())
}

fn dispatch_loop(shared: &Shared, program: &SharedAsyncProgram) {
    loop {
        let entry = {
            let mut queue = shared.lock();
            loop {
                if queue.abandoned {
                    break None;
                }
                if let Some(entry) = queue.entries.pop_front() {
                    break Some(entry);
                }
                if queue.stopping {
                    break None;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some((source, chunk)) = entry else { break };

        guarded("partial result callback", || {
            let mut program = lock_program(program);
            match source {
                Source::Stdout => program.on_parse_partial_result(&chunk),
                Source::Stderr => program.on_parse_error_partial_result(&chunk),
            }
        });
    }

    shared.lock().exited = true;
    shared.drained.notify_all();
}

/// Run listener code, logging and swallowing panics.
pub(crate) fn guarded(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!("{what} panicked; continuing");
    }
}
