//! A persistent shell driven through its stdin.
//!
//! Each command is written as one line framed by a start probe and an exit
//! code probe carrying fresh random tokens. Two reader threads consume the
//! shell's stdout and stderr, strip everything up to the start frame and
//! complete the invocation when the end frame shows up. Only one invocation
//! runs at a time.

mod reader;

use nix::sys::signal::Signal;
use std::io::{self, Write};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::async_program::{
    AsyncProgram, PartialDispatcher, SharedAsyncProgram, guarded, lock_program,
};
use crate::config::ConsoleSettings;
use crate::error::{AttemptError, ConsoleError};
use crate::identity::Identity;
use crate::kill::{ConsoleKiller, LocalKiller, ProcessKiller, kill_process_group};
use crate::marker::{CANCELLED_EXIT_CODE, EndFrameScanner, Markers, NeedleScanner};
use crate::program::{Completion, DEFAULT_BUFFER_SIZE, Executable, Program};
use crate::programs::{GroupsProgram, IdentityProgram, ShellPidProgram};
use crate::shell::{Shell, ShellProcess};

/// Exit code reported when a command is stopped for writing to stderr.
const EXIT_ON_STDERR_CODE: i32 = 1;

/// Where the current invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Idle,
    /// Command line written, start frame not seen yet.
    Sent,
    Started,
    /// Output is being forwarded to an async program.
    Streaming,
    Finished,
    Cancelled,
    TimedOut,
    Failed,
}

/// Handle to a console. Clones share the same shell.
#[derive(Clone)]
pub struct ShellConsole {
    inner: Arc<Inner>,
}

struct Inner {
    shell: Box<dyn Shell>,
    settings: ConsoleSettings,
    /// Held for the whole of an invocation, including reallocation.
    exec_lock: Mutex<()>,
    state: Mutex<State>,
    changed: Condvar,
    process: Mutex<Option<Process>>,
    killer: RwLock<Arc<dyn ProcessKiller>>,
    next_ticket: AtomicU64,
}

struct Process {
    child: Child,
    stdin: Box<dyn Write + Send>,
}

struct State {
    /// Bumped on every alloc and dealloc; readers of older processes go quiet.
    generation: u64,
    allocated: bool,
    alive: bool,
    shell_pid: Option<i32>,
    identity: Option<Identity>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    read_chunk: usize,
    last_activity: Instant,
    command: Option<ActiveCommand>,
    /// Terminal state of the most recent invocation.
    last: InvocationState,
}

struct ActiveCommand {
    ticket: u64,
    phase: InvocationState,
    start: NeedleScanner,
    /// `None` for programs that never print an end frame.
    end: Option<EndFrameScanner>,
    exit_code: Option<i32>,
    end_signal: Signal,
    /// A cancel or end is being delivered.
    interrupting: bool,
    ended: bool,
    exit_on_stderr: bool,
    /// A program that exits on stderr output wrote some.
    stderr_tripped: bool,
    /// The tripped command was signalled to stop.
    stop_sent: bool,
    /// Stdout bytes already handed to the dispatcher.
    forwarded: usize,
    stderr_frame: StderrFrame,
    sink: Option<Arc<PartialDispatcher>>,
}

/// Framing of the command's stderr. Output before the start token belongs
/// to an earlier command; the end token follows everything the command wrote.
struct StderrFrame {
    start: NeedleScanner,
    started: bool,
    /// `None` for programs that never print an end frame.
    end: Option<NeedleScanner>,
    done: bool,
    /// Stderr bytes already handed to the dispatcher.
    forwarded: usize,
}

/// Everything the protocol needs from a program, read once per invocation.
struct Invocation {
    id: String,
    command_line: String,
    trace: bool,
    wait_indefinitely: bool,
    wait_on_new_data: bool,
    exit_on_stderr: bool,
    buffer_size: usize,
    expects_end_frame: bool,
    end_signal: Signal,
}

impl Invocation {
    fn of(program: &dyn Program) -> Self {
        Self {
            id: program.id().to_string(),
            command_line: program.command_line(),
            trace: program.is_trace(),
            wait_indefinitely: program.wait_indefinitely(),
            wait_on_new_data: program.wait_on_new_data(),
            exit_on_stderr: program.exit_on_stderr_output(),
            buffer_size: program.buffer_size(),
            expects_end_frame: true,
            end_signal: Signal::SIGINT,
        }
    }
}

enum Target<'a> {
    Sync(&'a dyn Program),
    Async {
        dispatcher: &'a Arc<PartialDispatcher>,
        control: &'a AsyncControl,
    },
}

impl Target<'_> {
    fn describe(&self) -> Invocation {
        match self {
            Target::Sync(program) => Invocation::of(*program),
            Target::Async { dispatcher, .. } => {
                let program = lock_program(dispatcher.program());
                Invocation {
                    expects_end_frame: program.expects_end_frame(),
                    end_signal: program.end_signal(),
                    ..Invocation::of(&**program)
                }
            }
        }
    }
}

struct RawOutcome {
    exit_code: i32,
    cancelled: bool,
    ended: bool,
    stdout: String,
    stderr: String,
}

impl RawOutcome {
    fn completion(&self) -> Completion {
        Completion {
            exit_code: self.exit_code,
            cancelled: self.cancelled,
        }
    }
}

enum WaitEnd {
    Finished(i32),
    Cancelled,
    Ended,
    TimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancel,
    End,
}

impl ShellConsole {
    /// A console for `shell`. Nothing is spawned until [`alloc`](Self::alloc).
    pub fn new(shell: impl Shell + 'static, settings: ConsoleSettings) -> Self {
        let killer: Arc<dyn ProcessKiller> = if shell.is_privileged() {
            Arc::new(ConsoleKiller::new(settings.clone()))
        } else {
            Arc::new(LocalKiller)
        };
        Self {
            inner: Arc::new(Inner {
                shell: Box::new(shell),
                settings,
                exec_lock: Mutex::new(()),
                state: Mutex::new(State {
                    generation: 0,
                    allocated: false,
                    alive: false,
                    shell_pid: None,
                    identity: None,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    read_chunk: DEFAULT_BUFFER_SIZE,
                    last_activity: Instant::now(),
                    command: None,
                    last: InvocationState::Idle,
                }),
                changed: Condvar::new(),
                process: Mutex::new(None),
                killer: RwLock::new(killer),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the strategy used to signal running commands.
    ///
    /// A [`ConsoleKiller`] must not wrap this same console.
    pub fn set_killer(&self, killer: Arc<dyn ProcessKiller>) {
        *self
            .inner
            .killer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = killer;
    }

    pub fn settings(&self) -> &ConsoleSettings {
        &self.inner.settings
    }

    pub fn shell_id(&self) -> &str {
        self.inner.shell.id()
    }

    /// Spawn the shell and probe its pid and identity.
    ///
    /// The pid probe waits without a timeout so elevation prompts can be
    /// answered. Calling this on an active console does nothing.
    pub fn alloc(&self) -> Result<(), ConsoleError> {
        let _exec = self.inner.lock_exec();
        self.inner.alloc_locked()
    }

    /// Tear the shell down. Does not wait for a running invocation, which
    /// fails instead of reallocating.
    pub fn dealloc(&self) {
        self.inner.teardown();
    }

    pub fn realloc(&self) -> Result<(), ConsoleError> {
        let _exec = self.inner.lock_exec();
        self.inner.teardown();
        self.inner.alloc_locked()
    }

    /// Whether the console is allocated and its shell is running.
    pub fn is_active(&self) -> bool {
        let state = self.inner.lock_state();
        state.allocated && state.alive
    }

    pub fn is_privileged(&self) -> bool {
        self.inner.shell.is_privileged()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.lock_state().identity.clone()
    }

    pub fn shell_pid(&self) -> Option<i32> {
        self.inner.lock_state().shell_pid
    }

    /// State of the invocation in flight, `Idle` when there is none.
    pub fn invocation_state(&self) -> InvocationState {
        self.inner
            .lock_state()
            .command
            .as_ref()
            .map_or(InvocationState::Idle, |c| c.phase)
    }

    /// How the most recent invocation ended.
    pub fn last_invocation_state(&self) -> InvocationState {
        self.inner.lock_state().last
    }

    /// Run a program to completion, validate it and parse its output.
    pub fn execute(&self, mut executable: Executable<'_>) -> Result<Completion, ConsoleError> {
        let _exec = self.inner.lock_exec();
        self.inner.ensure_allocated()?;
        self.inner.execute_locked(&mut executable, true, false)
    }

    /// Start a streaming program on a dedicated launch thread.
    pub fn execute_async<P: AsyncProgram>(
        &self,
        program: P,
    ) -> Result<AsyncExecution, ConsoleError> {
        let program: SharedAsyncProgram = Arc::new(Mutex::new(Box::new(program)));
        let control = Arc::new(AsyncControl::default());

        let inner = Arc::clone(&self.inner);
        let launch_control = Arc::clone(&control);
        let handle = std::thread::Builder::new()
            .name("shellcon-async".into())
            .spawn(move || inner.run_async(program, &launch_control))
            .map_err(|e| ConsoleError::Execution(format!("failed to start launch thread: {e}")))?;

        Ok(AsyncExecution {
            canceller: AsyncCanceller {
                inner: Arc::clone(&self.inner),
                control,
            },
            handle: Some(handle),
        })
    }

    /// Cancel the running invocation with SIGTERM. It completes with exit
    /// code 143. Returns whether the signal was delivered.
    pub fn cancel(&self) -> bool {
        self.inner.interrupt(None, Interrupt::Cancel)
    }

    /// Ask the running invocation to finish by sending its end signal.
    pub fn end(&self) -> bool {
        self.inner.interrupt(None, Interrupt::End)
    }
}

impl std::fmt::Debug for ShellConsole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellConsole")
            .field("shell", &self.inner.shell.id())
            .field("privileged", &self.inner.shell.is_privileged())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_exec(&self) -> MutexGuard<'_, ()> {
        self.exec_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_allocated(&self) -> Result<(), ConsoleError> {
        if self.lock_state().allocated {
            Ok(())
        } else {
            Err(ConsoleError::ConsoleAlloc(format!(
                "{} console is not allocated",
                self.shell.id()
            )))
        }
    }

    fn alloc_locked(self: &Arc<Self>) -> Result<(), ConsoleError> {
        {
            let state = self.lock_state();
            if state.allocated && state.alive {
                return Ok(());
            }
        }
        self.teardown();

        let ShellProcess {
            child,
            stdin,
            stdout,
            stderr,
        } = self.shell.spawn(&self.settings.working_dir)?;

        let generation = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.allocated = true;
            state.alive = true;
            state.stdout.clear();
            state.stderr.clear();
            state.command = None;
            state.last_activity = Instant::now();
            state.generation
        };
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(Process { child, stdin });

        if let Err(e) = reader::spawn(Arc::downgrade(self), generation, stdout, stderr) {
            self.teardown();
            return Err(ConsoleError::ConsoleAlloc(format!(
                "failed to start reader threads: {e}"
            )));
        }

        std::thread::sleep(self.settings.warmup);

        if let Err(e) = self.probe() {
            self.teardown();
            return Err(match e {
                e @ ConsoleError::ConsoleAlloc(_) => e,
                e => ConsoleError::ConsoleAlloc(format!("{} probe failed: {e}", self.shell.id())),
            });
        }

        let state = self.lock_state();
        tracing::info!(
            shell = self.shell.id(),
            pid = state.shell_pid,
            uid = state.identity.as_ref().map(|i| i.uid),
            "console allocated"
        );
        Ok(())
    }

    fn probe(self: &Arc<Self>) -> Result<(), ConsoleError> {
        let mut pid = ShellPidProgram::new();
        self.execute_locked(&mut Executable::SyncResult(&mut pid), false, true)?;
        let shell_pid = pid
            .pid()
            .ok_or_else(|| ConsoleError::ConsoleAlloc("shell pid probe printed nothing".into()))?;
        self.lock_state().shell_pid = Some(shell_pid);

        let mut id = IdentityProgram::new();
        self.execute_locked(&mut Executable::SyncResult(&mut id), false, false)?;
        let mut identity = id
            .into_identity()
            .ok_or_else(|| ConsoleError::ConsoleAlloc("identity probe printed nothing".into()))?;

        let mut groups = GroupsProgram::new();
        match self.execute_locked(&mut Executable::SyncResult(&mut groups), false, false) {
            Ok(_) => {
                let groups = groups.into_groups();
                if !groups.is_empty() {
                    identity.groups = groups;
                }
            }
            Err(e) => tracing::warn!("group lookup failed: {e}"),
        }

        self.lock_state().identity = Some(identity);
        Ok(())
    }

    /// Kill the shell and forget it. Safe to call at any time.
    fn teardown(&self) {
        let process = self.process.lock().unwrap_or_else(PoisonError::into_inner).take();
        {
            let mut state = self.lock_state();
            state.generation += 1;
            state.allocated = false;
            state.alive = false;
            state.shell_pid = None;
            state.identity = None;
            state.stdout.clear();
            state.stderr.clear();
            self.changed.notify_all();
        }
        if let Some(process) = process {
            stop_process(process);
            tracing::debug!("{} console deallocated", self.shell.id());
        }
    }

    fn execute_locked(
        self: &Arc<Self>,
        executable: &mut Executable<'_>,
        realloc_allowed: bool,
        wait_indefinitely: bool,
    ) -> Result<Completion, ConsoleError> {
        let outcome = self.run(
            &Target::Sync(executable.program()),
            realloc_allowed,
            wait_indefinitely,
        )?;
        if outcome.cancelled || outcome.ended {
            return Ok(outcome.completion());
        }
        self.validate(executable.program(), &outcome)?;
        if let Executable::SyncResult(program) = executable {
            program.parse(&outcome.stdout, &outcome.stderr)?;
        }
        Ok(outcome.completion())
    }

    fn run_async(
        self: &Arc<Self>,
        program: SharedAsyncProgram,
        control: &AsyncControl,
    ) -> Result<Completion, ConsoleError> {
        let _exec = self.lock_exec();
        let dispatcher = Arc::new(PartialDispatcher::new(
            Arc::clone(&program),
            self.settings.async_end_timeout,
        ));

        let mut started = false;
        let result = self
            .ensure_allocated()
            .and_then(|()| dispatcher.start())
            .and_then(|()| {
                started = true;
                let target = Target::Async {
                    dispatcher: &dispatcher,
                    control,
                };
                self.run(&target, true, false)
            });

        if started {
            dispatcher.finish(matches!(&result, Ok(outcome) if outcome.cancelled));
        }

        let result = result.and_then(|outcome| {
            guarded("on_exit_code", || {
                lock_program(&program).on_exit_code(outcome.exit_code)
            });
            if !outcome.cancelled && !outcome.ended {
                let program = lock_program(&program);
                self.validate(&**program, &outcome)?;
            }
            Ok(outcome.completion())
        });

        if let Err(e) = &result {
            guarded("on_exception", || lock_program(&program).on_exception(e));
        }
        result
    }

    /// One attempt, plus a single retry on a fresh shell after an I/O failure.
    fn run(
        self: &Arc<Self>,
        target: &Target<'_>,
        realloc_allowed: bool,
        wait_indefinitely: bool,
    ) -> Result<RawOutcome, ConsoleError> {
        let mut invocation = target.describe();
        invocation.wait_indefinitely |= wait_indefinitely;

        match self.attempt(target, &invocation) {
            Ok(outcome) => Ok(outcome),
            Err(AttemptError::Console(e)) => Err(e),
            Err(AttemptError::Io(e)) if realloc_allowed => {
                tracing::warn!(
                    "{} console I/O failure running {}: {e}; reallocating",
                    self.shell.id(),
                    invocation.id
                );
                self.teardown();
                self.alloc_locked()?;
                self.attempt(target, &invocation).map_err(|e| match e {
                    AttemptError::Console(e) => e,
                    AttemptError::Io(e) => ConsoleError::Execution(format!(
                        "shell I/O failed after reallocation: {e}"
                    )),
                })
            }
            Err(AttemptError::Io(e)) => Err(ConsoleError::Execution(format!("shell I/O failed: {e}"))),
        }
    }

    fn attempt(
        &self,
        target: &Target<'_>,
        invocation: &Invocation,
    ) -> Result<RawOutcome, AttemptError> {
        if !self.lock_state().alive {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "shell is not running").into());
        }
        // Surfaces a dead pipe before any state is touched.
        self.write_stdin(b"\n\n")?;

        let markers = Markers::generate();
        let mut line = markers.start_probe(self.shell.start_probe());
        line.push(' ');
        line.push_str(&invocation.command_line);
        if invocation.expects_end_frame {
            line.push_str(&markers.exit_probe(self.shell.exit_probe()));
        }
        line.push('\n');

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, control) = match target {
            Target::Sync(_) => (None, None),
            Target::Async {
                dispatcher,
                control,
            } => (Some(Arc::clone(dispatcher)), Some(*control)),
        };

        let early = {
            let mut state = self.lock_state();
            state.stdout.clear();
            state.stderr.clear();
            state.read_chunk = invocation.buffer_size.clamp(1, reader::MAX_READ_CHUNK);
            state.command = Some(ActiveCommand {
                ticket,
                phase: InvocationState::Sent,
                start: markers.start_scanner(),
                end: invocation
                    .expects_end_frame
                    .then(|| markers.end_scanner()),
                exit_code: None,
                end_signal: invocation.end_signal,
                interrupting: false,
                ended: false,
                exit_on_stderr: invocation.exit_on_stderr,
                stderr_tripped: false,
                stop_sent: false,
                forwarded: 0,
                stderr_frame: StderrFrame {
                    start: markers.stderr_start_scanner(),
                    started: false,
                    end: invocation
                        .expects_end_frame
                        .then(|| markers.stderr_end_scanner()),
                    done: false,
                    forwarded: 0,
                },
                sink,
            });
            control.and_then(|c| c.activate(ticket))
        };

        let trace = invocation.trace || self.settings.debug;
        if trace {
            tracing::debug!(target: "shellcon::trace", shell = self.shell.id(), "> {}", invocation.command_line);
        }

        let started = Instant::now();
        let waited = match early {
            Some(end) => Ok(end),
            None => match self.write_stdin(line.as_bytes()) {
                Ok(()) => self.wait_for(ticket, invocation, started),
                Err(e) => Err(e.into()),
            },
        };
        let (stdout, stderr, was_ended) = self.release(ticket);
        self.lock_state().last = match &waited {
            Ok(WaitEnd::Finished(_) | WaitEnd::Ended) => InvocationState::Finished,
            Ok(WaitEnd::Cancelled) => InvocationState::Cancelled,
            Ok(WaitEnd::TimedOut(_)) => InvocationState::TimedOut,
            Err(_) => InvocationState::Failed,
        };

        let (exit_code, cancelled, ended) = match waited? {
            WaitEnd::Finished(code) => (code, false, was_ended),
            WaitEnd::Cancelled => (CANCELLED_EXIT_CODE, true, false),
            WaitEnd::Ended => (0, false, true),
            WaitEnd::TimedOut(elapsed) => {
                tracing::warn!(
                    "{} timed out after {elapsed:?}; killing it",
                    invocation.command_line
                );
                let pid = self.lock_state().shell_pid;
                self.signal_command(pid, Signal::SIGKILL);
                return Err(ConsoleError::OperationTimeout {
                    command: invocation.command_line.clone(),
                    elapsed,
                }
                .into());
            }
        };

        if trace {
            tracing::debug!(
                target: "shellcon::trace",
                shell = self.shell.id(),
                exit_code,
                cancelled,
                "< {} stdout={stdout:?} stderr={stderr:?}",
                invocation.id
            );
        }

        Ok(RawOutcome {
            exit_code,
            cancelled,
            ended,
            stdout,
            stderr,
        })
    }

    fn wait_for(
        &self,
        ticket: u64,
        invocation: &Invocation,
        started: Instant,
    ) -> Result<WaitEnd, AttemptError> {
        let timeout = self.settings.timeout;
        let mut state = self.lock_state();
        loop {
            let Some(command) = state.command.as_ref().filter(|c| c.ticket == ticket) else {
                return Err(ConsoleError::Execution("invocation was released".into()).into());
            };
            if command.interrupting {
                // The interrupting thread notifies once the signal is out.
                state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            match command.phase {
                InvocationState::Finished if command.stderr_tripped => {
                    return Ok(WaitEnd::Finished(EXIT_ON_STDERR_CODE));
                }
                InvocationState::Finished => {
                    return Ok(WaitEnd::Finished(
                        command.exit_code.unwrap_or(EXIT_ON_STDERR_CODE),
                    ));
                }
                InvocationState::Cancelled => return Ok(WaitEnd::Cancelled),
                _ => {}
            }
            if command.ended && command.end.is_none() {
                return Ok(WaitEnd::Ended);
            }
            if command.stderr_tripped && !command.stop_sent {
                let has_end_frame = command.end.is_some();
                let shell_pid = state.shell_pid;
                if let Some(command) = state.command.as_mut() {
                    command.stop_sent = true;
                }
                drop(state);
                tracing::debug!("{} wrote to stderr; stopping it", invocation.id);
                self.signal_command(shell_pid, Signal::SIGTERM);
                if !has_end_frame {
                    return Ok(WaitEnd::Finished(EXIT_ON_STDERR_CODE));
                }
                // Released only once the end frame shows the shell is idle again.
                state = self.lock_state();
                continue;
            }
            if !state.allocated {
                return Err(ConsoleError::Execution(format!(
                    "{} console was deallocated",
                    self.shell.id()
                ))
                .into());
            }
            if !state.alive {
                return Err(
                    io::Error::new(io::ErrorKind::UnexpectedEof, "shell exited").into(),
                );
            }

            if invocation.wait_indefinitely {
                state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            let mut deadline = started + timeout;
            if invocation.wait_on_new_data {
                deadline = deadline
                    .max(state.last_activity + timeout)
                    .min(started + self.settings.max_timeout);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitEnd::TimedOut(now - started));
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Clear the active command and take the output buffers. Also reports
    /// whether the command was ended.
    fn release(&self, ticket: u64) -> (String, String, bool) {
        let mut state = self.lock_state();
        let mut ended = false;
        if state.command.as_ref().is_some_and(|c| c.ticket == ticket) {
            ended = state.command.take().is_some_and(|c| c.ended);
        }
        state.read_chunk = DEFAULT_BUFFER_SIZE;
        let stdout = String::from_utf8_lossy(&std::mem::take(&mut state.stdout)).into_owned();
        let stderr = String::from_utf8_lossy(&std::mem::take(&mut state.stderr)).into_owned();
        (stdout, stderr, ended)
    }

    fn validate(&self, program: &dyn Program, outcome: &RawOutcome) -> Result<(), ConsoleError> {
        let check_shell = !program.ignore_shell_stderr_check();
        if check_shell {
            self.shell
                .check_stderr(program, outcome.exit_code, &outcome.stderr)?;
        }
        program.check_stderr(outcome.exit_code, &outcome.stderr)?;
        if check_shell {
            self.shell.check_exit_code(program, outcome.exit_code)?;
        }
        program.check_exit_code(outcome.exit_code)
    }

    fn write_stdin(&self, bytes: &[u8]) -> io::Result<()> {
        let mut process = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        let process = process
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "shell is not running"))?;
        process.stdin.write_all(bytes)?;
        process.stdin.flush()
    }

    /// Signal the running command and mark it cancelled or ended.
    ///
    /// The signal goes out before the waiting executor is released, so the
    /// next command cannot start underneath it.
    fn interrupt(&self, ticket: Option<u64>, kind: Interrupt) -> bool {
        let (ticket, shell_pid, signal) = {
            let mut state = self.lock_state();
            let shell_pid = state.shell_pid;
            let Some(command) = state.command.as_mut() else {
                return false;
            };
            if ticket.is_some_and(|t| t != command.ticket)
                || command.interrupting
                || !command.is_running()
                || (kind == Interrupt::End && command.ended)
            {
                return false;
            }
            command.interrupting = true;
            let signal = match kind {
                Interrupt::Cancel => Signal::SIGTERM,
                Interrupt::End => command.end_signal,
            };
            (command.ticket, shell_pid, signal)
        };

        let delivered = self.signal_command(shell_pid, signal);
        if kind == Interrupt::Cancel {
            std::thread::sleep(self.settings.kill_settle);
        }

        let mut state = self.lock_state();
        if let Some(command) = state.command.as_mut().filter(|c| c.ticket == ticket) {
            command.interrupting = false;
            match kind {
                Interrupt::Cancel => command.phase = InvocationState::Cancelled,
                Interrupt::End => command.ended = true,
            }
        }
        self.changed.notify_all();
        delivered
    }

    fn signal_command(&self, shell_pid: Option<i32>, signal: Signal) -> bool {
        let Some(shell_pid) = shell_pid else {
            tracing::warn!("shell pid unknown; cannot deliver {signal}");
            return false;
        };
        let killer = Arc::clone(&*self.killer.read().unwrap_or_else(PoisonError::into_inner));
        match killer.signal_descendants(shell_pid, signal) {
            Ok(count) => {
                tracing::debug!("sent {signal} to {count} process(es) under {shell_pid}");
                true
            }
            Err(e) => {
                tracing::warn!("failed to deliver {signal} under {shell_pid}: {e}");
                false
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let process = self
            .process
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(process) = process {
            stop_process(process);
        }
    }
}

fn stop_process(process: Process) {
    let Process { mut child, stdin } = process;
    drop(stdin);
    kill_process_group(child.id());
    let _ = child.kill();
    // A privileged shell may outlive our signals until it sees EOF; reap it
    // off-thread.
    let reap = std::thread::Builder::new()
        .name("shellcon-reap".into())
        .spawn(move || {
            let _ = child.wait();
        });
    if let Err(e) = reap {
        tracing::debug!("failed to spawn reaper thread: {e}");
    }
}

/// Cancellation state shared between an [`AsyncExecution`] and its launch
/// thread.
#[derive(Default)]
struct AsyncControl {
    cancel_requested: AtomicBool,
    end_requested: AtomicBool,
    /// Ticket of the active attempt, `0` when none.
    ticket: AtomicU64,
}

impl AsyncControl {
    /// Publish the attempt's ticket. Returns how it ends right away when a
    /// cancel or end was requested before the command was written.
    fn activate(&self, ticket: u64) -> Option<WaitEnd> {
        self.ticket.store(ticket, Ordering::SeqCst);
        if self.cancel_requested.load(Ordering::SeqCst) {
            Some(WaitEnd::Cancelled)
        } else if self.end_requested.load(Ordering::SeqCst) {
            Some(WaitEnd::Ended)
        } else {
            None
        }
    }
}

/// Cancels or ends one async execution. Cheap to clone.
#[derive(Clone)]
pub struct AsyncCanceller {
    inner: Arc<Inner>,
    control: Arc<AsyncControl>,
}

impl AsyncCanceller {
    /// Cancel the execution. A cancel requested before the command was
    /// written keeps it from running at all.
    pub fn cancel(&self) -> bool {
        self.control.cancel_requested.store(true, Ordering::SeqCst);
        match self.control.ticket.load(Ordering::SeqCst) {
            0 => true,
            ticket => self.inner.interrupt(Some(ticket), Interrupt::Cancel),
        }
    }

    pub fn end(&self) -> bool {
        self.control.end_requested.store(true, Ordering::SeqCst);
        match self.control.ticket.load(Ordering::SeqCst) {
            0 => true,
            ticket => self.inner.interrupt(Some(ticket), Interrupt::End),
        }
    }
}

/// A running async program.
pub struct AsyncExecution {
    canceller: AsyncCanceller,
    handle: Option<JoinHandle<Result<Completion, ConsoleError>>>,
}

impl AsyncExecution {
    pub fn canceller(&self) -> AsyncCanceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    pub fn end(&self) -> bool {
        self.canceller.end()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the launch thread and return its result.
    pub fn join(mut self) -> Result<Completion, ConsoleError> {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(ConsoleError::Execution("async launch thread panicked".into()))
            }),
            None => Err(ConsoleError::Execution("async execution already joined".into())),
        }
    }
}
