mod common;

use common::{Event, FlakyShell, Inline, Lines, Recorder, Script, TestContext, wait_until};
use pretty_assertions::assert_eq;
use shellcon_console::programs::{CaptureProgram, FindProgram, ListDirectoryProgram};
use shellcon_console::{
    CANCELLED_EXIT_CODE, ConsoleError, ConsoleOptions, ConsoleSettings, Executable,
    InvocationState, ShellConsole,
};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

#[test]
fn test_alloc_probes_pid_and_identity() {
    let ctx = TestContext::new();
    let console = ctx.console();

    assert!(console.is_active());
    assert!(!console.is_privileged());
    assert!(console.shell_pid().is_some_and(|pid| pid > 0));

    let expected_uid = std::process::Command::new("id")
        .arg("-u")
        .output()
        .unwrap();
    let expected_uid: u32 = String::from_utf8_lossy(&expected_uid.stdout)
        .trim()
        .parse()
        .unwrap();
    let identity = console.identity().unwrap();
    assert_eq!(identity.uid, expected_uid);
    assert!(!identity.groups.is_empty());

    console.dealloc();
}

#[test]
fn test_list_directory() {
    let ctx = TestContext::new();
    ctx.touch("file1");
    ctx.touch("file2");
    let console = ctx.console();

    let mut program = ListDirectoryProgram::new(ctx.path());
    let completion = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();

    assert_eq!(completion.exit_code, 0);
    assert!(completion.success());
    assert_eq!(program.entries(), &["file1", "file2"]);
}

#[test]
fn test_exit_code_and_output_without_markers() {
    let ctx = TestContext::new();
    let console = ctx.console();

    let mut program = CaptureProgram::new("sh", vec!["-c".into(), "printf 'a\\nb'; exit 3".into()]);
    let completion = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();

    assert_eq!(completion.exit_code, 3);
    assert_eq!(program.stdout(), "a\nb");
    assert!(!program.stdout().contains("/#"));
}

#[test]
fn test_consecutive_commands_are_isolated() {
    let ctx = TestContext::new();
    let console = ctx.console();

    for i in 0..20 {
        let mut program = Script::new(&format!("echo run-{i}"));
        console
            .execute(Executable::SyncResult(&mut program))
            .unwrap();
        assert_eq!(program.stdout, format!("run-{i}\n"));
    }
}

#[test]
fn test_permission_denied_overrides_success() {
    let ctx = TestContext::new();
    let console = ctx.console();

    let mut program = Script::new("echo 'cannot open /data: Permission denied' >&2; exit 0");
    let err = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap_err();

    assert!(
        matches!(err, ConsoleError::InsufficientPermissions { .. }),
        "{err:?}"
    );
    assert!(err.is_relaunchable());
    assert_eq!(err.relaunchable()[0].program_id, "script");
}

#[test]
fn test_builtin_stderr_is_never_lost() {
    let ctx = TestContext::new();
    let console = ctx.console();

    // A builtin writes stderr right before the shell prints the end frame.
    for _ in 0..300 {
        let mut program = Inline::new("printf 'x: Permission denied\\n' >&2");
        let err = console
            .execute(Executable::SyncResult(&mut program))
            .unwrap_err();
        assert!(
            matches!(err, ConsoleError::InsufficientPermissions { .. }),
            "{err:?}"
        );
    }

    for i in 0..100 {
        let mut program = Inline::new(&format!("printf 'err-{i}' >&2"));
        console
            .execute(Executable::SyncResult(&mut program))
            .unwrap();
        assert_eq!(program.stderr, format!("err-{i}"));
        assert_eq!(program.stdout, "");
    }
}

#[test]
fn test_missing_command_and_file() {
    let ctx = TestContext::new();
    let console = ctx.console();

    let mut program = CaptureProgram::new("shellcon-no-such-command", vec![]);
    let completion = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();
    assert_eq!(completion.exit_code, 127);

    let mut program = ListDirectoryProgram::new(ctx.path().join("missing"));
    let err = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap_err();
    assert!(
        matches!(err, ConsoleError::NoSuchFileOrDirectory(_)),
        "{err:?}"
    );
}

#[test]
fn test_nonzero_exit_is_execution_error() {
    let ctx = TestContext::new();
    let console = ctx.console();

    let mut program = Script::new("exit 2");
    let err = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap_err();
    assert!(matches!(err, ConsoleError::Execution(_)), "{err:?}");
    assert_eq!(console.last_invocation_state(), InvocationState::Finished);
}

#[test]
fn test_find_streams_matches() {
    let ctx = TestContext::new();
    ctx.touch("a.log");
    ctx.touch("b.log");
    ctx.touch("c.log");
    ctx.touch("notes.txt");
    let console = ctx.console();

    let (recorder, events) = Recorder::<PathBuf>::new();
    let program = FindProgram::new(ctx.path(), Box::new(recorder)).name("*.log");
    let completion = console.execute_async(program).unwrap().join().unwrap();
    assert_eq!(completion.exit_code, 0);

    let events = events.lock().unwrap().clone();
    assert_eq!(events.first(), Some(&Event::Start));

    let mut found: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Partial(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    found.sort();
    assert_eq!(found, vec!["a.log", "b.log", "c.log"]);

    let ends: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::End(_)))
        .collect();
    assert_eq!(ends, vec![&Event::End(false)]);
    assert_eq!(&events[events.len() - 2..], &[Event::End(false), Event::ExitCode(0)]);
}

#[test]
fn test_async_lines_arrive_in_order() {
    let ctx = TestContext::new();
    let console = ctx.console();

    let (recorder, events) = Recorder::<String>::new();
    let program = Lines::new(
        "for i in 1 2 3 4 5; do echo line-$i; sleep 0.02; done",
        Box::new(recorder),
    );
    console.execute_async(program).unwrap().join().unwrap();

    let expected: Vec<Event<String>> = std::iter::once(Event::Start)
        .chain((1..=5).map(|i| Event::Partial(format!("line-{i}"))))
        .chain([Event::End(false), Event::ExitCode(0)])
        .collect();
    assert_eq!(*events.lock().unwrap(), expected);
}

#[test]
fn test_cancel_async() {
    let ctx = TestContext::new();
    let console = ctx.console();

    let (recorder, events) = Recorder::<String>::new();
    let program = Lines::new("echo ready; sleep 30", Box::new(recorder));
    let execution = console.execute_async(program).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        events
            .lock()
            .unwrap()
            .contains(&Event::Partial("ready".into()))
    }));
    let started = Instant::now();
    assert!(execution.cancel());

    let completion = execution.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(completion.exit_code, CANCELLED_EXIT_CODE);
    assert!(completion.cancelled);

    let events = events.lock().unwrap().clone();
    assert!(events.contains(&Event::End(true)));
    assert!(events.contains(&Event::ExitCode(CANCELLED_EXIT_CODE)));
    assert!(!events.iter().any(|e| matches!(e, Event::Exception(_))));
    assert_eq!(console.last_invocation_state(), InvocationState::Cancelled);

    // The shell survives and the next command is not confused by the
    // cancelled command's late end frame.
    let mut program = Script::new("echo after");
    console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();
    assert_eq!(program.stdout, "after\n");
}

#[test]
fn test_cancel_blocked_execute() {
    let ctx = TestContext::new();
    let console = ctx.console();

    let runner = console.clone();
    let handle = std::thread::spawn(move || {
        let mut program = Script::new("sleep 30");
        runner.execute(Executable::SyncResult(&mut program))
    });

    assert!(wait_until(Duration::from_secs(5), || {
        console.invocation_state() == InvocationState::Started
    }));
    let started = Instant::now();
    assert!(console.cancel());

    let completion = handle.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(completion.exit_code, CANCELLED_EXIT_CODE);
    assert!(completion.cancelled);
    assert_eq!(console.last_invocation_state(), InvocationState::Cancelled);
    assert!(console.is_active());

    let mut program = Script::new("echo after");
    console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();
    assert_eq!(program.stdout, "after\n");
}

#[test]
fn test_exit_on_stderr_stops_command() {
    let ctx = TestContext::new();
    let settings = ConsoleSettings {
        timeout: Duration::from_secs(2),
        max_timeout: Duration::from_secs(2),
        ..ctx.settings()
    };
    let console = ctx.console_with(settings);

    let started = Instant::now();
    let mut program =
        Inline::new("sh -c 'echo oops >&2; sleep 5; echo late'").exit_on_stderr();
    let completion = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(completion.exit_code, 1);
    assert!(!completion.cancelled);
    assert!(program.stderr.starts_with("oops\n"), "{:?}", program.stderr);
    assert!(!program.stdout.contains("late"));

    // The stopped command no longer occupies the shell.
    let started = Instant::now();
    let mut program = Script::new("echo next");
    console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();
    assert_eq!(program.stdout, "next\n");
    assert!(started.elapsed() < Duration::from_secs(1));

    // Silent commands run to their own exit code.
    let mut program = Inline::new("true").exit_on_stderr();
    let completion = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();
    assert_eq!(completion.exit_code, 0);
}

#[test]
fn test_cancel_requested_before_start() {
    let ctx = TestContext::new();
    let console = ctx.console();

    // Hold the console so the async launch thread queues behind it.
    let busy = console.clone();
    let blocker = std::thread::spawn(move || {
        let mut program = Script::new("sleep 0.5");
        busy.execute(Executable::SyncResult(&mut program))
    });
    std::thread::sleep(Duration::from_millis(100));

    let (recorder, events) = Recorder::<String>::new();
    let program = Lines::new("echo should-not-run", Box::new(recorder));
    let execution = console.execute_async(program).unwrap();
    assert!(execution.cancel());

    blocker.join().unwrap().unwrap();
    let completion = execution.join().unwrap();
    assert!(completion.cancelled);
    assert!(
        !events
            .lock()
            .unwrap()
            .contains(&Event::Partial("should-not-run".into()))
    );
}

#[test]
fn test_end_without_end_frame() {
    let ctx = TestContext::new();
    let console = ctx.console();

    let (recorder, events) = Recorder::<String>::new();
    let program = Lines::new(
        "while :; do echo tick; sleep 0.05; done",
        Box::new(recorder),
    )
    .without_end_frame();
    let execution = console.execute_async(program).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        events
            .lock()
            .unwrap()
            .contains(&Event::Partial("tick".into()))
    }));
    assert!(execution.end());

    let completion = execution.join().unwrap();
    assert_eq!(completion.exit_code, 0);
    assert!(!completion.cancelled);
    assert!(events.lock().unwrap().contains(&Event::End(false)));
}

#[test]
fn test_timeout_not_before_slice() {
    let ctx = TestContext::new();
    let settings = ConsoleSettings {
        timeout: Duration::from_millis(300),
        max_timeout: Duration::from_millis(300),
        ..ctx.settings()
    };
    let console = ctx.console_with(settings);

    let started = Instant::now();
    let mut program = Script::new("sleep 10");
    let err = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        ConsoleError::OperationTimeout { command, elapsed } => {
            assert!(command.starts_with("sh -c"));
            assert!(elapsed >= Duration::from_millis(300));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(10));
    assert_eq!(console.last_invocation_state(), InvocationState::TimedOut);

    // The timed out command was killed; the console keeps working.
    let mut program = Script::new("echo alive");
    console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();
    assert_eq!(program.stdout, "alive\n");
}

#[test]
fn test_wait_on_new_data_extends_slice() {
    let ctx = TestContext::new();
    let settings = ConsoleSettings {
        timeout: Duration::from_millis(300),
        max_timeout: Duration::from_secs(10),
        ..ctx.settings()
    };
    let console = ctx.console_with(settings);

    let (recorder, events) = Recorder::<String>::new();
    let program = Lines::new(
        "for i in 1 2 3 4 5 6; do echo $i; sleep 0.15; done",
        Box::new(recorder),
    );
    let completion = console.execute_async(program).unwrap().join().unwrap();

    assert_eq!(completion.exit_code, 0);
    let partials = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, Event::Partial(_)))
        .count();
    assert_eq!(partials, 6);
}

#[test]
fn test_single_flight() {
    let ctx = TestContext::new();
    let console = ctx.console();

    let started = Instant::now();
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let console = console.clone();
            std::thread::spawn(move || {
                let mut program = Script::new(&format!("sleep 0.3; echo worker-{i}"));
                console
                    .execute(Executable::SyncResult(&mut program))
                    .map(|_| program.stdout)
            })
        })
        .collect();
    let mut outputs: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    outputs.sort();

    assert!(started.elapsed() >= Duration::from_millis(600));
    assert_eq!(outputs, vec!["worker-0\n", "worker-1\n"]);
}

#[test]
fn test_realloc_once_on_io_failure() {
    let ctx = TestContext::new();
    let settings = ctx.settings();
    let shell = FlakyShell::new("flaky-token", 1);
    let spawns = shell.spawns.clone();
    let console = ShellConsole::new(shell, settings);
    console.alloc().unwrap();
    let first_pid = console.shell_pid();

    let mut program = Script::new("echo flaky-token");
    console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();

    assert_eq!(program.stdout, "flaky-token\n");
    assert_eq!(spawns.load(Ordering::SeqCst), 2);
    assert_ne!(console.shell_pid(), first_pid);
}

#[test]
fn test_second_io_failure_surfaces_execution_error() {
    let ctx = TestContext::new();
    let shell = FlakyShell::new("flaky-token", 2);
    let spawns = shell.spawns.clone();
    let console = ShellConsole::new(shell, ctx.settings());
    console.alloc().unwrap();

    let mut program = Script::new("echo flaky-token");
    let err = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap_err();

    assert!(matches!(err, ConsoleError::Execution(_)), "{err:?}");
    assert_eq!(spawns.load(Ordering::SeqCst), 2);
}

#[test]
fn test_dealloc_and_realloc() {
    let ctx = TestContext::new();
    let console = ctx.console();

    console.dealloc();
    console.dealloc();
    assert!(!console.is_active());
    assert_eq!(console.shell_pid(), None);

    let mut program = Script::new("echo hi");
    let err = console
        .execute(Executable::SyncResult(&mut program))
        .unwrap_err();
    assert!(matches!(err, ConsoleError::ConsoleAlloc(_)), "{err:?}");

    console.realloc().unwrap();
    console
        .execute(Executable::SyncResult(&mut program))
        .unwrap();
    assert_eq!(program.stdout, "hi\n");
}

#[test]
fn test_alloc_fails_for_missing_shell() {
    let ctx = TestContext::new();
    let settings = ConsoleSettings::resolve(ConsoleOptions {
        shell: Some("/nonexistent/shell".into()),
        working_dir: Some(ctx.path().to_path_buf()),
        ..Default::default()
    });
    let console = ShellConsole::new(
        shellcon_console::PosixShell::from_settings(&settings),
        settings,
    );
    let err = console.alloc().unwrap_err();
    assert!(matches!(err, ConsoleError::ConsoleAlloc(_)), "{err:?}");
    assert!(!console.is_active());
}
