mod cli;
mod log;

use clap::Parser;
use cli::{Cli, Commands};
use miette::{IntoDiagnostic, Result, WrapErr};
use shellcon_console::programs::{CaptureProgram, FindProgram, ListDirectoryProgram};
use shellcon_console::{
    AsyncResultListener, Combine, ConsoleError, ConsoleOptions, ConsoleRegistry, ConsoleSettings,
    Executable, ShellConsole,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let level = log::Level::from_flags(cli.global_options.verbose, cli.global_options.quiet);
    log::init_tracing(level, cli.global_options.trace_format);

    let settings = load_settings(&cli)?;
    tracing::debug!(?settings, "resolved console settings");
    let registry = Arc::new(ConsoleRegistry::new(settings));

    let result = run(&registry, cli.command).await;
    registry.destroy();
    result
}

fn load_settings(cli: &Cli) -> Result<ConsoleSettings> {
    let file = match &cli.global_options.config {
        Some(path) => ConsoleOptions::load(path)?,
        None => {
            let cwd = std::env::current_dir()
                .into_diagnostic()
                .wrap_err("Failed to determine the current directory")?;
            ConsoleOptions::load_from_dir(&cwd)?.unwrap_or_default()
        }
    };
    let options = cli.global_options.console_options().combine(file);
    Ok(ConsoleSettings::resolve(options))
}

/// Run blocking console work off the async runtime.
async fn blocking<T, F>(registry: &Arc<ConsoleRegistry>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(ShellConsole) -> Result<T, ConsoleError> + Send + 'static,
{
    let registry = Arc::clone(registry);
    let result = tokio::task::spawn_blocking(move || registry.get().and_then(f))
        .await
        .into_diagnostic()?;
    Ok(result?)
}

async fn run(registry: &Arc<ConsoleRegistry>, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Exec { command, args } => {
            let (program, completion) = blocking(registry, move |console| {
                let mut program = CaptureProgram::new(command, args).trace(true);
                let completion = console.execute(Executable::SyncResult(&mut program))?;
                Ok((program, completion))
            })
            .await?;
            print!("{}", program.stdout());
            eprint!("{}", program.stderr());
            Ok(exit_code(completion.exit_code))
        }
        Commands::Ls { dir, all } => {
            let entries = blocking(registry, move |console| {
                let mut program = ListDirectoryProgram::new(dir).show_hidden(all);
                console.execute(Executable::SyncResult(&mut program))?;
                Ok(program.into_entries())
            })
            .await?;
            for entry in entries {
                println!("{entry}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Find { dir, name } => find(registry, dir, name).await,
        Commands::Id => {
            let console = blocking(registry, Ok).await?;
            let Some(identity) = console.identity() else {
                miette::bail!("console identity is unknown");
            };
            let groups: Vec<_> = identity.groups.iter().map(u32::to_string).collect();
            println!(
                "uid={} gid={} groups={}",
                identity.uid,
                identity.gid,
                groups.join(",")
            );
            println!(
                "shell={} pid={} privileged={}",
                console.shell_id(),
                console
                    .shell_pid()
                    .map_or_else(|| "?".to_string(), |pid| pid.to_string()),
                console.is_privileged()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Prints each match as soon as it arrives.
struct PrintPaths;

impl AsyncResultListener<PathBuf> for PrintPaths {
    fn on_partial_result(&mut self, path: PathBuf) {
        println!("{}", path.display());
    }

    fn on_async_end(&mut self, cancelled: bool) {
        if cancelled {
            tracing::info!("search cancelled");
        }
    }
}

async fn find(registry: &Arc<ConsoleRegistry>, dir: PathBuf, name: Option<String>) -> Result<ExitCode> {
    let execution = blocking(registry, move |console| {
        let mut program = FindProgram::new(dir, Box::new(PrintPaths));
        if let Some(name) = name {
            program = program.name(name);
        }
        console.execute_async(program)
    })
    .await?;

    let canceller = execution.canceller();
    let mut join = tokio::task::spawn_blocking(move || execution.join());

    let completion = tokio::select! {
        joined = &mut join => joined.into_diagnostic()??,
        signal = tokio::signal::ctrl_c() => {
            signal.into_diagnostic().wrap_err("Failed to listen for Ctrl-C")?;
            canceller.cancel();
            join.await.into_diagnostic()??
        }
    };

    if completion.cancelled {
        return Ok(ExitCode::from(130));
    }
    Ok(exit_code(completion.exit_code))
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

