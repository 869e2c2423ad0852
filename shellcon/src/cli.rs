use clap::{Parser, Subcommand, crate_version};
use shellcon_console::ConsoleOptions;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TraceFormat {
    /// A verbose structured log format used for debugging (default).
    #[default]
    Full,
    /// A JSON log format used for machine consumption.
    Json,
    /// A pretty human-readable log format used for debugging.
    Pretty,
}

#[derive(Parser, Debug)]
#[command(
    name = "shellcon",
    color = clap::ColorChoice::Auto,
    dont_delimit_trailing_values = true,
    about = format!("shellcon {}: run programs through a persistent shell console", crate_version!())
)]
pub struct Cli {
    #[command(flatten)]
    pub global_options: GlobalOptions,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct GlobalOptions {
    #[arg(
        short,
        long,
        global = true,
        env = "SHELLCON_CONFIG",
        help = "Configuration file (defaults to ./shellcon.yaml if present)."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        help = "Prefer a privileged console, falling back to an unprivileged one."
    )]
    pub privileged: bool,

    #[arg(
        long,
        global = true,
        value_name = "MS",
        help = "Timeout slice for a single command in milliseconds."
    )]
    pub timeout: Option<u64>,

    #[arg(short, long, global = true, help = "Enable additional debug logs.")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Silence all logs"
    )]
    pub quiet: bool,

    #[arg(
        long,
        global = true,
        env = "SHELLCON_TRACE_FORMAT",
        help = "Configure the output format of traces.",
        default_value_t,
        value_enum
    )]
    pub trace_format: TraceFormat,
}

impl GlobalOptions {
    /// Options given on the command line; they take precedence over the
    /// configuration file.
    pub fn console_options(&self) -> ConsoleOptions {
        ConsoleOptions {
            timeout_ms: self.timeout,
            prefer_privileged: self.privileged.then_some(true),
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    #[command(about = "Run a command through the console and exit with its exit code.")]
    Exec {
        command: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    #[command(about = "List the entries of a directory.")]
    Ls {
        dir: PathBuf,

        #[arg(short, long, help = "Include hidden entries.")]
        all: bool,
    },

    #[command(about = "Stream paths below a directory. Ctrl-C cancels the search.")]
    Find {
        dir: PathBuf,

        #[arg(help = "Only report entries whose name matches this glob.")]
        name: Option<String>,
    },

    #[command(about = "Print the identity the console's shell runs as.")]
    Id,
}
