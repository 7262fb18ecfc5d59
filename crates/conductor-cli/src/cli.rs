//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "conductor",
    version,
    about = "Apply snap configuration through the change engine.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML). A missing file means defaults.
    #[arg(long, value_name = "PATH", default_value = "conductor.toml")]
    pub config: PathBuf,

    /// Override `dirs.state_file` from the config.
    #[arg(long, value_name = "PATH")]
    pub state_file: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CONDUCTOR_LOG` or `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Apply `key=value` options to a snap and wait for the change.
    Configure {
        snap: String,

        /// Options as `key=value`; values are JSON, else plain strings.
        #[arg(value_name = "KEY=VALUE")]
        options: Vec<String>,

        /// Do not fail the change when the configuration fails.
        #[arg(long)]
        ignore_hook_error: bool,

        /// Apply the gadget's defaults for the snap first.
        #[arg(long)]
        use_defaults: bool,

        /// Queue the change and return without settling.
        #[arg(long)]
        no_wait: bool,
    },

    /// Print a committed option of a snap.
    Get { snap: String, key: String },

    /// List changes.
    Changes {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List the tasks of a change with their logs.
    Tasks {
        /// Change id, as `change-N` or `N`.
        change: String,
    },

    /// Record an installed snap revision.
    SetSnap {
        name: String,

        #[arg(long)]
        revision: i32,

        #[arg(long, value_name = "ID")]
        snap_id: Option<String>,

        #[arg(long = "type", value_enum, default_value = "app")]
        snap_type: SnapTypeArg,
    },

    /// Remove old changes now.
    Prune,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum SnapTypeArg {
    App,
    Gadget,
    Os,
    Kernel,
    Base,
    Snapd,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
