//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;
use tollgate_core::pipeline::ReleaseAction;

#[derive(Subcommand)]
pub enum Commands {
    /// Write the bundled python-package pipeline
    Init {
        /// Where to write the pipeline
        #[arg(default_value = "tollgate.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate pipeline configuration
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "tollgate.yaml")]
        path: PathBuf,
    },

    /// Show which runs an event would start and their job instances
    Plan {
        /// Path to pipeline file
        #[arg(default_value = "tollgate.yaml")]
        path: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Run a pipeline locally
    Run {
        /// Path to pipeline file
        #[arg(default_value = "tollgate.yaml")]
        path: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Show a stored run, or list recent runs
    Status {
        /// Run ID
        run_id: Option<String>,

        /// Number of runs to list
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Resume a run interrupted by a restart
    Resume {
        /// Run ID
        run_id: String,
    },

    /// Print the pipeline JSON schema
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Event that starts a run.
#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Event kind
    #[arg(short, long, value_enum, default_value_t = EventKind::Manual)]
    pub event: EventKind,

    /// Branch pushed to (push events)
    #[arg(short, long)]
    pub branch: Option<String>,

    /// Release action (release events)
    #[arg(long, value_enum, default_value_t = ReleaseArg::Created)]
    pub action: ReleaseArg,

    /// Who started a manual run
    #[arg(long)]
    pub actor: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Push,
    Release,
    Manual,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseArg {
    Created,
    Published,
    Prereleased,
    Released,
}

impl From<ReleaseArg> for ReleaseAction {
    fn from(arg: ReleaseArg) -> Self {
        match arg {
            ReleaseArg::Created => ReleaseAction::Created,
            ReleaseArg::Published => ReleaseAction::Published,
            ReleaseArg::Prereleased => ReleaseAction::Prereleased,
            ReleaseArg::Released => ReleaseAction::Released,
        }
    }
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}
