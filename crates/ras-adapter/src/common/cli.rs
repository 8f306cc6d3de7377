use std::path::PathBuf;

use clap::Parser;

use ras_engine::engine::ProcessingMode;

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to a TOML configuration file
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = "RAS_CONFIG",
        help_heading("GLOBAL OPTIONS")
    )]
    pub config: Option<PathBuf>,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "RAS_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version,
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Runs the control loop until SIGINT or SIGTERM is received
    Run(RunOpts),
    /// Validates the configuration and the cluster snapshot and prints a summary
    Check(CheckOpts),
}

#[derive(Parser)]
pub struct SnapshotOpts {
    /// JSON snapshot of the cluster (nodes, jobs, service status and RAS events)
    #[arg(long, value_hint = clap::ValueHint::FilePath, env = "RAS_SNAPSHOT")]
    pub snapshot: Option<PathBuf>,
}

#[derive(Parser)]
pub struct RunOpts {
    /// Which aspects of pending RAS events are handled
    /// [possible values: combined, job-ids-only, control-operations-only]
    #[arg(long, env = "RAS_MODE")]
    pub mode: Option<ProcessingMode>,

    #[clap(flatten)]
    pub source: SnapshotOpts,

    /// Appends every requested control action to this file (one JSON object per line)
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub action_journal: Option<PathBuf>,
}

#[derive(Parser)]
pub struct CheckOpts {
    #[clap(flatten)]
    pub source: SnapshotOpts,
}
