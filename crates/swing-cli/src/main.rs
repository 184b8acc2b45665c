mod commands;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::bundle::ReplaceBundleArgs;
use commands::dump::DumpArgs;
use commands::snapshots::{ExtractArgs, ListArgs};
use commands::transcript::{PruneArgs, SpansArgs};
use opts::StoreOpts;

#[derive(Parser, Debug)]
#[command(name = "swing", version, about = "Kernel store maintenance")]
struct Cli {
    #[command(flatten)]
    opts: StoreOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print one key, or every key under a prefix
    Dump(DumpArgs),

    /// Print kernel counters
    Stats,

    /// List vats with their state
    Vats,

    /// Recompute refcounts and c-lists and report inconsistencies
    Check,

    /// Point a vat at a different bundle without an upgrade
    ReplaceBundle(ReplaceBundleArgs),

    /// Vat snapshot commands
    #[command(subcommand)]
    Snapshots(SnapshotsCommand),

    /// Transcript commands
    #[command(subcommand)]
    Transcript(TranscriptCommand),
}

#[derive(Subcommand, Debug)]
enum SnapshotsCommand {
    /// List stored snapshots
    List(ListArgs),

    /// Write a snapshot's bytes to a file
    Extract(ExtractArgs),
}

#[derive(Subcommand, Debug)]
enum TranscriptCommand {
    /// Delete transcript items made redundant by a snapshot
    Prune(PruneArgs),

    /// List a vat's transcript spans
    Spans(SpansArgs),
}

fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();
    let opts = &cli.opts;

    match cli.command {
        Command::Dump(args) => commands::dump::cmd_dump(opts, &args),
        Command::Stats => commands::stats::cmd_stats(opts),
        Command::Vats => commands::vats::cmd_vats(opts),
        Command::Check => commands::check::cmd_check(opts),
        Command::ReplaceBundle(args) => commands::bundle::cmd_replace_bundle(opts, &args),
        Command::Snapshots(cmd) => match cmd {
            SnapshotsCommand::List(args) => commands::snapshots::cmd_list(opts, &args),
            SnapshotsCommand::Extract(args) => commands::snapshots::cmd_extract(opts, &args),
        },
        Command::Transcript(cmd) => match cmd {
            TranscriptCommand::Prune(args) => commands::transcript::cmd_prune(opts, &args),
            TranscriptCommand::Spans(args) => commands::transcript::cmd_spans(opts, &args),
        },
    }
}

/// Library crates log through `log`; route those records to stderr.
fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
