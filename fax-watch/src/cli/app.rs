use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "fax-watch",
    version,
    about = "Watch fax and scanner drop directories",
    long_about = "fax-watch monitors the directories that networked fax machines and scanners write into, tracks every document by content and streams lifecycle events to subscribers."
)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "fax-watch.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the configured sources until interrupted
    #[command(about = "Watch the configured sources and publish lifecycle events")]
    Run(RunArgs),

    /// Fingerprint the documents currently present and exit
    #[command(about = "Fingerprint every document in the configured sources and print them as JSON")]
    Scan,

    /// Write a sample configuration file
    #[command(about = "Write a commented sample configuration")]
    Init(InitArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Override the archive directory
    #[arg(long)]
    pub archive_dir: Option<PathBuf>,

    /// Override the feed listen address
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing configuration file
    #[arg(short, long)]
    pub force: bool,
}
