use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::logging::{LogFormat, LoggingConfig};
use crate::manager::Action;

#[derive(Debug, Parser)]
#[command(name = "photosync", version, about = "Mirror a remote media library into a local directory tree")]
pub struct Cli {
    /// Configuration file; defaults to the first of the standard locations.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Only act on this identity.
    #[arg(long, short = 'i', global = true)]
    pub identity: Option<String>,

    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show cursor state, item counts and ignore entries.
    Stats,
    /// Change the ignore list.
    Ignore(IgnoreArgs),
    /// Remove local files the remote no longer reports or that are ignored.
    Delete {
        /// Reconcile even if the latest index pass did not complete.
        #[arg(long)]
        force: bool,
    },
    /// Rebuild album directories from the store.
    Materialize,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("op").required(true).args(["set", "reset"])))]
pub struct IgnoreArgs {
    /// Remote ids to ignore.
    #[arg(long, num_args = 1..)]
    pub set: Vec<String>,

    /// Forget every ignore entry.
    #[arg(long)]
    pub reset: bool,
}

impl Cli {
    pub fn action(&self) -> Action {
        match &self.command {
            Command::Stats => Action::Stats,
            Command::Ignore(args) if args.reset => Action::IgnoreReset,
            Command::Ignore(args) => Action::IgnoreSet(args.set.clone()),
            Command::Delete { force } => Action::DeleteObsolete { force: *force },
            Command::Materialize => Action::Materialize,
        }
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig::default()
            .with_format(self.log_format)
            .with_level(self.log_level.clone())
            .with_file(self.log_file.clone())
    }
}
