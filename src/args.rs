use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::StrategyKind;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

/// Connection settings that override the config file.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Source PostgreSQL connection URI
    #[arg(long, env = "TABLESYNC_SOURCE_URI")]
    pub source_uri: Option<String>,

    /// Destination PostgreSQL connection URI
    #[arg(long, env = "TABLESYNC_DESTINATION_URI")]
    pub destination_uri: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replace the destination tables with the source rows
    Replicate {
        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Promote the shadow tables (otherwise load, preserve and discard)
        #[arg(short, long, default_value = "false")]
        execute: bool,

        /// Promotion strategy, overrides the config file
        #[arg(long, value_enum)]
        strategy: Option<StrategyKind>,

        /// Only replicate these destination tables (repeatable)
        #[arg(short, long)]
        table: Vec<String>,

        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Print the insert plan for each table without writing anything
    Plan {
        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Only plan these destination tables (repeatable)
        #[arg(short, long)]
        table: Vec<String>,

        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

pub fn get_args() -> Result<Args, clap::Error> {
    Args::try_parse()
}
