pub mod broker;
pub mod profile;
pub mod run;
pub mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::scheduler::OperationType;

#[derive(Parser)]
#[command(
    name = "data-breaker-agent",
    version,
    about = "Scan data brokers on a schedule and keep opting out until your records are gone"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to config.json in the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage the profile searched for on broker sites
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    /// Import and list broker definitions
    Broker {
        #[command(subcommand)]
        command: BrokerCommand,
    },
    /// Run one scheduling pass and exit
    Run {
        /// Which operations to run
        #[arg(long = "type", value_enum, default_value = "all")]
        operation_type: OperationType,
        /// Run everything scheduled, not only what is due
        #[arg(long)]
        force: bool,
        /// Show the automation surface while it works
        #[arg(long)]
        show_ui: bool,
        /// Maximum brokers processed at the same time
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
    /// Keep running scheduled passes until interrupted
    Agent {
        /// Hours between passes
        #[arg(long)]
        every: Option<u64>,
        /// Show the automation surface while it works
        #[arg(long)]
        show_ui: bool,
    },
    /// Show scan and opt-out jobs with their next run dates
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show the event history of a broker
    History {
        /// Broker name
        #[arg(long)]
        broker: String,
    },
}

#[derive(Subcommand)]
pub enum ProfileCommand {
    /// Save the profile to search for. A changed profile replaces the old one.
    Set {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        middle_name: Option<String>,
        #[arg(long)]
        city: String,
        /// Two-letter state code
        #[arg(long)]
        state: String,
        #[arg(long)]
        birth_year: i32,
    },
    /// Show the active profile
    Show,
}

#[derive(Subcommand)]
pub enum BrokerCommand {
    /// Import broker definitions from a JSON file or directory
    Import {
        /// File or directory (defaults to the brokers dir)
        #[arg(conflicts_with = "remote")]
        path: Option<PathBuf>,
        /// Fetch definitions from the remote registry instead
        #[arg(long)]
        remote: bool,
    },
    /// List imported brokers
    List,
}
