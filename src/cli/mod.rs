//! CLI argument parsing module
//!
//! Handles the command-line interface using clap:
//! - Operator subcommands (init, start, unblock, update, pause, purge, disable)
//! - The hidden `run <identity>` entry used by the supervisor
//! - Help and version output

use anyhow::{anyhow, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use std::path::PathBuf;

use crate::constants::DAEMON_RUN_SUBCOMMAND;

/// Parsed invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Init,
    Start { config: Option<PathBuf> },
    Unblock,
    Update { config: PathBuf },
    Pause { days: u32, condition: Option<String> },
    Purge,
    Disable,
    Run { identity: String },
}

fn version() -> &'static str {
    concat!(env!("DIGITAL_CARROT_VERSION"), " (", env!("GIT_HASH"), ")")
}

/// Command definition, separate from parsing so tests can drive it
pub fn build_cli() -> Command {
    Command::new("digital-carrot")
        .version(version())
        .about("Block distracting websites until your goals are met")
        .long_about(
            "Blocks websites through the hosts file. The block is lifted for the day once \
             every condition script required today reports success.",
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new("init").about("Write a template config and sample script into the current directory"))
        .subcommand(
            Command::new("start")
                .about("Start digital-carrot")
                .arg(
                    Arg::new("config")
                        .value_name("CONFIG")
                        .help("Config file to launch with; omit to restart from the last installed config")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(Command::new("unblock").about("Request to unblock websites for today"))
        .subcommand(
            Command::new("update")
                .about("Add websites or conditions from a config file (additions only)")
                .arg(
                    Arg::new("config")
                        .value_name("CONFIG")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("pause")
                .about("Request a multi-day pause; requires meeting an additional condition")
                .arg(
                    Arg::new("days")
                        .value_name("DAYS")
                        .required(true)
                        .help("Number of days to pause")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("condition")
                        .value_name("CONDITION")
                        .help("Use this condition's pause settings instead of the global pause condition"),
                ),
        )
        .subcommand(Command::new("purge").about("Remove conditions that are broken or have never succeeded"))
        .subcommand(Command::new("disable").about("Completely disable the daemon (password required)"))
        .subcommand(
            Command::new(DAEMON_RUN_SUBCOMMAND)
                .hide(true)
                .arg(Arg::new("identity").required(true)),
        )
}

/// Parse command line arguments
pub fn parse_args() -> Result<CliCommand> {
    from_matches(&build_cli().get_matches())
}

/// Map clap matches onto [`CliCommand`]
pub fn from_matches(matches: &ArgMatches) -> Result<CliCommand> {
    let command = match matches.subcommand() {
        Some(("init", _)) => CliCommand::Init,
        Some(("start", sub)) => CliCommand::Start {
            config: sub.get_one::<PathBuf>("config").cloned(),
        },
        Some(("unblock", _)) => CliCommand::Unblock,
        Some(("update", sub)) => CliCommand::Update {
            config: sub
                .get_one::<PathBuf>("config")
                .cloned()
                .ok_or_else(|| anyhow!("update requires a config path"))?,
        },
        Some(("pause", sub)) => CliCommand::Pause {
            days: sub
                .get_one::<u32>("days")
                .copied()
                .ok_or_else(|| anyhow!("pause requires a number of days"))?,
            condition: sub.get_one::<String>("condition").cloned(),
        },
        Some(("purge", _)) => CliCommand::Purge,
        Some(("disable", _)) => CliCommand::Disable,
        Some((DAEMON_RUN_SUBCOMMAND, sub)) => CliCommand::Run {
            identity: sub
                .get_one::<String>("identity")
                .cloned()
                .ok_or_else(|| anyhow!("run requires an identity"))?,
        },
        Some((other, _)) => return Err(anyhow!("Unknown subcommand: {}", other)),
        None => return Err(anyhow!("A subcommand is required")),
    };
    Ok(command)
}
