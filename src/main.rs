#![forbid(unsafe_code)]

use anyhow::Result;
use std::path::Path;

use digital_carrot::cli::{self, CliCommand};
use digital_carrot::client;
use digital_carrot::daemon::{self, ipc::Command, preservation::Identity};

fn main() -> Result<()> {
    match cli::parse_args()? {
        CliCommand::Init => {
            for path in client::init(Path::new("."))? {
                println!("Created {}", path.display());
            }
        }
        CliCommand::Start { config } => client::start_command(config.as_deref())?,
        CliCommand::Unblock => println!("{}", client::simple_command(&Command::Unblock)?),
        CliCommand::Update { config } => println!("{}", client::update_command(&config)?),
        CliCommand::Pause { days, condition } => {
            println!("{}", client::simple_command(&Command::Pause { days, condition })?)
        }
        CliCommand::Purge => println!("{}", client::simple_command(&Command::Purge)?),
        CliCommand::Disable => println!("{}", client::disable_command()?),
        CliCommand::Run { identity } => daemon::run_daemon(Identity::from(identity.as_str()))?,
    }

    Ok(())
}
