//! Admin client
//!
//! Everything the `digital-carrot` command does on the operator's side:
//! first-time project setup, installing the daemon, and the pipe round trip
//! for every runtime command.

use anyhow::{bail, Context, Result};
use dialoguer::Password;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use sysinfo::{PidExt, ProcessExt, System, SystemExt};

use crate::constants::DAEMON_RUN_SUBCOMMAND;
use crate::daemon::config::{hash_password, Config, ConfigError};
use crate::daemon::ipc::{send_command, Command};
use crate::daemon::launchd::{Launchctl, Supervisor};
use crate::daemon::preservation::{Identity, Layout, MissingScript, Preserver};
use crate::models::DisableMethod;

const CONFIG_TEMPLATE_NAME: &str = "config.toml";
const SAMPLE_SCRIPT_NAME: &str = "sample_script.sh";

const CONFIG_TEMPLATE: &str = r#"# Domains redirected to localhost while enforcement is active
blocked_websites = ["example.com"]

# Only "password" is supported; `digital-carrot start` asks for it
disable_method = "password"

# Validator for `digital-carrot pause <days>`
[pause_condition]
script = "sample_script.sh"
args = []
max_pause_days = 3

# Every condition required today must pass before `digital-carrot unblock`
# lifts the block until 02:00 tomorrow
[conditions.example_condition]
script = "sample_script.sh"
args = ["arg1", "arg2"]
require_on = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
"#;

const SAMPLE_SCRIPT: &str = r#"#!/bin/sh

# The shebang matters: scripts are executed directly, e.g. "./sample_script.sh"

# Whatever is printed to stdout is shown by `digital-carrot unblock`
echo "Success! You completed your goal."

# Exit codes:
# 0     -> the goal is met
# 1     -> unexpected error; the condition becomes removable with
#          `digital-carrot purge`
# other -> the goal is not met yet; the block stays
exit 0
"#;

/// Write a template config and sample validator into `dir`
pub fn init(dir: &Path) -> Result<Vec<PathBuf>> {
    let config = dir.join(CONFIG_TEMPLATE_NAME);
    let script = dir.join(SAMPLE_SCRIPT_NAME);

    for path in [&config, &script] {
        if path.exists() {
            bail!("Refusing to overwrite existing file: {}", path.display());
        }
    }

    std::fs::write(&config, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", config.display()))?;
    std::fs::write(&script, SAMPLE_SCRIPT)
        .with_context(|| format!("Failed to write {}", script.display()))?;
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to mark executable: {}", script.display()))?;

    Ok(vec![config, script])
}

/// Read a user config, rewriting script paths relative to the file itself
pub fn load_user_config(path: &Path) -> Result<(PathBuf, Config)> {
    let path = std::fs::canonicalize(path)
        .with_context(|| format!("Config file not found: {}", path.display()))?;
    let mut config = Config::load_from_file(&path)?;
    let base = path.parent().unwrap_or(Path::new("/"));
    config.absolutize_scripts(base);
    Ok((path, config))
}

/// Prepare a fresh install from the user's config: validated, with the
/// password digest set and runtime state cleared
pub fn prepare_initial_config(mut config: Config, password: &str) -> Result<Config> {
    config.validate()?;
    match config.disable_method {
        DisableMethod::Password => {
            if password.is_empty() {
                return Err(ConfigError::MissingPassword.into());
            }
            config.hashed_password = Some(hash_password(password));
        }
    }
    config.hosts_sha = None;
    config.pause_until = None;
    for spec in config.conditions.values_mut() {
        spec.validated = false;
        spec.internal_script = None;
    }
    if let Some(pause) = config.pause_condition.as_mut() {
        pause.internal_script = None;
    }
    Ok(config)
}

/// Install the daemon and hand the first instance to the supervisor.
/// Without a config the last persisted one is reused.
pub fn start(
    layout: &Layout,
    config: Option<Config>,
    image: Vec<u8>,
    supervisor: Box<dyn Supervisor>,
) -> Result<Identity> {
    let mut config = match config {
        Some(config) => config,
        None => Config::load_from_file(&layout.config_file())
            .context("No config given and no previous installation found")?,
    };

    // A leftover killswitch would let the first termination end everything
    let killswitch = layout.killswitch();
    if killswitch.exists() {
        std::fs::remove_file(&killswitch)
            .with_context(|| format!("Failed to remove stale killswitch: {}", killswitch.display()))?;
    }

    let mut preserver = Preserver::new(layout.clone(), Identity::generate(), image, supervisor);
    preserver.load_scripts(&mut config, MissingScript::Fatal)?;
    preserver.propagate(&mut config)
}

/// `start` as run from the command line
pub fn start_command(config_path: Option<&Path>) -> Result<()> {
    require_root()?;

    let config = match config_path {
        Some(path) => {
            let (_, config) = load_user_config(path)?;
            let password = Password::new()
                .with_prompt("Enter a password")
                .with_confirmation("Confirm password", "Passwords must match")
                .interact()
                .context("Failed to read password")?;
            Some(prepare_initial_config(config, &password)?)
        }
        None => None,
    };

    let exe = std::env::current_exe().context("Failed to get current executable path")?;
    let image = std::fs::read(&exe)
        .with_context(|| format!("Failed to read executable image: {}", exe.display()))?;

    let identity = start(&Layout::system(), config, image, Box::new(Launchctl))?;
    println!("✅ digital-carrot started ({})", identity);
    Ok(())
}

/// `update`: normalize the user's file in place, then send it to the daemon
pub fn update_command(config_path: &Path) -> Result<String> {
    require_root()?;
    let (path, config) = load_user_config(config_path)?;
    config.validate()?;
    config.save_to_file(&path)?;
    round_trip(&Command::Update { path })
}

/// `disable`: show the challenge, read the response without echo
pub fn disable_command() -> Result<String> {
    require_root()?;
    let challenge = round_trip(&Command::DisableChallenge)?;
    let response = Password::new()
        .with_prompt(challenge.trim())
        .allow_empty_password(true)
        .interact()
        .context("Failed to read response")?;
    round_trip(&Command::Disable { response })
}

/// Root check followed by a single round trip
pub fn simple_command(command: &Command) -> Result<String> {
    require_root()?;
    round_trip(command)
}

fn round_trip(command: &Command) -> Result<String> {
    if !is_daemon_running() {
        bail!("digital-carrot is not running. Start it with 'digital-carrot start <config>'");
    }
    send_command(&Layout::system(), command)
}

fn require_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("You must run this program as root.");
    }
    Ok(())
}

/// Whether a supervised `digital-carrot run <identity>` process exists
pub fn is_daemon_running() -> bool {
    !find_daemon_pids().is_empty()
}

/// PIDs of running daemon instances, excluding this process
pub fn find_daemon_pids() -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();
    let current_pid = std::process::id();

    system
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            let pid = pid.as_u32();
            if pid == current_pid {
                return None;
            }
            is_daemon_command_line(process.cmd()).then_some(pid)
        })
        .collect()
}

/// `<path>/bin/<identity> run <identity>` as written into the registration
fn is_daemon_command_line(cmd: &[String]) -> bool {
    match cmd {
        [exe, subcommand, identity, ..] => {
            subcommand == DAEMON_RUN_SUBCOMMAND
                && Path::new(exe).file_name().is_some_and(|name| name == identity.as_str())
        }
        _ => false,
    }
}
