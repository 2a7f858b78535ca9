//! Inter-process communication for daemon control
//!
//! Two named pipes carry a line-based text protocol: the client writes one
//! command line into the input pipe, the daemon answers through the output
//! pipe. Lines are decoded once into [`Command`] at this boundary.

use anyhow::{bail, Context, Result};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::constants::{DISABLE_CHALLENGE, MAX_COMMAND_BYTES, REPLY_TIMEOUT};
use crate::daemon::preservation::Layout;
use crate::enforcement::Engine;

const REPLY_POLL_DELAY: Duration = Duration::from_millis(50);

/// Every request the daemon understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Unblock,
    DisableChallenge,
    Disable { response: String },
    Update { path: PathBuf },
    Pause { days: u32, condition: Option<String> },
    Purge,
}

/// Decoding failures for a command line
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command: '{0}'")]
    UnknownCommand(String),
    #[error("Command '{command}' requires a {parameter}")]
    MissingParameter {
        command: &'static str,
        parameter: &'static str,
    },
    #[error("Command '{0}' takes no parameters")]
    UnexpectedParameter(&'static str),
    #[error("Invalid {parameter} for '{command}': '{value}'")]
    InvalidParameter {
        command: &'static str,
        parameter: &'static str,
        value: String,
    },
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }

        let (name, param) = match line.split_once(':') {
            Some((name, param)) => (name, Some(param)),
            None => (line, None),
        };

        match name {
            "unblock" => no_param("unblock", param).map(|_| Command::Unblock),
            "purge" => no_param("purge", param).map(|_| Command::Purge),
            "disable_challenge" => {
                no_param("disable_challenge", param).map(|_| Command::DisableChallenge)
            }
            // The response is taken verbatim, colons included
            "disable" => match param {
                Some(response) => Ok(Command::Disable {
                    response: response.to_string(),
                }),
                None => Err(ProtocolError::MissingParameter {
                    command: "disable",
                    parameter: "response",
                }),
            },
            "update" => {
                let raw = param.filter(|p| !p.is_empty()).ok_or(ProtocolError::MissingParameter {
                    command: "update",
                    parameter: "config path",
                })?;
                let path = PathBuf::from(raw);
                if !path.is_absolute() {
                    return Err(ProtocolError::InvalidParameter {
                        command: "update",
                        parameter: "absolute config path",
                        value: raw.to_string(),
                    });
                }
                Ok(Command::Update { path })
            }
            "pause" => {
                let raw = param.filter(|p| !p.is_empty()).ok_or(ProtocolError::MissingParameter {
                    command: "pause",
                    parameter: "number of days",
                })?;
                let (days, condition) = match raw.split_once(':') {
                    Some((days, condition)) => (days, Some(condition)),
                    None => (raw, None),
                };
                let days = days.parse::<u32>().map_err(|_| ProtocolError::InvalidParameter {
                    command: "pause",
                    parameter: "number of days",
                    value: days.to_string(),
                })?;
                let condition = match condition {
                    Some("") => {
                        return Err(ProtocolError::MissingParameter {
                            command: "pause",
                            parameter: "condition name",
                        })
                    }
                    other => other.map(str::to_string),
                };
                Ok(Command::Pause { days, condition })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

fn no_param(command: &'static str, param: Option<&str>) -> Result<(), ProtocolError> {
    match param {
        None => Ok(()),
        Some(_) => Err(ProtocolError::UnexpectedParameter(command)),
    }
}

impl fmt::Display for Command {
    /// Wire form, without the trailing newline
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Unblock => f.write_str("unblock"),
            Command::DisableChallenge => f.write_str("disable_challenge"),
            Command::Disable { response } => write!(f, "disable:{}", response),
            Command::Update { path } => write!(f, "update:{}", path.display()),
            Command::Pause { days, condition: None } => write!(f, "pause:{}", days),
            Command::Pause {
                days,
                condition: Some(name),
            } => write!(f, "pause:{}:{}", days, name),
            Command::Purge => f.write_str("purge"),
        }
    }
}

/// Route a decoded command to the engine and produce the reply text.
///
/// Errors are faults in the daemon's own state, not bad requests.
pub fn dispatch(engine: &mut Engine, command: Command) -> Result<String> {
    match command {
        Command::Unblock => engine.unblock().map(|report| report.message),
        Command::DisableChallenge => Ok(DISABLE_CHALLENGE.to_string()),
        Command::Disable { response } => engine.disable(&response),
        Command::Update { path } => engine.update_from_cfg(&path),
        Command::Pause { days, condition } => engine.pause(days, condition.as_deref()),
        Command::Purge => engine.purge_failed(),
    }
}

/// Create a FIFO at `path` unless one is already there
pub fn ensure_fifo(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => std::fs::remove_file(path)
            .with_context(|| format!("Failed to replace non-pipe file: {}", path.display()))?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to inspect {}", path.display())),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create pipe directory: {}", parent.display()))?;
    }
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .with_context(|| format!("Failed to create pipe: {}", path.display()))
}

/// Daemon end of the two pipes
pub struct CommandChannel {
    input: File,
    output_path: PathBuf,
}

impl CommandChannel {
    /// Create both pipes if needed and hold the input pipe open for reading
    pub fn open(layout: &Layout) -> Result<Self> {
        let input_path = layout.in_pipe();
        let output_path = layout.out_pipe();
        ensure_fifo(&input_path)?;
        ensure_fifo(&output_path)?;

        let input = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&input_path)
            .with_context(|| format!("Failed to open input pipe: {}", input_path.display()))?;

        Ok(Self { input, output_path })
    }

    /// Non-blocking read of whatever command lines are waiting
    pub fn poll(&mut self) -> Result<Vec<String>> {
        let mut buffer = vec![0u8; MAX_COMMAND_BYTES];
        let read = match self.input.read(&mut buffer) {
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e).context("Failed to read input pipe"),
        };

        let text = String::from_utf8_lossy(&buffer[..read]);
        Ok(text
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Best-effort reply: fails when no client is reading, and is not retried
    pub fn send(&self, message: &str) -> bool {
        let delivered = OpenOptions::new()
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&self.output_path)
            .and_then(|mut pipe| pipe.write_all(message.as_bytes()));

        match delivered {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to send reply ({}): {}", e, message.lines().next().unwrap_or_default());
                false
            }
        }
    }
}

/// Client side round trip: write `command`, wait for the reply
pub fn send_command(layout: &Layout, command: &Command) -> Result<String> {
    let input_path = layout.in_pipe();
    let output_path = layout.out_pipe();

    // Attach as a reader before sending so the reply has somewhere to go
    let mut output = OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(&output_path)
        .with_context(|| format!("Failed to open output pipe: {}", output_path.display()))?;

    let mut input = OpenOptions::new()
        .write(true)
        .open(&input_path)
        .with_context(|| format!("Failed to open input pipe: {}", input_path.display()))?;
    // One write, so the daemon never sees half a line
    input
        .write_all(format!("{}\n", command).as_bytes())
        .context("Failed to send command")?;
    drop(input);

    let deadline = Instant::now() + REPLY_TIMEOUT;
    let mut reply = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match output.read(&mut chunk) {
            Ok(0) if !reply.is_empty() => break,
            Ok(0) => {}
            Ok(read) => {
                reply.extend_from_slice(&chunk[..read]);
                continue;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e).context("Failed to read reply"),
        }
        if Instant::now() >= deadline {
            bail!("No reply from the daemon within {} seconds", REPLY_TIMEOUT.as_secs());
        }
        std::thread::sleep(REPLY_POLL_DELAY);
    }

    Ok(String::from_utf8_lossy(&reply).into_owned())
}
