//! Global constants for digital-carrot
//!
//! Centralized location for fixed paths, labels and timing

use std::time::Duration;

/// Subsystem identifier for macOS Unified Logging System
pub const APP_SUBSYSTEM: &str = "com.digitalcarrot";

/// Prefix of every LaunchD job label; the run identity is appended
pub const LAUNCHD_LABEL_PREFIX: &str = "com.digitalcarrot";

/// Hidden subcommand the supervisor uses to launch the daemon
pub const DAEMON_RUN_SUBCOMMAND: &str = "run";

/// Protected directory holding every persisted artifact
pub const WORKING_DIR: &str = "/var/db/digital-carrot";

/// System-wide LaunchD registrations
pub const LAUNCH_DAEMONS_DIR: &str = "/Library/LaunchDaemons";

/// Hosts file the block region is written into
pub const HOSTS_FILE: &str = "/etc/hosts";

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const IN_PIPE_NAME: &str = "comms_in.pipe";
pub const OUT_PIPE_NAME: &str = "comms_out.pipe";
pub const KILLSWITCH_NAME: &str = "killswitch";
pub const LOCK_FILE_NAME: &str = "process.lock";
pub const LOG_FILE_NAME: &str = "daemon.log";
pub const SCRIPTS_DIR_NAME: &str = "scripts";
pub const BIN_DIR_NAME: &str = "bin";

/// Script store key of the global pause validator
pub const PAUSE_SCRIPT_KEY: &str = "__pause_condition__";

/// Sentinel comments delimiting the block region in the hosts file
pub const BLOCK_START_MARKER: &str = "#carrotblock";
pub const BLOCK_END_MARKER: &str = "#/carrotblock";

/// Run loop tick
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Enforcement and command polling happen on every Nth tick
pub const ENFORCE_EVERY_TICKS: u64 = 5;

/// Single-instance lock acquisition bounds
pub const LOCK_ATTEMPTS: u32 = 6;
pub const LOCK_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Hour of day (local time) at which an earned unblock or pause expires
pub const PAUSE_RESET_HOUR: u32 = 2;

/// Upper bound on pause length when the config leaves it unset
pub const DEFAULT_MAX_PAUSE_DAYS: u32 = 3;

/// Largest command line accepted from the input pipe in one read
pub const MAX_COMMAND_BYTES: usize = 4096;

/// How long the client waits for a reply; validators run synchronously
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(300);

/// Challenge text answered to `disable_challenge`
pub const DISABLE_CHALLENGE: &str = "Password";
