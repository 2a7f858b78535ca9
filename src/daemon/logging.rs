//! Structured daemon logging
//!
//! Installs the `log` backend (Unified Logging on macOS, stderr elsewhere,
//! which the LaunchD descriptor redirects to the daemon log file) and emits
//! daemon lifecycle events as `message | {json}` lines.

use anyhow::Result;
use serde_json::json;
use log::{error, info};

use crate::daemon::preservation::Identity;
use crate::enforcement::StopReason;

/// Daemon logger for lifecycle and command events
#[derive(Debug, Clone)]
pub struct DaemonLogger {
    /// Current logging level
    level: LogLevel,
}

/// Log levels for daemon operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Info,
}

impl DaemonLogger {
    /// Install the logging backend for `subsystem`
    pub fn new(subsystem: &str, level: LogLevel) -> Result<Self> {
        // Validate subsystem format (should be reverse DNS)
        if !subsystem.contains('.') {
            anyhow::bail!("Subsystem must be in reverse DNS format (e.g., 'com.example.app')");
        }

        install_backend(subsystem)?;

        Ok(Self { level })
    }

    /// Logger that only formats events; the backend is left untouched
    pub fn detached(level: LogLevel) -> Self {
        Self { level }
    }

    /// Log daemon startup event
    pub fn log_startup(&self, identity: &Identity, pid: u32) {
        let message = json!({
            "event": "daemon_startup",
            "identity": identity.as_str(),
            "pid": pid,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Info, "Daemon started", &message);
    }

    /// Log daemon shutdown event
    pub fn log_shutdown(&self, identity: &Identity, reason: &StopReason) {
        let reason = match reason {
            StopReason::Disabled => "disabled".to_string(),
            StopReason::Terminated(termination) => format!("{:?}", termination),
        };
        let message = json!({
            "event": "daemon_shutdown",
            "identity": identity.as_str(),
            "reason": reason,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Info, "Daemon shutting down", &message);
    }

    /// Log a command read from the input pipe
    pub fn log_command(&self, line: &str) {
        // Never log the disable response itself
        let shown = match line.split_once(':') {
            Some(("disable", _)) => "disable:<redacted>",
            _ => line,
        };
        let message = json!({
            "event": "command_received",
            "command": shown,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Info, &format!("Received command: '{}'", shown), &message);
    }

    /// Log a block region rewrite
    pub fn log_hosts_repaired(&self, hosts_file: &std::path::Path, site_count: usize) {
        let message = json!({
            "event": "hosts_repaired",
            "hosts_file": hosts_file.display().to_string(),
            "site_count": site_count,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Info, "Block region rewritten", &message);
    }

    /// Log a validator that ended with an unexpected error
    pub fn log_condition_failed(&self, name: &str, exit_code: Option<i32>, stderr: &str) {
        let message = json!({
            "event": "condition_failed",
            "condition": name,
            "exit_code": exit_code,
            "stderr": stderr,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(
            LogLevel::Error,
            &format!("Condition '{}' failed (exit: {:?})", name, exit_code),
            &message,
        );
    }

    /// Log error events
    pub fn log_error(&self, error_message: &str, context: Option<&str>) {
        let message = json!({
            "event": "error",
            "message": error_message,
            "context": context,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        self.log_structured(LogLevel::Error, error_message, &message);
    }

    /// Format `message | {json}` and hand it to the `log` facade
    fn log_structured(&self, level: LogLevel, message: &str, data: &serde_json::Value) {
        if !self.should_log(level) {
            return;
        }

        let full_message = format_event(message, data);
        match level {
            LogLevel::Error => {
                error!("{}", full_message);
            },
            LogLevel::Info => {
                info!("{}", full_message);
            },
        }
    }

    /// Check if we should log at this level
    fn should_log(&self, level: LogLevel) -> bool {
        match (self.level, level) {
            (LogLevel::Error, LogLevel::Error) => true,
            (LogLevel::Info, LogLevel::Error | LogLevel::Info) => true,
            _ => false,
        }
    }
}

fn format_event(message: &str, data: &serde_json::Value) -> String {
    format!("{} | {}", message, data)
}

#[cfg(target_os = "macos")]
fn install_backend(subsystem: &str) -> Result<()> {
    let logger = oslog::OsLogger::new(subsystem);
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))?;
    log::set_max_level(log::LevelFilter::Debug);
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn install_backend(_subsystem: &str) -> Result<()> {
    let installed = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init();
    if installed.is_err() {
        log::warn!("Logger already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_format() {
        let data = json!({"event": "daemon_startup", "pid": 7});
        let line = format_event("Daemon started", &data);
        assert!(line.starts_with("Daemon started | {"));
        assert!(line.contains("\"pid\":7"));
    }

    #[test]
    fn test_level_filtering() {
        let quiet = DaemonLogger::detached(LogLevel::Error);
        assert!(quiet.should_log(LogLevel::Error));
        assert!(!quiet.should_log(LogLevel::Info));

        let verbose = DaemonLogger::detached(LogLevel::Info);
        assert!(verbose.should_log(LogLevel::Info));
    }

    #[test]
    fn test_rejects_non_reverse_dns_subsystem() {
        assert!(DaemonLogger::new("carrot", LogLevel::Info).is_err());
    }
}
