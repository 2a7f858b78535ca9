//! Enforcement engine
//!
//! Owns the authoritative config together with the preservation manager and
//! drives the block/unblock/pause state machine. Every operation takes the
//! engine explicitly; there is no shared state outside it.

use anyhow::Result;
use chrono::{Datelike, Local, NaiveDateTime, NaiveTime};
use std::path::Path;

use crate::conditions::{run_script, ScriptRun};
use crate::constants::{PAUSE_RESET_HOUR, PAUSE_SCRIPT_KEY};
use crate::daemon::config::{hash_password, Config};
use crate::daemon::logging::{DaemonLogger, LogLevel};
use crate::daemon::preservation::{MissingScript, Preserver, Termination};
use crate::enforcement::hosts::HostsFile;
use crate::models::Weekday;

/// Source of the current local time
pub type Clock = Box<dyn Fn() -> NaiveDateTime>;

const ALL_MET: &str = "You met all your goals! Well done.";
const STILL_MISSING: &str = "Still missing some goals.";
const FATAL_SCRIPT_MESSAGE: &str =
    "This script failed with an unknown error. To purge it from the system run 'digital-carrot purge'";

/// Why the run loop must stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Password-gated shutdown; nothing is respawned
    Disabled,
    /// Termination signal handled
    Terminated(Termination),
}

/// Result of one enforcement tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforceOutcome {
    Paused,
    Intact,
    Repaired,
}

/// Human-readable unblock report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnblockReport {
    pub message: String,
    pub complete: bool,
}

/// Meaning of a validator exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Met,
    /// Exit 1 or no exit code at all: the condition becomes purge-eligible
    Broken,
    NotYetMet,
}

fn classify(run: &ScriptRun) -> Verdict {
    match run.code {
        Some(0) => Verdict::Met,
        Some(1) | None => Verdict::Broken,
        Some(_) => Verdict::NotYetMet,
    }
}

/// `days` after `now`, at the reset hour
fn days_from(now: NaiveDateTime, days: u32) -> NaiveDateTime {
    let date = now.date() + chrono::Duration::days(i64::from(days));
    let reset = NaiveTime::from_hms_opt(PAUSE_RESET_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
    date.and_time(reset)
}

/// Run a validator, folding a failure to launch into an unexpected error
fn run_validator(script: &Path, args: &[String]) -> ScriptRun {
    run_script(script, args).unwrap_or_else(|e| {
        log::error!("{:#}", e);
        ScriptRun {
            code: None,
            stdout: String::new(),
            stderr: format!("{:#}", e),
        }
    })
}

pub struct Engine {
    config: Config,
    preserver: Preserver,
    hosts: HostsFile,
    clock: Clock,
    logger: DaemonLogger,
    stop: Option<StopReason>,
}

impl Engine {
    pub fn new(config: Config, preserver: Preserver, hosts: HostsFile) -> Self {
        Self {
            config,
            preserver,
            hosts,
            clock: Box::new(|| Local::now().naive_local()),
            logger: DaemonLogger::detached(LogLevel::Info),
            stop: None,
        }
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn preserver(&self) -> &Preserver {
        &self.preserver
    }

    pub fn hosts(&self) -> &HostsFile {
        &self.hosts
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop.as_ref()
    }

    /// Tick action: persist, then repair the block region if the hosts file
    /// no longer matches what was last written
    pub fn enforce(&mut self) -> Result<EnforceOutcome> {
        self.preserver.dump_to_disk(&mut self.config)?;

        if self.config.is_paused_at((self.clock)()) {
            log::debug!("Pause detected.");
            return Ok(EnforceOutcome::Paused);
        }

        let live = self.hosts.digest()?;
        if self.config.hosts_sha.as_deref() == Some(live.as_str()) {
            log::debug!("No changes detected in hosts file.");
            return Ok(EnforceOutcome::Intact);
        }

        log::info!("{} was changed. Fixing.", self.hosts.path().display());
        let digest = self.hosts.block(&self.config.blocked_websites)?;
        self.logger
            .log_hosts_repaired(self.hosts.path(), self.config.blocked_websites.len());
        self.config.hosts_sha = Some(digest);
        self.config.save_to_file(&self.preserver.layout().config_file())?;
        Ok(EnforceOutcome::Repaired)
    }

    /// Evaluate today's conditions; lift the block until tomorrow when all are met
    pub fn unblock(&mut self) -> Result<UnblockReport> {
        log::info!("Attempting to unblock websites.");
        self.preserver.dump_to_disk(&mut self.config)?;

        let now = (self.clock)();
        let today = Weekday::from(now.weekday());
        let mut lines = Vec::new();
        let mut complete = true;

        for (name, spec) in self.config.conditions.iter_mut() {
            if !spec.is_required_on(today) {
                lines.push(format!("[✓] {}: Not required today.", name));
                continue;
            }

            let run = run_validator(spec.executable_path(), &spec.args);
            match classify(&run) {
                Verdict::Met => {
                    spec.validated = true;
                    lines.push(format!("[✓] {}: {}", name, run.stdout.trim()));
                }
                Verdict::Broken => {
                    spec.validated = false;
                    complete = false;
                    self.logger.log_condition_failed(name, run.code, run.stderr.trim());
                    lines.push(format!("[x] {}: {}", name, FATAL_SCRIPT_MESSAGE));
                }
                Verdict::NotYetMet => {
                    complete = false;
                    lines.push(format!("[x] {}: {}", name, run.stdout.trim()));
                }
            }
        }

        if complete {
            lines.push(ALL_MET.to_string());
            self.config.pause_until = Some(days_from(now, 1));
            self.hosts.clear()?;
            self.config.hosts_sha = None;
            log::info!("Websites unlocked");
        } else {
            lines.push(STILL_MISSING.to_string());
        }

        self.config.save_to_file(&self.preserver.layout().config_file())?;

        Ok(UnblockReport {
            message: lines.join("\n"),
            complete,
        })
    }

    /// Earn a multi-day pause. `condition` selects a condition's own pause
    /// settings instead of the global pause condition.
    pub fn pause(&mut self, days: u32, condition: Option<&str>) -> Result<String> {
        let max_days = match condition {
            None => match &self.config.pause_condition {
                Some(pause) => pause.max_days(),
                None => return Ok("Pausing is not enabled.".to_string()),
            },
            Some(name) => match self.config.conditions.get(name) {
                Some(spec) => match &spec.pause {
                    Some(pause) => pause.max_days(),
                    None => return Ok(format!("Pausing is not enabled for {}.", name)),
                },
                None => return Ok(format!("Unknown condition: {}", name)),
            },
        };

        if days == 0 {
            return Ok("A pause must last at least one day.".to_string());
        }
        if days > max_days {
            return Ok(format!("You're not allowed to pause more than {} days", max_days));
        }

        let report = self.unblock()?;
        if !report.complete {
            return Ok(format!(
                "Please finish your goals before requesting a longer pause.\n{}",
                report.message
            ));
        }

        // Resolved after unblock() so the freshly materialized copy is used
        let (script, args) = match condition {
            None => match &self.config.pause_condition {
                Some(pause) => (pause.executable_path().clone(), pause.args.clone()),
                None => return Ok("Pausing is not enabled.".to_string()),
            },
            Some(name) => match self.config.conditions.get(name) {
                Some(spec) => (
                    spec.executable_path().clone(),
                    spec.pause.as_ref().map(|p| p.pause_args.clone()).unwrap_or_default(),
                ),
                None => return Ok(format!("Unknown condition: {}", name)),
            },
        };

        let run = run_validator(&script, &args);
        if !run.succeeded() {
            return Ok(format!("Pause failed: {}", run.stdout));
        }

        self.config.pause_until = Some(days_from((self.clock)(), days));
        self.config.save_to_file(&self.preserver.layout().config_file())?;
        log::info!("Paused for {} days", days);
        Ok(format!("Pause successful: {}", run.stdout))
    }

    /// Remove every condition that has not validated
    pub fn purge_failed(&mut self) -> Result<String> {
        let mut lines = Vec::new();
        let mut removed = Vec::new();

        for (name, spec) in &self.config.conditions {
            if spec.validated {
                lines.push(format!("[✓] {}", name));
            } else {
                lines.push(format!("[x] {}", name));
                removed.push(name.clone());
            }
        }

        for name in &removed {
            self.config.conditions.remove(name);
            self.preserver.forget_script(name)?;
        }
        self.config.save_to_file(&self.preserver.layout().config_file())?;

        let mut message = format!("Status:\n{}", lines.join("\n"));
        if !removed.is_empty() {
            message.push_str("\n\nRemoved the following failed conditions:\n");
            message.push_str(&removed.join("\n"));
            log::info!("Purged conditions: {}", removed.join(", "));
        }
        Ok(message)
    }

    /// Password-gated genuine shutdown
    pub fn disable(&mut self, response: &str) -> Result<String> {
        let accepted = self
            .config
            .hashed_password
            .as_deref()
            .is_some_and(|expected| expected == hash_password(response));

        if !accepted {
            log::warn!("Rejected disable attempt");
            return Ok("Wrong password".to_string());
        }

        self.preserver.write_killswitch()?;
        self.hosts.clear()?;
        self.preserver.delete_self()?;
        self.preserver.purge_persisted_state()?;
        self.stop = Some(StopReason::Disabled);
        log::info!("Disabled by password");
        Ok("Shutting down".to_string())
    }

    /// Additively merge the user's config file and write the result back to it
    pub fn update_from_cfg(&mut self, user_file: &Path) -> Result<String> {
        let user = match Config::load_from_file(user_file)
            .and_then(|user| user.validate().map(|_| user).map_err(Into::into))
        {
            Ok(user) => user,
            Err(e) => return Ok(format!("Update rejected: {:#}", e)),
        };

        let had_pause_script = self.preserver.has_script(PAUSE_SCRIPT_KEY);
        let mut merged = self.config.clone();
        let mut added = merged.merge_additive(user);
        let dropped = self.preserver.load_scripts(&mut merged, MissingScript::Drop)?;
        for name in &dropped {
            log::warn!("Dropped condition '{}': script not found or unreadable", name);
        }
        added.retain(|name| !dropped.contains(name));

        // Nothing is committed until the user's copy has been written back
        if let Err(e) = merged.save_to_file(user_file) {
            for name in &added {
                self.preserver.forget_script(name)?;
            }
            if !had_pause_script {
                self.preserver.forget_script(PAUSE_SCRIPT_KEY)?;
            }
            return Ok(format!("Update rejected: {:#}", e));
        }

        if !added.is_empty() {
            log::info!("Added conditions: {}", added.join(", "));
        }
        self.config = merged;
        self.preserver.dump_to_disk(&mut self.config)?;

        Ok(format!("Updated {}", user_file.display()))
    }

    /// Respawn-or-release on a termination signal; the loop stops either way
    pub fn on_termination(&mut self) -> Result<&StopReason> {
        let termination = self.preserver.on_termination(&mut self.config)?;
        Ok(&*self.stop.insert(StopReason::Terminated(termination)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u32) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2026, 10, 19)
            .and_then(|d| d.and_hms_opt(hour, 30, 0))
            .unwrap()
    }

    fn run(code: Option<i32>) -> ScriptRun {
        ScriptRun {
            code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_exit_code_trichotomy() {
        assert_eq!(classify(&run(Some(0))), Verdict::Met);
        assert_eq!(classify(&run(Some(1))), Verdict::Broken);
        assert_eq!(classify(&run(None)), Verdict::Broken);
        assert_eq!(classify(&run(Some(2))), Verdict::NotYetMet);
        assert_eq!(classify(&run(Some(42))), Verdict::NotYetMet);
    }

    #[test]
    fn test_launch_failure_counts_as_broken() {
        let run = run_validator(Path::new("/nonexistent/validator"), &[]);
        assert_eq!(run.code, None);
        assert!(run.stderr.contains("/nonexistent/validator"));
        assert_eq!(classify(&run), Verdict::Broken);
    }

    #[test]
    fn test_days_from_lands_on_reset_hour() {
        let next = days_from(at(14), 1);
        assert_eq!(next.to_string(), "2026-10-20 02:00:00");
        assert_eq!(days_from(at(0), 3).to_string(), "2026-10-22 02:00:00");
    }
}
